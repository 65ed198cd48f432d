//! Field-level encryption using AES-256-GCM.
//!
//! Encrypted columns travel to the server as self-describing strings:
//!
//! ```text
//! enc:v1:<key-id>:<base64(nonce || ciphertext || tag)>
//! ```
//!
//! `key-id` is the first four bytes of SHA-256 over the key, in hex. It lets
//! the service pick the right key after a rotation: the current key encrypts,
//! every retired key still decrypts, and a value decrypted with a retired
//! key is reported so the caller can re-push it under the current key.
//!
//! The plaintext is the column's JSON encoding and the column name is bound
//! as associated data, so a ciphertext cannot be replayed into another column.

use crate::error::{SyncError, SyncResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::RwLock;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;
/// Prefix of every encrypted value.
pub const CIPHERTEXT_PREFIX: &str = "enc:v1:";

const KEY_ID_SIZE: usize = 4;
const HKDF_INFO: &[u8] = b"tidesync-field-key-v1";

/// Master key for field encryption.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidKey`] unless `bytes` is exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SyncError::InvalidKey {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from high-entropy secret material using HKDF-SHA256.
    ///
    /// HKDF is not a password hash; feed it a random secret (for example a
    /// per-user key delivered by the auth layer), not a typed password.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EncryptionFailure`] if expansion fails.
    pub fn derive_from_secret(secret: &[u8], salt: &[u8]) -> SyncResult<Self> {
        use hkdf::Hkdf;

        let hk = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut bytes)
            .map_err(|_| SyncError::EncryptionFailure {
                message: "HKDF expand failed".into(),
            })?;

        Ok(Self { bytes })
    }

    /// Returns the raw key bytes. Don't log or serialize the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// The key's fingerprint.
    #[must_use]
    pub fn key_id(&self) -> KeyId {
        let digest = Sha256::digest(self.bytes);
        let mut id = [0u8; KEY_ID_SIZE];
        id.copy_from_slice(&digest[..KEY_ID_SIZE]);
        KeyId(id)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("id", &self.key_id())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Short, non-secret key fingerprint embedded in every ciphertext.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; KEY_ID_SIZE]);

impl KeyId {
    /// Parses the 8-character hex form.
    #[must_use]
    pub fn parse(hex: &str) -> Option<Self> {
        if hex.len() != KEY_ID_SIZE * 2 || !hex.is_ascii() {
            return None;
        }
        let mut id = [0u8; KEY_ID_SIZE];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Self(id))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

/// Result of decrypting a field.
#[derive(Debug, Clone, PartialEq)]
pub struct Decrypted {
    /// The recovered column value.
    pub value: Value,
    /// True if a retired key was needed, so the value should be re-encrypted.
    pub used_retired_key: bool,
}

struct KeySlot {
    id: KeyId,
    cipher: Aes256Gcm,
}

impl KeySlot {
    fn new(key: &EncryptionKey) -> Self {
        Self {
            id: key.key_id(),
            cipher: Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())),
        }
    }
}

#[derive(Default)]
struct KeyRing {
    current: Option<KeySlot>,
    retired: Vec<KeySlot>,
}

/// Encrypts and decrypts column values with a rotatable master key.
///
/// A service created with [`disabled`](Self::disabled) has no key: it
/// refuses to encrypt and fails to decrypt anything ciphertext-shaped.
pub struct EncryptionService {
    keys: RwLock<KeyRing>,
}

impl EncryptionService {
    /// Creates a service using `key`.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            keys: RwLock::new(KeyRing {
                current: Some(KeySlot::new(&key)),
                retired: Vec::new(),
            }),
        }
    }

    /// Creates a service with no key.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            keys: RwLock::new(KeyRing::default()),
        }
    }

    /// Whether a current key is installed.
    pub fn is_enabled(&self) -> bool {
        self.keys.read().current.is_some()
    }

    /// The current key's fingerprint.
    pub fn current_key_id(&self) -> Option<KeyId> {
        self.keys.read().current.as_ref().map(|slot| slot.id)
    }

    /// Number of retired keys still accepted for decryption.
    pub fn retired_key_count(&self) -> usize {
        self.keys.read().retired.len()
    }

    /// Installs `key` as the current key. The previous key is retired and
    /// keeps decrypting. Installing the current key again is a no-op.
    pub fn update_master_key(&self, key: EncryptionKey) {
        let slot = KeySlot::new(&key);
        let mut ring = self.keys.write();

        if ring.current.as_ref().is_some_and(|c| c.id == slot.id) {
            return;
        }
        ring.retired.retain(|r| r.id != slot.id);
        if let Some(previous) = ring.current.replace(slot) {
            tracing::info!(retired = %previous.id, "master key rotated");
            ring.retired.push(previous);
        }
    }

    /// Encrypts a column value into the `enc:v1:` string form.
    ///
    /// Null is returned unchanged so "no value" survives the round trip.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EncryptionFailure`] if no key is installed.
    pub fn encrypt(&self, column: &str, value: &Value) -> SyncResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        let plaintext = serde_json::to_vec(value).map_err(|e| SyncError::EncryptionFailure {
            message: e.to_string(),
        })?;

        let ring = self.keys.read();
        let slot = ring.current.as_ref().ok_or_else(|| SyncError::EncryptionFailure {
            message: "no master key installed".into(),
        })?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = slot
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &plaintext,
                    aad: column.as_bytes(),
                },
            )
            .map_err(|_| SyncError::EncryptionFailure {
                message: "AES-GCM seal failed".into(),
            })?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend(sealed);

        Ok(Value::String(format!(
            "{CIPHERTEXT_PREFIX}{}:{}",
            slot.id,
            STANDARD.encode(blob)
        )))
    }

    /// Decrypts a value produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::DecryptionFailure`] if the value is not
    /// ciphertext-shaped, the key is unknown, or authentication fails.
    pub fn decrypt(&self, column: &str, ciphertext: &str) -> SyncResult<Decrypted> {
        let (key_id, blob) = parse_ciphertext(ciphertext).ok_or_else(|| {
            SyncError::DecryptionFailure {
                message: format!("value in column {column} is not a ciphertext"),
            }
        })?;

        let ring = self.keys.read();
        let (slot, used_retired_key) = match ring.current.as_ref().filter(|c| c.id == key_id) {
            Some(slot) => (slot, false),
            None => {
                let slot = ring.retired.iter().find(|r| r.id == key_id).ok_or_else(|| {
                    SyncError::DecryptionFailure {
                        message: format!("unknown key {key_id} for column {column}"),
                    }
                })?;
                (slot, true)
            }
        };

        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);
        let plaintext = slot
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &blob[NONCE_SIZE..],
                    aad: column.as_bytes(),
                },
            )
            .map_err(|_| SyncError::DecryptionFailure {
                message: format!("authentication failed for column {column}"),
            })?;

        let value = serde_json::from_slice(&plaintext).map_err(|e| SyncError::DecryptionFailure {
            message: format!("decrypted column {column} is not valid JSON: {e}"),
        })?;

        Ok(Decrypted {
            value,
            used_retired_key,
        })
    }

    /// Returns true if `value` has the exact shape of an encrypted value:
    /// prefix, hex key id and a base64 blob long enough for nonce and tag.
    #[must_use]
    pub fn is_ciphertext(value: &str) -> bool {
        parse_ciphertext(value).is_some()
    }
}

impl fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionService")
            .field("current", &self.current_key_id())
            .field("retired", &self.retired_key_count())
            .finish()
    }
}

fn parse_ciphertext(value: &str) -> Option<(KeyId, Vec<u8>)> {
    let rest = value.strip_prefix(CIPHERTEXT_PREFIX)?;
    let (key_hex, encoded) = rest.split_once(':')?;
    let key_id = KeyId::parse(key_hex)?;
    let blob = STANDARD.decode(encoded).ok()?;
    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return None;
    }
    Some((key_id, blob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_from_bytes() {
        let key = EncryptionKey::from_bytes(&[7u8; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; KEY_SIZE]);
        assert!(matches!(
            EncryptionKey::from_bytes(&[0u8; 16]),
            Err(SyncError::InvalidKey { expected: 32, actual: 16 })
        ));
    }

    #[test]
    fn derived_keys_are_deterministic() {
        let a = EncryptionKey::derive_from_secret(b"secret", b"salt").unwrap();
        let b = EncryptionKey::derive_from_secret(b"secret", b"salt").unwrap();
        let c = EncryptionKey::derive_from_secret(b"secret", b"other").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn debug_redacts_key() {
        let key = EncryptionKey::from_bytes(&[0xAB; KEY_SIZE]).unwrap();
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("[171"));
    }

    #[test]
    fn key_id_hex_round_trip() {
        let id = EncryptionKey::generate().key_id();
        let hex = id.to_string();
        assert_eq!(hex.len(), 8);
        assert_eq!(KeyId::parse(&hex), Some(id));
        assert_eq!(KeyId::parse("zzzzzzzz"), None);
        assert_eq!(KeyId::parse("abc"), None);
    }

    #[test]
    fn encrypt_decrypt() {
        let service = EncryptionService::new(EncryptionKey::generate());
        let sealed = service.encrypt("content", &json!("top secret")).unwrap();
        let text = sealed.as_str().unwrap();

        assert!(text.starts_with(CIPHERTEXT_PREFIX));
        assert!(EncryptionService::is_ciphertext(text));

        let opened = service.decrypt("content", text).unwrap();
        assert_eq!(opened.value, json!("top secret"));
        assert!(!opened.used_retired_key);
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let service = EncryptionService::new(EncryptionKey::generate());
        let a = service.encrypt("content", &json!("x")).unwrap();
        let b = service.encrypt("content", &json!("x")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn null_passes_through() {
        let service = EncryptionService::new(EncryptionKey::generate());
        assert_eq!(service.encrypt("content", &Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn column_is_bound_as_aad() {
        let service = EncryptionService::new(EncryptionKey::generate());
        let sealed = service.encrypt("content", &json!("x")).unwrap();
        assert!(matches!(
            service.decrypt("title", sealed.as_str().unwrap()),
            Err(SyncError::DecryptionFailure { .. })
        ));
    }

    #[test]
    fn tampering_is_detected() {
        let service = EncryptionService::new(EncryptionKey::generate());
        let sealed = service.encrypt("content", &json!("hello")).unwrap();
        let text = sealed.as_str().unwrap();

        let (head, encoded) = text.rsplit_once(':').unwrap();
        let mut blob = STANDARD.decode(encoded).unwrap();
        blob[NONCE_SIZE] ^= 0xFF;
        let tampered = format!("{head}:{}", STANDARD.encode(blob));

        assert!(service.decrypt("content", &tampered).is_err());
    }

    #[test]
    fn plaintext_is_not_ciphertext_shaped() {
        assert!(!EncryptionService::is_ciphertext("hello"));
        assert!(!EncryptionService::is_ciphertext("enc:v1:"));
        assert!(!EncryptionService::is_ciphertext("enc:v1:0011aabb:short"));
        assert!(!EncryptionService::is_ciphertext("enc:v1:nothex!!:AAAA"));
    }

    #[test]
    fn rotation_keeps_old_ciphertexts_readable() {
        let service = EncryptionService::new(EncryptionKey::generate());
        let old = service.encrypt("content", &json!("before")).unwrap();
        let old_id = service.current_key_id();

        service.update_master_key(EncryptionKey::generate());
        assert_ne!(service.current_key_id(), old_id);
        assert_eq!(service.retired_key_count(), 1);

        let opened = service.decrypt("content", old.as_str().unwrap()).unwrap();
        assert_eq!(opened.value, json!("before"));
        assert!(opened.used_retired_key);

        let fresh = service.encrypt("content", &json!("after")).unwrap();
        assert!(!service.decrypt("content", fresh.as_str().unwrap()).unwrap().used_retired_key);
    }

    #[test]
    fn reinstalling_current_key_is_a_noop() {
        let key = EncryptionKey::generate();
        let service = EncryptionService::new(key.clone());
        service.update_master_key(key);
        assert_eq!(service.retired_key_count(), 0);
    }

    #[test]
    fn unknown_key_fails() {
        let writer = EncryptionService::new(EncryptionKey::generate());
        let reader = EncryptionService::new(EncryptionKey::generate());
        let sealed = writer.encrypt("content", &json!("x")).unwrap();
        assert!(matches!(
            reader.decrypt("content", sealed.as_str().unwrap()),
            Err(SyncError::DecryptionFailure { .. })
        ));
    }

    #[test]
    fn disabled_service() {
        let service = EncryptionService::disabled();
        assert!(!service.is_enabled());
        assert!(matches!(
            service.encrypt("content", &json!("x")),
            Err(SyncError::EncryptionFailure { .. })
        ));
    }

    #[test]
    fn structured_values_survive() {
        let service = EncryptionService::new(EncryptionKey::generate());
        let value = json!({"tags": ["a", "b"], "n": 3});
        let sealed = service.encrypt("meta", &value).unwrap();
        assert_eq!(service.decrypt("meta", sealed.as_str().unwrap()).unwrap().value, value);
    }
}
