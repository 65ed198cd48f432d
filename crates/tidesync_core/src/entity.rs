//! Syncable entity trait and type-erasure helpers.

use std::any::Any;
use std::fmt;
use uuid::Uuid;

/// A host model object that participates in sync.
///
/// Every syncable entity carries the sync-relevant fields directly: a stable
/// string ID, a monotonically increasing version, a soft-delete flag and a
/// last-modified timestamp in Unix milliseconds. Everything else is described
/// to the engine through [`FieldMapping`](crate::FieldMapping)s.
///
/// Implementors must be `Clone`; the engine works with boxed
/// `dyn SyncableEntity` values and relies on the blanket [`EntityAny`] impl
/// to clone and downcast them.
///
/// # Example
///
/// ```rust
/// use tidesync_core::SyncableEntity;
///
/// #[derive(Debug, Clone, Default)]
/// struct Tag {
///     id: String,
///     version: u64,
///     deleted: bool,
///     updated_at: u64,
///     label: String,
/// }
///
/// impl SyncableEntity for Tag {
///     fn id(&self) -> &str { &self.id }
///     fn version(&self) -> u64 { self.version }
///     fn set_version(&mut self, version: u64) { self.version = version; }
///     fn is_deleted(&self) -> bool { self.deleted }
///     fn set_deleted(&mut self, deleted: bool) { self.deleted = deleted; }
///     fn updated_at(&self) -> u64 { self.updated_at }
///     fn set_updated_at(&mut self, millis: u64) { self.updated_at = millis; }
/// }
/// ```
pub trait SyncableEntity: EntityAny + fmt::Debug + Send + Sync + 'static {
    /// Stable, non-empty identifier.
    fn id(&self) -> &str;

    /// Current version. New entities start at 0.
    fn version(&self) -> u64;

    /// Overwrites the version.
    fn set_version(&mut self, version: u64);

    /// Whether this entity is a tombstone.
    fn is_deleted(&self) -> bool;

    /// Sets the tombstone flag.
    fn set_deleted(&mut self, deleted: bool);

    /// Last-modified time in Unix milliseconds.
    fn updated_at(&self) -> u64;

    /// Overwrites the last-modified time.
    fn set_updated_at(&mut self, millis: u64);
}

/// Object-safe cloning and downcasting, implemented for every
/// `SyncableEntity + Clone`.
pub trait EntityAny {
    /// Borrows as `Any`.
    fn as_any(&self) -> &dyn Any;

    /// Mutably borrows as `Any`.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Converts a box into `Box<dyn Any>`.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    /// Clones into a new box.
    fn clone_entity(&self) -> Box<dyn SyncableEntity>;
}

impl<T> EntityAny for T
where
    T: SyncableEntity + Clone,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn clone_entity(&self) -> Box<dyn SyncableEntity> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn SyncableEntity> {
    fn clone(&self) -> Self {
        self.clone_entity()
    }
}

impl dyn SyncableEntity {
    /// Returns a reference to the concrete type, if it is `T`.
    pub fn downcast_ref<T: SyncableEntity>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns a mutable reference to the concrete type, if it is `T`.
    pub fn downcast_mut<T: SyncableEntity>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Unboxes into the concrete type, if it is `T`.
    pub fn downcast<T: SyncableEntity>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}

/// Generates a new entity ID.
///
/// IDs are UUIDv7 strings, so they sort by creation time.
#[must_use]
pub fn new_entity_id() -> String {
    Uuid::now_v7().to_string()
}

/// The sync-relevant fields of an entity, captured so a failed local save
/// can put the caller's object back the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SyncFields {
    version: u64,
    deleted: bool,
    updated_at: u64,
}

impl SyncFields {
    pub(crate) fn capture(entity: &dyn SyncableEntity) -> Self {
        Self {
            version: entity.version(),
            deleted: entity.is_deleted(),
            updated_at: entity.updated_at(),
        }
    }

    pub(crate) fn restore(self, entity: &mut dyn SyncableEntity) {
        entity.set_version(self.version);
        entity.set_deleted(self.deleted);
        entity.set_updated_at(self.updated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Widget {
        id: String,
        version: u64,
        deleted: bool,
        updated_at: u64,
    }

    impl SyncableEntity for Widget {
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
        fn is_deleted(&self) -> bool {
            self.deleted
        }
        fn set_deleted(&mut self, deleted: bool) {
            self.deleted = deleted;
        }
        fn updated_at(&self) -> u64 {
            self.updated_at
        }
        fn set_updated_at(&mut self, millis: u64) {
            self.updated_at = millis;
        }
    }

    #[test]
    fn boxed_entities_clone_and_downcast() {
        let boxed: Box<dyn SyncableEntity> = Box::new(Widget {
            id: "p1".into(),
            version: 3,
            ..Widget::default()
        });
        let copy = boxed.clone();
        assert_eq!(copy.id(), "p1");
        assert_eq!(copy.downcast_ref::<Widget>().map(|p| p.version), Some(3));

        let concrete = copy.downcast::<Widget>().unwrap();
        assert_eq!(concrete.id, "p1");
    }

    #[test]
    fn sync_fields_round_trip() {
        let mut widget = Widget {
            id: "p".into(),
            version: 4,
            deleted: false,
            updated_at: 10,
        };
        let saved = SyncFields::capture(&widget);
        widget.set_version(5);
        widget.set_deleted(true);
        widget.set_updated_at(99);

        saved.restore(&mut widget);
        assert_eq!(widget.version, 4);
        assert!(!widget.deleted);
        assert_eq!(widget.updated_at, 10);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = new_entity_id();
        let b = new_entity_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
