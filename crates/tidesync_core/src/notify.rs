//! Notifications from the engine to the host.
//!
//! Background work (realtime merges, queue drains, reconciliation) has no
//! caller to return errors to, so it reports through notifications instead.
//! Hosts can register callbacks or take a channel receiver.
//!
//! ```rust
//! use tidesync_core::{Notification, Notifier};
//!
//! let notifier = Notifier::new();
//! let rx = notifier.subscribe();
//! notifier.emit(Notification::EntityChanged {
//!     table: "notes".into(),
//!     entity_id: "n1".into(),
//! });
//! assert_eq!(rx.try_recv().unwrap().entity_id(), Some("n1"));
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Something the host may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A local entity was changed by inbound data.
    EntityChanged {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
    },
    /// A push was rejected because the remote is ahead of the local baseline.
    VersionRegressionDetected {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
    },
    /// Inbound data for this entity was plaintext or sealed with a retired
    /// key; call `heal` to re-push it under the current key.
    NeedsHealing {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
    },
    /// A queued operation failed permanently and was removed.
    OperationDropped {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
        /// Queue sequence number.
        seq: u64,
        /// Why it failed.
        reason: String,
    },
    /// A background push (ancestor bump, realtime correction) failed permanently.
    PushRejected {
        /// Remote table.
        table: String,
        /// Entity ID.
        entity_id: String,
        /// Why it failed.
        reason: String,
    },
    /// An inbound change could not be merged.
    MergeFailed {
        /// Remote table.
        table: String,
        /// Entity ID, if the record had one.
        entity_id: Option<String>,
        /// Why it failed.
        reason: String,
    },
}

impl Notification {
    /// The entity this notification is about, if any.
    #[must_use]
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::EntityChanged { entity_id, .. }
            | Self::VersionRegressionDetected { entity_id, .. }
            | Self::NeedsHealing { entity_id, .. }
            | Self::OperationDropped { entity_id, .. }
            | Self::PushRejected { entity_id, .. } => Some(entity_id.as_str()),
            Self::MergeFailed { entity_id, .. } => entity_id.as_deref(),
        }
    }

    /// The table this notification is about.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::EntityChanged { table, .. }
            | Self::VersionRegressionDetected { table, .. }
            | Self::NeedsHealing { table, .. }
            | Self::OperationDropped { table, .. }
            | Self::PushRejected { table, .. }
            | Self::MergeFailed { table, .. } => table.as_str(),
        }
    }
}

/// Handle returned by [`Notifier::on_notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Fans notifications out to callbacks and channel subscribers.
pub struct Notifier {
    callbacks: RwLock<Vec<(SubscriptionId, Callback)>>,
    channels: RwLock<Vec<Sender<Notification>>>,
    next_id: AtomicU64,
}

impl Notifier {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            channels: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback. Callbacks run on the thread that emits and
    /// must not block.
    pub fn on_notification<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Callback = Arc::new(callback);
        self.callbacks.write().push((id, callback));
        id
    }

    /// Removes a callback. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(existing, _)| *existing != id);
        callbacks.len() != before
    }

    /// Returns a receiver for every future notification. Dropped receivers
    /// are cleaned up on the next emit.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.channels.write().push(tx);
        rx
    }

    /// Delivers `notification` to every subscriber.
    pub fn emit(&self, notification: Notification) {
        tracing::trace!(?notification, "notify");

        // Callbacks may subscribe or unsubscribe, so don't hold the lock.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(&notification);
        }

        self.channels
            .write()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    /// Number of live subscribers of both kinds.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().len() + self.channels.read().len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
