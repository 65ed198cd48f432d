//! Echo suppression for locally-originated pushes.

use crate::clock::Clock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Remembers which entities this client pushed recently, so the realtime
/// echo of our own write is not merged back as a remote change.
///
/// Entries older than the window are dropped lazily on every call.
#[derive(Debug)]
pub struct EchoTracker {
    window: Duration,
    clock: Arc<dyn Clock>,
    // table -> entity id -> push time
    pushed: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl EchoTracker {
    /// Creates a tracker with the given window.
    pub fn new(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window,
            clock,
            pushed: Mutex::new(HashMap::new()),
        }
    }

    /// Records that `entity_id` in `table` is about to be pushed.
    pub fn mark_as_pushed(&self, entity_id: &str, table: &str) {
        let now = self.clock.now();
        let mut pushed = self.pushed.lock();
        self.purge_expired(&mut pushed, now);
        pushed
            .entry(table.to_owned())
            .or_default()
            .insert(entity_id.to_owned(), now);
    }

    /// Returns true if `entity_id` was pushed within the window.
    pub fn was_recently_pushed(&self, entity_id: &str, table: &str) -> bool {
        let now = self.clock.now();
        let mut pushed = self.pushed.lock();
        self.purge_expired(&mut pushed, now);
        pushed
            .get(table)
            .is_some_and(|ids| ids.contains_key(entity_id))
    }

    /// Number of entities currently inside the window.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut pushed = self.pushed.lock();
        self.purge_expired(&mut pushed, now);
        pushed.values().map(HashMap::len).sum()
    }

    /// Returns true if nothing is inside the window.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The suppression window.
    pub fn window(&self) -> Duration {
        self.window
    }

    fn purge_expired(&self, pushed: &mut HashMap<String, HashMap<String, Instant>>, now: Instant) {
        let window = self.window;
        pushed.retain(|_, ids| {
            ids.retain(|_, at| now.saturating_duration_since(*at) < window);
            !ids.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Debug)]
    struct StepClock {
        start: Instant,
        offset: PlMutex<Duration>,
    }

    impl StepClock {
        fn new() -> Self {
            Self {
                start: Instant::now(),
                offset: PlMutex::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> Instant {
            self.start + *self.offset.lock()
        }

        fn unix_millis(&self) -> u64 {
            0
        }
    }

    #[test]
    fn suppresses_within_window() {
        let clock = Arc::new(StepClock::new());
        let tracker = EchoTracker::new(Duration::from_secs(5), clock.clone());

        tracker.mark_as_pushed("n1", "notes");
        clock.advance(Duration::from_millis(4_999));
        assert!(tracker.was_recently_pushed("n1", "notes"));
        assert!(!tracker.was_recently_pushed("n1", "folders"));
        assert!(!tracker.was_recently_pushed("n2", "notes"));
    }

    #[test]
    fn expires_after_window() {
        let clock = Arc::new(StepClock::new());
        let tracker = EchoTracker::new(Duration::from_secs(5), clock.clone());

        tracker.mark_as_pushed("n1", "notes");
        clock.advance(Duration::from_secs(5));
        assert!(!tracker.was_recently_pushed("n1", "notes"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn re_marking_refreshes_window() {
        let clock = Arc::new(StepClock::new());
        let tracker = EchoTracker::new(Duration::from_secs(5), clock.clone());

        tracker.mark_as_pushed("n1", "notes");
        clock.advance(Duration::from_secs(3));
        tracker.mark_as_pushed("n1", "notes");
        clock.advance(Duration::from_secs(3));
        assert!(tracker.was_recently_pushed("n1", "notes"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn expired_entries_are_purged_on_write() {
        let clock = Arc::new(StepClock::new());
        let tracker = EchoTracker::new(Duration::from_secs(1), clock.clone());

        for i in 0..10 {
            tracker.mark_as_pushed(&format!("n{i}"), "notes");
        }
        clock.advance(Duration::from_secs(2));
        tracker.mark_as_pushed("fresh", "notes");
        assert_eq!(tracker.len(), 1);
    }
}
