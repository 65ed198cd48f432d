//! A clock tests can move by hand.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tidesync_core::Clock;

/// Clock that only moves when told to.
///
/// Starts at the real `Instant::now()` and a fixed Unix time of
/// `1_700_000_000_000` ms.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(Instant, u64)>,
}

impl ManualClock {
    /// Creates a clock at the starting point.
    pub fn new() -> Self {
        Self {
            state: Mutex::new((Instant::now(), 1_700_000_000_000)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.0 += by;
        state.1 += u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.state.lock().0
    }

    fn unix_millis(&self) -> u64 {
        self.state.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_both_readings() {
        let clock = ManualClock::new();
        let (start, start_ms) = (clock.now(), clock.unix_millis());
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, Duration::from_millis(1500));
        assert_eq!(clock.unix_millis() - start_ms, 1500);
    }
}
