//! The log clock: one monotone source for log positions and commit stamps.

use std::sync::atomic::{AtomicU64, Ordering};

use verso_types::Lsn;

/// Monotone LSN source.
///
/// Wraps an `AtomicU64` for lock-free reads; [`advance`](Self::advance)
/// hands out strictly increasing stamps. Commit stamps and log positions
/// draw from the same sequence, so `cur_lsn` snapshots are directly
/// comparable with any tuple's commit stamp.
#[derive(Debug)]
pub struct LogClock {
    lsn: AtomicU64,
}

impl LogClock {
    /// Create a clock whose first [`advance`](Self::advance) yields `lsn#1`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lsn: AtomicU64::new(0),
        }
    }

    /// Snapshot the current position (Acquire).
    ///
    /// Returns [`Lsn::INVALID`] until the first `advance`.
    #[must_use]
    pub fn cur_lsn(&self) -> Lsn {
        Lsn::new(self.lsn.load(Ordering::Acquire))
    }

    /// Claim the next stamp.
    #[must_use]
    pub fn advance(&self) -> Lsn {
        Lsn::new(self.lsn.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Jump the clock forward to at least `to`. Used by tests and by bulk
    /// load to open an LSN range; never moves the clock backwards.
    pub fn advance_to(&self, to: Lsn) {
        self.lsn.fetch_max(to.offset(), Ordering::AcqRel);
    }
}

impl Default for LogClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::LogClock;
    use verso_types::Lsn;

    #[test]
    fn starts_invalid_and_counts_up() {
        let clock = LogClock::new();
        assert_eq!(clock.cur_lsn(), Lsn::INVALID);
        assert_eq!(clock.advance(), Lsn::new(1));
        assert_eq!(clock.advance(), Lsn::new(2));
        assert_eq!(clock.cur_lsn(), Lsn::new(2));
    }

    #[test]
    fn advance_to_never_rewinds() {
        let clock = LogClock::new();
        clock.advance_to(Lsn::new(100));
        assert_eq!(clock.cur_lsn(), Lsn::new(100));
        clock.advance_to(Lsn::new(10));
        assert_eq!(clock.cur_lsn(), Lsn::new(100));
        assert_eq!(clock.advance(), Lsn::new(101));
    }

    #[test]
    fn stamps_are_unique_across_threads() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let clock = Arc::new(LogClock::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let clock = Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| clock.advance().offset()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for lsn in h.join().unwrap() {
                assert!(seen.insert(lsn), "duplicate stamp {lsn}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
