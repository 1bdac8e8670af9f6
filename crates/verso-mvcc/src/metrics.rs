//! Core activity counters.
//!
//! Lock-free `AtomicU64` counters with `Relaxed` ordering; readers may
//! observe stale values but never torn ones.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for allocator, reclamation, epoch, and SSN activity.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    /// Hot segments fully drained and returned to the ring.
    pub segments_reclaimed_total: AtomicU64,
    /// Bytes relocated into the cold region by the reclaimer.
    pub cold_relocated_bytes_total: AtomicU64,
    /// Bytes relocated into fresh hot segments by the reclaimer.
    pub hot_relocated_bytes_total: AtomicU64,
    /// Version-chain tails truncated below the trim horizon.
    pub chain_truncations_total: AtomicU64,
    /// Epochs closed by the epoch manager.
    pub epoch_advances_total: AtomicU64,
    /// Transactions aborted by serializability validation.
    pub ssn_aborts_total: AtomicU64,
    /// Writer pre-commit inspections that found at least one reader.
    pub inspections_with_readers_total: AtomicU64,
}

impl CoreMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segments_reclaimed_total: AtomicU64::new(0),
            cold_relocated_bytes_total: AtomicU64::new(0),
            hot_relocated_bytes_total: AtomicU64::new(0),
            chain_truncations_total: AtomicU64::new(0),
            epoch_advances_total: AtomicU64::new(0),
            ssn_aborts_total: AtomicU64::new(0),
            inspections_with_readers_total: AtomicU64::new(0),
        }
    }

    /// Point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CoreMetricsSnapshot {
        CoreMetricsSnapshot {
            segments_reclaimed_total: self.segments_reclaimed_total.load(Ordering::Relaxed),
            cold_relocated_bytes_total: self.cold_relocated_bytes_total.load(Ordering::Relaxed),
            hot_relocated_bytes_total: self.hot_relocated_bytes_total.load(Ordering::Relaxed),
            chain_truncations_total: self.chain_truncations_total.load(Ordering::Relaxed),
            epoch_advances_total: self.epoch_advances_total.load(Ordering::Relaxed),
            ssn_aborts_total: self.ssn_aborts_total.load(Ordering::Relaxed),
            inspections_with_readers_total: self
                .inspections_with_readers_total
                .load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of [`CoreMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CoreMetricsSnapshot {
    pub segments_reclaimed_total: u64,
    pub cold_relocated_bytes_total: u64,
    pub hot_relocated_bytes_total: u64,
    pub chain_truncations_total: u64,
    pub epoch_advances_total: u64,
    pub ssn_aborts_total: u64,
    pub inspections_with_readers_total: u64,
}

impl std::fmt::Display for CoreMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "core(segments={} cold_bytes={} hot_bytes={} truncated={} epochs={} aborts={})",
            self.segments_reclaimed_total,
            self.cold_relocated_bytes_total,
            self.hot_relocated_bytes_total,
            self.chain_truncations_total,
            self.epoch_advances_total,
            self.ssn_aborts_total,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::CoreMetrics;
    use std::sync::atomic::Ordering;

    #[test]
    fn snapshot_reflects_counters() {
        let m = CoreMetrics::new();
        m.segments_reclaimed_total.fetch_add(2, Ordering::Relaxed);
        m.cold_relocated_bytes_total.fetch_add(4096, Ordering::Relaxed);
        let snap = m.snapshot();
        assert_eq!(snap.segments_reclaimed_total, 2);
        assert_eq!(snap.cold_relocated_bytes_total, 4096);
        let display = snap.to_string();
        assert!(display.contains("segments=2"));
        assert!(display.contains("cold_bytes=4096"));
    }

    #[test]
    fn snapshot_serializes() {
        let m = CoreMetrics::new();
        m.ssn_aborts_total.fetch_add(3, Ordering::Relaxed);
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"ssn_aborts_total\":3"));
    }
}
