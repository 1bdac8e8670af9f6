//! Core configuration knobs.

use verso_error::CoreError;

use crate::readers::SLOT_COUNT;

/// How a committing writer handles a back-edge to a still-running reader
/// (the reader will commit after the writer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackedgePolicy {
    /// Transfer the writer's successor bound to the reader by CAS-lowering
    /// the reader's `sstamp`; the reader validates it at its own commit.
    /// Permits back-edges without aborting read-mostly transactions.
    CasSstamp,
    /// Tell the reader to abort via its `should_abort` flag; if the reader
    /// has already left its ACTIVE state, the writer aborts itself instead.
    ShouldAbort,
    /// Busy-wait for the reader's outcome, then treat it as a normal
    /// committed or aborted reader.
    Spin,
}

/// Configuration of the storage core.
///
/// The hot region of each per-socket allocator holds
/// `2^(segment_bits + num_segments_bits)` bytes; the cold region holds
/// `cold_capacity_segments * 2^segment_bits` bytes. The width of the
/// per-tuple reader bitmap is the compile-time [`SLOT_COUNT`] (64) and
/// is not a runtime knob.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// log2 of the hot segment size in bytes.
    pub segment_bits: u32,

    /// The hot ring carries `2^num_segments_bits` segments.
    pub num_segments_bits: u32,

    /// Cold region size, in segments.
    pub cold_capacity_segments: u64,

    /// Bytes allocated before the allocator asks for a new epoch.
    pub trim_mark_bytes: u64,

    /// LSN age beyond which a reader takes the persistent-reader path
    /// instead of tracking the read.
    pub old_version_threshold: u64,

    /// Number of per-socket allocators.
    pub num_sockets: usize,

    /// Back-edge handling at writer pre-commit.
    pub backedge_policy: BackedgePolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            segment_bits: 30,
            num_segments_bits: 2,
            cold_capacity_segments: 2,
            trim_mark_bytes: 16 * 1024 * 1024,
            old_version_threshold: 1 << 20,
            num_sockets: 1,
            backedge_policy: BackedgePolicy::CasSstamp,
        }
    }
}

impl CoreConfig {
    /// Total hot-region capacity in bytes.
    #[must_use]
    pub const fn hot_capacity(&self) -> u64 {
        1_u64 << (self.segment_bits + self.num_segments_bits)
    }

    /// One segment, in bytes.
    #[must_use]
    pub const fn segment_size(&self) -> u64 {
        1_u64 << self.segment_bits
    }

    /// Total cold-region capacity in bytes.
    #[must_use]
    pub const fn cold_capacity(&self) -> u64 {
        self.cold_capacity_segments << self.segment_bits
    }

    /// Reject knob combinations the allocator cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the offending knob.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.segment_bits < 12 || self.segment_bits > 40 {
            return Err(CoreError::InvalidConfig(format!(
                "segment_bits must be in [12, 40], got {}",
                self.segment_bits
            )));
        }
        if self.num_segments_bits == 0 || self.num_segments_bits > 8 {
            return Err(CoreError::InvalidConfig(format!(
                "num_segments_bits must be in [1, 8], got {}",
                self.num_segments_bits
            )));
        }
        if self.cold_capacity_segments == 0 {
            return Err(CoreError::InvalidConfig(
                "cold_capacity_segments must be at least 1".to_owned(),
            ));
        }
        if self.num_sockets == 0 {
            return Err(CoreError::InvalidConfig(
                "num_sockets must be at least 1".to_owned(),
            ));
        }
        if self.trim_mark_bytes == 0 || self.trim_mark_bytes > self.hot_capacity() {
            return Err(CoreError::InvalidConfig(format!(
                "trim_mark_bytes must be in (0, hot_capacity={}], got {}",
                self.hot_capacity(),
                self.trim_mark_bytes
            )));
        }
        debug_assert_eq!(SLOT_COUNT, 64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BackedgePolicy, CoreConfig};

    #[test]
    fn defaults_validate() {
        let cfg = CoreConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.hot_capacity(), 4 << 30);
        assert_eq!(cfg.segment_size(), 1 << 30);
        assert_eq!(cfg.cold_capacity(), 2 << 30);
        assert_eq!(cfg.backedge_policy, BackedgePolicy::CasSstamp);
    }

    #[test]
    fn rejects_degenerate_knobs() {
        let mut cfg = CoreConfig {
            segment_bits: 8,
            ..CoreConfig::default()
        };
        assert!(cfg.validate().is_err());

        cfg.segment_bits = 20;
        cfg.num_segments_bits = 0;
        assert!(cfg.validate().is_err());

        cfg.num_segments_bits = 2;
        cfg.trim_mark_bytes = 0;
        assert!(cfg.validate().is_err());

        cfg.trim_mark_bytes = 1 << 20;
        cfg.num_sockets = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_serde() {
        let cfg = CoreConfig {
            segment_bits: 20,
            num_segments_bits: 2,
            trim_mark_bytes: 1 << 19,
            backedge_policy: BackedgePolicy::ShouldAbort,
            ..CoreConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"backedge_policy\":\"should_abort\""));
        let back: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.segment_bits, 20);
        assert_eq!(back.backedge_policy, BackedgePolicy::ShouldAbort);
    }
}
