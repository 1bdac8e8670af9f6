use thiserror::Error;

/// Which memory region an allocation failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// The segmented hot ring.
    Hot,
    /// The append-only cold region.
    Cold,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hot => f.write_str("hot"),
            Self::Cold => f.write_str("cold"),
        }
    }
}

/// Why a transaction failed serializability validation.
///
/// All of these surface as [`CoreError::SerializationAbort`] and are
/// retryable by re-running the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The exclusion window closed: `pstamp >= sstamp` at validation.
    ExclusionWindow,
    /// Another committer marked this transaction for abort.
    ShouldAbort,
    /// The old-version marker was already locked by a committing writer.
    MarkerLocked,
    /// The chain head carried another transaction's uncommitted version.
    WriteConflict,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExclusionWindow => f.write_str("exclusion window closed"),
            Self::ShouldAbort => f.write_str("marked for abort by a committer"),
            Self::MarkerLocked => f.write_str("persistent-reader marker locked"),
            Self::WriteConflict => f.write_str("uncommitted overwrite in progress"),
        }
    }
}

/// Primary error type for the verso storage core.
///
/// Only [`CoreError::SerializationAbort`] is retryable; every other kind
/// terminates the transaction, and `GcOverlap` / `SlotExhaustion`
/// indicate a misconfigured or wedged process.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The region allocator ran out of reclaimable space.
    #[error("out of memory: {requested} bytes from the {region} region")]
    OutOfMemory { region: Region, requested: u64 },

    /// A segment boundary was crossed while the previous reclamation
    /// cycle was still in flight.
    #[error("reclamation requested before the previous cycle finished")]
    GcOverlap,

    /// Serializability validation failed; the transaction may be retried.
    #[error("serialization abort: {0}")]
    SerializationAbort(AbortReason),

    /// Every reader-bitmap slot is claimed.
    #[error("no free reader slot (all {0} claimed)")]
    SlotExhaustion(usize),

    /// A configuration knob is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    /// Whether re-running the transaction can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SerializationAbort(_))
    }
}

/// Convenience alias used across the core crates.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
