//! Concurrency-control and memory-management core of a main-memory,
//! multi-version OLTP storage engine.
//!
//! Two tightly coupled subsystems live here:
//!
//! - **SSN reader tracking** ([`ssn`], [`readers`], [`tuple`], [`txn`]):
//!   readers and writers cooperate through per-tuple bitmaps and
//!   per-slot commit-stamp arrays so that dangerous read/write
//!   anti-dependencies are caught without a read set for old versions.
//!
//! - **Region allocation + epoch reclamation** ([`region`], [`epoch`]):
//!   a bump-pointer ring of segments with a background daemon that
//!   relocates still-live versions and releases drained segments once
//!   the epoch manager proves no thread can observe them.
//!
//! [`runtime::MvccRuntime`] wires the two together; the index and log
//! layers are consumed through the narrow [`tuple::ChainIndex`] and
//! [`clock::LogClock`] seams.

// Raw version-chain memory requires unsafe code; every use carries a
// SAFETY comment tying it to the epoch protocol.
#![allow(unsafe_code)]

pub mod aligned;
pub mod clock;
pub mod config;
pub mod epoch;
pub mod metrics;
pub mod readers;
pub mod region;
pub mod runtime;
pub mod ssn;
pub mod tuple;
pub mod txn;

pub use aligned::{CacheAligned, CACHE_LINE_BYTES};
pub use clock::LogClock;
pub use config::{BackedgePolicy, CoreConfig};
pub use epoch::{EpochCallbacks, EpochManager, ThreadEpoch};
pub use metrics::{CoreMetrics, CoreMetricsSnapshot};
pub use readers::{ReadersList, SlotGuard, SLOT_COUNT};
pub use region::{DrainOutcome, GcState, RegionAllocator};
pub use runtime::{MvccRuntime, WorkerHandle};
pub use ssn::{
    deregister_reader, register_old_reader, register_reader, writer_inspect_readers,
    InspectOutcome,
};
pub use tuple::{ChainIndex, Object, OidTable, TupleHeader, MARKER_LOCK, MARKER_MARK};
pub use txn::{Transaction, TxnContext, TxnRegistry, TxnState};

pub use verso_error::{AbortReason, CoreError, Region, Result};
pub use verso_types::{Epoch, Lsn, Oid, Xid};
