//! Foundation newtypes shared across the verso storage core.
//!
//! Runtime machinery (allocators, the epoch manager, the SSN protocol)
//! lives in `verso-mvcc`; this crate only defines the identity and
//! timestamp types those modules exchange.

mod ids;
mod lsn;

pub use ids::{Epoch, Oid, Xid};
pub use lsn::Lsn;
