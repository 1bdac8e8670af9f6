//! The SSN reader/writer cooperation protocol.
//!
//! Readers claim their slot bit in a tuple's `rl_bitmap` before relying
//! on the version's contents; a reader that judges the version *old*
//! (age above the configured threshold) additionally sets the
//! persistent-reader `MARK` and skips read-set tracking entirely. The
//! committing writer of the next version then carries the whole burden:
//! it locks the marker to fence out new old-version readers, resolves
//! every set bitmap bit to either a live transaction or the slot's
//! last read-mostly commit stamp, and folds the result into its
//! predecessor stamp before the exclusion-window test.
//!
//! Registration, deregistration, and the old-version path live here next
//! to the writer-side inspection so the two halves of the contract stay
//! on one page.

use verso_error::{AbortReason, CoreError};
use verso_types::Xid;

use crate::config::BackedgePolicy;
use crate::readers::{ReadersList, SLOT_COUNT};
use crate::tuple::{TupleHeader, MARKER_MARK};
use crate::txn::{TxnContext, TxnRegistry, TxnState};

use std::sync::atomic::Ordering;

/// Ensure the calling thread's bit is set in the tuple's reader bitmap.
///
/// Idempotent: a transaction re-reading the same tuple leaves the bitmap
/// unchanged. The SeqCst OR orders the claim before any use of the
/// version's contents.
pub fn register_reader(tuple: &TupleHeader, slot_mask: u64) {
    if tuple.rl_bitmap.load(Ordering::SeqCst) & slot_mask == 0 {
        tuple.rl_bitmap.fetch_or(slot_mask, Ordering::SeqCst);
    }
}

/// Old-version path: mark the tuple as persistently read, then claim the
/// bitmap bit. The read is *not* tracked; the caller must not enlist the
/// tuple in its read set.
///
/// # Errors
///
/// [`CoreError::SerializationAbort`] with [`AbortReason::MarkerLocked`]
/// when a committing writer has already locked the marker; the reader
/// transaction must abort.
pub fn register_old_reader(tuple: &TupleHeader, slot_mask: u64) -> Result<(), CoreError> {
    if !tuple.try_mark_persistent() {
        return Err(CoreError::SerializationAbort(AbortReason::MarkerLocked));
    }
    register_reader(tuple, slot_mask);
    Ok(())
}

/// Clear the calling thread's bit, tolerating repeated calls for the
/// same tuple (a transaction may have read it several times).
pub fn deregister_reader(tuple: &TupleHeader, slot_mask: u64) {
    if tuple.rl_bitmap.load(Ordering::SeqCst) & slot_mask != 0 {
        tuple.rl_bitmap.fetch_xor(slot_mask, Ordering::SeqCst);
    }
}

/// What the writer's inspection saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectOutcome {
    /// At least one reader (tracked bit or persistent mark) existed.
    pub saw_readers: bool,
}

/// Writer pre-commit inspection of one overwritten version.
///
/// Locks the persistent-reader marker, snapshots the bitmap (excluding
/// the writer's own slot), and resolves every reader to a predecessor-
/// stamp contribution on `writer`:
///
/// - a reader already in pre-commit with an earlier commit stamp is
///   awaited and contributes its `cstamp` (commit) or its slot's last
///   read-mostly stamp (abort);
/// - a reader that will commit after the writer is a back-edge, handled
///   per `policy`;
/// - a vanished reader contributes its slot's last read-mostly stamp;
/// - a set `MARK` widens the vanished-reader rule to every slot.
///
/// The caller must have published the writer's finalized `sstamp` before
/// calling (the CAS back-edge hands that value to readers).
///
/// # Errors
///
/// [`CoreError::SerializationAbort`] when the `ShouldAbort` policy could
/// not notify the reader in time and the writer must yield instead.
pub fn writer_inspect_readers(
    writer: &TxnContext,
    tuple: &TupleHeader,
    rlist: &ReadersList,
    registry: &TxnRegistry,
    policy: BackedgePolicy,
    self_mask: u64,
) -> Result<InspectOutcome, CoreError> {
    tuple.lock_marker();
    let bm = ReadersList::tuple_readers(tuple, self_mask, true);
    let marked = tuple.marker() & MARKER_MARK != 0;
    if bm == 0 && !marked {
        return Ok(InspectOutcome { saw_readers: false });
    }

    let mut bits = bm;
    while bits != 0 {
        let slot = bits.trailing_zeros();
        bits &= bits - 1;
        inspect_slot(writer, slot, rlist, registry, policy)?;
    }

    if marked {
        // An untracked old-version reader existed; it may sit at any
        // slot, including one whose bit a later reader now owns. Take
        // the conservative stamp from every slot.
        let self_slot = self_mask.trailing_zeros();
        for slot in 0..SLOT_COUNT as u32 {
            if slot != self_slot {
                writer.raise_pstamp(rlist.get_last_read_mostly_cstamp(slot));
            }
        }
    }

    Ok(InspectOutcome { saw_readers: true })
}

fn inspect_slot(
    writer: &TxnContext,
    slot: u32,
    rlist: &ReadersList,
    registry: &TxnRegistry,
    policy: BackedgePolicy,
) -> Result<(), CoreError> {
    let xid = rlist.xid_at(slot);
    if xid == 0 {
        // Reader finished or was replaced: its slot stamp is the worst
        // commit stamp it could have assumed.
        writer.raise_pstamp(rlist.get_last_read_mostly_cstamp(slot));
        return Ok(());
    }
    let Some(reader) = registry.get(Xid::new(xid)) else {
        writer.raise_pstamp(rlist.get_last_read_mostly_cstamp(slot));
        return Ok(());
    };

    let r_cstamp = reader.cstamp();
    if r_cstamp > 0 && r_cstamp < writer.cstamp() {
        // The reader serializes before this writer; wait for its verdict.
        await_outcome(writer, &reader, slot, rlist);
        return Ok(());
    }

    // Back-edge: the reader will (attempt to) commit after this writer.
    match policy {
        BackedgePolicy::CasSstamp => {
            // Publish-before-CAS: our sstamp was finalized and stored
            // with Release by the commit path before inspection started.
            let transferred = reader.lower_sstamp(writer.sstamp());
            tracing::debug!(
                writer = %writer.xid(),
                reader = %reader.xid(),
                sstamp = transferred,
                "back-edge: successor bound transferred to reader"
            );
        }
        BackedgePolicy::ShouldAbort => {
            if reader.state() == TxnState::Active {
                reader.set_should_abort();
                if reader.state() == TxnState::Active {
                    tracing::debug!(
                        writer = %writer.xid(),
                        reader = %reader.xid(),
                        "back-edge: reader told to abort"
                    );
                    return Ok(());
                }
            }
            // The reader slipped past ACTIVE before it could observe the
            // flag; the writer yields instead of risking a missed edge.
            return Err(CoreError::SerializationAbort(AbortReason::ShouldAbort));
        }
        BackedgePolicy::Spin => {
            await_outcome(writer, &reader, slot, rlist);
        }
    }
    Ok(())
}

/// Busy-wait for `reader`'s final state, then fold the appropriate
/// predecessor stamp into the writer. Bounded by the reader's own
/// validation path.
fn await_outcome(writer: &TxnContext, reader: &TxnContext, slot: u32, rlist: &ReadersList) {
    loop {
        match reader.state() {
            TxnState::Committed => {
                writer.raise_pstamp(reader.cstamp());
                return;
            }
            TxnState::Aborted => {
                writer.raise_pstamp(rlist.get_last_read_mostly_cstamp(slot));
                return;
            }
            TxnState::Active | TxnState::Precommit => std::hint::spin_loop(),
        }
    }
}
