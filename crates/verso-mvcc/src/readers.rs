//! The process-wide readers list.
//!
//! Every worker thread claims one bit position; per-tuple reader bitmaps
//! use the same positions. Two slot arrays let a committing writer
//! resolve a bitmap bit to either a running transaction (`xids`) or, when
//! the reader is already gone, to the most pessimistic commit stamp any
//! recent read-mostly transaction at that slot could have assumed
//! (`last_read_mostly_clsns`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use verso_error::CoreError;
use verso_types::{Lsn, Xid};

use crate::aligned::CacheAligned;
use crate::tuple::TupleHeader;

/// Number of reader slots; also the width of every tuple's `rl_bitmap`.
pub const SLOT_COUNT: usize = 64;

/// Claimed-slot word plus the two per-slot arrays.
pub struct ReadersList {
    claimed: AtomicU64,
    xids: [CacheAligned<AtomicU64>; SLOT_COUNT],
    last_read_mostly_clsns: [CacheAligned<AtomicU64>; SLOT_COUNT],
}

impl ReadersList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            claimed: AtomicU64::new(0),
            xids: std::array::from_fn(|_| CacheAligned::new(AtomicU64::new(0))),
            last_read_mostly_clsns: std::array::from_fn(|_| CacheAligned::new(AtomicU64::new(0))),
        }
    }

    /// Claim the lowest unset bit of the claimed-slots word.
    ///
    /// # Errors
    ///
    /// [`CoreError::SlotExhaustion`] when all [`SLOT_COUNT`] bits are
    /// taken. Fatal: the caller cannot run transactions on this thread.
    pub fn claim_slot(self: &Arc<Self>) -> Result<SlotGuard, CoreError> {
        let mut old = self.claimed.load(Ordering::Acquire);
        loop {
            if old == u64::MAX {
                return Err(CoreError::SlotExhaustion(SLOT_COUNT));
            }
            // Setting the lowest clear bit: old | (old + 1).
            let new = old | (old.wrapping_add(1));
            match self
                .claimed
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let mask = new ^ old;
                    tracing::trace!(slot = mask.trailing_zeros(), "reader slot claimed");
                    return Ok(SlotGuard {
                        rlist: Arc::clone(self),
                        mask,
                    });
                }
                Err(cur) => old = cur,
            }
        }
    }

    /// Snapshot a tuple's reader bitmap, optionally excluding the caller's
    /// own bit.
    #[must_use]
    pub fn tuple_readers(tuple: &TupleHeader, self_mask: u64, exclude_self: bool) -> u64 {
        let bm = tuple.rl_bitmap.load(Ordering::SeqCst);
        if exclude_self {
            bm & !self_mask
        } else {
            bm
        }
    }

    /// Record `xid` as the transaction currently occupying `slot`.
    /// Written only by the owning thread.
    pub fn register_tx(&self, slot: u32, xid: Xid) {
        debug_assert_eq!(self.xids[slot as usize].load(Ordering::Relaxed), 0);
        self.xids[slot as usize].store(xid.get(), Ordering::Release);
    }

    /// Clear the slot at transaction end. Written only by the owning
    /// thread.
    pub fn deregister_tx(&self, slot: u32) {
        self.xids[slot as usize].store(0, Ordering::Release);
    }

    /// The xid currently occupying `slot`, or zero.
    #[must_use]
    pub fn xid_at(&self, slot: u32) -> u64 {
        self.xids[slot as usize].load(Ordering::Acquire)
    }

    /// Record the commit stamp a committing read-mostly transaction
    /// assigned itself.
    ///
    /// The Release store pairs with the writer's Acquire in
    /// [`get_last_read_mostly_cstamp`](Self::get_last_read_mostly_cstamp):
    /// any writer that later inspects this slot observes at least this
    /// stamp. Must happen before the commit is broadcast (the state store
    /// to COMMITTED).
    pub fn stamp_last_committed_lsn(&self, slot: u32, lsn: Lsn) {
        self.last_read_mostly_clsns[slot as usize].store(lsn.offset(), Ordering::Release);
    }

    /// Raw offset of the last read-mostly commit stamp at `slot`: the
    /// worst-case cstamp any vanished reader there could have assumed.
    #[must_use]
    pub fn get_last_read_mostly_cstamp(&self, slot: u32) -> u64 {
        self.last_read_mostly_clsns[slot as usize].load(Ordering::Acquire)
    }

    fn release(&self, mask: u64) {
        debug_assert_ne!(self.claimed.load(Ordering::Relaxed) & mask, 0);
        self.claimed.fetch_xor(mask, Ordering::AcqRel);
        tracing::trace!(slot = mask.trailing_zeros(), "reader slot released");
    }
}

impl Default for ReadersList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReadersList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadersList")
            .field("claimed", &self.claimed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A claimed reader-bitmap position, released on drop.
///
/// One per worker thread; every transaction begun on the thread uses the
/// same position.
pub struct SlotGuard {
    rlist: Arc<ReadersList>,
    mask: u64,
}

impl SlotGuard {
    /// The single-bit mask this thread ORs into tuple bitmaps.
    #[inline]
    #[must_use]
    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// The bit index of this slot.
    #[inline]
    #[must_use]
    pub fn index(&self) -> u32 {
        self.mask.trailing_zeros()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.rlist.release(self.mask);
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("slot", &self.index()).finish()
    }
}
