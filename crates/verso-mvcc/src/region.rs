//! The per-socket region allocator and its reclaim daemon.
//!
//! Versions are bump-allocated out of a hot ring of `2^K` segments of
//! `2^S` bytes. The usable window is `[reclaimed_offset - hot_capacity,
//! reclaimed_offset)`; allocation is a fetch-and-add, and a chunk that
//! would span a segment boundary is abandoned, which is what pushes the
//! allocator into `GC_REQUESTED`. One daemon per socket drains the
//! oldest segment when signaled: chain heads below the trim horizon move
//! to the cold region, dead tails are cut, and still-live interior
//! versions move to fresh hot storage. The epoch callback is the only
//! place that advances `reclaimed_offset` and returns the allocator to
//! `NORMAL`, so storage is never reused while a thread from an older
//! epoch could still hold a pointer into the drained segment.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use verso_error::{CoreError, Region};
use verso_types::{Lsn, Oid};

use crate::aligned::{CacheAligned, CACHE_LINE_BYTES};
use crate::config::CoreConfig;
use crate::metrics::CoreMetrics;
use crate::tuple::{is_installer, ChainIndex, Object};

// ---------------------------------------------------------------------------
// GC state machine
// ---------------------------------------------------------------------------

/// Reclamation state of one allocator.
///
/// `Normal → Requested` is performed by the allocating thread that
/// crosses a segment boundary; every other transition happens inside the
/// epoch-reclaimed callback or the daemon, which serializes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcState {
    Normal = 0,
    Requested = 1,
    InProgress = 2,
    Finished = 3,
}

impl GcState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Normal,
            1 => Self::Requested,
            2 => Self::InProgress,
            _ => Self::Finished,
        }
    }
}

// ---------------------------------------------------------------------------
// Owned region memory
// ---------------------------------------------------------------------------

/// A zeroed, cache-line-aligned allocation owned for the process
/// lifetime.
struct RegionMemory {
    base: NonNull<u8>,
    layout: Layout,
}

impl RegionMemory {
    fn new(capacity: u64) -> Self {
        let layout = Layout::from_size_align(capacity as usize, CACHE_LINE_BYTES)
            .expect("region capacity fits a Layout");
        // SAFETY: layout has non-zero size (capacities are validated > 0).
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).expect("region allocation failed");
        Self { base, layout }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

impl Drop for RegionMemory {
    fn drop(&mut self) {
        // SAFETY: base/layout came from alloc_zeroed above.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

// SAFETY: the region is plain bytes; all structure written into it is
// accessed through atomics on Object/TupleHeader.
unsafe impl Send for RegionMemory {}
unsafe impl Sync for RegionMemory {}

// ---------------------------------------------------------------------------
// RegionAllocator
// ---------------------------------------------------------------------------

/// One NUMA socket's allocator: hot ring + cold region + GC state.
pub struct RegionAllocator {
    socket: usize,
    segment_bits: u32,
    hot_capacity: u64,
    hot_mask: u64,
    cold_capacity: u64,
    hot: RegionMemory,
    cold: RegionMemory,

    /// Upper bound of the usable hot window; starts at `hot_capacity`.
    reclaimed_offset: AtomicU64,
    allocated_hot_offset: CacheAligned<AtomicU64>,
    allocated_cold_offset: CacheAligned<AtomicU64>,
    /// Bytes allocated since the last trim-mark epoch request.
    allocated_since_trim: AtomicU64,

    state: AtomicU8,
    reclaim_lock: Mutex<()>,
    reclaim_cv: Condvar,
    shutdown: AtomicBool,
}

/// One reclamation pass's byte accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub cold_relocated_bytes: u64,
    pub hot_relocated_bytes: u64,
    pub chain_truncations: u64,
}

impl RegionAllocator {
    #[must_use]
    pub fn new(config: &CoreConfig, socket: usize) -> Self {
        let hot_capacity = config.hot_capacity();
        let cold_capacity = config.cold_capacity();
        tracing::info!(
            socket,
            hot_capacity,
            cold_capacity,
            segment_bits = config.segment_bits,
            "region allocator initialized"
        );
        Self {
            socket,
            segment_bits: config.segment_bits,
            hot_capacity,
            hot_mask: hot_capacity - 1,
            cold_capacity,
            hot: RegionMemory::new(hot_capacity),
            cold: RegionMemory::new(cold_capacity),
            reclaimed_offset: AtomicU64::new(hot_capacity),
            allocated_hot_offset: CacheAligned::new(AtomicU64::new(0)),
            allocated_cold_offset: CacheAligned::new(AtomicU64::new(0)),
            allocated_since_trim: AtomicU64::new(0),
            state: AtomicU8::new(GcState::Normal as u8),
            reclaim_lock: Mutex::new(()),
            reclaim_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub fn socket(&self) -> usize {
        self.socket
    }

    #[inline]
    #[must_use]
    pub const fn segment_size(&self) -> u64 {
        1 << self.segment_bits
    }

    #[must_use]
    pub fn state(&self) -> GcState {
        GcState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: GcState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Current hot allocation cursor (monotone).
    #[must_use]
    pub fn allocated_hot_offset(&self) -> u64 {
        self.allocated_hot_offset.load(Ordering::SeqCst)
    }

    /// Current reclaimed bound (monotone).
    #[must_use]
    pub fn reclaimed_offset(&self) -> u64 {
        self.reclaimed_offset.load(Ordering::SeqCst)
    }

    /// Bytes allocated since the accumulator was last consumed.
    #[must_use]
    pub fn trim_accumulated(&self) -> u64 {
        self.allocated_since_trim.load(Ordering::Relaxed)
    }

    /// Subtract `amount` after a successful trim-mark epoch request.
    pub fn consume_trim(&self, amount: u64) {
        self.allocated_since_trim.fetch_sub(amount, Ordering::Relaxed);
    }

    /// Allocate `size` bytes of version storage from the hot ring.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfMemory`] when the usable window is exhausted
    /// (reclamation has not kept up), and [`CoreError::GcOverlap`] when a
    /// segment boundary is crossed while a previous cycle is still in
    /// flight.
    pub fn allocate_hot(&self, size: u64) -> Result<NonNull<u8>, CoreError> {
        if size == 0 || size > self.segment_size() {
            return Err(CoreError::OutOfMemory {
                region: Region::Hot,
                requested: size,
            });
        }
        loop {
            let noffset = self.allocated_hot_offset.fetch_add(size, Ordering::SeqCst) + size;
            if self.reclaimed_offset.load(Ordering::SeqCst) < noffset {
                return Err(CoreError::OutOfMemory {
                    region: Region::Hot,
                    requested: size,
                });
            }
            self.allocated_since_trim.fetch_add(size, Ordering::Relaxed);

            let sbits = self.segment_bits;
            if (noffset - 1) >> sbits != (noffset - size) >> sbits {
                // The chunk spans a segment boundary: abandon it and open
                // the next segment, which costs one reclamation cycle.
                tracing::info!(
                    socket = self.socket,
                    segment = noffset >> sbits,
                    "opening hot segment"
                );
                if self.state() != GcState::Normal {
                    return Err(CoreError::GcOverlap);
                }
                self.set_state(GcState::Requested);
                continue;
            }

            let offset = (noffset - size) & self.hot_mask;
            // SAFETY: offset + size <= hot_capacity (the chunk fits one
            // segment and the window check passed), and the region lives
            // as long as self.
            return Ok(unsafe { NonNull::new_unchecked(self.hot.base().add(offset as usize)) });
        }
    }

    /// Allocate `size` bytes from the append-only cold region.
    ///
    /// # Errors
    ///
    /// [`CoreError::OutOfMemory`] when the cold region is exhausted; cold
    /// storage is only compacted at restart.
    pub fn allocate_cold(&self, size: u64) -> Result<NonNull<u8>, CoreError> {
        if size == 0 {
            return Err(CoreError::OutOfMemory {
                region: Region::Cold,
                requested: size,
            });
        }
        let noffset = self.allocated_cold_offset.fetch_add(size, Ordering::SeqCst) + size;
        if self.cold_capacity < noffset {
            return Err(CoreError::OutOfMemory {
                region: Region::Cold,
                requested: size,
            });
        }
        // SAFETY: [noffset - size, noffset) is within the cold region.
        Ok(unsafe { NonNull::new_unchecked(self.cold.base().add((noffset - size) as usize)) })
    }

    /// Wake the reclaim daemon.
    ///
    /// The lock is taken so the notification cannot slip between the
    /// daemon's condition check and its wait.
    pub fn trigger_reclaim(&self) {
        let _guard = self.reclaim_lock.lock();
        self.reclaim_cv.notify_all();
    }

    /// Ask the daemon to exit; it wakes and returns.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _guard = self.reclaim_lock.lock();
        self.reclaim_cv.notify_all();
    }

    /// Open the drained segment for reuse. Called only from the
    /// epoch-reclaimed callback after `GC_FINISHED`.
    pub fn advance_reclaimed(&self) {
        self.reclaimed_offset
            .fetch_add(self.segment_size(), Ordering::SeqCst);
    }

    #[inline]
    fn hot_offset_of(&self, ptr: *const Object) -> u64 {
        (ptr as usize).wrapping_sub(self.hot.addr()) as u64
    }

    /// Copy `src` into `dst`, optionally severing the copy's tail link.
    ///
    /// # Safety
    ///
    /// `src` must be a live version of `size` bytes and `dst` an
    /// allocation of at least that size owned by the reclaimer.
    unsafe fn relocate(src: *mut Object, dst: NonNull<u8>, sever_tail: bool) -> *mut Object {
        let size = (*src).size() as usize;
        std::ptr::copy_nonoverlapping(src.cast::<u8>(), dst.as_ptr(), size);
        let moved = dst.as_ptr().cast::<Object>();
        if sever_tail {
            (*moved).next().store(std::ptr::null_mut(), Ordering::SeqCst);
        }
        moved
    }

    /// Drain the oldest hot segment: one full pass over every registered
    /// table's chains.
    ///
    /// For each chain, versions stored in the segment are either moved to
    /// cold storage (reachable head below the trim horizon), cut off
    /// (dead tail below the horizon), or moved to fresh hot storage
    /// (still live). Any CAS failure restarts that oid's walk, which
    /// keeps the pass linearizable with concurrent installs.
    pub fn drain_segment(&self, tables: &[Arc<dyn ChainIndex>], trim_lsn: Lsn) -> DrainOutcome {
        let start = self.reclaimed_offset.load(Ordering::SeqCst) & self.hot_mask;
        let end = start + self.segment_size();
        debug_assert_eq!(start % self.segment_size(), 0);
        tracing::info!(
            socket = self.socket,
            start,
            end,
            %trim_lsn,
            "reclaiming hot segment"
        );

        let mut out = DrainOutcome::default();
        for table in tables {
            for raw_oid in 1..table.oid_count() {
                let oid = Oid::new(raw_oid);
                'restart: loop {
                    let head = table.head(oid);
                    if head.is_null() {
                        break;
                    }

                    // SAFETY: chain pointers reachable from a head stay
                    // valid for the whole cycle; their storage is only
                    // reused after the epoch callback advances
                    // reclaimed_offset, which happens strictly after this
                    // pass finishes.
                    unsafe {
                        let head_obj = &*head;
                        let head_off = self.hot_offset_of(head);
                        if head_off >= start
                            && head_off + head_obj.size() <= end
                            && !is_installer(head_obj.tuple().clsn_word())
                            && Lsn::from_word(head_obj.tuple().clsn_word()) < trim_lsn
                        {
                            // Reachable but cold: move out of the ring and
                            // drop the (even older) tail.
                            let dst = self.must_allocate(Region::Cold, head_obj.size());
                            let moved = Self::relocate(head, dst, true);
                            if !table.cas_head(oid, head, moved) {
                                continue 'restart;
                            }
                            out.cold_relocated_bytes += head_obj.size();
                            break;
                        }

                        let mut prev: *mut Object = std::ptr::null_mut();
                        let mut cur = head;
                        while !cur.is_null() {
                            let obj = &*cur;
                            let size = obj.size();
                            let off = self.hot_offset_of(cur);
                            let clsn = obj.tuple().clsn_word();
                            if off >= start && off + size <= end && !is_installer(clsn) {
                                // Installer-tagged versions stay put: the
                                // installing transaction still holds this
                                // pointer and will stamp it at commit.
                                let dead = Lsn::from_word(clsn) < trim_lsn;
                                if dead && !prev.is_null() {
                                    // Everything from here down is below
                                    // the horizon: cut the tail.
                                    if (*prev)
                                        .next()
                                        .compare_exchange(
                                            cur,
                                            std::ptr::null_mut(),
                                            Ordering::SeqCst,
                                            Ordering::SeqCst,
                                        )
                                        .is_err()
                                    {
                                        continue 'restart;
                                    }
                                    out.chain_truncations += 1;
                                    break;
                                }
                                // Still live (or a live head): move to a
                                // fresh hot segment.
                                let dst = self.must_allocate(Region::Hot, size);
                                let moved = Self::relocate(cur, dst, false);
                                let swapped = if prev.is_null() {
                                    table.cas_head(oid, cur, moved)
                                } else {
                                    (*prev)
                                        .next()
                                        .compare_exchange(
                                            cur,
                                            moved,
                                            Ordering::SeqCst,
                                            Ordering::SeqCst,
                                        )
                                        .is_ok()
                                };
                                if !swapped {
                                    continue 'restart;
                                }
                                out.hot_relocated_bytes += size;
                                prev = moved;
                                cur = (*moved).next().load(Ordering::SeqCst);
                            } else {
                                prev = cur;
                                cur = obj.next().load(Ordering::SeqCst);
                            }
                        }
                    }
                    break;
                }
            }
        }
        out
    }

    /// Daemon-side allocation: there is no caller to hand an error to, so
    /// failure here means the ring or the cold region is misconfigured
    /// for the live-version footprint.
    fn must_allocate(&self, region: Region, size: u64) -> NonNull<u8> {
        let result = match region {
            Region::Hot => self.allocate_hot(size),
            Region::Cold => self.allocate_cold(size),
        };
        match result {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::error!(socket = self.socket, %err, "reclaim daemon cannot relocate");
                panic!("reclaim daemon cannot relocate: {err}");
            }
        }
    }
}

impl std::fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("socket", &self.socket)
            .field("state", &self.state())
            .field("allocated_hot_offset", &self.allocated_hot_offset())
            .field("reclaimed_offset", &self.reclaimed_offset())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Reclaim daemon
// ---------------------------------------------------------------------------

/// Everything the daemon thread needs.
pub(crate) struct ReclaimContext {
    pub allocator: Arc<RegionAllocator>,
    pub tables: Arc<RwLock<Vec<Arc<dyn ChainIndex>>>>,
    pub trim_lsn: Arc<AtomicU64>,
    pub metrics: Arc<CoreMetrics>,
}

/// Daemon body: wait for a cycle, drain one segment, hand the state
/// machine back to the epoch callback.
pub(crate) fn run_reclaim_daemon(ctx: &ReclaimContext) {
    let allocator = &ctx.allocator;
    tracing::info!(socket = allocator.socket(), "reclaim daemon started");
    loop {
        {
            let mut guard = allocator.reclaim_lock.lock();
            loop {
                if allocator.shutdown.load(Ordering::SeqCst) {
                    tracing::info!(socket = allocator.socket(), "reclaim daemon stopping");
                    return;
                }
                if allocator.state() == GcState::InProgress {
                    break;
                }
                allocator.reclaim_cv.wait(&mut guard);
            }
        }

        let trim_lsn = Lsn::new(ctx.trim_lsn.load(Ordering::Acquire));
        let tables = ctx.tables.read().clone();
        let outcome = allocator.drain_segment(&tables, trim_lsn);

        ctx.metrics
            .cold_relocated_bytes_total
            .fetch_add(outcome.cold_relocated_bytes, Ordering::Relaxed);
        ctx.metrics
            .hot_relocated_bytes_total
            .fetch_add(outcome.hot_relocated_bytes, Ordering::Relaxed);
        ctx.metrics
            .chain_truncations_total
            .fetch_add(outcome.chain_truncations, Ordering::Relaxed);

        debug_assert_eq!(allocator.state(), GcState::InProgress);
        allocator.set_state(GcState::Finished);
        tracing::info!(
            socket = allocator.socket(),
            cold_bytes = outcome.cold_relocated_bytes,
            hot_bytes = outcome.hot_relocated_bytes,
            truncated = outcome.chain_truncations,
            "hot segment drained"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{DrainOutcome, GcState, RegionAllocator};
    use crate::config::CoreConfig;
    use crate::tuple::{ChainIndex, Object, OidTable};
    use std::sync::Arc;
    use verso_error::CoreError;
    use verso_types::{Lsn, Oid, Xid};

    fn small_config() -> CoreConfig {
        CoreConfig {
            segment_bits: 12, // 4 KiB segments
            num_segments_bits: 2,
            cold_capacity_segments: 2,
            trim_mark_bytes: 1 << 11,
            ..CoreConfig::default()
        }
    }

    #[test]
    fn allocations_stay_inside_the_window() {
        let ra = RegionAllocator::new(&small_config(), 0);
        for _ in 0..8 {
            ra.allocate_hot(256).unwrap();
            let window = ra.reclaimed_offset() - ra.allocated_hot_offset();
            assert!(window <= ra.segment_size() * 4);
        }
    }

    #[test]
    fn spanning_chunk_is_abandoned_and_requests_gc() {
        let ra = RegionAllocator::new(&small_config(), 0);
        ra.allocate_hot(4000).unwrap();
        assert_eq!(ra.state(), GcState::Normal);
        // 4000 + 200 crosses the first 4 KiB boundary.
        let ptr = ra.allocate_hot(200).unwrap();
        assert_eq!(ra.state(), GcState::Requested);
        // The retried chunk starts after the abandoned span.
        assert!(ra.allocated_hot_offset() >= 4200);
        let _ = ptr;
    }

    #[test]
    fn back_to_back_boundary_crossings_are_fatal() {
        let ra = RegionAllocator::new(&small_config(), 0);
        ra.allocate_hot(4000).unwrap();
        ra.allocate_hot(200).unwrap(); // first crossing: Requested
        // Creep up to just short of the next boundary without spanning,
        // so the next chunk must span it.
        loop {
            let off = ra.allocated_hot_offset();
            let to_near_boundary = 8190 - off;
            if to_near_boundary == 0 {
                break;
            }
            ra.allocate_hot(to_near_boundary.min(512)).unwrap();
        }
        let err = ra.allocate_hot(300).unwrap_err();
        assert!(matches!(err, CoreError::GcOverlap));
    }

    #[test]
    fn hot_exhaustion_reports_out_of_memory() {
        let ra = RegionAllocator::new(&small_config(), 0);
        // Exactly segment-sized chunks never span a boundary.
        for _ in 0..4 {
            ra.allocate_hot(4096).unwrap();
        }
        assert!(matches!(
            ra.allocate_hot(4096),
            Err(CoreError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn cold_is_a_plain_bump_with_a_hard_cap() {
        let ra = RegionAllocator::new(&small_config(), 0);
        let a = ra.allocate_cold(1024).unwrap();
        let b = ra.allocate_cold(1024).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 1024);
        ra.allocate_cold(8192 - 2048).unwrap();
        assert!(matches!(
            ra.allocate_cold(1),
            Err(CoreError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn advance_reclaimed_opens_exactly_one_segment() {
        let ra = RegionAllocator::new(&small_config(), 0);
        let before = ra.reclaimed_offset();
        ra.advance_reclaimed();
        assert_eq!(ra.reclaimed_offset() - before, 1 << 12);
    }

    /// Install a chain of versions for one oid directly through the
    /// allocator, newest last. Returns the object pointers oldest-first.
    fn build_chain(
        ra: &RegionAllocator,
        table: &OidTable,
        oid: Oid,
        stamps: &[u64],
        payload: &[u8],
    ) -> Vec<*mut Object> {
        let mut ptrs = Vec::new();
        for (i, &stamp) in stamps.iter().enumerate() {
            let size = Object::alloc_size(payload.len());
            let dst = ra.allocate_hot(size).unwrap();
            let prev = table.head(oid);
            // SAFETY: dst is a fresh allocation of `size` bytes.
            let obj = unsafe { Object::initialize(dst.as_ptr(), prev, Xid::new(i as u64 + 1), payload) };
            // SAFETY: obj was just initialized.
            unsafe { (*obj).tuple().set_commit_stamp(Lsn::new(stamp)) };
            assert!(table.cas_head(oid, prev, obj));
            ptrs.push(obj);
        }
        ptrs
    }

    #[test]
    fn drain_moves_cold_heads_and_cuts_dead_tails() {
        let ra = RegionAllocator::new(&small_config(), 0);
        let table = OidTable::new(8);

        // oid 1: whole chain ancient -> head goes cold, tail severed.
        let cold_oid = table.allocate_oid().unwrap();
        build_chain(&ra, &table, cold_oid, &[5, 9], b"cold");

        // oid 2: live head in-segment, ancient tail -> head relocates
        // hot, tail truncates.
        let live_oid = table.allocate_oid().unwrap();
        build_chain(&ra, &table, live_oid, &[7, 500], b"live");

        let table = Arc::new(table);
        let out = ra.drain_segment(
            &[Arc::clone(&table) as Arc<dyn ChainIndex>],
            Lsn::new(100),
        );

        // cold chain: head (clsn 9) relocated cold, chain cut below it.
        let cold_head = table.head(cold_oid);
        assert!(!cold_head.is_null());
        // SAFETY: relocated head is valid cold storage.
        let cold_head = unsafe { &*cold_head };
        assert_eq!(cold_head.tuple().commit_stamp(), Some(Lsn::new(9)));
        assert!(cold_head.next().load(std::sync::atomic::Ordering::SeqCst).is_null());
        assert_eq!(cold_head.payload(), b"cold");

        // live chain: head (clsn 500) moved to fresh hot storage; its
        // ancient predecessor (clsn 7) was cut.
        let live_head = table.head(live_oid);
        // SAFETY: relocated head is valid hot storage.
        let live_head = unsafe { &*live_head };
        assert_eq!(live_head.tuple().commit_stamp(), Some(Lsn::new(500)));
        assert!(live_head.next().load(std::sync::atomic::Ordering::SeqCst).is_null());
        assert_eq!(live_head.payload(), b"live");

        assert_eq!(
            out,
            DrainOutcome {
                cold_relocated_bytes: cold_head.size(),
                hot_relocated_bytes: live_head.size(),
                chain_truncations: 1,
            }
        );
    }

    #[test]
    fn drain_keeps_a_freshly_installed_head() {
        // A writer won the head before the daemon's walk; the drain must
        // keep the writer's version on top and only prune below it.
        let ra = RegionAllocator::new(&small_config(), 0);
        let table = Arc::new(OidTable::new(4));
        let oid = table.allocate_oid().unwrap();
        build_chain(&ra, &table, oid, &[3], b"old");

        // A racing writer installs a fresh committed head on top.
        build_chain(&ra, &table, oid, &[400], b"new");

        ra.drain_segment(&[Arc::clone(&table) as Arc<dyn ChainIndex>], Lsn::new(100));
        let head = table.head(oid);
        // SAFETY: head is a valid version.
        let head = unsafe { &*head };
        assert_eq!(head.tuple().commit_stamp(), Some(Lsn::new(400)));
        assert_eq!(head.payload(), b"new");
    }

    #[test]
    fn uncommitted_versions_are_left_in_place() {
        let ra = RegionAllocator::new(&small_config(), 0);
        let table = Arc::new(OidTable::new(4));
        let oid = table.allocate_oid().unwrap();

        let size = Object::alloc_size(4);
        let dst = ra.allocate_hot(size).unwrap();
        // SAFETY: fresh allocation of `size` bytes.
        let obj = unsafe { Object::initialize(dst.as_ptr(), std::ptr::null_mut(), Xid::new(7), b"mine") };
        assert!(table.cas_head(oid, std::ptr::null_mut(), obj));

        let out = ra.drain_segment(&[Arc::clone(&table) as Arc<dyn ChainIndex>], Lsn::new(u64::MAX >> 1));
        // The installer still holds this pointer: the drain neither moves
        // nor truncates it.
        assert_eq!(out, DrainOutcome::default());
        assert_eq!(table.head(oid), obj);
        // SAFETY: head was never moved.
        let head = unsafe { &*table.head(oid) };
        assert!(head.tuple().commit_stamp().is_none());
        assert_eq!(head.payload(), b"mine");
    }
}
