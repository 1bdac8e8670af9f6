//! Transaction contexts and the transaction glue.
//!
//! [`TxnContext`] is the shared, atomically-updated surface other
//! transactions interact with: commit/predecessor/successor stamps, the
//! state machine, and the `should_abort` flag. [`Transaction`] is the
//! worker-owned driver that walks chains, installs versions, and runs
//! the SSN commit protocol against the runtime's singletons.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use verso_error::{AbortReason, CoreError};
use verso_types::{Lsn, Oid, Xid};

use crate::runtime::WorkerHandle;
use crate::ssn;
use crate::tuple::{installer_xid, is_installer, ChainIndex, Object};

// ---------------------------------------------------------------------------
// TxnContext
// ---------------------------------------------------------------------------

/// Transaction state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnState {
    Active = 0,
    Precommit = 1,
    Committed = 2,
    Aborted = 3,
}

impl TxnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Active,
            1 => Self::Precommit,
            2 => Self::Committed,
            _ => Self::Aborted,
        }
    }
}

/// The shared face of a running transaction.
///
/// Everything here is read by other transactions through the readers
/// list: a committing writer resolves a bitmap bit to an xid, fetches
/// this context from the registry, and then spins on `state`, raises
/// nothing, or CAS-lowers `sstamp`. `sstamp` starts at `u64::MAX` and is
/// only ever lowered, by the owner at pre-commit and by back-edge
/// writers.
#[derive(Debug)]
pub struct TxnContext {
    xid: Xid,
    slot: u32,
    begin_stamp: Lsn,
    cstamp: AtomicU64,
    pstamp: AtomicU64,
    sstamp: AtomicU64,
    state: AtomicU8,
    should_abort: AtomicBool,
    read_mostly: AtomicBool,
}

impl TxnContext {
    #[must_use]
    pub fn new(xid: Xid, slot: u32, begin_stamp: Lsn) -> Self {
        Self {
            xid,
            slot,
            begin_stamp,
            cstamp: AtomicU64::new(0),
            pstamp: AtomicU64::new(0),
            sstamp: AtomicU64::new(u64::MAX),
            state: AtomicU8::new(TxnState::Active as u8),
            should_abort: AtomicBool::new(false),
            read_mostly: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub fn xid(&self) -> Xid {
        self.xid
    }

    #[inline]
    #[must_use]
    pub fn slot(&self) -> u32 {
        self.slot
    }

    #[inline]
    #[must_use]
    pub fn begin_stamp(&self) -> Lsn {
        self.begin_stamp
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TxnState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Commit stamp, zero until pre-commit.
    #[must_use]
    pub fn cstamp(&self) -> u64 {
        self.cstamp.load(Ordering::Acquire)
    }

    pub fn set_cstamp(&self, cstamp: Lsn) {
        self.cstamp.store(cstamp.offset(), Ordering::Release);
    }

    #[must_use]
    pub fn pstamp(&self) -> u64 {
        self.pstamp.load(Ordering::SeqCst)
    }

    /// Raise the predecessor stamp to at least `to`.
    pub fn raise_pstamp(&self, to: u64) {
        self.pstamp.fetch_max(to, Ordering::SeqCst);
    }

    /// Latest published successor bound.
    #[must_use]
    pub fn sstamp(&self) -> u64 {
        self.sstamp.load(Ordering::SeqCst)
    }

    /// Lower the successor bound to at most `to`; monotone, callable by
    /// back-edge writers as well as the owner. Returns the resulting
    /// bound.
    pub fn lower_sstamp(&self, to: u64) -> u64 {
        let prev = self.sstamp.fetch_min(to, Ordering::SeqCst);
        prev.min(to)
    }

    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.should_abort.load(Ordering::SeqCst)
    }

    pub fn set_should_abort(&self) {
        self.should_abort.store(true, Ordering::SeqCst);
    }

    /// Record that this transaction took the untracked old-version path.
    pub fn mark_read_mostly(&self) {
        self.read_mostly.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_read_mostly(&self) -> bool {
        self.read_mostly.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// TxnRegistry
// ---------------------------------------------------------------------------

/// xid → context map, used by writers to resolve readers-list slots.
///
/// Lock-based and simple; cardinality is bounded by active transactions.
#[derive(Debug, Default)]
pub struct TxnRegistry {
    active: Mutex<HashMap<u64, Arc<TxnContext>>>,
}

impl TxnRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ctx: Arc<TxnContext>) {
        self.active.lock().insert(ctx.xid().get(), ctx);
    }

    pub fn remove(&self, xid: Xid) {
        self.active.lock().remove(&xid.get());
    }

    /// The running context for `xid`, if it is still registered.
    #[must_use]
    pub fn get(&self, xid: Xid) -> Option<Arc<TxnContext>> {
        self.active.lock().get(&xid.get()).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

struct WriteRecord {
    table: Arc<dyn ChainIndex>,
    oid: Oid,
    new: *mut Object,
    prev: *mut Object,
}

/// A running transaction, bound to its worker thread.
///
/// Dropping an unfinished transaction aborts it.
pub struct Transaction<'w> {
    worker: &'w WorkerHandle,
    ctx: Arc<TxnContext>,
    read_set: SmallVec<[*mut Object; 8]>,
    write_set: SmallVec<[WriteRecord; 4]>,
    finished: bool,
}

impl<'w> Transaction<'w> {
    pub(crate) fn begin(worker: &'w WorkerHandle) -> Self {
        let runtime = worker.runtime();
        runtime.epochs().thread_enter(worker.epoch());
        let xid = runtime.next_xid();
        let begin_stamp = runtime.clock().cur_lsn();
        let ctx = Arc::new(TxnContext::new(xid, worker.slot_index(), begin_stamp));
        runtime.registry().insert(Arc::clone(&ctx));
        runtime.rlist().register_tx(worker.slot_index(), xid);
        tracing::debug!(xid = %xid, begin = %begin_stamp, "transaction started");
        Self {
            worker,
            ctx,
            read_set: SmallVec::new(),
            write_set: SmallVec::new(),
            finished: false,
        }
    }

    /// The shared context (begin stamp, stamps, state).
    #[must_use]
    pub fn ctx(&self) -> &Arc<TxnContext> {
        &self.ctx
    }

    /// Read the visible version of `oid`, registering this transaction
    /// as a reader.
    ///
    /// Visibility is snapshot-at-begin: the newest version whose commit
    /// stamp is at or below the begin stamp, or this transaction's own
    /// uncommitted version. Reads of versions older than the configured
    /// threshold take the untracked persistent-reader path.
    ///
    /// # Errors
    ///
    /// [`CoreError::SerializationAbort`] with
    /// [`AbortReason::MarkerLocked`] when an old-version read races a
    /// committing writer; the transaction must be aborted.
    pub fn read(
        &mut self,
        table: &Arc<dyn ChainIndex>,
        oid: Oid,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        let mut cur = table.head(oid);
        while !cur.is_null() {
            // SAFETY: chain pointers observed inside our epoch stay valid
            // until the epoch drains (segment reuse is epoch-gated).
            let obj = unsafe { &*cur };
            let word = obj.tuple().clsn_word();
            if is_installer(word) {
                if installer_xid(word) == self.ctx.xid() {
                    return Ok(Some(obj.payload().to_vec()));
                }
                cur = obj.next().load(Ordering::SeqCst);
                continue;
            }
            let clsn = Lsn::from_word(word);
            if clsn <= self.ctx.begin_stamp() {
                self.register_read(obj, clsn)?;
                return Ok(Some(obj.payload().to_vec()));
            }
            cur = obj.next().load(Ordering::SeqCst);
        }
        Ok(None)
    }

    fn register_read(&mut self, obj: &Object, clsn: Lsn) -> Result<(), CoreError> {
        let runtime = self.worker.runtime();
        let mask = self.worker.slot_mask();
        let age = self.ctx.begin_stamp().offset().saturating_sub(clsn.offset());
        if age > runtime.config().old_version_threshold {
            // Old version: mark, claim the bit, and do not track.
            ssn::register_old_reader(obj.tuple(), mask)?;
            self.ctx.mark_read_mostly();
        } else {
            ssn::register_reader(obj.tuple(), mask);
            self.read_set.push(obj as *const Object as *mut Object);
        }
        // Creator is a predecessor; an already-stamped overwriter is a
        // successor.
        self.ctx.raise_pstamp(clsn.offset());
        let sstamp = obj.tuple().sstamp.load(Ordering::SeqCst);
        if sstamp != u64::MAX {
            self.ctx.lower_sstamp(sstamp);
        }
        Ok(())
    }

    /// Install a new version of `oid`.
    ///
    /// # Errors
    ///
    /// [`CoreError::SerializationAbort`] with
    /// [`AbortReason::WriteConflict`] when the head carries another
    /// transaction's uncommitted version or a version newer than this
    /// transaction's snapshot; [`CoreError::OutOfMemory`] /
    /// [`CoreError::GcOverlap`] from the allocator.
    pub fn write(
        &mut self,
        table: &Arc<dyn ChainIndex>,
        oid: Oid,
        payload: &[u8],
    ) -> Result<(), CoreError> {
        let runtime = self.worker.runtime();
        let size = Object::alloc_size(payload.len());
        let storage = runtime.allocate_version(self.worker, size)?;
        let mut new: *mut Object = std::ptr::null_mut();

        loop {
            let head = table.head(oid);
            if !head.is_null() {
                // SAFETY: see read(); epoch-gated chain pointer.
                let head_obj = unsafe { &*head };
                let word = head_obj.tuple().clsn_word();
                if is_installer(word) && installer_xid(word) != self.ctx.xid() {
                    return Err(CoreError::SerializationAbort(AbortReason::WriteConflict));
                }
                if !is_installer(word) && Lsn::from_word(word) > self.ctx.begin_stamp() {
                    // A later transaction already committed a newer
                    // version this snapshot cannot see.
                    return Err(CoreError::SerializationAbort(AbortReason::WriteConflict));
                }
            }
            if new.is_null() {
                // SAFETY: storage is a fresh allocation of `size` bytes.
                new = unsafe { Object::initialize(storage.as_ptr(), head, self.ctx.xid(), payload) };
            } else {
                // SAFETY: `new` is ours and unpublished; only the link
                // needs refreshing before the retry.
                unsafe { (*new).next().store(head, Ordering::SeqCst) };
            }
            if table.cas_head(oid, head, new) {
                if !head.is_null() {
                    // SAFETY: as above.
                    let prev_tuple = unsafe { (*head).tuple() };
                    // Readers of the overwritten version recorded their
                    // stamps in its pstamp.
                    self.ctx.raise_pstamp(prev_tuple.pstamp.load(Ordering::SeqCst));
                }
                self.write_set.push(WriteRecord {
                    table: Arc::clone(table),
                    oid,
                    new,
                    prev: head,
                });
                tracing::trace!(xid = %self.ctx.xid(), %oid, size, "version installed");
                return Ok(());
            }
        }
    }

    /// Run SSN validation and commit.
    ///
    /// On any validation failure the transaction is aborted (its
    /// installed versions are unlinked) before the error is returned.
    ///
    /// # Errors
    ///
    /// [`CoreError::SerializationAbort`] with the failing rule.
    pub fn commit(mut self) -> Result<Lsn, CoreError> {
        match self.try_commit() {
            Ok(cstamp) => {
                self.finished = true;
                Ok(cstamp)
            }
            Err(err) => {
                self.worker
                    .runtime()
                    .metrics()
                    .ssn_aborts_total
                    .fetch_add(1, Ordering::Relaxed);
                self.do_abort();
                Err(err)
            }
        }
    }

    /// Abort and release everything.
    pub fn abort(mut self) {
        self.do_abort();
    }

    fn try_commit(&mut self) -> Result<Lsn, CoreError> {
        let runtime = self.worker.runtime();
        let ctx = &self.ctx;

        let cstamp = runtime.clock().advance();
        ctx.set_cstamp(cstamp);
        ctx.set_state(TxnState::Precommit);
        // Finalize and publish the successor bound before any back-edge
        // CAS can hand it to a reader.
        ctx.lower_sstamp(cstamp.offset());

        // Writer inspection over every overwritten version.
        for w in &self.write_set {
            if w.prev.is_null() {
                continue;
            }
            // SAFETY: prev stays valid through our epoch.
            let prev_tuple = unsafe { (*w.prev).tuple() };
            ctx.raise_pstamp(prev_tuple.xstamp.load(Ordering::SeqCst));
            let outcome = ssn::writer_inspect_readers(
                ctx,
                prev_tuple,
                runtime.rlist(),
                runtime.registry(),
                runtime.config().backedge_policy,
                self.worker.slot_mask(),
            )?;
            if outcome.saw_readers {
                runtime
                    .metrics()
                    .inspections_with_readers_total
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        // Re-validate the read set: an overwriter that committed since
        // the read has stamped the version's sstamp.
        for &r in &self.read_set {
            // SAFETY: read-set pointers stay valid through our epoch.
            let sstamp = unsafe { (*r).tuple() }.sstamp.load(Ordering::SeqCst);
            if sstamp != u64::MAX {
                ctx.lower_sstamp(sstamp);
            }
        }

        if ctx.should_abort() {
            return Err(CoreError::SerializationAbort(AbortReason::ShouldAbort));
        }
        if ctx.pstamp() >= ctx.sstamp() {
            return Err(CoreError::SerializationAbort(AbortReason::ExclusionWindow));
        }

        // Commit point. Read-mostly transactions leave their stamp for
        // writers that will find their slot empty, before the state
        // broadcast makes the commit visible.
        if ctx.is_read_mostly() {
            runtime
                .rlist()
                .stamp_last_committed_lsn(ctx.slot(), cstamp);
        }
        ctx.set_state(TxnState::Committed);

        // Post-commit: stamp the new versions, close out the old ones,
        // release reads.
        let sstamp = ctx.sstamp();
        let pstamp = ctx.pstamp();
        for w in &self.write_set {
            // SAFETY: our own versions; prev epoch-gated as above.
            unsafe {
                (*w.new).tuple().set_commit_stamp(cstamp);
                if !w.prev.is_null() {
                    let prev_tuple = (*w.prev).tuple();
                    prev_tuple.sstamp.fetch_min(sstamp, Ordering::SeqCst);
                    prev_tuple.raise_xstamp(pstamp);
                }
            }
        }
        let mask = self.worker.slot_mask();
        for &r in &self.read_set {
            // SAFETY: as above.
            let tuple = unsafe { (*r).tuple() };
            tuple.raise_xstamp(cstamp.offset());
            ssn::deregister_reader(tuple, mask);
        }

        self.release_context();
        tracing::debug!(xid = %ctx.xid(), cstamp = %cstamp, "transaction committed");
        Ok(cstamp)
    }

    fn do_abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let ctx = &self.ctx;
        ctx.set_state(TxnState::Aborted);

        // Unlink installed versions, newest first; our installer tag kept
        // other writers (and the reclaimer) away from these heads.
        for w in self.write_set.iter().rev() {
            let unlinked = w.table.cas_head(w.oid, w.new, w.prev);
            debug_assert!(unlinked, "abort found a foreign head above an installer");
        }
        let mask = self.worker.slot_mask();
        for &r in &self.read_set {
            // SAFETY: read-set pointers stay valid through our epoch.
            ssn::deregister_reader(unsafe { (*r).tuple() }, mask);
        }
        self.release_context();
        tracing::debug!(xid = %ctx.xid(), "transaction aborted");
    }

    fn release_context(&self) {
        let runtime = self.worker.runtime();
        runtime.registry().remove(self.ctx.xid());
        runtime.rlist().deregister_tx(self.ctx.slot());
        runtime.epochs().thread_exit(self.worker.epoch());
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.do_abort();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("xid", &self.ctx.xid())
            .field("state", &self.ctx.state())
            .field("reads", &self.read_set.len())
            .field("writes", &self.write_set.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{TxnContext, TxnRegistry, TxnState};
    use std::sync::Arc;
    use verso_types::{Lsn, Xid};

    #[test]
    fn context_starts_active_with_open_window() {
        let ctx = TxnContext::new(Xid::new(1), 0, Lsn::new(5));
        assert_eq!(ctx.state(), TxnState::Active);
        assert_eq!(ctx.cstamp(), 0);
        assert_eq!(ctx.pstamp(), 0);
        assert_eq!(ctx.sstamp(), u64::MAX);
        assert!(!ctx.should_abort());
        assert!(!ctx.is_read_mostly());
    }

    #[test]
    fn stamps_move_monotonically() {
        let ctx = TxnContext::new(Xid::new(1), 0, Lsn::new(5));
        ctx.raise_pstamp(10);
        ctx.raise_pstamp(3);
        assert_eq!(ctx.pstamp(), 10);
        assert_eq!(ctx.lower_sstamp(50), 50);
        assert_eq!(ctx.lower_sstamp(80), 50);
        assert_eq!(ctx.sstamp(), 50);
    }

    #[test]
    fn registry_resolves_and_forgets() {
        let registry = TxnRegistry::new();
        let ctx = Arc::new(TxnContext::new(Xid::new(9), 2, Lsn::new(1)));
        registry.insert(Arc::clone(&ctx));
        assert!(registry.get(Xid::new(9)).is_some());
        assert_eq!(registry.len(), 1);
        registry.remove(Xid::new(9));
        assert!(registry.get(Xid::new(9)).is_none());
        assert!(registry.is_empty());
    }
}
