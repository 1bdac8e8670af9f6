//! Runtime wiring: the process-wide singletons and their lifecycles.
//!
//! [`MvccRuntime`] owns the clock, the readers list, the transaction
//! registry, the epoch manager, and one region allocator (plus reclaim
//! daemon) per socket. It also implements the epoch callbacks that tie
//! the trim horizon to allocator state transitions: `epoch_ended`
//! snapshots the log position when any allocator wants a cycle, and
//! `epoch_reclaimed` is the only place that starts daemons, opens
//! drained segments, and returns allocators to `NORMAL`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use verso_error::CoreError;
use verso_types::{Epoch, Lsn, Xid};

use crate::clock::LogClock;
use crate::config::CoreConfig;
use crate::epoch::{EpochCallbacks, EpochManager, ThreadEpoch};
use crate::metrics::CoreMetrics;
use crate::readers::{ReadersList, SlotGuard};
use crate::region::{run_reclaim_daemon, GcState, ReclaimContext, RegionAllocator};
use crate::tuple::ChainIndex;
use crate::txn::{Transaction, TxnRegistry};

// ---------------------------------------------------------------------------
// GcCoordinator
// ---------------------------------------------------------------------------

/// Epoch callbacks driving the reclamation state machine.
struct GcCoordinator {
    clock: Arc<LogClock>,
    allocators: Vec<Arc<RegionAllocator>>,
    trim_lsn: Arc<AtomicU64>,
    metrics: Arc<CoreMetrics>,
}

impl EpochCallbacks for GcCoordinator {
    fn epoch_ended(&self, epoch: Epoch) -> Lsn {
        // A cookie is only worth taking when some allocator is waiting on
        // this epoch's closure.
        for allocator in &self.allocators {
            match allocator.state() {
                GcState::Requested | GcState::Finished => {
                    let lsn = self.clock.cur_lsn();
                    tracing::debug!(%epoch, cookie = %lsn, "epoch closing with reclamation pending");
                    return lsn;
                }
                GcState::Normal | GcState::InProgress => {}
            }
        }
        Lsn::INVALID
    }

    fn epoch_reclaimed(&self, cookie: Lsn) {
        if cookie.is_valid() {
            self.trim_lsn.fetch_max(cookie.offset(), Ordering::AcqRel);
        }
        for allocator in &self.allocators {
            match allocator.state() {
                GcState::Requested => {
                    allocator.set_state(GcState::InProgress);
                    allocator.trigger_reclaim();
                }
                GcState::Finished => {
                    allocator.advance_reclaimed();
                    allocator.set_state(GcState::Normal);
                    self.metrics
                        .segments_reclaimed_total
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        socket = allocator.socket(),
                        reclaimed_offset = allocator.reclaimed_offset(),
                        "hot segment returned to the ring"
                    );
                }
                GcState::Normal | GcState::InProgress => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MvccRuntime
// ---------------------------------------------------------------------------

/// The storage core's singleton set.
pub struct MvccRuntime {
    config: CoreConfig,
    clock: Arc<LogClock>,
    rlist: Arc<ReadersList>,
    registry: TxnRegistry,
    epochs: EpochManager,
    allocators: Vec<Arc<RegionAllocator>>,
    tables: Arc<RwLock<Vec<Arc<dyn ChainIndex>>>>,
    trim_lsn: Arc<AtomicU64>,
    metrics: Arc<CoreMetrics>,
    system_loading: AtomicBool,
    next_xid: AtomicU64,
    worker_seq: AtomicU64,
    daemons: Mutex<Vec<JoinHandle<()>>>,
}

impl MvccRuntime {
    /// Bring up allocators, the epoch manager, and one reclaim daemon
    /// per socket.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidConfig`] from [`CoreConfig::validate`].
    pub fn new(config: CoreConfig) -> Result<Arc<Self>, CoreError> {
        config.validate()?;

        let clock = Arc::new(LogClock::new());
        let trim_lsn = Arc::new(AtomicU64::new(Lsn::INVALID.offset()));
        let metrics = Arc::new(CoreMetrics::new());
        let tables: Arc<RwLock<Vec<Arc<dyn ChainIndex>>>> = Arc::new(RwLock::new(Vec::new()));

        let allocators: Vec<Arc<RegionAllocator>> = (0..config.num_sockets)
            .map(|socket| Arc::new(RegionAllocator::new(&config, socket)))
            .collect();

        let coordinator = Arc::new(GcCoordinator {
            clock: Arc::clone(&clock),
            allocators: allocators.clone(),
            trim_lsn: Arc::clone(&trim_lsn),
            metrics: Arc::clone(&metrics),
        });

        let mut daemons = Vec::with_capacity(allocators.len());
        for allocator in &allocators {
            let ctx = ReclaimContext {
                allocator: Arc::clone(allocator),
                tables: Arc::clone(&tables),
                trim_lsn: Arc::clone(&trim_lsn),
                metrics: Arc::clone(&metrics),
            };
            let handle = std::thread::Builder::new()
                .name(format!("verso-reclaim-{}", allocator.socket()))
                .spawn(move || run_reclaim_daemon(&ctx))
                .expect("spawning the reclaim daemon");
            daemons.push(handle);
        }

        Ok(Arc::new(Self {
            config,
            clock,
            rlist: Arc::new(ReadersList::new()),
            registry: TxnRegistry::new(),
            epochs: EpochManager::new(coordinator),
            allocators,
            tables,
            trim_lsn,
            metrics,
            system_loading: AtomicBool::new(false),
            next_xid: AtomicU64::new(1),
            worker_seq: AtomicU64::new(0),
            daemons: Mutex::new(daemons),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &LogClock {
        &self.clock
    }

    #[must_use]
    pub fn rlist(&self) -> &ReadersList {
        &self.rlist
    }

    #[must_use]
    pub fn registry(&self) -> &TxnRegistry {
        &self.registry
    }

    #[must_use]
    pub fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    #[must_use]
    pub fn metrics(&self) -> &CoreMetrics {
        &self.metrics
    }

    /// The commit-stamp horizon below which versions are unobservable.
    #[must_use]
    pub fn trim_lsn(&self) -> Lsn {
        Lsn::new(self.trim_lsn.load(Ordering::Acquire))
    }

    /// Allocator owned by `socket`, for diagnostics and tests.
    #[must_use]
    pub fn allocator(&self, socket: usize) -> &Arc<RegionAllocator> {
        &self.allocators[socket]
    }

    /// Make a table's chains visible to the reclaim daemon.
    pub fn register_table(&self, table: Arc<dyn ChainIndex>) {
        self.tables.write().push(table);
    }

    /// Route generic allocation to the cold region during initial load.
    pub fn begin_bulk_load(&self) {
        self.system_loading.store(true, Ordering::Release);
    }

    /// Return to normal hot allocation.
    pub fn finish_bulk_load(&self) {
        self.system_loading.store(false, Ordering::Release);
    }

    /// Register the calling thread as a worker: claims a reader slot,
    /// joins the epoch protocol, and gets a socket assigned round-robin.
    ///
    /// # Errors
    ///
    /// [`CoreError::SlotExhaustion`] when every reader slot is claimed.
    pub fn register_worker(self: &Arc<Self>) -> Result<WorkerHandle, CoreError> {
        let slot = self.rlist.claim_slot()?;
        let epoch = self.epochs.register_thread();
        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed) as usize;
        let allocator = Arc::clone(&self.allocators[seq % self.allocators.len()]);
        tracing::debug!(
            slot = slot.index(),
            socket = allocator.socket(),
            "worker registered"
        );
        Ok(WorkerHandle {
            runtime: Arc::clone(self),
            slot,
            epoch,
            allocator,
        })
    }

    /// Close the current epoch by hand (maintenance and tests; the
    /// allocator requests advances itself once the trim mark is hit).
    pub fn advance_epoch(&self) -> bool {
        if self.epochs.new_epoch() {
            self.metrics.epoch_advances_total.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub(crate) fn next_xid(&self) -> Xid {
        Xid::new(self.next_xid.fetch_add(1, Ordering::Relaxed))
    }

    /// Version-storage allocation on behalf of a worker: cold during
    /// bulk load, hot otherwise, with the trim-mark epoch request folded
    /// in.
    pub(crate) fn allocate_version(
        &self,
        worker: &WorkerHandle,
        size: u64,
    ) -> Result<NonNull<u8>, CoreError> {
        let allocator = &worker.allocator;
        if self.system_loading.load(Ordering::Acquire) {
            return allocator.allocate_cold(size);
        }
        let ptr = allocator.allocate_hot(size)?;
        let accumulated = allocator.trim_accumulated();
        if accumulated >= self.config.trim_mark_bytes
            && self.epochs.new_epoch_possible()
            && self.epochs.new_epoch()
        {
            allocator.consume_trim(accumulated);
            self.metrics.epoch_advances_total.fetch_add(1, Ordering::Relaxed);
        }
        Ok(ptr)
    }
}

impl Drop for MvccRuntime {
    fn drop(&mut self) {
        for allocator in &self.allocators {
            allocator.request_shutdown();
        }
        for handle in self.daemons.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for MvccRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MvccRuntime")
            .field("sockets", &self.allocators.len())
            .field("epoch", &self.epochs.current())
            .field("trim_lsn", &self.trim_lsn())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WorkerHandle
// ---------------------------------------------------------------------------

/// A worker thread's registration: reader slot, epoch membership, and
/// socket-local allocator. Transactions are begun through this handle
/// and inherit all three.
pub struct WorkerHandle {
    runtime: Arc<MvccRuntime>,
    slot: SlotGuard,
    epoch: Arc<ThreadEpoch>,
    allocator: Arc<RegionAllocator>,
}

impl WorkerHandle {
    /// Start a transaction on this worker.
    #[must_use]
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::begin(self)
    }

    #[must_use]
    pub fn runtime(&self) -> &MvccRuntime {
        &self.runtime
    }

    #[must_use]
    pub(crate) fn epoch(&self) -> &ThreadEpoch {
        &self.epoch
    }

    /// Bit index of this worker's reader slot.
    #[must_use]
    pub fn slot_index(&self) -> u32 {
        self.slot.index()
    }

    /// Single-bit mask this worker ORs into tuple bitmaps.
    #[must_use]
    pub fn slot_mask(&self) -> u64 {
        self.slot.mask()
    }

    pub(crate) fn allocator_arc(&self) -> &Arc<RegionAllocator> {
        &self.allocator
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.runtime.epochs.deregister_thread(&self.epoch);
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("slot", &self.slot_index())
            .field("socket", &self.allocator.socket())
            .finish()
    }
}
