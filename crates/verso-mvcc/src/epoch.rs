//! Quiescent-state epoch manager.
//!
//! Work is grouped by epoch; a closed epoch's deferred callback runs only
//! once every registered thread has left it. Closing an epoch does not
//! require the closer to be outside: the closer simply carries its
//! quiescence debt into the closed epoch, and reclamation waits for it.
//! What closing does require is that no straggler is still inside an
//! *earlier* closed epoch, which bounds the pending window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use verso_types::{Epoch, Lsn};

/// Sentinel for "this thread is outside any epoch".
const OUTSIDE: u64 = 0;

/// Per-epoch hooks.
///
/// `epoch_ended` runs when an epoch closes and returns the cookie to hold
/// until the epoch drains (here: a log-position snapshot).
/// `epoch_reclaimed` runs once no thread can still observe the epoch.
/// Closures driven by thread exit carry [`Lsn::INVALID`] cookies (there
/// may be no live transaction to snapshot); implementations must treat
/// such cookies as "no new information".
pub trait EpochCallbacks: Send + Sync {
    fn epoch_ended(&self, epoch: Epoch) -> Lsn;
    fn epoch_reclaimed(&self, cookie: Lsn);
}

/// A registered thread's view of the epoch clock.
#[derive(Debug)]
pub struct ThreadEpoch {
    active: AtomicU64,
}

impl ThreadEpoch {
    fn new() -> Self {
        Self {
            active: AtomicU64::new(OUTSIDE),
        }
    }

    /// The epoch this thread is inside, or `None`.
    #[must_use]
    pub fn active_epoch(&self) -> Option<Epoch> {
        match self.active.load(Ordering::SeqCst) {
            OUTSIDE => None,
            e => Some(Epoch::new(e)),
        }
    }
}

struct Inner {
    threads: Vec<Arc<ThreadEpoch>>,
    /// Closed epochs with their cookies, oldest first, awaiting drain.
    pending: VecDeque<(Epoch, Lsn)>,
}

/// The epoch manager proper.
pub struct EpochManager {
    /// Currently open epoch. Starts at 1 so [`OUTSIDE`] stays unambiguous.
    current: AtomicU64,
    inner: Mutex<Inner>,
    callbacks: Arc<dyn EpochCallbacks>,
}

impl EpochManager {
    #[must_use]
    pub fn new(callbacks: Arc<dyn EpochCallbacks>) -> Self {
        Self {
            current: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                threads: Vec::new(),
                pending: VecDeque::new(),
            }),
            callbacks,
        }
    }

    /// The currently open epoch.
    #[must_use]
    pub fn current(&self) -> Epoch {
        Epoch::new(self.current.load(Ordering::SeqCst))
    }

    /// Register the calling thread; must happen before its first
    /// [`thread_enter`](Self::thread_enter).
    #[must_use]
    pub fn register_thread(&self) -> Arc<ThreadEpoch> {
        let handle = Arc::new(ThreadEpoch::new());
        self.inner.lock().threads.push(Arc::clone(&handle));
        tracing::trace!(epoch = %self.current(), "epoch thread registered");
        handle
    }

    /// Deregister a thread.
    ///
    /// Closes the current epoch with an [`Lsn::INVALID`] cookie (there is
    /// no transaction left on this thread to snapshot a log position
    /// from) so that pending reclamation never waits on a departed
    /// thread, then attempts reclamation.
    pub fn deregister_thread(&self, handle: &Arc<ThreadEpoch>) {
        handle.active.store(OUTSIDE, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.threads.retain(|t| !Arc::ptr_eq(t, handle));
        let closing = Epoch::new(self.current.fetch_add(1, Ordering::SeqCst));
        inner.pending.push_back((closing, Lsn::INVALID));
        tracing::debug!(epoch = %closing, "epoch closed at thread exit");
        self.reclaim_drained(&mut inner);
    }

    /// Mark the calling thread as inside the current epoch.
    pub fn thread_enter(&self, handle: &ThreadEpoch) {
        handle
            .active
            .store(self.current.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Mark the calling thread as outside any epoch and attempt
    /// reclamation of drained epochs.
    pub fn thread_exit(&self, handle: &ThreadEpoch) {
        handle.active.store(OUTSIDE, Ordering::SeqCst);
        self.reclaim_drained(&mut self.inner.lock());
    }

    /// Quiescence point: leave whatever epoch the thread was in and
    /// re-enter the current one.
    pub fn thread_quiesce(&self, handle: &ThreadEpoch) {
        handle
            .active
            .store(self.current.load(Ordering::SeqCst), Ordering::SeqCst);
        self.reclaim_drained(&mut self.inner.lock());
    }

    /// Whether [`new_epoch`](Self::new_epoch) can currently succeed: no
    /// registered thread is still inside an epoch older than the current
    /// one.
    #[must_use]
    pub fn new_epoch_possible(&self) -> bool {
        let inner = self.inner.lock();
        self.no_stragglers(&inner)
    }

    /// Close the current epoch and open the next.
    ///
    /// Obtains the cookie from [`EpochCallbacks::epoch_ended`], queues the
    /// closed epoch, and attempts reclamation. Returns `false` (without
    /// closing) when a straggler from an earlier closed epoch still
    /// exists.
    pub fn new_epoch(&self) -> bool {
        let mut inner = self.inner.lock();
        if !self.no_stragglers(&inner) {
            return false;
        }
        let closing = Epoch::new(self.current.load(Ordering::SeqCst));
        let cookie = self.callbacks.epoch_ended(closing);
        self.current.store(closing.get() + 1, Ordering::SeqCst);
        inner.pending.push_back((closing, cookie));
        tracing::info!(epoch = %closing, %cookie, "epoch closed");
        self.reclaim_drained(&mut inner);
        true
    }

    fn no_stragglers(&self, inner: &Inner) -> bool {
        let current = self.current.load(Ordering::SeqCst);
        inner.threads.iter().all(|t| {
            let e = t.active.load(Ordering::SeqCst);
            e == OUTSIDE || e >= current
        })
    }

    /// Fire `epoch_reclaimed` for every queued epoch no thread is still
    /// inside, oldest first.
    fn reclaim_drained(&self, inner: &mut Inner) {
        while let Some(&(epoch, cookie)) = inner.pending.front() {
            let drained = inner.threads.iter().all(|t| {
                let e = t.active.load(Ordering::SeqCst);
                e == OUTSIDE || e > epoch.get()
            });
            if !drained {
                break;
            }
            inner.pending.pop_front();
            tracing::info!(epoch = %epoch, %cookie, "epoch reclaimed");
            self.callbacks.epoch_reclaimed(cookie);
        }
    }
}

impl std::fmt::Debug for EpochManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("EpochManager")
            .field("current", &self.current.load(Ordering::Relaxed))
            .field("threads", &inner.threads.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}
