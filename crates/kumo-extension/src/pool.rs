//! Bounded pool of runtime instances for one extension.
//!
//! Instances are created lazily up to the pool capacity. Idle instances sit
//! in a bounded crossbeam channel; callers that find neither an idle
//! instance nor a free slot block on that channel until an instance comes
//! back, their deadline passes, they are cancelled, or the pool is torn down.
//!
//! The pool never holds more than `capacity` live instances: a slot is
//! reserved against the live count (idle + checked out) before the
//! initializer runs, and released instances that do not fit are discarded.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{at, bounded, never, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ExtensionError;
use crate::runtime::{InterruptHandle, RuntimeInstance};

/// Builds a new instance for a pool.
pub type Initializer = Box<dyn Fn() -> Result<RuntimeInstance, ExtensionError> + Send + Sync>;

// ─── Cancellation ───────────────────────────────────────────────────────

struct CancelInner {
    cancelled: AtomicBool,
    // Dropped on cancel; the disconnect wakes every blocked receiver.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    /// Instances leased under this token, interrupted on cancel.
    leased: Mutex<Vec<(Uuid, InterruptHandle)>>,
}

/// Cloneable cancellation token.
///
/// Cancelling stops a blocked [`Pool::acquire`] and interrupts any script
/// running on an instance leased with the token.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                signal: rx,
                leased: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.trigger.lock().take();
        for (_, handle) in self.inner.leased.lock().iter() {
            handle.interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn signal(&self) -> Receiver<()> {
        self.inner.signal.clone()
    }

    fn watch(&self, instance: Uuid, handle: InterruptHandle) {
        let mut leased = self.inner.leased.lock();
        // Checked under the lock so a concurrent cancel cannot slip between.
        if self.is_cancelled() {
            handle.interrupt();
        }
        leased.push((instance, handle));
    }

    fn unwatch(&self, instance: Uuid) {
        self.inner.leased.lock().retain(|(id, _)| *id != instance);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Deadline and cancellation for one acquire.
#[derive(Debug, Clone, Default)]
pub struct AcquireContext {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancelToken>,
}

impl AcquireContext {
    /// Wait as long as it takes.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancel: None,
        }
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            deadline: None,
            cancel: Some(cancel),
        }
    }

    /// Add a cancellation token to an existing context.
    pub fn cancelled_by(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

// ─── Stats ──────────────────────────────────────────────────────────────

/// Point-in-time pool metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub idle: usize,
    pub checked_out: usize,
    pub capacity: usize,
}

// ─── Pool ───────────────────────────────────────────────────────────────

pub struct Pool {
    extension_id: String,
    capacity: usize,
    initializer: Initializer,
    idle_tx: Sender<RuntimeInstance>,
    idle_rx: Receiver<RuntimeInstance>,
    /// Idle plus checked-out instances.
    live: AtomicUsize,
    checked_out: AtomicUsize,
    created: AtomicU64,
    reused: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    closed: AtomicBool,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    freed_tx: Sender<()>,
    freed_rx: Receiver<()>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("extension_id", &self.extension_id)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Create an empty pool. No instance is built until the first acquire.
    pub fn new(extension_id: &str, capacity: usize, initializer: Initializer) -> Self {
        let capacity = capacity.max(1);
        let (idle_tx, idle_rx) = bounded(capacity);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let (freed_tx, freed_rx) = bounded(capacity);
        Self {
            extension_id: extension_id.to_string(),
            capacity,
            initializer,
            idle_tx,
            idle_rx,
            live: AtomicUsize::new(0),
            checked_out: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            freed_tx,
            freed_rx,
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Borrow an instance, creating one if the pool has room.
    ///
    /// The context's cancel token stays attached to the lease: cancelling it
    /// interrupts whatever script the lease is running.
    pub fn acquire(self: &Arc<Self>, ctx: &AcquireContext) -> Result<PooledInstance, ExtensionError> {
        let mut lease = self.checkout(ctx)?;
        if let Some(token) = &ctx.cancel {
            lease.watch(token.clone());
        }
        Ok(lease)
    }

    fn checkout(self: &Arc<Self>, ctx: &AcquireContext) -> Result<PooledInstance, ExtensionError> {
        if ctx.is_cancelled() {
            return Err(ExtensionError::AcquireCancelled(self.extension_id.clone()));
        }
        if self.is_closed() {
            return Err(ExtensionError::PoolClosed(self.extension_id.clone()));
        }

        if let Ok(instance) = self.idle_rx.try_recv() {
            return Ok(self.lease_reused(instance));
        }

        if self.try_reserve() {
            return self.create_reserved();
        }

        self.wait_for_idle(ctx)
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            idle: self.idle_rx.len(),
            checked_out: self.checked_out.load(Ordering::SeqCst),
            capacity: self.capacity,
        }
    }

    /// Close the pool, wake every waiter and drop all idle instances.
    ///
    /// Leases still out are discarded when they come back.
    pub fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.lock().take();
        let dropped = self.drain_idle();
        debug!(extension = %self.extension_id, dropped, "runtime pool torn down");
    }

    // ── internals ─────────────────────────────────────────────────────

    /// Reserve a live slot; fails once `live` reaches capacity.
    fn try_reserve(&self) -> bool {
        let mut current = self.live.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity {
                return false;
            }
            match self.live.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn create_reserved(self: &Arc<Self>) -> Result<PooledInstance, ExtensionError> {
        match (self.initializer)() {
            Ok(instance) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                self.checked_out.fetch_add(1, Ordering::SeqCst);
                debug!(
                    extension = %self.extension_id,
                    instance = %instance.id(),
                    "runtime instance created"
                );
                Ok(self.lease(instance))
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.free_slot();
                warn!(extension = %self.extension_id, error = %e, "runtime instance initialization failed");
                Err(e)
            }
        }
    }

    fn wait_for_idle(self: &Arc<Self>, ctx: &AcquireContext) -> Result<PooledInstance, ExtensionError> {
        let cancel_rx = ctx
            .cancel
            .as_ref()
            .map(CancelToken::signal)
            .unwrap_or_else(never);
        let deadline_rx = ctx.deadline.map(at).unwrap_or_else(never);

        loop {
            select! {
                recv(self.idle_rx) -> msg => return match msg {
                    Ok(instance) if self.is_closed() => {
                        self.discard_idle(instance);
                        Err(ExtensionError::PoolClosed(self.extension_id.clone()))
                    }
                    Ok(instance) => Ok(self.lease_reused(instance)),
                    Err(_) => Err(ExtensionError::PoolClosed(self.extension_id.clone())),
                },
                recv(self.freed_rx) -> _ => {
                    // A discard or failed initializer gave back a live slot.
                    if self.is_closed() {
                        return Err(ExtensionError::PoolClosed(self.extension_id.clone()));
                    }
                    if let Ok(instance) = self.idle_rx.try_recv() {
                        return Ok(self.lease_reused(instance));
                    }
                    if self.try_reserve() {
                        return self.create_reserved();
                    }
                },
                recv(cancel_rx) -> _ => {
                    debug!(extension = %self.extension_id, "runtime pool acquire cancelled");
                    return Err(ExtensionError::AcquireCancelled(self.extension_id.clone()));
                },
                recv(deadline_rx) -> _ => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        extension = %self.extension_id,
                        capacity = self.capacity,
                        "runtime pool exhausted, acquire timed out"
                    );
                    return Err(ExtensionError::AcquireTimeout(self.extension_id.clone()));
                },
                recv(self.shutdown_rx) -> _ => {
                    return Err(ExtensionError::PoolClosed(self.extension_id.clone()));
                },
            }
        }
    }

    fn lease_reused(self: &Arc<Self>, instance: RuntimeInstance) -> PooledInstance {
        self.reused.fetch_add(1, Ordering::Relaxed);
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        self.lease(instance)
    }

    fn lease(self: &Arc<Self>, instance: RuntimeInstance) -> PooledInstance {
        PooledInstance {
            instance: Some(instance),
            pool: Arc::clone(self),
            cancel: None,
        }
    }

    fn release(&self, instance: RuntimeInstance) {
        instance.clear_interrupt();
        self.checked_out.fetch_sub(1, Ordering::SeqCst);

        if self.is_closed() {
            self.discard_idle(instance);
            return;
        }
        match self.idle_tx.try_send(instance) {
            Ok(()) => {
                // A teardown may have drained the queue between the check
                // above and the send.
                if self.is_closed() {
                    self.drain_idle();
                }
            }
            Err(TrySendError::Full(instance)) | Err(TrySendError::Disconnected(instance)) => {
                debug!(extension = %self.extension_id, "idle queue full, discarding instance");
                self.discard_idle(instance);
            }
        }
    }

    fn discard_checked_out(&self, instance: RuntimeInstance) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
        self.discard_idle(instance);
    }

    /// Drop an instance that is no longer counted as checked out.
    fn discard_idle(&self, instance: RuntimeInstance) {
        self.free_slot();
        drop(instance);
    }

    fn free_slot(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        // Full means enough wakeups are already pending.
        let _ = self.freed_tx.try_send(());
    }

    fn drain_idle(&self) -> usize {
        let mut dropped = 0;
        while let Ok(instance) = self.idle_rx.try_recv() {
            self.discard_idle(instance);
            dropped += 1;
        }
        dropped
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ─── Lease ──────────────────────────────────────────────────────────────

/// Exclusive lease on a pooled instance.
///
/// Dropping the lease returns the instance to its pool. If the thread is
/// unwinding the instance is discarded instead, since its state is unknown.
pub struct PooledInstance {
    instance: Option<RuntimeInstance>,
    pool: Arc<Pool>,
    cancel: Option<CancelToken>,
}

impl PooledInstance {
    /// Drop a tainted instance instead of returning it.
    pub fn discard(mut self) {
        self.unwatch();
        if let Some(instance) = self.instance.take() {
            debug!(extension = %self.pool.extension_id, instance = %instance.id(), "discarding runtime instance");
            self.pool.discard_checked_out(instance);
        }
    }

    /// Return the instance now rather than at end of scope.
    pub fn release(mut self) {
        self.unwatch();
        if let Some(instance) = self.instance.take() {
            self.pool.release(instance);
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    fn watch(&mut self, token: CancelToken) {
        if let Some(instance) = &self.instance {
            token.watch(instance.id(), instance.interrupt_handle());
            self.cancel = Some(token);
        }
    }

    /// Detach the cancel token before the instance leaves the lease, so a
    /// late cancel cannot interrupt the next holder.
    fn unwatch(&mut self) {
        if let (Some(token), Some(instance)) = (self.cancel.take(), &self.instance) {
            token.unwatch(instance.id());
        }
    }
}

impl Deref for PooledInstance {
    type Target = RuntimeInstance;

    fn deref(&self) -> &RuntimeInstance {
        self.instance.as_ref().expect("lease used after release")
    }
}

impl DerefMut for PooledInstance {
    fn deref_mut(&mut self) -> &mut RuntimeInstance {
        self.instance.as_mut().expect("lease used after release")
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        self.unwatch();
        if let Some(instance) = self.instance.take() {
            if std::thread::panicking() {
                self.pool.discard_checked_out(instance);
            } else {
                self.pool.release(instance);
            }
        }
    }
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInstance")
            .field("extension_id", &self.pool.extension_id)
            .field("instance", &self.instance.as_ref().map(RuntimeInstance::id))
            .finish()
    }
}
