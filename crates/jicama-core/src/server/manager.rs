//! Lock manager dispatch front door
//!
//! Routes client operations to the right server lock through the store's
//! exclusive checkout, enforces the manager lifecycle (pre-start
//! buffering, flush-on-start), validates source-client liveness, replays
//! reconnection contexts, and sweeps a departed client's state out of
//! every lock.

use std::sync::{Arc, Weak};

use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use jicama_api::{
    ClientId, LockContext, LockId, LockLevel, LockOwner, LockRequestMessage, LockSnapshot,
    NotifyMode, ThreadId,
};
use jicama_common::JicamaError;

use crate::channel::{ClientLiveness, LockChannel};
use crate::model::LockManagerConfig;

use super::lock::{LockEffect, NotifiedWaiters, ServerLock};
use super::store::LockStore;
use super::timer::{LockTimer, TimerKey};

/// Lifecycle gate: acquisitions arriving before start are buffered in
/// arrival order and flushed under the write side of the transition, so
/// no request is missed or double-processed
enum Gate {
    Buffering(Vec<BufferedRequest>),
    Accepting,
}

struct BufferedRequest {
    lock_id: LockId,
    owner: LockOwner,
    level: LockLevel,
    /// `None` for lock(), `Some` for tryLock()
    timeout_ms: Option<u64>,
}

/// The dispatch front door; cheap to clone, shared across dispatcher
/// tasks and timer callbacks
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
}

struct LockManagerInner {
    store: LockStore,
    channel: Arc<dyn LockChannel>,
    liveness: Arc<dyn ClientLiveness>,
    timer: LockTimer,
    gate: RwLock<Gate>,
    config: LockManagerConfig,
    /// Handle timer callbacks take back to this instance without keeping
    /// it alive
    self_weak: Weak<LockManagerInner>,
}

impl LockManager {
    pub fn new(
        channel: Arc<dyn LockChannel>,
        liveness: Arc<dyn ClientLiveness>,
        config: LockManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_weak| LockManagerInner {
                store: LockStore::new(),
                channel,
                liveness,
                timer: LockTimer::new(),
                gate: RwLock::new(Gate::Buffering(Vec::new())),
                config,
                self_weak: self_weak.clone(),
            }),
        }
    }

    /// Flush buffered acquisitions in arrival order and begin accepting
    /// operations synchronously
    pub async fn start(&self) {
        let mut gate = self.inner.gate.write().await;
        let buffered = match std::mem::replace(&mut *gate, Gate::Accepting) {
            Gate::Buffering(buffered) => buffered,
            Gate::Accepting => {
                warn!("Lock manager already started");
                return;
            }
        };
        info!(
            buffered = buffered.len(),
            "Lock manager started, flushing buffered acquisitions"
        );
        // Still under the gate's write side: the first post-start request
        // cannot interleave with the flush
        for request in buffered {
            match request.timeout_ms {
                None => {
                    self.inner
                        .do_lock(request.lock_id, request.owner, request.level)
                        .await
                }
                Some(timeout_ms) => {
                    self.inner
                        .do_try_lock(request.lock_id, request.owner, request.level, timeout_ms)
                        .await
                }
            }
        }
    }

    /// Route one wire-level operation. QueryLock yields a snapshot; every
    /// other operation yields `None`.
    pub async fn handle(
        &self,
        message: LockRequestMessage,
    ) -> Result<Option<LockSnapshot>, JicamaError> {
        match message {
            LockRequestMessage::Lock {
                lock_id,
                client_id,
                thread_id,
                level,
            } => {
                self.lock(lock_id, client_id, thread_id, level).await?;
                Ok(None)
            }
            LockRequestMessage::TryLock {
                lock_id,
                client_id,
                thread_id,
                level,
                timeout_ms,
            } => {
                self.try_lock(lock_id, client_id, thread_id, level, timeout_ms)
                    .await?;
                Ok(None)
            }
            LockRequestMessage::Unlock {
                lock_id,
                client_id,
                thread_id,
            } => {
                self.unlock(lock_id, client_id, thread_id).await?;
                Ok(None)
            }
            LockRequestMessage::QueryLock {
                lock_id, client_id, ..
            } => {
                self.ensure_started("queryLock").await?;
                if self.drop_if_disconnected(&client_id, "queryLock") {
                    return Ok(None);
                }
                Ok(self.query_lock(&lock_id).await)
            }
            LockRequestMessage::Interrupt {
                lock_id,
                client_id,
                thread_id,
            } => {
                self.interrupt(lock_id, client_id, thread_id).await?;
                Ok(None)
            }
            LockRequestMessage::Wait {
                lock_id,
                client_id,
                thread_id,
                timeout_ms,
                holds,
            } => {
                self.wait(lock_id, client_id, thread_id, timeout_ms, holds)
                    .await?;
                Ok(None)
            }
            LockRequestMessage::Notify {
                lock_id,
                client_id,
                thread_id,
                mode,
            } => {
                self.notify(lock_id, client_id, thread_id, mode).await?;
                Ok(None)
            }
            LockRequestMessage::RecallCommit {
                lock_id,
                client_id,
                contexts,
            } => {
                self.recall_commit(lock_id, client_id, contexts).await?;
                Ok(None)
            }
            LockRequestMessage::Reestablish {
                client_id,
                contexts,
            } => {
                self.reestablish(client_id, contexts).await?;
                Ok(None)
            }
        }
    }

    /// Blocking acquisition
    pub async fn lock(
        &self,
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        level: LockLevel,
    ) -> Result<(), JicamaError> {
        let owner = LockOwner::new(client_id, thread_id);
        if self.buffer_if_starting(&lock_id, &owner, level, None).await {
            return Ok(());
        }
        if self.drop_if_disconnected(&owner.client_id, "lock") {
            return Ok(());
        }
        self.inner.do_lock(lock_id, owner, level).await;
        Ok(())
    }

    /// Bounded acquisition
    pub async fn try_lock(
        &self,
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        level: LockLevel,
        timeout_ms: u64,
    ) -> Result<(), JicamaError> {
        let owner = LockOwner::new(client_id, thread_id);
        if self
            .buffer_if_starting(&lock_id, &owner, level, Some(timeout_ms))
            .await
        {
            return Ok(());
        }
        if self.drop_if_disconnected(&owner.client_id, "tryLock") {
            return Ok(());
        }
        self.inner
            .do_try_lock(lock_id, owner, level, timeout_ms)
            .await;
        Ok(())
    }

    /// Release; allowed for disconnected clients so state does not leak
    pub async fn unlock(
        &self,
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
    ) -> Result<(), JicamaError> {
        self.ensure_started("unlock").await?;
        let owner = LockOwner::new(client_id, thread_id);
        match self.inner.store.checkout_existing(&lock_id).await {
            Some(mut guard) => {
                let effects = guard.unlock(&owner);
                self.inner.checkin_apply(guard, effects).await;
            }
            None => warn!(lock_id = %lock_id, owner = %owner, "Unlock for unknown lock"),
        }
        Ok(())
    }

    /// Cooperative cancellation; allowed for disconnected clients
    pub async fn interrupt(
        &self,
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
    ) -> Result<(), JicamaError> {
        self.ensure_started("interrupt").await?;
        let owner = LockOwner::new(client_id, thread_id);
        if let Some(mut guard) = self.inner.store.checkout_existing(&lock_id).await {
            let effects = guard.interrupt(&owner);
            self.inner.checkin_apply(guard, effects).await;
        }
        Ok(())
    }

    /// Park the owner in wait(), releasing its holds
    pub async fn wait(
        &self,
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        timeout_ms: Option<u64>,
        holds: Vec<LockLevel>,
    ) -> Result<(), JicamaError> {
        self.ensure_started("wait").await?;
        if self.drop_if_disconnected(&client_id, "wait") {
            return Ok(());
        }
        let owner = LockOwner::new(client_id, thread_id);
        let mut guard = self.inner.store.checkout(&lock_id).await;
        match guard.wait(owner, timeout_ms, holds) {
            Ok(effects) => {
                self.inner.checkin_apply(guard, effects).await;
                Ok(())
            }
            Err(err) => {
                self.inner.store.checkin(guard);
                Err(err)
            }
        }
    }

    /// Wake one or all waiters. The grant pass for the woken owners runs
    /// in its own checkouts, after the notifying lock is checked back in.
    pub async fn notify(
        &self,
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        mode: NotifyMode,
    ) -> Result<(), JicamaError> {
        self.ensure_started("notify").await?;
        if self.drop_if_disconnected(&client_id, "notify") {
            return Ok(());
        }
        let owner = LockOwner::new(client_id, thread_id);
        let mut notified = NotifiedWaiters::default();
        let mut guard = self.inner.store.checkout(&lock_id).await;
        let effects = match guard.notify(&owner, mode, &mut notified) {
            Ok(effects) => effects,
            Err(err) => {
                self.inner.store.checkin(guard);
                return Err(err);
            }
        };
        self.inner.checkin_apply(guard, effects).await;

        for waiter in notified.drain() {
            let mut guard = self.inner.store.checkout(&waiter.lock_id).await;
            let effects = guard.requeue_notified(waiter.owner, waiter.reacquire);
            self.inner.checkin_apply(guard, effects).await;
        }
        Ok(())
    }

    /// Apply a greedy holder's recall report. Before start this is
    /// intentionally ignored: a client may race its recall timer against
    /// the manager's own start sequence.
    pub async fn recall_commit(
        &self,
        lock_id: LockId,
        client_id: ClientId,
        contexts: Vec<LockContext>,
    ) -> Result<(), JicamaError> {
        {
            let gate = self.inner.gate.read().await;
            if matches!(&*gate, Gate::Buffering(_)) {
                warn!(
                    lock_id = %lock_id,
                    client_id = %client_id,
                    "Ignoring recall-commit before lock manager start"
                );
                return Ok(());
            }
        }
        match self.inner.store.checkout_existing(&lock_id).await {
            Some(mut guard) => match guard.recall_commit(&client_id, contexts) {
                Ok(effects) => {
                    self.inner.checkin_apply(guard, effects).await;
                    Ok(())
                }
                Err(err) => {
                    self.inner.store.checkin(guard);
                    Err(err)
                }
            },
            None => {
                warn!(lock_id = %lock_id, client_id = %client_id, "Recall-commit for unknown lock");
                Ok(())
            }
        }
    }

    /// Replay a rejoined client's last-known contexts into the
    /// authoritative state. This is a lifecycle API invoked by the
    /// reconnection layer before `start()`, so it bypasses the gate.
    pub async fn reestablish(
        &self,
        client_id: ClientId,
        contexts: Vec<LockContext>,
    ) -> Result<(), JicamaError> {
        info!(
            client_id = %client_id,
            contexts = contexts.len(),
            "Reestablishing lock state for rejoined client"
        );
        for context in contexts {
            if context.client_id != client_id {
                warn!(
                    client_id = %client_id,
                    reported = %context.client_id,
                    "Skipping reestablish context reported for a different client"
                );
                continue;
            }
            let mut guard = self.inner.store.checkout(&context.lock_id).await;
            let effects = guard.reestablish(&context);
            self.inner.checkin_apply(guard, effects).await;
        }
        Ok(())
    }

    /// Remove every contribution of a departed client from every lock;
    /// invoked on client disconnect
    pub async fn clear_all_locks_for(&self, client_id: &ClientId) {
        info!(client_id = %client_id, "Clearing lock state for departed client");
        for lock_id in self.inner.store.lock_ids() {
            if let Some(mut guard) = self.inner.store.checkout_existing(&lock_id).await {
                let effects = guard.clear_state_for_client(client_id);
                self.inner.checkin_apply(guard, effects).await;
            }
        }
    }

    /// Aggregate state of one lock, no mutation
    pub async fn query_lock(&self, lock_id: &LockId) -> Option<LockSnapshot> {
        let guard = self.inner.store.checkout_existing(lock_id).await?;
        let snapshot = guard.snapshot();
        self.inner.store.checkin(guard);
        Some(snapshot)
    }

    /// Administrative dump of every lock, no mutation
    pub async fn dump(&self) -> Vec<LockSnapshot> {
        let mut snapshots = Vec::new();
        for lock_id in self.inner.store.lock_ids() {
            if let Some(snapshot) = self.query_lock(&lock_id).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    /// Number of locks currently tracked
    pub fn lock_count(&self) -> usize {
        self.inner.store.len()
    }

    async fn buffer_if_starting(
        &self,
        lock_id: &LockId,
        owner: &LockOwner,
        level: LockLevel,
        timeout_ms: Option<u64>,
    ) -> bool {
        {
            let gate = self.inner.gate.read().await;
            if matches!(&*gate, Gate::Accepting) {
                return false;
            }
        }
        // Re-check under the write side; the transition to Accepting is
        // one-way, so observing it here is final
        let mut gate = self.inner.gate.write().await;
        match &mut *gate {
            Gate::Buffering(buffer) => {
                debug!(lock_id = %lock_id, owner = %owner, "Buffering pre-start acquisition");
                buffer.push(BufferedRequest {
                    lock_id: lock_id.clone(),
                    owner: owner.clone(),
                    level,
                    timeout_ms,
                });
                true
            }
            Gate::Accepting => false,
        }
    }

    async fn ensure_started(&self, operation: &str) -> Result<(), JicamaError> {
        let gate = self.inner.gate.read().await;
        match &*gate {
            Gate::Accepting => Ok(()),
            Gate::Buffering(_) => Err(JicamaError::ProtocolViolation(format!(
                "{operation} received before lock manager start"
            ))),
        }
    }

    fn drop_if_disconnected(&self, client_id: &ClientId, operation: &str) -> bool {
        if self.inner.liveness.is_connected(client_id) {
            return false;
        }
        warn!(
            client_id = %client_id,
            operation,
            "Dropping operation from disconnected client"
        );
        true
    }
}

impl LockManagerInner {
    async fn do_lock(&self, lock_id: LockId, owner: LockOwner, level: LockLevel) {
        metrics::counter!("jicama_lock_requests_total").increment(1);
        let mut guard = self.store.checkout(&lock_id).await;
        let effects = guard.lock(owner, level, self.config.greedy_enabled);
        self.checkin_apply(guard, effects).await;
    }

    async fn do_try_lock(
        &self,
        lock_id: LockId,
        owner: LockOwner,
        level: LockLevel,
        timeout_ms: u64,
    ) {
        metrics::counter!("jicama_lock_requests_total").increment(1);
        let mut guard = self.store.checkout(&lock_id).await;
        let effects = guard.try_lock(owner, level, timeout_ms, self.config.greedy_enabled);
        self.checkin_apply(guard, effects).await;
    }

    /// Check the lock back in, then apply the transition's effects; no
    /// reply is sent and no timer armed while the lock is checked out
    async fn checkin_apply(
        &self,
        guard: OwnedMutexGuard<ServerLock>,
        effects: Vec<LockEffect>,
    ) {
        let lock_id = guard.id().clone();
        self.store.checkin(guard);
        for effect in effects {
            match effect {
                LockEffect::Send { client_id, message } => {
                    if let Err(err) = self.channel.send(&client_id, message).await {
                        warn!(
                            client_id = %client_id,
                            error = %err,
                            "Failed to deliver lock message"
                        );
                    }
                }
                LockEffect::ScheduleTry { owner, delay_ms } => {
                    self.arm(
                        TimerKey::TryLock {
                            lock_id: lock_id.clone(),
                            owner,
                        },
                        delay_ms,
                    );
                }
                LockEffect::CancelTry { owner } => {
                    self.timer.cancel(&TimerKey::TryLock {
                        lock_id: lock_id.clone(),
                        owner,
                    });
                }
                LockEffect::ScheduleWait { owner, delay_ms } => {
                    self.arm(
                        TimerKey::Wait {
                            lock_id: lock_id.clone(),
                            owner,
                        },
                        delay_ms,
                    );
                }
                LockEffect::CancelWait { owner } => {
                    self.timer.cancel(&TimerKey::Wait {
                        lock_id: lock_id.clone(),
                        owner,
                    });
                }
                LockEffect::ScheduleRecall { client_id } => {
                    self.arm(
                        TimerKey::Recall {
                            lock_id: lock_id.clone(),
                            client_id,
                        },
                        self.config.recall_timeout_ms,
                    );
                }
                LockEffect::CancelRecall { client_id } => {
                    self.timer.cancel(&TimerKey::Recall {
                        lock_id: lock_id.clone(),
                        client_id,
                    });
                }
            }
        }
    }

    fn arm(&self, key: TimerKey, delay_ms: u64) {
        let weak = self.self_weak.clone();
        let fire_key = key.clone();
        self.timer.schedule(key, delay_ms, move || {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move {
                    inner.on_timer(fire_key).await;
                });
            }
        });
    }

    async fn on_timer(&self, key: TimerKey) {
        self.timer.forget(&key);
        match key {
            TimerKey::TryLock { lock_id, owner } => {
                if let Some(mut guard) = self.store.checkout_existing(&lock_id).await {
                    let effects = guard.try_timeout(&owner);
                    self.checkin_apply(guard, effects).await;
                }
            }
            TimerKey::Wait { lock_id, owner } => {
                if let Some(mut guard) = self.store.checkout_existing(&lock_id).await {
                    let effects = guard.wait_timeout(&owner);
                    self.checkin_apply(guard, effects).await;
                }
            }
            TimerKey::Recall { lock_id, client_id } => {
                if self.liveness.is_connected(&client_id) {
                    warn!(
                        lock_id = %lock_id,
                        client_id = %client_id,
                        "Greedy recall still unanswered past deadline"
                    );
                } else {
                    warn!(
                        lock_id = %lock_id,
                        client_id = %client_id,
                        "Greedy holder disconnected without answering recall, purging its state"
                    );
                    if let Some(mut guard) = self.store.checkout_existing(&lock_id).await {
                        let effects = guard.clear_state_for_client(&client_id);
                        self.checkin_apply(guard, effects).await;
                    }
                }
            }
        }
    }
}
