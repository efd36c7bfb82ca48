//! Client lock manager
//!
//! The per-client front door: routes each thread's operations into the
//! per-lock state machines, talks to the server through the
//! `LockRequestTransport`, applies incoming server messages, and exports
//! the contexts used for greedy recalls and reconnection replay.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use jicama_api::{
    ClientId, LockContext, LockId, LockLevel, LockRequestMessage, NotifyMode, ServerLockMessage,
    ThreadId,
};
use jicama_common::{JicamaError, now_millis};

use super::lock::{AwardDisposition, ClientLock, GreedyState, RequestRoute, TryTimeoutResolution};
use super::state::{AcquireOutcome, WaitOutcome, WaitSignal};

/// Client-to-server message path; implemented by the transport layer
#[async_trait::async_trait]
pub trait LockRequestTransport: Send + Sync {
    async fn send(&self, message: LockRequestMessage) -> Result<(), JicamaError>;
}

/// Per-client lock manager; cheap to clone
#[derive(Clone)]
pub struct ClientLockManager {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    client_id: RwLock<ClientId>,
    locks: DashMap<LockId, Arc<Mutex<ClientLock>>>,
    transport: Arc<dyn LockRequestTransport>,
}

impl ClientLockManager {
    pub fn new(client_id: ClientId, transport: Arc<dyn LockRequestTransport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                client_id: RwLock::new(client_id),
                locks: DashMap::new(),
                transport,
            }),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.client_id.read().clone()
    }

    /// Adopt the fresh client id issued on rejoin; subsequently exported
    /// contexts carry the new identity
    pub fn rebind(&self, client_id: ClientId) {
        let mut current = self.inner.client_id.write();
        debug!(old = %current, new = %client_id, "Rebinding client id");
        *current = client_id;
    }

    /// Acquire `lock_id` at `level` for `thread_id`, blocking (parking the
    /// task) until awarded
    pub async fn lock(
        &self,
        lock_id: &LockId,
        thread_id: ThreadId,
        level: LockLevel,
    ) -> Result<(), JicamaError> {
        let cell = self.cell(lock_id);
        let (route, rx) = {
            let mut lock = cell.lock();
            let (tx, rx) = tokio::sync::oneshot::channel();
            (lock.route_lock(thread_id, level, tx), rx)
        };
        match route {
            RequestRoute::Granted => return Ok(()),
            RequestRoute::QueuedLocal => {}
            RequestRoute::Delegated => {
                self.inner
                    .transport
                    .send(LockRequestMessage::Lock {
                        lock_id: lock_id.clone(),
                        client_id: self.client_id(),
                        thread_id,
                        level,
                    })
                    .await?;
            }
        }
        match rx.await {
            Ok(AcquireOutcome::Awarded) => Ok(()),
            Ok(AcquireOutcome::Interrupted) => Err(JicamaError::Interrupted(format!(
                "lock '{lock_id}' thread {thread_id}"
            ))),
            Ok(AcquireOutcome::Refused) | Err(_) => Err(JicamaError::InternalError(format!(
                "blocking acquisition of '{lock_id}' resolved without an award"
            ))),
        }
    }

    /// Bounded acquisition. Timeout 0 means "no blocking network round
    /// trip allowed": the request is satisfied from the greedy cache or
    /// refused on the spot.
    pub async fn try_lock(
        &self,
        lock_id: &LockId,
        thread_id: ThreadId,
        level: LockLevel,
        timeout_ms: u64,
    ) -> Result<bool, JicamaError> {
        let cell = self.cell(lock_id);
        let (route, rx) = {
            let mut lock = cell.lock();
            if timeout_ms == 0 {
                return Ok(lock.try_acquire_immediate(thread_id, level));
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            let deadline_at = now_millis() + timeout_ms as i64;
            (lock.route_try_lock(thread_id, level, deadline_at, tx), rx)
        };
        match route {
            RequestRoute::Granted => return Ok(true),
            RequestRoute::QueuedLocal => {}
            RequestRoute::Delegated => {
                self.inner
                    .transport
                    .send(LockRequestMessage::TryLock {
                        lock_id: lock_id.clone(),
                        client_id: self.client_id(),
                        thread_id,
                        level,
                        timeout_ms,
                    })
                    .await?;
            }
        }
        // The local deadline mirrors the server's timer
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(AcquireOutcome::Awarded)) => Ok(true),
            Ok(Ok(AcquireOutcome::Refused)) => Ok(false),
            Ok(Ok(AcquireOutcome::Interrupted)) => Err(JicamaError::Interrupted(format!(
                "tryLock '{lock_id}' thread {thread_id}"
            ))),
            Ok(Err(_)) => Err(JicamaError::InternalError(format!(
                "bounded acquisition of '{lock_id}' resolved without an outcome"
            ))),
            Err(_elapsed) => {
                let resolution = { cell.lock().resolve_try_timeout(thread_id, level) };
                match resolution {
                    TryTimeoutResolution::Held => Ok(true),
                    TryTimeoutResolution::Refused => Ok(false),
                }
            }
        }
    }

    /// Release the thread's most recent hold. Under a greedy grant the
    /// release stays local and may unblock locally queued threads;
    /// otherwise the server is told.
    pub async fn unlock(&self, lock_id: &LockId, thread_id: ThreadId) -> Result<(), JicamaError> {
        let cell = self.cell(lock_id);
        let send_unlock = {
            let mut lock = cell.lock();
            if lock.remove_last_hold(thread_id).is_none() {
                return Err(JicamaError::NotHeld(format!(
                    "lock '{lock_id}' thread {thread_id}"
                )));
            }
            match lock.greedy() {
                GreedyState::Granted(_) => {
                    lock.award_local_pendings();
                    false
                }
                _ => true,
            }
        };
        if send_unlock {
            self.inner
                .transport
                .send(LockRequestMessage::Unlock {
                    lock_id: lock_id.clone(),
                    client_id: self.client_id(),
                    thread_id,
                })
                .await?;
        }
        Ok(())
    }

    /// Release the thread's holds, park inside wait(), and reacquire them
    /// before returning the outcome
    pub async fn wait(
        &self,
        lock_id: &LockId,
        thread_id: ThreadId,
        timeout_ms: Option<u64>,
    ) -> Result<WaitOutcome, JicamaError> {
        let cell = self.cell(lock_id);
        let (rx, holds) = {
            let mut lock = cell.lock();
            let holds = lock.stash_holds(thread_id);
            if holds.is_empty() {
                return Err(JicamaError::IllegalMonitorState(format!(
                    "wait on '{lock_id}' by thread {thread_id} which holds nothing"
                )));
            }
            let (tx, rx) = tokio::sync::oneshot::channel();
            let deadline_at = timeout_ms.map(|t| now_millis() + t as i64);
            lock.add_waiter(thread_id, holds.clone(), deadline_at, tx);
            // The released holds may unblock locally queued threads
            lock.award_local_pendings();
            (rx, holds)
        };
        self.inner
            .transport
            .send(LockRequestMessage::Wait {
                lock_id: lock_id.clone(),
                client_id: self.client_id(),
                thread_id,
                timeout_ms,
                holds,
            })
            .await?;
        match rx.await {
            Ok(WaitSignal::Notified) => Ok(WaitOutcome::Notified),
            Ok(WaitSignal::TimedOut) => Ok(WaitOutcome::TimedOut),
            Ok(WaitSignal::Interrupted) => Err(JicamaError::Interrupted(format!(
                "wait '{lock_id}' thread {thread_id}"
            ))),
            Err(_) => Err(JicamaError::InternalError(format!(
                "wait on '{lock_id}' resolved without a signal"
            ))),
        }
    }

    /// Wake one or all waiters on the lock; the caller must hold WRITE
    pub async fn notify(
        &self,
        lock_id: &LockId,
        thread_id: ThreadId,
        mode: NotifyMode,
    ) -> Result<(), JicamaError> {
        {
            let cell = self.cell(lock_id);
            let lock = cell.lock();
            if !lock.has_write_hold(thread_id) {
                return Err(JicamaError::IllegalMonitorState(format!(
                    "notify on '{lock_id}' by thread {thread_id} which does not hold WRITE"
                )));
            }
        }
        self.inner
            .transport
            .send(LockRequestMessage::Notify {
                lock_id: lock_id.clone(),
                client_id: self.client_id(),
                thread_id,
                mode,
            })
            .await
    }

    /// Cooperatively cancel the thread's blocked acquisition or wait;
    /// idempotent
    pub async fn interrupt(&self, lock_id: &LockId, thread_id: ThreadId) -> Result<(), JicamaError> {
        let delegated = match self.existing_cell(lock_id) {
            Some(cell) => cell.lock().interrupt(thread_id),
            None => None,
        };
        if delegated == Some(true) {
            self.inner
                .transport
                .send(LockRequestMessage::Interrupt {
                    lock_id: lock_id.clone(),
                    client_id: self.client_id(),
                    thread_id,
                })
                .await?;
        }
        Ok(())
    }

    /// Apply one server-to-client message
    pub async fn handle_server_message(
        &self,
        message: ServerLockMessage,
    ) -> Result<(), JicamaError> {
        match message {
            ServerLockMessage::Awarded {
                lock_id,
                thread_id,
                level,
                greedy,
            } => {
                let disposition = match self.existing_cell(&lock_id) {
                    Some(cell) => cell.lock().handle_award(thread_id, level, greedy),
                    None => AwardDisposition::Stale,
                };
                if disposition == AwardDisposition::Stale {
                    // Interrupt or timeout won the race; hand the grant
                    // straight back so the server does not leak it
                    warn!(lock_id = %lock_id, thread_id = %thread_id, "Releasing stale award");
                    self.inner
                        .transport
                        .send(LockRequestMessage::Unlock {
                            lock_id,
                            client_id: self.client_id(),
                            thread_id,
                        })
                        .await?;
                }
                Ok(())
            }
            ServerLockMessage::Refused { lock_id, thread_id } => {
                if let Some(cell) = self.existing_cell(&lock_id) {
                    cell.lock().handle_refused(thread_id);
                }
                Ok(())
            }
            ServerLockMessage::Notified { lock_id, thread_id } => {
                if let Some(cell) = self.existing_cell(&lock_id) {
                    cell.lock().handle_notified(thread_id);
                }
                Ok(())
            }
            ServerLockMessage::RecallRequest { lock_id } => {
                let client_id = self.client_id();
                let contexts = match self.existing_cell(&lock_id) {
                    Some(cell) => cell.lock().begin_recall(&client_id),
                    None => None,
                };
                match contexts {
                    Some(contexts) => {
                        debug!(
                            lock_id = %lock_id,
                            contexts = contexts.len(),
                            "Answering greedy recall"
                        );
                        self.inner
                            .transport
                            .send(LockRequestMessage::RecallCommit {
                                lock_id: lock_id.clone(),
                                client_id,
                                contexts,
                            })
                            .await?;
                        if let Some(cell) = self.existing_cell(&lock_id) {
                            cell.lock().finish_recall();
                        }
                        Ok(())
                    }
                    None => {
                        warn!(
                            lock_id = %lock_id,
                            "Recall for a lock this client does not hold greedily"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Export every lock's state for reconnection replay (REESTABLISH)
    pub fn reestablish_contexts(&self) -> Vec<LockContext> {
        let client_id = self.client_id();
        let mut contexts = Vec::new();
        for entry in self.inner.locks.iter() {
            contexts.extend(entry.value().lock().contexts(&client_id, true));
        }
        contexts
    }

    /// The cached greedy level for a lock, if any (diagnostics)
    pub fn greedy_level(&self, lock_id: &LockId) -> Option<LockLevel> {
        let cell = self.existing_cell(lock_id)?;
        let lock = cell.lock();
        match lock.greedy() {
            GreedyState::Granted(level) => Some(level),
            _ => None,
        }
    }

    fn cell(&self, lock_id: &LockId) -> Arc<Mutex<ClientLock>> {
        self.inner
            .locks
            .entry(lock_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ClientLock::new(lock_id.clone()))))
            .value()
            .clone()
    }

    fn existing_cell(&self, lock_id: &LockId) -> Option<Arc<Mutex<ClientLock>>> {
        self.inner.locks.get(lock_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jicama_api::LockContextState;

    struct RecordingTransport {
        sent: Mutex<Vec<LockRequestMessage>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<LockRequestMessage> {
            self.sent.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl LockRequestTransport for RecordingTransport {
        async fn send(&self, message: LockRequestMessage) -> Result<(), JicamaError> {
            self.sent.lock().push(message);
            Ok(())
        }
    }

    fn client(transport: Arc<RecordingTransport>) -> ClientLockManager {
        ClientLockManager::new(ClientId::from("c-1"), transport)
    }

    async fn greedy_client(
        transport: Arc<RecordingTransport>,
        lock_id: &LockId,
        level: LockLevel,
    ) -> ClientLockManager {
        let mgr = client(transport);
        let t1 = ThreadId::new(1);
        let pending = tokio::spawn({
            let mgr = mgr.clone();
            let lock_id = lock_id.clone();
            async move { mgr.lock(&lock_id, t1, level).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.handle_server_message(ServerLockMessage::Awarded {
            lock_id: lock_id.clone(),
            thread_id: t1,
            level,
            greedy: true,
        })
        .await
        .unwrap();
        pending.await.unwrap().unwrap();
        mgr
    }

    #[tokio::test]
    async fn test_greedy_grant_serves_later_requests_locally() {
        let transport = RecordingTransport::new();
        let lock_id = LockId::from("l");
        let mgr = greedy_client(transport.clone(), &lock_id, LockLevel::Write).await;
        assert_eq!(mgr.greedy_level(&lock_id), Some(LockLevel::Write));
        assert_eq!(transport.sent().len(), 1, "one LOCK for the initial grant");

        // Release and reacquire repeatedly: all local, zero messages
        let t1 = ThreadId::new(1);
        mgr.unlock(&lock_id, t1).await.unwrap();
        for _ in 0..3 {
            mgr.lock(&lock_id, t1, LockLevel::Write).await.unwrap();
            mgr.unlock(&lock_id, t1).await.unwrap();
        }
        assert_eq!(transport.sent().len(), 1, "greedy holding eliminates round trips");
    }

    #[tokio::test]
    async fn test_greedy_local_queue_is_awarded_on_unlock() {
        let transport = RecordingTransport::new();
        let lock_id = LockId::from("l");
        let mgr = greedy_client(transport.clone(), &lock_id, LockLevel::Write).await;
        let t1 = ThreadId::new(1);
        let t2 = ThreadId::new(2);

        // t1 holds; t2 queues locally without a network request
        let blocked = tokio::spawn({
            let mgr = mgr.clone();
            let lock_id = lock_id.clone();
            async move { mgr.lock(&lock_id, t2, LockLevel::Write).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent().len(), 1);

        mgr.unlock(&lock_id, t1).await.unwrap();
        blocked.await.unwrap().unwrap();
        assert_eq!(transport.sent().len(), 1, "local handoff stays off the wire");
    }

    #[tokio::test]
    async fn test_try_lock_zero_timeout_never_touches_the_network() {
        let transport = RecordingTransport::new();
        let mgr = client(transport.clone());
        let lock_id = LockId::from("l");

        let acquired = mgr
            .try_lock(&lock_id, ThreadId::new(1), LockLevel::Write, 0)
            .await
            .unwrap();
        assert!(!acquired, "not greedy, so zero-timeout fails fast");
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_without_hold_is_an_error() {
        let transport = RecordingTransport::new();
        let mgr = client(transport);
        let err = mgr
            .unlock(&LockId::from("l"), ThreadId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JicamaError::NotHeld(_)));
    }

    #[tokio::test]
    async fn test_notify_requires_a_write_hold() {
        let transport = RecordingTransport::new();
        let mgr = client(transport);
        let err = mgr
            .notify(&LockId::from("l"), ThreadId::new(1), NotifyMode::One)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_interrupt_unparks_with_interrupted_outcome() {
        let transport = RecordingTransport::new();
        let mgr = client(transport.clone());
        let lock_id = LockId::from("l");
        let t1 = ThreadId::new(1);

        let blocked = tokio::spawn({
            let mgr = mgr.clone();
            let lock_id = lock_id.clone();
            async move { mgr.lock(&lock_id, t1, LockLevel::Write).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        mgr.interrupt(&lock_id, t1).await.unwrap();
        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(err, JicamaError::Interrupted(_)));
        assert!(
            transport
                .sent()
                .iter()
                .any(|m| matches!(m, LockRequestMessage::Interrupt { .. })),
            "the delegated request is cancelled on the server too"
        );

        // A second interrupt is a no-op and sends nothing further
        let before = transport.sent().len();
        mgr.interrupt(&lock_id, t1).await.unwrap();
        assert_eq!(transport.sent().len(), before);
    }

    #[tokio::test]
    async fn test_recall_reports_exact_state_and_stops_short_circuiting() {
        let transport = RecordingTransport::new();
        let lock_id = LockId::from("l");
        let mgr = greedy_client(transport.clone(), &lock_id, LockLevel::Write).await;

        mgr.handle_server_message(ServerLockMessage::RecallRequest {
            lock_id: lock_id.clone(),
        })
        .await
        .unwrap();

        let commit = transport
            .sent()
            .into_iter()
            .find_map(|m| match m {
                LockRequestMessage::RecallCommit { contexts, .. } => Some(contexts),
                _ => None,
            })
            .expect("a recall commit must be sent");
        assert_eq!(commit.len(), 1);
        assert_eq!(commit[0].state, LockContextState::Holder);
        assert_eq!(commit[0].level, LockLevel::Write);
        assert_eq!(mgr.greedy_level(&lock_id), None);

        // The next acquisition goes back to the server
        let before = transport.sent().len();
        let blocked = tokio::spawn({
            let mgr = mgr.clone();
            let lock_id = lock_id.clone();
            async move { mgr.lock(&lock_id, ThreadId::new(2), LockLevel::Read).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent().len(), before + 1);
        blocked.abort();
    }

    #[tokio::test]
    async fn test_stale_award_is_released() {
        let transport = RecordingTransport::new();
        let mgr = client(transport.clone());

        mgr.handle_server_message(ServerLockMessage::Awarded {
            lock_id: LockId::from("l"),
            thread_id: ThreadId::new(9),
            level: LockLevel::Write,
            greedy: false,
        })
        .await
        .unwrap();

        assert!(
            transport
                .sent()
                .iter()
                .any(|m| matches!(m, LockRequestMessage::Unlock { .. })),
            "an unwanted award is handed straight back"
        );
    }

    #[tokio::test]
    async fn test_reestablish_contexts_cover_greedy_and_holds() {
        let transport = RecordingTransport::new();
        let lock_id = LockId::from("l");
        let mgr = greedy_client(transport.clone(), &lock_id, LockLevel::Write).await;

        mgr.rebind(ClientId::from("c-2"));
        let contexts = mgr.reestablish_contexts();
        assert!(contexts.iter().all(|c| c.client_id == ClientId::from("c-2")));
        assert!(
            contexts
                .iter()
                .any(|c| c.state == LockContextState::Holder && c.level == LockLevel::Write)
        );
        assert!(
            contexts
                .iter()
                .any(|c| c.state == LockContextState::GreedyHolder)
        );
    }
}
