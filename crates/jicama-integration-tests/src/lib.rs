//! In-process test cluster for the Jicama lock manager
//!
//! Wires `ClientLockManager` instances to a `LockManager` without any real
//! transport: client requests dispatch straight into the manager, and
//! server messages are routed into per-client delivery pumps, preserving
//! per-client ordering the way the wire would.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use jicama_api::{ClientId, LockRequestMessage, ServerLockMessage};
use jicama_common::JicamaError;
use jicama_core::{
    ClientLiveness, ClientLockManager, LockChannel, LockManager, LockManagerConfig,
    LockRequestTransport,
};

/// Routes server messages to per-client inboxes and records every
/// delivery for assertions
pub struct RouterChannel {
    inboxes: DashMap<ClientId, mpsc::UnboundedSender<ServerLockMessage>>,
    delivered: Mutex<Vec<(ClientId, ServerLockMessage)>>,
}

impl RouterChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: DashMap::new(),
            delivered: Mutex::new(Vec::new()),
        })
    }

    /// Every message delivered to `client_id`, in order
    pub fn delivered_to(&self, client_id: &ClientId) -> Vec<ServerLockMessage> {
        self.delivered
            .lock()
            .iter()
            .filter(|(c, _)| c == client_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn delivered_count(&self, client_id: &ClientId) -> usize {
        self.delivered_to(client_id).len()
    }
}

#[async_trait::async_trait]
impl LockChannel for RouterChannel {
    async fn send(
        &self,
        client_id: &ClientId,
        message: ServerLockMessage,
    ) -> Result<(), JicamaError> {
        self.delivered
            .lock()
            .push((client_id.clone(), message.clone()));
        match self.inboxes.get(client_id) {
            Some(tx) => tx
                .send(message)
                .map_err(|e| JicamaError::ChannelError(e.to_string())),
            None => Err(JicamaError::ChannelError(format!(
                "no inbox for client '{client_id}'"
            ))),
        }
    }
}

struct LivenessTable {
    connected: DashMap<ClientId, ()>,
}

impl ClientLiveness for LivenessTable {
    fn is_connected(&self, client_id: &ClientId) -> bool {
        self.connected.contains_key(client_id)
    }
}

/// Client-to-server path: dispatch straight into the manager
struct DirectTransport {
    manager: LockManager,
}

#[async_trait::async_trait]
impl LockRequestTransport for DirectTransport {
    async fn send(&self, message: LockRequestMessage) -> Result<(), JicamaError> {
        self.manager.handle(message).await.map(|_| ())
    }
}

/// One connected client process
pub struct TestClient {
    pub locks: ClientLockManager,
    pump: tokio::task::JoinHandle<()>,
}

impl TestClient {
    pub fn client_id(&self) -> ClientId {
        self.locks.client_id()
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// An in-process lock cluster: one authority, any number of clients
pub struct TestCluster {
    pub server: LockManager,
    pub router: Arc<RouterChannel>,
    liveness: Arc<LivenessTable>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    pub fn without_greedy() -> Self {
        Self::with_config(LockManagerConfig {
            greedy_enabled: false,
            ..LockManagerConfig::default()
        })
    }

    pub fn with_config(config: LockManagerConfig) -> Self {
        init_tracing();
        let router = RouterChannel::new();
        let liveness = Arc::new(LivenessTable {
            connected: DashMap::new(),
        });
        let server = LockManager::new(router.clone(), liveness.clone(), config);
        Self {
            server,
            router,
            liveness,
        }
    }

    pub async fn start(&self) {
        self.server.start().await;
    }

    /// Connect a new client process
    pub fn join(&self) -> TestClient {
        let client_id = ClientId::generate();
        let locks = ClientLockManager::new(
            client_id.clone(),
            Arc::new(DirectTransport {
                manager: self.server.clone(),
            }),
        );
        let pump = self.open_inbox(&client_id, locks.clone());
        TestClient { locks, pump }
    }

    /// Drop the client's connection and purge its server-side state
    pub async fn disconnect(&self, client: &TestClient) {
        let client_id = client.client_id();
        self.liveness.connected.remove(&client_id);
        self.router.inboxes.remove(&client_id);
        self.server.clear_all_locks_for(&client_id).await;
    }

    /// Sever the connection without the disconnect sweep (a crash the
    /// server has not noticed yet)
    pub fn sever(&self, client: &TestClient) {
        let client_id = client.client_id();
        self.liveness.connected.remove(&client_id);
        self.router.inboxes.remove(&client_id);
    }

    /// Rejoin with a fresh client id and replay the client's last-known
    /// contexts into the authority. The server processes the old
    /// connection's departure first, as the membership layer would.
    pub async fn rejoin(&self, client: &mut TestClient) {
        let old_id = client.client_id();
        self.server.clear_all_locks_for(&old_id).await;
        let new_id = ClientId::generate();
        client.locks.rebind(new_id.clone());
        client.pump.abort();
        client.pump = self.open_inbox(&new_id, client.locks.clone());
        let contexts = client.locks.reestablish_contexts();
        self.server
            .reestablish(new_id, contexts)
            .await
            .expect("reestablish must not fail");
    }

    fn open_inbox(
        &self,
        client_id: &ClientId,
        locks: ClientLockManager,
    ) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.router.inboxes.insert(client_id.clone(), tx);
        self.liveness.connected.insert(client_id.clone(), ());
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = locks.handle_server_message(message).await {
                    warn!(error = %err, "Client failed to apply server message");
                }
            }
        })
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Let in-flight deliveries and pumps settle
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

/// Install a test subscriber once, honoring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
