//! Collaborator interfaces to the transport layer
//!
//! The network transport and wire framing live outside this crate; the
//! lock manager only ever talks to one client through `LockChannel` and
//! asks `ClientLiveness` whether a client is still connected.

use jicama_api::{ClientId, ServerLockMessage};
use jicama_common::JicamaError;

/// Delivers server-to-client lock messages (awards, refusals, recall
/// requests, notifications) to a specific connected client
///
/// Implementations must preserve send order per client: the recall
/// protocol relies on an award emitted before a recall being observed
/// before it.
#[async_trait::async_trait]
pub trait LockChannel: Send + Sync {
    async fn send(
        &self,
        client_id: &ClientId,
        message: ServerLockMessage,
    ) -> Result<(), JicamaError>;
}

/// Answers whether a client connection is currently alive
pub trait ClientLiveness: Send + Sync {
    fn is_connected(&self, client_id: &ClientId) -> bool;
}
