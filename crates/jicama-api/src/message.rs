//! Lock protocol messages
//!
//! One message kind per logical operation, carried over the out-of-scope
//! transport. Client-to-server operations name the full owner; replies
//! omit the client id because the channel already addresses one client.

use serde::{Deserialize, Serialize};

use crate::model::{ClientId, LockContext, LockId, LockLevel, ThreadId};

/// Scope of a notify() call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotifyMode {
    One,
    All,
}

/// Client-to-server lock operations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LockRequestMessage {
    Lock {
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        level: LockLevel,
    },
    TryLock {
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        level: LockLevel,
        timeout_ms: u64,
    },
    Unlock {
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
    },
    QueryLock {
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
    },
    Interrupt {
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
    },
    Wait {
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        timeout_ms: Option<u64>,
        /// The stashed hold levels in acquisition order; authoritative for
        /// a greedy holder whose per-thread holds the server cannot see
        holds: Vec<LockLevel>,
    },
    Notify {
        lock_id: LockId,
        client_id: ClientId,
        thread_id: ThreadId,
        mode: NotifyMode,
    },
    RecallCommit {
        lock_id: LockId,
        client_id: ClientId,
        contexts: Vec<LockContext>,
    },
    Reestablish {
        client_id: ClientId,
        contexts: Vec<LockContext>,
    },
}

impl LockRequestMessage {
    /// The client the operation originates from
    pub fn client_id(&self) -> &ClientId {
        match self {
            LockRequestMessage::Lock { client_id, .. }
            | LockRequestMessage::TryLock { client_id, .. }
            | LockRequestMessage::Unlock { client_id, .. }
            | LockRequestMessage::QueryLock { client_id, .. }
            | LockRequestMessage::Interrupt { client_id, .. }
            | LockRequestMessage::Wait { client_id, .. }
            | LockRequestMessage::Notify { client_id, .. }
            | LockRequestMessage::RecallCommit { client_id, .. }
            | LockRequestMessage::Reestablish { client_id, .. } => client_id,
        }
    }
}

/// Server-to-client replies and callbacks
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerLockMessage {
    /// A lock/tryLock/reacquire request was granted. `greedy` marks a
    /// client-level greedy grant the client may serve locally.
    Awarded {
        lock_id: LockId,
        thread_id: ThreadId,
        level: LockLevel,
        greedy: bool,
    },
    /// A bounded request expired (or a zero-timeout request could not be
    /// granted immediately)
    Refused { lock_id: LockId, thread_id: ThreadId },
    /// The server revokes this client's greedy grant; the client must
    /// answer with RecallCommit
    RecallRequest { lock_id: LockId },
    /// A waiter was selected by notify(); reacquire awards follow
    Notified { lock_id: LockId, thread_id: ThreadId },
}

impl ServerLockMessage {
    pub fn lock_id(&self) -> &LockId {
        match self {
            ServerLockMessage::Awarded { lock_id, .. }
            | ServerLockMessage::Refused { lock_id, .. }
            | ServerLockMessage::RecallRequest { lock_id }
            | ServerLockMessage::Notified { lock_id, .. } => lock_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LockOwner;

    #[test]
    fn test_request_client_id() {
        let msg = LockRequestMessage::Unlock {
            lock_id: LockId::from("l"),
            client_id: ClientId::from("c-9"),
            thread_id: ThreadId::new(1),
        };
        assert_eq!(msg.client_id(), &ClientId::from("c-9"));
    }

    #[test]
    fn test_message_serde_tags() {
        let msg = LockRequestMessage::TryLock {
            lock_id: LockId::from("orders"),
            client_id: ClientId::from("c-1"),
            thread_id: ThreadId::new(2),
            level: LockLevel::Read,
            timeout_ms: 100,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "tryLock");
        assert_eq!(json["timeoutMs"], 100);

        let reply = ServerLockMessage::Awarded {
            lock_id: LockId::from("orders"),
            thread_id: ThreadId::new(2),
            level: LockLevel::Read,
            greedy: false,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "awarded");
        assert_eq!(json["level"], "READ");

        let owner = LockOwner::new(ClientId::from("c-1"), ThreadId::new(2));
        assert_eq!(format!("{}", owner), "c-1#2");
    }
}
