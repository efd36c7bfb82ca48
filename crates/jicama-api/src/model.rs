//! Identifier value types and lock contexts
//!
//! These are the immutable value types the whole protocol is built on,
//! plus the `LockContext` snapshot that is the unit of greedy-recall
//! reporting and reconnection replay.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Globally unique, opaque name of a lock
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LockId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies a logical thread within one client; only unique in
/// combination with the client identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one connected client process; stable for the lifetime of a
/// connection and reissued on rejoin
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection-scoped client id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lock level requested or held by an owner
///
/// WRITE is exclusive; READ is shared. WRITE excludes all READ/WRITE holds
/// from other owners; an owner that already holds WRITE may always take
/// READ on top of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockLevel {
    Read,
    Write,
}

impl LockLevel {
    pub fn is_write(self) -> bool {
        matches!(self, LockLevel::Write)
    }

    /// Whether a hold at `self` and a hold at `other` may coexist when the
    /// owners differ
    pub fn is_compatible(self, other: LockLevel) -> bool {
        !(self.is_write() || other.is_write())
    }

    /// Whether a grant at `self` covers a request at `requested` without
    /// widening (WRITE covers both levels, READ covers only READ)
    pub fn covers(self, requested: LockLevel) -> bool {
        self.is_write() || !requested.is_write()
    }
}

impl Display for LockLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockLevel::Read => write!(f, "READ"),
            LockLevel::Write => write!(f, "WRITE"),
        }
    }
}

/// The (client, thread) pair a hold or request belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOwner {
    pub client_id: ClientId,
    pub thread_id: ThreadId,
}

impl LockOwner {
    pub fn new(client_id: ClientId, thread_id: ThreadId) -> Self {
        Self {
            client_id,
            thread_id,
        }
    }
}

impl Display for LockOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.client_id, self.thread_id)
    }
}

/// State tag of an exchanged lock context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockContextState {
    /// A granted per-thread hold
    Holder,
    /// The client-level greedy grant
    GreedyHolder,
    /// A queued blocking acquisition
    Pending,
    /// A queued bounded acquisition; `timeout_ms` carries the remainder
    TryPending,
    /// A thread blocked inside wait()
    Waiter,
}

/// Wire-level snapshot of one (owner, lock, state, level, timeout) tuple
///
/// The unit of reconnection replay and of greedy-recall reporting. A
/// waiter with several stashed holds is reported as one context per
/// stashed level, in acquisition order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockContext {
    pub lock_id: LockId,
    pub client_id: ClientId,
    pub thread_id: ThreadId,
    pub state: LockContextState,
    pub level: LockLevel,
    /// Remaining timeout in milliseconds for TryPending and timed Waiter
    /// contexts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl LockContext {
    pub fn owner(&self) -> LockOwner {
        LockOwner::new(self.client_id.clone(), self.thread_id)
    }
}

/// One granted hold, as reported by the administrative dump
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldSnapshot {
    pub client_id: ClientId,
    pub thread_id: ThreadId,
    pub level: LockLevel,
}

/// One queued acquisition, as reported by the administrative dump
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSnapshot {
    pub client_id: ClientId,
    pub thread_id: ThreadId,
    pub level: LockLevel,
    /// Whether this entry is deadline-bounded (tryLock)
    pub bounded: bool,
}

/// One waiter, as reported by the administrative dump
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaiterSnapshot {
    pub client_id: ClientId,
    pub thread_id: ThreadId,
    pub reacquire: Vec<LockLevel>,
}

/// Aggregate, read-only state of one lock for operational tooling
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockSnapshot {
    pub lock_id: LockId,
    pub greedy_holder: Option<ClientId>,
    pub recall_in_progress: bool,
    pub holds: Vec<HoldSnapshot>,
    pub pending: Vec<PendingSnapshot>,
    pub waiters: Vec<WaiterSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_compatibility() {
        assert!(LockLevel::Read.is_compatible(LockLevel::Read));
        assert!(!LockLevel::Read.is_compatible(LockLevel::Write));
        assert!(!LockLevel::Write.is_compatible(LockLevel::Read));
        assert!(!LockLevel::Write.is_compatible(LockLevel::Write));
    }

    #[test]
    fn test_level_covers() {
        assert!(LockLevel::Write.covers(LockLevel::Read));
        assert!(LockLevel::Write.covers(LockLevel::Write));
        assert!(LockLevel::Read.covers(LockLevel::Read));
        assert!(!LockLevel::Read.covers(LockLevel::Write));
    }

    #[test]
    fn test_generated_client_ids_are_unique() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[test]
    fn test_context_serde_shape() {
        let ctx = LockContext {
            lock_id: LockId::from("orders"),
            client_id: ClientId::from("c-1"),
            thread_id: ThreadId::new(7),
            state: LockContextState::TryPending,
            level: LockLevel::Write,
            timeout_ms: Some(250),
        };

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["lockId"], "orders");
        assert_eq!(json["state"], "try_pending");
        assert_eq!(json["level"], "WRITE");
        assert_eq!(json["timeoutMs"], 250);

        let back: LockContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }
}
