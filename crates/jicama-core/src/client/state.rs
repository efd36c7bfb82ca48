//! Client-side lock state nodes
//!
//! The closed family of per-thread states a thread can be in with respect
//! to one lock, as a tagged enum: a `Hold` cannot be parked and a parked
//! node cannot be granted twice, by construction. Parking a thread is
//! awaiting the node's oneshot channel; unparking is completing it.

use tokio::sync::oneshot;

use jicama_api::{LockLevel, ThreadId};

/// How a blocked acquisition ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcquireOutcome {
    Awarded,
    Refused,
    Interrupted,
}

/// How a wait() ended, as signalled to the parked task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitSignal {
    Notified,
    TimedOut,
    Interrupted,
}

/// How a wait() ended, as reported to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Woken by notify(); holds were reacquired before returning
    Notified,
    /// The wait deadline elapsed; holds were reacquired before returning
    TimedOut,
}

/// One thread's relationship to one lock
#[derive(Debug)]
pub(crate) enum NodeState {
    /// A granted hold
    Hold { level: LockLevel },
    /// A blocked acquisition. `delegated` records whether the server knows
    /// about it (false while the request is arbitrated locally under a
    /// greedy grant).
    Pending {
        level: LockLevel,
        delegated: bool,
        tx: oneshot::Sender<AcquireOutcome>,
    },
    /// A blocked, deadline-bounded acquisition
    PendingTry {
        level: LockLevel,
        delegated: bool,
        deadline_at: i64,
        tx: oneshot::Sender<AcquireOutcome>,
    },
    /// A thread parked inside wait(), with the reacquisition it is owed
    Waiter {
        remaining: Vec<LockLevel>,
        regained: Vec<LockLevel>,
        notified: bool,
        deadline_at: Option<i64>,
        tx: oneshot::Sender<WaitSignal>,
    },
}

/// One node of the per-lock chain, in insertion order
#[derive(Debug)]
pub(crate) struct LockNode {
    pub(crate) thread_id: ThreadId,
    pub(crate) state: NodeState,
}

impl LockNode {
    pub(crate) fn is_hold(&self) -> bool {
        matches!(self.state, NodeState::Hold { .. })
    }

    pub(crate) fn is_queued(&self) -> bool {
        matches!(
            self.state,
            NodeState::Pending { .. } | NodeState::PendingTry { .. }
        )
    }

    /// The level a hold or queued request is at, if any
    pub(crate) fn level(&self) -> Option<LockLevel> {
        match &self.state {
            NodeState::Hold { level }
            | NodeState::Pending { level, .. }
            | NodeState::PendingTry { level, .. } => Some(*level),
            NodeState::Waiter { .. } => None,
        }
    }
}
