//! Per-lock client state machine
//!
//! One `ClientLock` owns the chain of state nodes for one lock on one
//! client and decides whether a request can be satisfied from the cached
//! greedy grant or must be delegated to the server. While the client is
//! the greedy holder it arbitrates its own threads with the same
//! compatibility and FIFO rules the server applies, so a recall can hand
//! the server an exact, consistent picture.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use jicama_api::{
    ClientId, LockContext, LockContextState, LockId, LockLevel, ThreadId,
};
use jicama_common::{CLIENT_LEVEL_THREAD_ID, now_millis};

use super::state::{AcquireOutcome, LockNode, NodeState, WaitSignal};

/// Client-level greedy state for one lock, orthogonal to the per-thread
/// node states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GreedyState {
    /// No cached grant; every request is delegated
    NoInterest,
    /// The server granted this client the right to satisfy compatible
    /// requests locally
    Granted(LockLevel),
    /// A recall arrived and the commit is being assembled/sent; local
    /// short-circuiting is suspended
    RecallPending,
}

/// Where a request was routed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestRoute {
    /// Satisfied from the greedy grant; a hold is already recorded
    Granted,
    /// Queued locally behind this client's own threads
    QueuedLocal,
    /// Sent to the server
    Delegated,
}

/// What handle_award did with an incoming award
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AwardDisposition {
    Applied,
    /// No node wanted it (interrupt/timeout race); the award must be
    /// released back to the server
    Stale,
}

/// Resolution of a tryLock whose local deadline fired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TryTimeoutResolution {
    /// The award won the race; the hold stands
    Held,
    Refused,
}

pub(crate) struct ClientLock {
    id: LockId,
    greedy: GreedyState,
    nodes: Vec<LockNode>,
}

impl ClientLock {
    pub(crate) fn new(id: LockId) -> Self {
        Self {
            id,
            greedy: GreedyState::NoInterest,
            nodes: Vec::new(),
        }
    }

    pub(crate) fn greedy(&self) -> GreedyState {
        self.greedy
    }

    /// Whether `level` for `thread_id` is compatible with every other
    /// thread's hold
    fn holds_compatible(&self, thread_id: ThreadId, level: LockLevel) -> bool {
        self.nodes.iter().all(|n| match &n.state {
            NodeState::Hold { level: held } => {
                n.thread_id == thread_id || held.is_compatible(level)
            }
            _ => true,
        })
    }

    /// Whether an earlier queued request of another thread conflicts with
    /// `level` (local FIFO fairness)
    fn conflicting_queued(&self, thread_id: ThreadId, level: LockLevel) -> bool {
        self.nodes.iter().any(|n| {
            n.thread_id != thread_id
                && n.is_queued()
                && n.level().is_some_and(|l| !l.is_compatible(level))
        })
    }

    fn greedy_covers(&self, level: LockLevel) -> bool {
        matches!(self.greedy, GreedyState::Granted(granted) if granted.covers(level))
    }

    fn can_acquire_locally(&self, thread_id: ThreadId, level: LockLevel) -> bool {
        self.greedy_covers(level)
            && self.holds_compatible(thread_id, level)
            && !self.conflicting_queued(thread_id, level)
    }

    /// Route a blocking acquisition; on `Granted` the hold is recorded and
    /// `tx` is dropped
    pub(crate) fn route_lock(
        &mut self,
        thread_id: ThreadId,
        level: LockLevel,
        tx: oneshot::Sender<AcquireOutcome>,
    ) -> RequestRoute {
        if self.can_acquire_locally(thread_id, level) {
            debug!(lock_id = %self.id, thread_id = %thread_id, level = %level, "Greedy local grant");
            self.nodes.push(LockNode {
                thread_id,
                state: NodeState::Hold { level },
            });
            return RequestRoute::Granted;
        }
        let delegated = !self.greedy_covers(level);
        self.nodes.push(LockNode {
            thread_id,
            state: NodeState::Pending {
                level,
                delegated,
                tx,
            },
        });
        if delegated {
            RequestRoute::Delegated
        } else {
            RequestRoute::QueuedLocal
        }
    }

    /// Route a bounded acquisition; identical to `route_lock` except the
    /// queued node carries its deadline
    pub(crate) fn route_try_lock(
        &mut self,
        thread_id: ThreadId,
        level: LockLevel,
        deadline_at: i64,
        tx: oneshot::Sender<AcquireOutcome>,
    ) -> RequestRoute {
        if self.can_acquire_locally(thread_id, level) {
            debug!(lock_id = %self.id, thread_id = %thread_id, level = %level, "Greedy local grant");
            self.nodes.push(LockNode {
                thread_id,
                state: NodeState::Hold { level },
            });
            return RequestRoute::Granted;
        }
        let delegated = !self.greedy_covers(level);
        self.nodes.push(LockNode {
            thread_id,
            state: NodeState::PendingTry {
                level,
                delegated,
                deadline_at,
                tx,
            },
        });
        if delegated {
            RequestRoute::Delegated
        } else {
            RequestRoute::QueuedLocal
        }
    }

    /// Zero-timeout acquisition: grant from the greedy cache or fail fast;
    /// never creates a node and never costs a network round trip
    pub(crate) fn try_acquire_immediate(&mut self, thread_id: ThreadId, level: LockLevel) -> bool {
        if self.can_acquire_locally(thread_id, level) {
            self.nodes.push(LockNode {
                thread_id,
                state: NodeState::Hold { level },
            });
            return true;
        }
        false
    }

    /// Award every locally queued request that the greedy grant now
    /// covers, front to back with the same skip rules as the server
    pub(crate) fn award_local_pendings(&mut self) -> usize {
        if !matches!(self.greedy, GreedyState::Granted(_)) {
            return 0;
        }
        let mut skipped: Vec<(ThreadId, LockLevel)> = Vec::new();
        let mut awarded = 0;
        let mut i = 0;
        while i < self.nodes.len() {
            let thread_id = self.nodes[i].thread_id;
            let (level, local) = match &self.nodes[i].state {
                NodeState::Pending {
                    level, delegated, ..
                }
                | NodeState::PendingTry {
                    level, delegated, ..
                } => (*level, !delegated),
                _ => {
                    i += 1;
                    continue;
                }
            };
            let blocked = skipped
                .iter()
                .any(|(t, l)| *t != thread_id && !l.is_compatible(level));
            if local
                && !blocked
                && self.greedy_covers(level)
                && self.holds_compatible(thread_id, level)
            {
                let previous = std::mem::replace(
                    &mut self.nodes[i].state,
                    NodeState::Hold { level },
                );
                let tx = match previous {
                    NodeState::Pending { tx, .. } | NodeState::PendingTry { tx, .. } => tx,
                    _ => unreachable!("matched a queued node above"),
                };
                let _ = tx.send(AcquireOutcome::Awarded);
                awarded += 1;
            } else {
                skipped.push((thread_id, level));
            }
            i += 1;
        }
        awarded
    }

    /// Release the thread's most recently acquired hold
    pub(crate) fn remove_last_hold(&mut self, thread_id: ThreadId) -> Option<LockLevel> {
        let idx = self
            .nodes
            .iter()
            .rposition(|n| n.thread_id == thread_id && n.is_hold())?;
        let node = self.nodes.remove(idx);
        node.level()
    }

    pub(crate) fn has_write_hold(&self, thread_id: ThreadId) -> bool {
        self.nodes.iter().any(|n| {
            n.thread_id == thread_id
                && matches!(n.state, NodeState::Hold { level } if level.is_write())
        })
    }

    /// Remove the thread's holds in acquisition order, returning their
    /// levels (the wait() stash)
    pub(crate) fn stash_holds(&mut self, thread_id: ThreadId) -> Vec<LockLevel> {
        let mut stash = Vec::new();
        self.nodes.retain(|n| {
            if n.thread_id == thread_id && n.is_hold() {
                if let Some(level) = n.level() {
                    stash.push(level);
                }
                false
            } else {
                true
            }
        });
        stash
    }

    pub(crate) fn add_waiter(
        &mut self,
        thread_id: ThreadId,
        remaining: Vec<LockLevel>,
        deadline_at: Option<i64>,
        tx: oneshot::Sender<WaitSignal>,
    ) {
        self.nodes.push(LockNode {
            thread_id,
            state: NodeState::Waiter {
                remaining,
                regained: Vec::new(),
                notified: false,
                deadline_at,
                tx,
            },
        });
    }

    /// Apply an incoming award to the node that asked for it
    pub(crate) fn handle_award(
        &mut self,
        thread_id: ThreadId,
        level: LockLevel,
        greedy: bool,
    ) -> AwardDisposition {
        if greedy {
            debug!(lock_id = %self.id, level = %level, "Greedy grant cached");
            self.greedy = GreedyState::Granted(level);
        }

        // A queued request whose level the award covers
        let queued = self.nodes.iter().position(|n| {
            n.thread_id == thread_id
                && n.is_queued()
                && n.level().is_some_and(|requested| level.covers(requested))
        });
        if let Some(idx) = queued {
            let requested = self.nodes[idx].level().unwrap_or(level);
            let previous = std::mem::replace(
                &mut self.nodes[idx].state,
                NodeState::Hold { level: requested },
            );
            if let NodeState::Pending { tx, .. } | NodeState::PendingTry { tx, .. } = previous {
                let _ = tx.send(AcquireOutcome::Awarded);
            }
            return AwardDisposition::Applied;
        }

        // A waiter regaining one of its stashed holds
        let waiting = self.nodes.iter().position(|n| {
            n.thread_id == thread_id && matches!(&n.state, NodeState::Waiter { remaining, .. } if remaining.contains(&level))
        });
        if let Some(idx) = waiting {
            let done = match &mut self.nodes[idx].state {
                NodeState::Waiter {
                    remaining,
                    regained,
                    ..
                } => {
                    if let Some(pos) = remaining.iter().position(|l| *l == level) {
                        remaining.remove(pos);
                    }
                    regained.push(level);
                    remaining.is_empty()
                }
                _ => false,
            };
            if done {
                let node = self.nodes.remove(idx);
                if let NodeState::Waiter {
                    regained,
                    notified,
                    tx,
                    ..
                } = node.state
                {
                    for regained_level in regained {
                        self.nodes.push(LockNode {
                            thread_id,
                            state: NodeState::Hold {
                                level: regained_level,
                            },
                        });
                    }
                    let signal = if notified {
                        WaitSignal::Notified
                    } else {
                        WaitSignal::TimedOut
                    };
                    let _ = tx.send(signal);
                }
            }
            return AwardDisposition::Applied;
        }

        if greedy {
            // A bare greedy re-grant with nothing queued is still useful
            return AwardDisposition::Applied;
        }
        AwardDisposition::Stale
    }

    /// Apply an incoming refusal to the bounded request it targets
    pub(crate) fn handle_refused(&mut self, thread_id: ThreadId) {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.thread_id == thread_id && n.is_queued());
        let Some(idx) = idx else {
            // The local deadline already resolved this request
            return;
        };
        match &self.nodes[idx].state {
            NodeState::PendingTry { .. } => {
                let node = self.nodes.remove(idx);
                if let NodeState::PendingTry { tx, .. } = node.state {
                    let _ = tx.send(AcquireOutcome::Refused);
                }
            }
            NodeState::Pending { .. } => {
                warn!(lock_id = %self.id, thread_id = %thread_id, "Refusal for a blocking acquisition ignored");
            }
            _ => {}
        }
    }

    /// Mark the thread's waiter as notified; the reacquire awards follow
    pub(crate) fn handle_notified(&mut self, thread_id: ThreadId) {
        for node in &mut self.nodes {
            if node.thread_id == thread_id
                && let NodeState::Waiter { notified, .. } = &mut node.state
            {
                *notified = true;
                return;
            }
        }
        debug!(lock_id = %self.id, thread_id = %thread_id, "Notified with no waiter present");
    }

    /// Resolve the race between a local tryLock deadline and an award
    pub(crate) fn resolve_try_timeout(
        &mut self,
        thread_id: ThreadId,
        level: LockLevel,
    ) -> TryTimeoutResolution {
        let idx = self.nodes.iter().position(|n| {
            n.thread_id == thread_id && matches!(n.state, NodeState::PendingTry { .. })
        });
        if let Some(idx) = idx {
            self.nodes.remove(idx);
            return TryTimeoutResolution::Refused;
        }
        // The node is gone: either the award transitioned it to a hold, or
        // a server refusal removed it
        if self
            .nodes
            .iter()
            .any(|n| n.thread_id == thread_id && n.state_is_hold_at(level))
        {
            TryTimeoutResolution::Held
        } else {
            TryTimeoutResolution::Refused
        }
    }

    /// Cancel the thread's blocked node. Returns whether the server knew
    /// about it (and must be told), or `None` when there was nothing to
    /// cancel.
    pub(crate) fn interrupt(&mut self, thread_id: ThreadId) -> Option<bool> {
        let idx = self
            .nodes
            .iter()
            .position(|n| n.thread_id == thread_id && !n.is_hold())?;
        let node = self.nodes.remove(idx);
        match node.state {
            NodeState::Pending { delegated, tx, .. }
            | NodeState::PendingTry { delegated, tx, .. } => {
                let _ = tx.send(AcquireOutcome::Interrupted);
                Some(delegated)
            }
            NodeState::Waiter { tx, .. } => {
                let _ = tx.send(WaitSignal::Interrupted);
                Some(true)
            }
            NodeState::Hold { .. } => None,
        }
    }

    /// Begin answering a recall: suspend local short-circuiting, hand every
    /// locally queued request over to the server, and produce the exact
    /// report of this client's state. Returns `None` when this client is
    /// not actually the greedy holder (degenerate, logged by the caller).
    pub(crate) fn begin_recall(&mut self, client_id: &ClientId) -> Option<Vec<LockContext>> {
        if !matches!(self.greedy, GreedyState::Granted(_)) {
            return None;
        }
        self.greedy = GreedyState::RecallPending;
        for node in &mut self.nodes {
            match &mut node.state {
                NodeState::Pending { delegated, .. }
                | NodeState::PendingTry { delegated, .. } => *delegated = true,
                _ => {}
            }
        }
        Some(self.contexts(client_id, false))
    }

    /// The recall commit has been sent; the client is no longer the greedy
    /// holder until re-granted
    pub(crate) fn finish_recall(&mut self) {
        if self.greedy == GreedyState::RecallPending {
            self.greedy = GreedyState::NoInterest;
        }
    }

    /// Snapshot this lock's state as exchange contexts: holds first, then
    /// the greedy grant (reconnection only), then queued requests, then
    /// waiters
    pub(crate) fn contexts(&self, client_id: &ClientId, include_greedy: bool) -> Vec<LockContext> {
        let now = now_millis();
        let mut contexts = Vec::new();
        let context = |thread_id: ThreadId, state, level, timeout_ms| LockContext {
            lock_id: self.id.clone(),
            client_id: client_id.clone(),
            thread_id,
            state,
            level,
            timeout_ms,
        };

        for node in &self.nodes {
            if let NodeState::Hold { level } = node.state {
                contexts.push(context(node.thread_id, LockContextState::Holder, level, None));
            }
        }
        if include_greedy
            && let GreedyState::Granted(level) = self.greedy
        {
            contexts.push(context(
                ThreadId::new(CLIENT_LEVEL_THREAD_ID),
                LockContextState::GreedyHolder,
                level,
                None,
            ));
        }
        for node in &self.nodes {
            match &node.state {
                NodeState::Pending { level, .. } => {
                    contexts.push(context(node.thread_id, LockContextState::Pending, *level, None));
                }
                NodeState::PendingTry {
                    level, deadline_at, ..
                } => {
                    let remaining = (*deadline_at - now).max(0) as u64;
                    contexts.push(context(
                        node.thread_id,
                        LockContextState::TryPending,
                        *level,
                        Some(remaining),
                    ));
                }
                NodeState::Waiter {
                    remaining,
                    regained,
                    deadline_at,
                    ..
                } => {
                    // A partially reacquired waiter reports its regained
                    // levels as holds
                    for level in regained {
                        contexts.push(context(node.thread_id, LockContextState::Holder, *level, None));
                    }
                    let timeout = deadline_at.map(|d| (d - now).max(0) as u64);
                    for level in remaining {
                        contexts.push(context(
                            node.thread_id,
                            LockContextState::Waiter,
                            *level,
                            timeout,
                        ));
                    }
                }
                NodeState::Hold { .. } => {}
            }
        }
        contexts
    }
}

impl LockNode {
    fn state_is_hold_at(&self, level: LockLevel) -> bool {
        matches!(self.state, NodeState::Hold { level: held } if held == level)
    }
}
