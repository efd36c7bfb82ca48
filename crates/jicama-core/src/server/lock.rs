//! Authoritative per-lock state machine
//!
//! One `ServerLock` is the single source of truth for one `LockId`: the
//! granted holds, the greedy holder, the FIFO pending queue, and the
//! waiters blocked inside wait(). Every transition runs inside the lock
//! store's exclusive checkout and returns a list of `LockEffect`s (replies
//! to send, timers to schedule or cancel) that the manager applies after
//! checkin, so no reply is ever sent while the lock is checked out.

use std::collections::VecDeque;

use tracing::{debug, warn};

use jicama_api::{
    ClientId, HoldSnapshot, LockContext, LockContextState, LockId, LockLevel, LockOwner,
    LockSnapshot, NotifyMode, PendingSnapshot, ServerLockMessage, WaiterSnapshot,
};
use jicama_common::JicamaError;

/// A side effect produced by a state transition, applied after checkin
#[derive(Debug)]
pub(crate) enum LockEffect {
    /// Deliver a protocol message to a client
    Send {
        client_id: ClientId,
        message: ServerLockMessage,
    },
    /// Arm the tryLock expiry timer for a queued bounded request
    ScheduleTry { owner: LockOwner, delay_ms: u64 },
    /// Disarm the tryLock expiry timer (awarded, interrupted, or cleared)
    CancelTry { owner: LockOwner },
    /// Arm the wait expiry timer for a timed waiter
    ScheduleWait { owner: LockOwner, delay_ms: u64 },
    /// Disarm the wait expiry timer
    CancelWait { owner: LockOwner },
    /// Arm the recall deadline for the greedy holder
    ScheduleRecall { client_id: ClientId },
    /// Disarm the recall deadline
    CancelRecall { client_id: ClientId },
}

/// A granted hold
#[derive(Clone, Debug)]
struct Hold {
    owner: LockOwner,
    level: LockLevel,
}

/// The client-level greedy grant standing in for that client's threads
#[derive(Clone, Debug)]
struct GreedyHold {
    client_id: ClientId,
    level: LockLevel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingKind {
    /// Blocking acquisition, waits until granted
    Lock,
    /// Bounded acquisition, refused when the deadline elapses
    Try,
}

/// A queued, not-yet-granted acquisition request
#[derive(Clone, Debug)]
struct PendingEntry {
    owner: LockOwner,
    level: LockLevel,
    kind: PendingKind,
}

/// A thread blocked inside wait(), with the holds it gave up
#[derive(Clone, Debug)]
struct WaiterEntry {
    owner: LockOwner,
    reacquire: Vec<LockLevel>,
    timed: bool,
}

/// Accumulates the waiters selected by a notify() call
///
/// The grant decision for a notified waiter happens on a later lock-store
/// pass, outside the notifying operation's checkout, so the accumulator is
/// threaded through `notify` and drained by the manager afterwards.
#[derive(Debug, Default)]
pub struct NotifiedWaiters {
    entries: Vec<NotifiedWaiter>,
}

#[derive(Debug)]
pub struct NotifiedWaiter {
    pub lock_id: LockId,
    pub owner: LockOwner,
    pub reacquire: Vec<LockLevel>,
}

impl NotifiedWaiters {
    pub fn push(&mut self, entry: NotifiedWaiter) {
        self.entries.push(entry);
    }

    pub fn drain(&mut self) -> Vec<NotifiedWaiter> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) struct ServerLock {
    id: LockId,
    /// Set by the store when this instance is removed from the map; a
    /// checkout that observes it retries against a fresh instance
    pub(crate) retired: bool,
    holds: Vec<Hold>,
    greedy: Option<GreedyHold>,
    recall_in_progress: bool,
    pending: VecDeque<PendingEntry>,
    waiters: Vec<WaiterEntry>,
}

impl ServerLock {
    pub(crate) fn new(id: LockId) -> Self {
        Self {
            id,
            retired: false,
            holds: Vec::new(),
            greedy: None,
            recall_in_progress: false,
            pending: VecDeque::new(),
            waiters: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> &LockId {
        &self.id
    }

    /// Whether this lock carries no state at all (removal candidate)
    pub(crate) fn is_empty(&self) -> bool {
        self.holds.is_empty()
            && self.greedy.is_none()
            && self.pending.is_empty()
            && self.waiters.is_empty()
    }

    /// Whether a grant at `level` to `owner` would violate the exclusion
    /// invariant right now
    fn can_award(&self, owner: &LockOwner, level: LockLevel) -> bool {
        if self.recall_in_progress {
            return false;
        }
        if let Some(greedy) = &self.greedy
            && greedy.client_id != owner.client_id
            && !greedy.level.is_compatible(level)
        {
            return false;
        }
        self.holds
            .iter()
            .all(|h| h.owner == *owner || h.level.is_compatible(level))
    }

    /// Whether an earlier queued request of a different owner conflicts
    /// with `level` (FIFO fairness: such a request must not be bypassed)
    fn has_conflicting_pending(&self, owner: &LockOwner, level: LockLevel) -> bool {
        self.pending
            .iter()
            .any(|p| p.owner != *owner && !p.level.is_compatible(level))
    }

    /// Whether any state on this lock belongs to a client other than
    /// `client_id`
    fn other_client_interest(&self, client_id: &ClientId) -> bool {
        self.holds.iter().any(|h| h.owner.client_id != *client_id)
            || self.pending.iter().any(|p| p.owner.client_id != *client_id)
            || self.waiters.iter().any(|w| w.owner.client_id != *client_id)
            || self
                .greedy
                .as_ref()
                .is_some_and(|g| g.client_id != *client_id)
    }

    /// Whether `level` for `owner` requires recalling the greedy holder.
    /// A conflicting request from another client always recalls; the
    /// greedy client's own request recalls when it outgrows the cached
    /// level, because the server cannot see that client's local holds.
    fn needs_recall(&self, owner: &LockOwner, level: LockLevel) -> bool {
        match &self.greedy {
            Some(greedy) if greedy.client_id != owner.client_id => {
                !greedy.level.is_compatible(level)
            }
            Some(greedy) => !greedy.level.covers(level),
            None => false,
        }
    }

    fn start_recall(&mut self, effects: &mut Vec<LockEffect>) {
        if self.recall_in_progress {
            return;
        }
        let Some(greedy) = &self.greedy else {
            return;
        };
        self.recall_in_progress = true;
        metrics::counter!("jicama_lock_recalls_total").increment(1);
        debug!(lock_id = %self.id, client_id = %greedy.client_id, "Recalling greedy grant");
        effects.push(LockEffect::Send {
            client_id: greedy.client_id.clone(),
            message: ServerLockMessage::RecallRequest {
                lock_id: self.id.clone(),
            },
        });
        effects.push(LockEffect::ScheduleRecall {
            client_id: greedy.client_id.clone(),
        });
    }

    fn send_awarded(
        &self,
        owner: &LockOwner,
        level: LockLevel,
        greedy: bool,
        effects: &mut Vec<LockEffect>,
    ) {
        effects.push(LockEffect::Send {
            client_id: owner.client_id.clone(),
            message: ServerLockMessage::Awarded {
                lock_id: self.id.clone(),
                thread_id: owner.thread_id,
                level,
                greedy,
            },
        });
    }

    /// Grant a per-thread hold and reply with the award
    fn grant(&mut self, owner: LockOwner, level: LockLevel, effects: &mut Vec<LockEffect>) {
        metrics::counter!("jicama_lock_grants_total").increment(1);
        debug!(lock_id = %self.id, owner = %owner, level = %level, "Hold awarded");
        self.send_awarded(&owner, level, false, effects);
        self.holds.push(Hold { owner, level });
    }

    /// Grant either a greedy client-level hold (when this client is the
    /// only interested party) or a plain per-thread hold
    fn award(
        &mut self,
        owner: LockOwner,
        level: LockLevel,
        greedy_allowed: bool,
        effects: &mut Vec<LockEffect>,
    ) {
        let sole_interest = greedy_allowed
            && !self.recall_in_progress
            && !self.other_client_interest(&owner.client_id);
        if sole_interest {
            // Widen an existing greedy grant rather than narrowing it
            let granted = match &self.greedy {
                Some(g) if g.client_id == owner.client_id && g.level.covers(level) => g.level,
                _ => level,
            };
            metrics::counter!("jicama_lock_grants_total").increment(1);
            debug!(
                lock_id = %self.id,
                client_id = %owner.client_id,
                level = %granted,
                "Greedy hold awarded"
            );
            self.greedy = Some(GreedyHold {
                client_id: owner.client_id.clone(),
                level: granted,
            });
            self.send_awarded(&owner, granted, true, effects);
        } else {
            self.grant(owner, level, effects);
        }
    }

    /// Re-evaluate the queue head(s): award every queue-prefix of mutually
    /// compatible, non-conflicting requests, stopping conflicting entries
    /// behind the first one that cannot be granted
    fn process_pending(&mut self, effects: &mut Vec<LockEffect>) {
        if self.recall_in_progress {
            return;
        }
        let mut skipped: Vec<(LockOwner, LockLevel)> = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            let owner = self.pending[i].owner.clone();
            let level = self.pending[i].level;
            let blocked = skipped
                .iter()
                .any(|(o, l)| *o != owner && !l.is_compatible(level));
            if !blocked && self.can_award(&owner, level) {
                let Some(entry) = self.pending.remove(i) else {
                    break;
                };
                if entry.kind == PendingKind::Try {
                    effects.push(LockEffect::CancelTry {
                        owner: entry.owner.clone(),
                    });
                }
                self.grant(entry.owner, entry.level, effects);
            } else {
                skipped.push((owner, level));
                i += 1;
            }
        }
    }

    /// Blocking acquisition: award immediately when compatible and not
    /// bypassing a conflicting queued request, otherwise enqueue
    pub(crate) fn lock(
        &mut self,
        owner: LockOwner,
        level: LockLevel,
        greedy_allowed: bool,
    ) -> Vec<LockEffect> {
        let mut effects = Vec::new();

        // Duplicate acquisition by the same owner at the same level is
        // idempotent; the award is re-sent so the reply is never lost
        if self
            .holds
            .iter()
            .any(|h| h.owner == owner && h.level == level)
        {
            debug!(lock_id = %self.id, owner = %owner, "Re-awarding already granted hold");
            self.send_awarded(&owner, level, false, &mut effects);
            return effects;
        }
        if let Some(greedy) = &self.greedy
            && greedy.client_id == owner.client_id
            && greedy.level.covers(level)
            && !self.recall_in_progress
        {
            debug!(lock_id = %self.id, owner = %owner, "Re-awarding under existing greedy grant");
            self.send_awarded(&owner, greedy.level, true, &mut effects);
            return effects;
        }
        if self.pending.iter().any(|p| p.owner == owner && p.level == level) {
            warn!(lock_id = %self.id, owner = %owner, "Duplicate pending request ignored");
            return effects;
        }

        if self.needs_recall(&owner, level) {
            self.start_recall(&mut effects);
        }
        if self.can_award(&owner, level) && !self.has_conflicting_pending(&owner, level) {
            self.award(owner, level, greedy_allowed, &mut effects);
        } else {
            debug!(lock_id = %self.id, owner = %owner, level = %level, "Request queued");
            self.pending.push_back(PendingEntry {
                owner,
                level,
                kind: PendingKind::Lock,
            });
        }
        effects
    }

    /// Bounded acquisition. Timeout 0 never queues: award now or refuse
    /// now.
    pub(crate) fn try_lock(
        &mut self,
        owner: LockOwner,
        level: LockLevel,
        timeout_ms: u64,
        greedy_allowed: bool,
    ) -> Vec<LockEffect> {
        let mut effects = Vec::new();

        let recall_needed = self.needs_recall(&owner, level);
        if !recall_needed
            && self.can_award(&owner, level)
            && !self.has_conflicting_pending(&owner, level)
        {
            self.award(owner, level, greedy_allowed, &mut effects);
            return effects;
        }
        if timeout_ms == 0 {
            debug!(lock_id = %self.id, owner = %owner, "Zero-timeout tryLock refused");
            effects.push(LockEffect::Send {
                client_id: owner.client_id.clone(),
                message: ServerLockMessage::Refused {
                    lock_id: self.id.clone(),
                    thread_id: owner.thread_id,
                },
            });
            return effects;
        }
        if recall_needed {
            self.start_recall(&mut effects);
        }
        debug!(lock_id = %self.id, owner = %owner, timeout_ms, "Bounded request queued");
        effects.push(LockEffect::ScheduleTry {
            owner: owner.clone(),
            delay_ms: timeout_ms,
        });
        self.pending.push_back(PendingEntry {
            owner,
            level,
            kind: PendingKind::Try,
        });
        effects
    }

    /// Release the owner's most recently granted hold (LIFO, mirroring the
    /// client-side monitor discipline) and re-evaluate the queue
    pub(crate) fn unlock(&mut self, owner: &LockOwner) -> Vec<LockEffect> {
        let mut effects = Vec::new();
        match self.holds.iter().rposition(|h| h.owner == *owner) {
            Some(idx) => {
                let hold = self.holds.remove(idx);
                debug!(lock_id = %self.id, owner = %owner, level = %hold.level, "Hold released");
                self.process_pending(&mut effects);
            }
            None => {
                // Stale release racing a timeout or disconnect purge
                warn!(lock_id = %self.id, owner = %owner, "Unlock for a hold that is not present");
            }
        }
        effects
    }

    /// Stash the owner's holds and park it as a waiter. `reported` carries
    /// the hold levels as seen by the client and is authoritative when the
    /// owner's client holds greedily (the server has no per-thread holds
    /// for it).
    pub(crate) fn wait(
        &mut self,
        owner: LockOwner,
        timeout_ms: Option<u64>,
        reported: Vec<LockLevel>,
    ) -> Result<Vec<LockEffect>, JicamaError> {
        if self.waiters.iter().any(|w| w.owner == owner) {
            warn!(lock_id = %self.id, owner = %owner, "Duplicate wait ignored");
            return Ok(Vec::new());
        }

        let mut stash = Vec::new();
        self.holds.retain(|h| {
            if h.owner == owner {
                stash.push(h.level);
                false
            } else {
                true
            }
        });
        if stash.is_empty() {
            let greedy_client = self
                .greedy
                .as_ref()
                .is_some_and(|g| g.client_id == owner.client_id);
            if greedy_client {
                stash = reported;
            }
        }
        if stash.is_empty() {
            return Err(JicamaError::IllegalMonitorState(format!(
                "wait on lock '{}' by non-holder {}",
                self.id, owner
            )));
        }

        let mut effects = Vec::new();
        if let Some(timeout) = timeout_ms {
            effects.push(LockEffect::ScheduleWait {
                owner: owner.clone(),
                delay_ms: timeout,
            });
        }
        debug!(lock_id = %self.id, owner = %owner, levels = stash.len(), "Thread parked in wait()");
        self.waiters.push(WaiterEntry {
            owner,
            reacquire: stash,
            timed: timeout_ms.is_some(),
        });
        self.process_pending(&mut effects);
        Ok(effects)
    }

    /// Move one or all waiters into the accumulator; the notifying owner
    /// must hold WRITE (directly or through a greedy WRITE grant)
    pub(crate) fn notify(
        &mut self,
        owner: &LockOwner,
        mode: NotifyMode,
        notified: &mut NotifiedWaiters,
    ) -> Result<Vec<LockEffect>, JicamaError> {
        let authorized = self
            .holds
            .iter()
            .any(|h| h.owner == *owner && h.level.is_write())
            || self
                .greedy
                .as_ref()
                .is_some_and(|g| g.client_id == owner.client_id && g.level.is_write());
        if !authorized {
            return Err(JicamaError::IllegalMonitorState(format!(
                "notify on lock '{}' by non-write-holder {}",
                self.id, owner
            )));
        }

        let take = match mode {
            NotifyMode::One => 1,
            NotifyMode::All => self.waiters.len(),
        };
        let mut effects = Vec::new();
        for waiter in self.waiters.drain(..take.min(self.waiters.len())) {
            if waiter.timed {
                effects.push(LockEffect::CancelWait {
                    owner: waiter.owner.clone(),
                });
            }
            effects.push(LockEffect::Send {
                client_id: waiter.owner.client_id.clone(),
                message: ServerLockMessage::Notified {
                    lock_id: self.id.clone(),
                    thread_id: waiter.owner.thread_id,
                },
            });
            notified.push(NotifiedWaiter {
                lock_id: self.id.clone(),
                owner: waiter.owner,
                reacquire: waiter.reacquire,
            });
        }
        debug!(lock_id = %self.id, owner = %owner, count = notified.len(), "Waiters notified");
        Ok(effects)
    }

    /// Re-queue a notified (or timed-out) waiter's stashed holds at the
    /// front of the queue and re-evaluate
    pub(crate) fn requeue_notified(
        &mut self,
        owner: LockOwner,
        reacquire: Vec<LockLevel>,
    ) -> Vec<LockEffect> {
        for level in reacquire.into_iter().rev() {
            self.pending.push_front(PendingEntry {
                owner: owner.clone(),
                level,
                kind: PendingKind::Lock,
            });
        }
        let mut effects = Vec::new();
        self.process_pending(&mut effects);
        effects
    }

    /// Wait deadline elapsed: reinsert the waiter's stash as reacquire
    /// requests. No NOTIFIED is sent, which is how the client knows the
    /// wait timed out rather than being notified.
    pub(crate) fn wait_timeout(&mut self, owner: &LockOwner) -> Vec<LockEffect> {
        match self.waiters.iter().position(|w| w.owner == *owner) {
            Some(idx) => {
                let waiter = self.waiters.remove(idx);
                debug!(lock_id = %self.id, owner = %owner, "Wait timed out, reacquiring holds");
                self.requeue_notified(waiter.owner, waiter.reacquire)
            }
            // Raced with a notify; the notify won
            None => Vec::new(),
        }
    }

    /// tryLock deadline elapsed: dequeue and refuse, unless the award won
    /// the race
    pub(crate) fn try_timeout(&mut self, owner: &LockOwner) -> Vec<LockEffect> {
        let mut effects = Vec::new();
        let idx = self
            .pending
            .iter()
            .position(|p| p.owner == *owner && p.kind == PendingKind::Try);
        if let Some(idx) = idx {
            self.pending.remove(idx);
            metrics::counter!("jicama_lock_refusals_total").increment(1);
            debug!(lock_id = %self.id, owner = %owner, "Bounded request timed out, refused");
            effects.push(LockEffect::Send {
                client_id: owner.client_id.clone(),
                message: ServerLockMessage::Refused {
                    lock_id: self.id.clone(),
                    thread_id: owner.thread_id,
                },
            });
            self.process_pending(&mut effects);
        }
        effects
    }

    /// Cooperative cancellation of a pending, bounded, or waiting node;
    /// idempotent, and never disturbs other owners' queue positions
    pub(crate) fn interrupt(&mut self, owner: &LockOwner) -> Vec<LockEffect> {
        let mut effects = Vec::new();
        if let Some(idx) = self.pending.iter().position(|p| p.owner == *owner) {
            let entry = self.pending.remove(idx);
            if let Some(entry) = entry
                && entry.kind == PendingKind::Try
            {
                effects.push(LockEffect::CancelTry {
                    owner: entry.owner.clone(),
                });
            }
            debug!(lock_id = %self.id, owner = %owner, "Pending request interrupted");
        } else if let Some(idx) = self.waiters.iter().position(|w| w.owner == *owner) {
            let waiter = self.waiters.remove(idx);
            if waiter.timed {
                effects.push(LockEffect::CancelWait {
                    owner: waiter.owner.clone(),
                });
            }
            debug!(lock_id = %self.id, owner = %owner, "Waiter interrupted");
        } else {
            debug!(lock_id = %self.id, owner = %owner, "Interrupt no-op, node already settled");
            return effects;
        }
        self.process_pending(&mut effects);
        effects
    }

    /// Replace the recalled client's synthetic greedy state with the exact
    /// per-thread contexts it reported, then re-evaluate the queue
    pub(crate) fn recall_commit(
        &mut self,
        client_id: &ClientId,
        contexts: Vec<LockContext>,
    ) -> Result<Vec<LockEffect>, JicamaError> {
        match &self.greedy {
            Some(greedy) if greedy.client_id == *client_id => {}
            _ => {
                return Err(JicamaError::IllegalMonitorState(format!(
                    "recall-commit for lock '{}' from client '{}' which is not the greedy holder",
                    self.id, client_id
                )));
            }
        }

        let mut effects = Vec::new();
        self.greedy = None;
        if self.recall_in_progress {
            self.recall_in_progress = false;
            effects.push(LockEffect::CancelRecall {
                client_id: client_id.clone(),
            });
        }
        // The report is authoritative for the client's holds. Queued
        // requests and waiters stay: one may have raced the recall window
        // (sent after the snapshot, arriving before the commit) and would
        // otherwise be lost; the context installs below deduplicate
        // against them.
        self.holds.retain(|h| h.owner.client_id != *client_id);

        debug!(
            lock_id = %self.id,
            client_id = %client_id,
            contexts = contexts.len(),
            "Recall committed, installing reported contexts"
        );
        for context in &contexts {
            self.install_context(context, &mut effects);
        }
        self.process_pending(&mut effects);
        Ok(effects)
    }

    /// Replay one reconnection context into this lock
    pub(crate) fn reestablish(&mut self, context: &LockContext) -> Vec<LockEffect> {
        let mut effects = Vec::new();
        self.install_context(context, &mut effects);
        effects
    }

    /// Install a reported context. Holder and greedy contexts are trusted
    /// (recovery path); pending contexts are re-submitted through the
    /// normal grant path; waiter contexts are re-installed, merging the
    /// per-level entries of one waiter back into a single node.
    fn install_context(&mut self, context: &LockContext, effects: &mut Vec<LockEffect>) {
        let owner = context.owner();
        match context.state {
            LockContextState::Holder => {
                // Holds are a set per (owner, level); replaying twice is a
                // no-op
                if !self
                    .holds
                    .iter()
                    .any(|h| h.owner == owner && h.level == context.level)
                {
                    self.holds.push(Hold {
                        owner,
                        level: context.level,
                    });
                }
            }
            LockContextState::GreedyHolder => {
                if let Some(greedy) = &self.greedy
                    && greedy.client_id != context.client_id
                {
                    warn!(
                        lock_id = %self.id,
                        incumbent = %greedy.client_id,
                        reported = %context.client_id,
                        "Greedy holder context conflicts with incumbent; keeping incumbent"
                    );
                    return;
                }
                self.greedy = Some(GreedyHold {
                    client_id: context.client_id.clone(),
                    level: context.level,
                });
            }
            LockContextState::Pending => {
                effects.extend(self.lock(owner, context.level, false));
            }
            LockContextState::TryPending => {
                effects.extend(self.try_lock(
                    owner,
                    context.level,
                    context.timeout_ms.unwrap_or(0),
                    false,
                ));
            }
            LockContextState::Waiter => {
                if let Some(waiter) = self.waiters.iter_mut().find(|w| w.owner == owner) {
                    // Second context of a multi-level waiter
                    if !waiter.reacquire.contains(&context.level) {
                        waiter.reacquire.push(context.level);
                    }
                } else {
                    if let Some(timeout) = context.timeout_ms {
                        effects.push(LockEffect::ScheduleWait {
                            owner: owner.clone(),
                            delay_ms: timeout,
                        });
                    }
                    self.waiters.push(WaiterEntry {
                        owner,
                        reacquire: vec![context.level],
                        timed: context.timeout_ms.is_some(),
                    });
                }
            }
        }
    }

    /// Remove every hold, pending request, and waiter owned by `client_id`
    fn purge_client(&mut self, client_id: &ClientId, effects: &mut Vec<LockEffect>) {
        self.holds.retain(|h| h.owner.client_id != *client_id);
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            if entry.owner.client_id == *client_id {
                if entry.kind == PendingKind::Try {
                    effects.push(LockEffect::CancelTry { owner: entry.owner });
                }
            } else {
                kept.push_back(entry);
            }
        }
        self.pending = kept;
        let mut kept_waiters = Vec::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if waiter.owner.client_id == *client_id {
                if waiter.timed {
                    effects.push(LockEffect::CancelWait { owner: waiter.owner });
                }
            } else {
                kept_waiters.push(waiter);
            }
        }
        self.waiters = kept_waiters;
    }

    /// Remove every contribution of a (disconnected) client and
    /// re-evaluate the queue
    pub(crate) fn clear_state_for_client(&mut self, client_id: &ClientId) -> Vec<LockEffect> {
        let mut effects = Vec::new();
        if self
            .greedy
            .as_ref()
            .is_some_and(|g| g.client_id == *client_id)
        {
            self.greedy = None;
            if self.recall_in_progress {
                self.recall_in_progress = false;
                effects.push(LockEffect::CancelRecall {
                    client_id: client_id.clone(),
                });
            }
        }
        self.purge_client(client_id, &mut effects);
        self.process_pending(&mut effects);
        effects
    }

    /// Aggregate state for administrative tooling; no mutation
    pub(crate) fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            lock_id: self.id.clone(),
            greedy_holder: self.greedy.as_ref().map(|g| g.client_id.clone()),
            recall_in_progress: self.recall_in_progress,
            holds: self
                .holds
                .iter()
                .map(|h| HoldSnapshot {
                    client_id: h.owner.client_id.clone(),
                    thread_id: h.owner.thread_id,
                    level: h.level,
                })
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|p| PendingSnapshot {
                    client_id: p.owner.client_id.clone(),
                    thread_id: p.owner.thread_id,
                    level: p.level,
                    bounded: p.kind == PendingKind::Try,
                })
                .collect(),
            waiters: self
                .waiters
                .iter()
                .map(|w| WaiterSnapshot {
                    client_id: w.owner.client_id.clone(),
                    thread_id: w.owner.thread_id,
                    reacquire: w.reacquire.clone(),
                })
                .collect(),
        }
    }
}
