//! Lock timer
//!
//! Schedules tryLock expirations, wait expirations, and recall deadlines.
//! A fired timer re-enters the manager, which checks out the affected lock
//! before mutating anything, so a timer racing a normal unlock on the same
//! lock is serialized like every other operation and lands as an
//! idempotent no-op when the node it targets is already gone.

use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::trace;

use jicama_api::{ClientId, LockId, LockOwner};

/// Identity of one armed deadline
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    TryLock { lock_id: LockId, owner: LockOwner },
    Wait { lock_id: LockId, owner: LockOwner },
    Recall { lock_id: LockId, client_id: ClientId },
}

pub(crate) struct LockTimer {
    tasks: DashMap<TimerKey, JoinHandle<()>>,
}

impl LockTimer {
    pub(crate) fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    /// Arm `key` to fire `on_fire` after `delay_ms`; re-arming an already
    /// armed key replaces the previous deadline
    pub(crate) fn schedule<F>(&self, key: TimerKey, delay_ms: u64, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        trace!(?key, delay_ms, "Arming lock timer");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            on_fire();
        });
        if let Some(previous) = self.tasks.insert(key, handle) {
            previous.abort();
        }
    }

    /// Disarm `key`; a no-op when the timer already fired or was never
    /// armed
    pub(crate) fn cancel(&self, key: &TimerKey) {
        if let Some((_, handle)) = self.tasks.remove(key) {
            trace!(?key, "Disarmed lock timer");
            handle.abort();
        }
    }

    /// Forget a fired timer's bookkeeping entry
    pub(crate) fn forget(&self, key: &TimerKey) {
        self.tasks.remove(key);
    }

    pub(crate) fn armed(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for LockTimer {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
    }
}
