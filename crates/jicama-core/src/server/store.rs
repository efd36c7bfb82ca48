//! Concurrent lock store
//!
//! Maps `LockId` to server lock state and hands out exclusive checkouts.
//! Distinct keys check out fully concurrently; one key is strictly
//! serialized. Map mutation (insert, remove-when-empty) is its own short
//! exclusive section: removal retires the instance under its own guard so
//! a concurrent checkout never resurrects a removed lock. A checkout that
//! observes `retired` retries against a fresh instance.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use jicama_api::LockId;

use super::lock::ServerLock;

#[derive(Default)]
pub(crate) struct LockStore {
    locks: DashMap<LockId, Arc<Mutex<ServerLock>>>,
}

impl LockStore {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Exclusive checkout, creating the lock if it does not exist
    pub(crate) async fn checkout(&self, id: &LockId) -> OwnedMutexGuard<ServerLock> {
        loop {
            let cell = self
                .locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ServerLock::new(id.clone()))))
                .value()
                .clone();
            let guard = cell.lock_owned().await;
            if !guard.retired {
                return guard;
            }
            // Lost the race against a removal; retry with a fresh entry
        }
    }

    /// Exclusive checkout of an existing lock only
    pub(crate) async fn checkout_existing(&self, id: &LockId) -> Option<OwnedMutexGuard<ServerLock>> {
        loop {
            let cell = self.locks.get(id)?.value().clone();
            let guard = cell.lock_owned().await;
            if !guard.retired {
                return Some(guard);
            }
        }
    }

    /// Return a checkout; an empty lock is retired and removed from the
    /// map under its own guard
    pub(crate) fn checkin(&self, mut guard: OwnedMutexGuard<ServerLock>) {
        if guard.is_empty() {
            guard.retired = true;
            let id = guard.id().clone();
            self.locks.remove(&id);
            debug!(lock_id = %id, "Empty lock removed from store");
        }
    }

    /// Keys currently present, for housekeeping sweeps
    pub(crate) fn lock_ids(&self) -> Vec<LockId> {
        self.locks.iter().map(|e| e.key().clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
