//! Row lock table for the in-memory store.
//!
//! Emulates `SELECT ... FOR UPDATE` with a bounded wait: a key is held by at
//! most one unit of work, waiters block on a condvar until it is released or
//! their deadline passes.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use stockflow_core::{BusinessId, CorrectionId, TransferId};
use stockflow_inventory::Dimension;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum LockKey {
    Snapshot(BusinessId, Dimension),
    Transfer(BusinessId, TransferId),
    Correction(BusinessId, CorrectionId),
}

impl core::fmt::Display for LockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LockKey::Snapshot(_, dim) => write!(f, "snapshot {dim}"),
            LockKey::Transfer(_, id) => write!(f, "transfer {id}"),
            LockKey::Correction(_, id) => write!(f, "correction {id}"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl LockTable {
    /// Take `key`, waiting at most `timeout` for its current holder.
    pub(crate) fn acquire(&self, key: LockKey, timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().map_err(|_| StoreError::Poisoned)?;

        while held.contains(&key) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockTimeout(key.to_string()));
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| StoreError::Poisoned)?;
            held = guard;
        }

        held.insert(key);
        Ok(())
    }

    /// Release keys and wake waiters. Never fails, so drops always unlock.
    pub(crate) fn release(&self, keys: impl IntoIterator<Item = LockKey>) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            held.remove(&key);
        }
        drop(held);
        self.released.notify_all();
    }
}
