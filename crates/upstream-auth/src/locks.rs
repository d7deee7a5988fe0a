//! Per-account refresh locks
//!
//! At most one refresh runs for a given account at any instant, across
//! foreground `ensure_valid` calls, forced refreshes, and both background
//! sweeps. The registry hands out an RAII guard; dropping the guard — on
//! success, error, or unwind — releases the account.

use std::sync::Arc;

use dashmap::DashMap;

/// Process-wide set of account ids with a refresh in flight.
#[derive(Debug, Default, Clone)]
pub struct RefreshLockRegistry {
    in_flight: Arc<DashMap<u64, ()>>,
}

/// Held while a refresh runs; releases the account id on drop.
#[derive(Debug)]
pub struct RefreshGuard {
    in_flight: Arc<DashMap<u64, ()>>,
    account_id: u64,
}

impl RefreshLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the refresh critical section for `account_id`.
    ///
    /// Returns `None` when a refresh is already in flight — callers treat
    /// the concurrent refresh as sufficient and proceed with the token
    /// they have.
    pub fn try_begin(&self, account_id: u64) -> Option<RefreshGuard> {
        use dashmap::mapref::entry::Entry;
        match self.in_flight.entry(account_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(RefreshGuard {
                    in_flight: self.in_flight.clone(),
                    account_id,
                })
            }
        }
    }

    /// Whether a refresh is currently in flight for `account_id`.
    pub fn is_refreshing(&self, account_id: u64) -> bool {
        self.in_flight.contains_key(&account_id)
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.account_id);
    }
}
