//! Per-account concurrency slots
//!
//! Bounds parallel in-flight requests per account. Acquisition is
//! fail-fast — at capacity the selector tries a different account instead
//! of queueing, which pushes backpressure to selection where accounts are
//! interchangeable. The returned guard releases its slot on drop, so
//! error returns and cancelled requests can never leak capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

struct Slot {
    limit: u32,
    /// Absent when the account is unbounded (limit 0)
    semaphore: Option<Arc<Semaphore>>,
    active: Arc<AtomicU32>,
}

impl Slot {
    fn new(limit: u32, active: Arc<AtomicU32>) -> Self {
        Self {
            limit,
            semaphore: (limit > 0).then(|| Arc::new(Semaphore::new(limit as usize))),
            active,
        }
    }
}

/// Held for the duration of one upstream call; releases on drop.
#[derive(Debug)]
pub struct SlotGuard {
    account_id: u64,
    active: Arc<AtomicU32>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SlotGuard {
    pub fn account_id(&self) -> u64 {
        self.account_id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Capacity accounting for all pool accounts.
///
/// The configured ceiling arrives with each acquisition (it lives on the
/// account record); a changed ceiling rebuilds the semaphore, applying the
/// new bound to subsequent acquisitions while outstanding guards keep
/// their permits on the retired semaphore.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    slots: DashMap<u64, Slot>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot for `account_id` under the given ceiling.
    ///
    /// Returns `None` immediately when the ceiling is met — never blocks.
    /// A `limit` of 0 means unlimited: the guard only tracks the in-flight
    /// count.
    pub fn try_acquire(&self, account_id: u64, limit: u32) -> Option<SlotGuard> {
        let (semaphore, active) = {
            let mut slot = self
                .slots
                .entry(account_id)
                .or_insert_with(|| Slot::new(limit, Arc::new(AtomicU32::new(0))));
            if slot.limit != limit {
                debug!(account_id, old = slot.limit, new = limit, "concurrency ceiling changed");
                *slot = Slot::new(limit, slot.active.clone());
            }
            (slot.semaphore.clone(), slot.active.clone())
        };

        let permit = match semaphore {
            Some(semaphore) => match semaphore.try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => return None,
            },
            None => None,
        };

        active.fetch_add(1, Ordering::SeqCst);
        Some(SlotGuard {
            account_id,
            active,
            _permit: permit,
        })
    }

    /// Whether an acquisition under `limit` could currently succeed.
    /// Used by the affinity fast path to avoid proposing a saturated pin.
    pub fn has_capacity(&self, account_id: u64, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }
        match self.slots.get(&account_id) {
            Some(slot) if slot.limit == limit => slot
                .semaphore
                .as_ref()
                .is_none_or(|s| s.available_permits() > 0),
            // No slot yet, or the ceiling changed: acquisition will rebuild
            _ => true,
        }
    }

    /// Current in-flight count for an account.
    pub fn in_flight(&self, account_id: u64) -> u32 {
        self.slots
            .get(&account_id)
            .map(|slot| slot.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Administrative reset: replace the account's slot state under a new
    /// ceiling. Outstanding guards drain against the retired semaphore.
    pub fn set_limit(&self, account_id: u64, limit: u32) {
        let active = self
            .slots
            .get(&account_id)
            .map(|slot| slot.active.clone())
            .unwrap_or_else(|| Arc::new(AtomicU32::new(0)));
        self.slots.insert(account_id, Slot::new(limit, active));
    }
}
