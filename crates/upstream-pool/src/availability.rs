//! Per-account availability marks
//!
//! Unavailable accounts are excluded from selection until explicitly
//! cleared — by an administrator or by the external health-probe service.
//! Marking keeps the first reason and timestamp so flapping failures
//! don't rewrite history; clearing is idempotent.

use account_store::now_millis;
use dashmap::DashMap;
use serde::Serialize;

/// Why and since when an account is out of rotation.
#[derive(Debug, Clone, Serialize)]
pub struct Unavailability {
    pub reason: String,
    /// Unix millis of the first mark
    pub since: u64,
}

/// Process-wide set of unavailable account ids.
#[derive(Debug, Default)]
pub struct AvailabilityTracker {
    unavailable: DashMap<u64, Unavailability>,
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `account_id` out of rotation. Idempotent: a second mark keeps
    /// the original reason and timestamp.
    pub fn mark_unavailable(&self, account_id: u64, reason: &str) {
        self.unavailable
            .entry(account_id)
            .or_insert_with(|| Unavailability {
                reason: reason.to_string(),
                since: now_millis(),
            });
    }

    /// Put `account_id` back in rotation. Idempotent.
    pub fn clear(&self, account_id: u64) {
        self.unavailable.remove(&account_id);
    }

    pub fn is_available(&self, account_id: u64) -> bool {
        !self.unavailable.contains_key(&account_id)
    }

    /// Reason for an account's unavailability, if marked.
    pub fn get(&self, account_id: u64) -> Option<Unavailability> {
        self.unavailable.get(&account_id).map(|e| e.value().clone())
    }

    /// Snapshot for health/admin output, ordered by account id.
    pub fn snapshot(&self) -> Vec<(u64, Unavailability)> {
        let mut entries: Vec<(u64, Unavailability)> = self
            .unavailable
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Number of accounts currently out of rotation.
    pub fn unavailable_count(&self) -> usize {
        self.unavailable.len()
    }
}
