//! Session affinity cache
//!
//! Multi-turn conversations stay pinned to the account that served them:
//! the dispatcher pins on success and resolves on the next call with the
//! same session key. Entries idle longer than the TTL are treated as
//! absent on lookup and removed opportunistically — there is no sweeper.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

struct AffinityEntry {
    account_id: u64,
    last_touched: Instant,
}

/// Session-key → account-id stickiness with idle-TTL eviction.
pub struct SessionAffinity {
    entries: DashMap<String, AffinityEntry>,
    ttl: Duration,
}

impl SessionAffinity {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Look up the pinned account for `session_key`, refreshing the idle
    /// timer on a hit. An entry past the TTL counts as absent.
    pub fn resolve(&self, session_key: &str) -> Option<u64> {
        let expired = {
            let mut entry = self.entries.get_mut(session_key)?;
            if entry.last_touched.elapsed() >= self.ttl {
                true
            } else {
                entry.last_touched = Instant::now();
                return Some(entry.account_id);
            }
        };
        if expired {
            self.entries.remove(session_key);
        }
        None
    }

    /// Pin (or re-pin) a session to an account.
    pub fn pin(&self, session_key: &str, account_id: u64) {
        debug!(session_key, account_id, "session pinned");
        self.entries.insert(
            session_key.to_string(),
            AffinityEntry {
                account_id,
                last_touched: Instant::now(),
            },
        );
    }

    /// Remove one session's pin.
    pub fn evict(&self, session_key: &str) {
        self.entries.remove(session_key);
    }

    /// Drop every pin pointing at `account_id` (account leaving rotation).
    pub fn evict_account(&self, account_id: u64) {
        self.entries.retain(|_, entry| entry.account_id != account_id);
    }

    /// Live entries for the admin listing: (session key, account id,
    /// seconds idle). Expired entries are pruned on the way.
    pub fn entries(&self) -> Vec<(String, u64, u64)> {
        self.entries
            .retain(|_, entry| entry.last_touched.elapsed() < self.ttl);
        let mut listing: Vec<(String, u64, u64)> = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().account_id,
                    e.value().last_touched.elapsed().as_secs(),
                )
            })
            .collect();
        listing.sort_by(|a, b| a.0.cmp(&b.0));
        listing
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
