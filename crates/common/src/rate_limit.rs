//! Fixed-window rate limiting
//!
//! Counts events per key in discrete, non-overlapping windows. The first
//! `check` for a key opens a window; once the window elapses the counter
//! resets transparently on the next check. Denials report the seconds
//! remaining until the window resets so callers can emit `Retry-After`.
//!
//! Distinct concerns (login attempts, CAPTCHA issuance, per-key call rate)
//! each construct their own limiter instance; keys never interact.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Seconds until the window resets; zero when allowed.
    pub wait_secs: u64,
}

impl Decision {
    fn allow() -> Self {
        Self {
            allowed: true,
            wait_secs: 0,
        }
    }
}

#[derive(Debug)]
struct Window {
    count: i64,
    started: Instant,
}

/// Fixed-window counter keyed by caller identity
/// (e.g. `login:<ip>`, `captcha:<ip>`, `apikey:<id>`).
///
/// The mutex is held only for the map lookup and counter bump; there is no
/// await point inside the critical section, so a `std::sync::Mutex` is
/// sufficient even under concurrent request handling.
#[derive(Debug, Default)]
pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl FixedWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment-and-test `key` against `limit` events per `window`.
    ///
    /// A `limit` of zero or below disables enforcement for the key and
    /// records nothing.
    pub fn check(&self, key: &str, limit: i64, window: Duration) -> Decision {
        if limit <= 0 {
            return Decision::allow();
        }

        let now = Instant::now();
        let mut windows = self.windows.lock().expect("limiter mutex poisoned");

        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });

        // Window elapsed: reset transparently
        if now.duration_since(entry.started) >= window {
            entry.count = 0;
            entry.started = now;
        }

        if entry.count < limit {
            entry.count += 1;
            return Decision::allow();
        }

        let elapsed = now.duration_since(entry.started);
        let remaining = window.saturating_sub(elapsed);
        Decision {
            allowed: false,
            // Round up so callers never retry inside the same window
            wait_secs: remaining.as_secs().max(1),
        }
    }

    /// Drop all state for `key` (used after a successful login so
    /// legitimate retries are not penalized).
    pub fn reset(&self, key: &str) {
        self.windows
            .lock()
            .expect("limiter mutex poisoned")
            .remove(key);
    }
}
