//! Upstream account pool: availability, capacity, and dispatch
//!
//! The pool decides which account serves each proxied call and bounds how
//! many calls may use an account at once. Selection honors session
//! affinity (multi-turn conversations stay pinned to one account),
//! availability marks, per-account concurrency ceilings, and
//! least-recently-used rotation. The dispatcher wraps selection in the
//! retry state machine: ensure credential → call upstream → classify →
//! forced-refresh retry on 401 → re-select on other failures, within a
//! bounded retry budget.
//!
//! Account lifecycle at dispatch time:
//! 1. Selector picks an eligible account and acquires its concurrency slot
//! 2. Token manager guarantees a valid access token
//! 3. Transport adapter issues the upstream call
//! 4. Success pins session affinity and stamps last-use; failures count
//!    toward flipping the account unavailable
//! 5. The slot guard releases on every exit path, including cancellation

pub mod affinity;
pub mod availability;
pub mod concurrency;
pub mod dispatch;
pub mod error;
pub mod selector;
pub mod transport;

pub use affinity::SessionAffinity;
pub use availability::{AvailabilityTracker, Unavailability};
pub use concurrency::{ConcurrencyLimiter, SlotGuard};
pub use dispatch::{DispatchConfig, Dispatcher};
pub use error::{Error, Result};
pub use selector::{AccountSelector, Lease, SelectionRequest};
pub use transport::{ProxyRequest, ProxyResponse, Transport};
