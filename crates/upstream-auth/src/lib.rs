//! Token lifecycle management for upstream accounts
//!
//! Guarantees that an account's access token is valid (by more than a
//! safety margin) at the moment it is used, across four divergent refresh
//! wire protocols. This crate is a standalone library with no dependency
//! on the gateway binary.
//!
//! Refresh flow:
//! 1. The dispatcher calls `TokenManager::ensure_valid()` before each use
//! 2. Near-expiry tokens are refreshed under a per-account keyed lock
//! 3. New tokens are persisted through the `AccountStore` collaborator
//! 4. Background sweeps (`spawn_expiry_sweep`, `spawn_relay_sweep`) keep
//!    the pool fresh so request-time refresh stays the exception
//! 5. Relay-gateway refresh failures write an explicit expired marker so
//!    selection excludes the account until an admin re-authorizes it

pub mod endpoints;
pub mod error;
pub mod locks;
pub mod manager;
pub mod refresh;
pub mod sweep;

pub use endpoints::RefreshEndpoints;
pub use error::{Error, Result};
pub use locks::RefreshLockRegistry;
pub use manager::{TokenManager, TokenManagerConfig};
pub use refresh::{RelayGrant, TokenGrant};
pub use sweep::{spawn_expiry_sweep, spawn_relay_sweep};
