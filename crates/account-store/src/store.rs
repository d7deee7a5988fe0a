//! Persistence contract for the scheduling core
//!
//! Every method is safe to call concurrently and reflects completed writes
//! to subsequent reads within the process. The token manager and the
//! selector only touch accounts through this trait — never by writing
//! fields on a copy they happen to hold.

use std::time::Duration;

use async_trait::async_trait;
use provider::Provider;

use crate::account::Account;
use crate::error::Result;

/// Persistence collaborator for the account registry.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch one account by id.
    async fn get(&self, id: u64) -> Result<Option<Account>>;

    /// All enabled accounts, optionally filtered by provider.
    async fn list_enabled(&self, provider: Option<Provider>) -> Result<Vec<Account>>;

    /// Persist a completed OAuth refresh: new access token, optionally a
    /// rotated refresh token (`None` keeps the stored one), and the new
    /// expiry. Stamps `last_refreshed_at` and clears any expired marker.
    async fn update_credential(
        &self,
        id: u64,
        access_token: String,
        refresh_token: Option<String>,
        token_expiry: Option<u64>,
    ) -> Result<()>;

    /// Persist a completed relay re-issue: new access token plus the
    /// organization/plan the relay reported. Stamps `last_refreshed_at`
    /// and clears any expired marker.
    async fn update_relay_credential(
        &self,
        id: u64,
        access_token: String,
        organization_id: Option<String>,
        plan_type: Option<String>,
    ) -> Result<()>;

    /// Record terminal credential loss so selection excludes the account
    /// until an administrator re-authorizes it.
    async fn mark_credential_expired(&self, id: u64, reason: &str) -> Result<()>;

    /// Enabled accounts of `provider` whose `last_refreshed_at` is older
    /// than `staleness` (or missing), regardless of token expiry.
    async fn list_needing_stale_refresh(
        &self,
        provider: Provider,
        staleness: Duration,
    ) -> Result<Vec<Account>>;

    /// Stamp `last_used_at` after a successful dispatch.
    async fn touch_last_used(&self, id: u64) -> Result<()>;
}
