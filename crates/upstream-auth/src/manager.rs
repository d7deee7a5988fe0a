//! Token manager
//!
//! Owns the refresh decision and the per-account critical section. All
//! credential mutation flows through here: the dispatcher's request-time
//! `ensure_valid`, administrative `force_refresh`, and the background
//! sweeps all funnel into one locked refresh path that persists through
//! the account store.

use std::sync::Arc;
use std::time::Duration;

use account_store::{Account, AccountStore, now_millis};
use provider::Provider;
use tracing::{debug, info, warn};

use crate::endpoints::RefreshEndpoints;
use crate::error::{Error, Result};
use crate::locks::RefreshLockRegistry;
use crate::refresh;
use crate::refresh::TokenGrant;

/// Tunables for the token manager.
#[derive(Debug, Clone)]
pub struct TokenManagerConfig {
    /// Refresh when time-until-expiry drops below this margin
    pub refresh_threshold: Duration,
    /// Timeout for token endpoint calls so a stalled endpoint cannot
    /// starve the pool
    pub http_timeout: Duration,
    pub endpoints: RefreshEndpoints,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            refresh_threshold: Duration::from_secs(5 * 60),
            http_timeout: Duration::from_secs(30),
            endpoints: RefreshEndpoints::default(),
        }
    }
}

/// Credential lifecycle service for the account pool.
///
/// Constructed once at startup and shared via `Arc`; the lock registry is
/// process-wide state guaranteeing at most one in-flight refresh per
/// account.
pub struct TokenManager {
    store: Arc<dyn AccountStore>,
    http: reqwest::Client,
    config: TokenManagerConfig,
    locks: RefreshLockRegistry,
}

impl TokenManager {
    pub fn new(store: Arc<dyn AccountStore>, config: TokenManagerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .expect("building refresh HTTP client");
        Self {
            store,
            http,
            config,
            locks: RefreshLockRegistry::new(),
        }
    }

    /// The account store this manager persists through.
    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn refresh_threshold(&self) -> Duration {
        self.config.refresh_threshold
    }

    /// Guarantee `account` carries a usable access token.
    ///
    /// No-op when the account has no expiry or the token is still outside
    /// the refresh threshold. When another caller already holds the
    /// account's refresh lock, returns immediately and the caller proceeds
    /// with the token it has — the in-flight refresh is treated as
    /// sufficient. Otherwise refreshes synchronously, persisting the new
    /// credential and updating `account` in place.
    pub async fn ensure_valid(&self, account: &mut Account) -> Result<()> {
        if account.token_expiry.is_none() {
            return Ok(());
        }
        if !account.needs_refresh(self.config.refresh_threshold) {
            return Ok(());
        }

        let Some(_guard) = self.locks.try_begin(account.id) else {
            debug!(
                account_id = account.id,
                "refresh already in flight, using current token"
            );
            return Ok(());
        };
        self.refresh_locked(account).await
    }

    /// Refresh regardless of expiry (administrative "refresh now" and the
    /// dispatcher's 401 path). Returns the updated account record.
    ///
    /// Fails with `RefreshInFlight` when another refresh holds the lock;
    /// callers re-read the account instead of stacking refreshes.
    pub async fn force_refresh(&self, account_id: u64) -> Result<Account> {
        let mut account = self
            .store
            .get(account_id)
            .await?
            .ok_or(Error::NotFound(account_id))?;

        let Some(_guard) = self.locks.try_begin(account_id) else {
            return Err(Error::RefreshInFlight(account_id));
        };
        self.refresh_locked(&mut account).await?;
        Ok(account)
    }

    /// Dispatch to the provider's wire protocol. Caller holds the lock.
    async fn refresh_locked(&self, account: &mut Account) -> Result<()> {
        match account.provider {
            Provider::ClaudeOfficial => {
                let grant = refresh::refresh_claude(
                    &self.http,
                    &self.config.endpoints.claude,
                    &account.refresh_token,
                )
                .await?;
                self.apply_grant(account, grant).await
            }
            Provider::OpenAiOauth | Provider::OpenAiResponses => {
                let grant = refresh::refresh_openai(
                    &self.http,
                    &self.config.endpoints.openai,
                    &account.refresh_token,
                )
                .await?;
                self.apply_grant(account, grant).await
            }
            Provider::Gemini => {
                let grant = refresh::refresh_gemini(
                    &self.http,
                    &self.config.endpoints.google,
                    &account.refresh_token,
                    account.client_id.as_deref(),
                    account.client_secret.as_deref(),
                )
                .await?;
                self.apply_grant(account, grant).await
            }
            Provider::GatewayRelay => self.refresh_relay_locked(account).await,
        }
    }

    /// Persist an OAuth grant and mirror it onto the in-memory record.
    async fn apply_grant(&self, account: &mut Account, grant: TokenGrant) -> Result<()> {
        let expiry = now_millis() + grant.expires_in * 1000;
        self.store
            .update_credential(
                account.id,
                grant.access_token.clone(),
                grant.refresh_token.clone(),
                Some(expiry),
            )
            .await?;

        account.access_token = grant.access_token;
        if let Some(rotated) = grant.refresh_token {
            account.refresh_token = rotated;
        }
        account.token_expiry = Some(expiry);
        account.last_refreshed_at = Some(now_millis());
        account.credential_expired = false;
        account.expired_reason = None;

        info!(
            account_id = account.id,
            provider = %account.provider,
            "token refresh succeeded"
        );
        Ok(())
    }

    /// Relay re-issue. Unlike the OAuth paths, a failed exchange writes an
    /// explicit expired marker so selection stops using the account —
    /// relay tokens report no expiry, so a silent failure would otherwise
    /// keep a dead credential in rotation.
    async fn refresh_relay_locked(&self, account: &mut Account) -> Result<()> {
        let gateway_url = account
            .gateway_url
            .clone()
            .ok_or(Error::MissingGatewayUrl)?;

        match refresh::refresh_relay(&self.http, &gateway_url, &account.refresh_token).await {
            Ok(grant) => {
                self.store
                    .update_relay_credential(
                        account.id,
                        grant.access_token.clone(),
                        grant.organization_id.clone(),
                        grant.plan_type.clone(),
                    )
                    .await?;

                account.access_token = grant.access_token;
                account.organization_id = grant.organization_id;
                account.plan_type = grant.plan_type.clone();
                account.last_refreshed_at = Some(now_millis());
                account.credential_expired = false;
                account.expired_reason = None;

                info!(
                    account_id = account.id,
                    plan_type = grant.plan_type.as_deref().unwrap_or("unknown"),
                    "relay credential re-issued"
                );
                Ok(())
            }
            Err(Error::MissingRefreshToken) => Err(Error::MissingRefreshToken),
            Err(e) => {
                let reason = format!("relay refresh failed: {e}");
                warn!(account_id = account.id, error = %e, "relay refresh failed, marking credential expired");
                if let Err(mark_err) = self
                    .store
                    .mark_credential_expired(account.id, &reason)
                    .await
                {
                    warn!(account_id = account.id, error = %mark_err, "failed to persist expired marker");
                }
                account.credential_expired = true;
                account.expired_reason = Some(reason);
                Err(e)
            }
        }
    }

    /// Whether a refresh is in flight for the account (used by the relay
    /// sweep to skip accounts instead of erroring on the lock).
    pub fn is_refreshing(&self, account_id: u64) -> bool {
        self.locks.is_refreshing(account_id)
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &RefreshLockRegistry {
        &self.locks
    }
}
