//! Background refresh sweeps
//!
//! Two periodic tasks keep the pool fresh so request-time refresh stays
//! the exception:
//!
//! - the expiry sweep scans all enabled accounts and refreshes any token
//!   inside the refresh threshold (default every minute);
//! - the relay sweep re-issues gateway-relay credentials that have not
//!   been refreshed within the staleness window (default hourly, checked
//!   once immediately at startup), because relay tokens carry no expiry
//!   the manager can trust.
//!
//! Per-account refreshes are fire-and-forget: a failure is logged and the
//! existing token stays in place until the next cycle or a forced retry.
//! Both sweeps stop cleanly when the cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use account_store::AccountStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::manager::TokenManager;

/// Spawn the expiry sweep: every `interval`, refresh all enabled accounts
/// whose token expires within the manager's refresh threshold.
pub fn spawn_expiry_sweep(
    manager: Arc<TokenManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick — accounts were just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("expiry sweep stopped");
                    break;
                }
                _ = ticker.tick() => expiry_cycle(&manager).await,
            }
        }
    })
}

/// Spawn the relay staleness sweep: immediately and then every `interval`,
/// re-issue gateway-relay credentials older than `staleness`.
pub fn spawn_relay_sweep(
    manager: Arc<TokenManager>,
    interval: Duration,
    staleness: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        relay_cycle(&manager, staleness).await;

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("relay sweep stopped");
                    break;
                }
                _ = ticker.tick() => relay_cycle(&manager, staleness).await,
            }
        }
    })
}

/// One expiry cycle: launch a non-blocking refresh per expiring account.
/// The per-account lock already deduplicates against foreground refreshes.
async fn expiry_cycle(manager: &Arc<TokenManager>) {
    let accounts = match manager.store().list_enabled(None).await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = %e, "expiry sweep could not list accounts");
            return;
        }
    };

    let threshold = manager.refresh_threshold();
    for account in accounts {
        if account.token_expiry.is_none() || !account.needs_refresh(threshold) {
            continue;
        }

        debug!(account_id = account.id, "token expiring within threshold, refreshing");
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut account = account;
            let id = account.id;
            if let Err(e) = manager.ensure_valid(&mut account).await {
                warn!(account_id = id, error = %e, "background refresh failed, will retry next cycle");
            }
        });
    }
}

/// One relay cycle: re-issue every stale relay credential. Accounts with a
/// refresh already in flight are skipped, not queued.
async fn relay_cycle(manager: &Arc<TokenManager>, staleness: Duration) {
    let accounts = match manager
        .store()
        .list_needing_stale_refresh(provider::Provider::GatewayRelay, staleness)
        .await
    {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = %e, "relay sweep could not list stale accounts");
            return;
        }
    };

    if accounts.is_empty() {
        return;
    }
    debug!(count = accounts.len(), "re-issuing stale relay credentials");

    for account in accounts {
        if manager.is_refreshing(account.id) {
            continue;
        }

        let manager = manager.clone();
        tokio::spawn(async move {
            match manager.force_refresh(account.id).await {
                Ok(_) => {}
                Err(Error::RefreshInFlight(_)) => {
                    debug!(account_id = account.id, "relay refresh already in flight");
                }
                Err(e) => {
                    warn!(account_id = account.id, error = %e, "relay re-issue failed");
                }
            }
        });
    }
}
