//! Dispatch state machine
//!
//! Per call: select → ensure credential → dispatch → classify outcome →
//! retry or terminate. The classification rules:
//!
//! - 401: force a token refresh and retry the same account exactly once
//! - 403: mark the account unavailable immediately (credentials rejected)
//! - other 4xx/5xx and transport errors: count consecutive failures and
//!   mark unavailable only at the configured threshold, then re-enter
//!   selection with the failed account excluded
//! - success: reset the failure count, pin session affinity, stamp last use
//!
//! The re-selection budget bounds how many different accounts one call may
//! burn. When accounts were tried and all failed, the last upstream error
//! surfaces; when the pool had nothing to offer at all, the caller sees
//! the no-eligible-account error instead.

use std::collections::HashSet;
use std::sync::Arc;

use account_store::AccountStore;
use dashmap::DashMap;
use provider::{ErrorClassification, classify_status};
use tracing::{debug, info, warn};
use upstream_auth::TokenManager;

use crate::affinity::SessionAffinity;
use crate::availability::AvailabilityTracker;
use crate::error::{Error, Result};
use crate::selector::{AccountSelector, Lease, SelectionRequest};
use crate::transport::{ProxyRequest, ProxyResponse, Transport};

/// Dispatch policy knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How many times one call may re-enter selection after a failure
    pub max_reselects: u32,
    /// Consecutive failures before an account is marked unavailable
    pub unavailable_after_failures: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_reselects: 1,
            unavailable_after_failures: 2,
        }
    }
}

/// Orchestrates one proxied call across selection, credential lifecycle,
/// and the upstream transport.
pub struct Dispatcher {
    selector: AccountSelector,
    tokens: Arc<TokenManager>,
    store: Arc<dyn AccountStore>,
    availability: Arc<AvailabilityTracker>,
    affinity: Arc<SessionAffinity>,
    /// Consecutive upstream failures per account; reset on success
    failures: DashMap<u64, u32>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        selector: AccountSelector,
        tokens: Arc<TokenManager>,
        store: Arc<dyn AccountStore>,
        availability: Arc<AvailabilityTracker>,
        affinity: Arc<SessionAffinity>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            selector,
            tokens,
            store,
            availability,
            affinity,
            failures: DashMap::new(),
            config,
        }
    }

    /// Run one proxied call to completion, retrying within the budget.
    pub async fn dispatch(
        &self,
        request: &SelectionRequest<'_>,
        payload: &ProxyRequest,
        transport: &dyn Transport,
    ) -> Result<ProxyResponse> {
        let mut excluded: HashSet<u64> = HashSet::new();
        let mut reselects_left = self.config.max_reselects;
        let mut last_failure: Option<Error> = None;

        loop {
            let mut lease = match self.selector.select(request, &excluded).await {
                Ok(lease) => lease,
                // Accounts were tried and failed: surface the upstream
                // error, not the now-empty candidate set
                Err(select_err) => return Err(last_failure.unwrap_or(select_err)),
            };
            let account_id = lease.account.id;

            if let Err(e) = self.tokens.ensure_valid(&mut lease.account).await {
                warn!(account_id, error = %e, "credential validation failed");
                drop(lease);
                self.availability
                    .mark_unavailable(account_id, &format!("credential refresh failed: {e}"));
                excluded.insert(account_id);
                if reselects_left == 0 {
                    return Err(e.into());
                }
                reselects_left -= 1;
                continue;
            }

            match self.call_with_auth_retry(&mut lease, payload, transport).await {
                Ok(response) if response.is_success() => {
                    self.note_success(&lease, request).await;
                    return Ok(response);
                }
                Ok(response) => {
                    let body = response.body_text();
                    let classification = classify_status(response.status, &body);
                    self.note_failure(
                        account_id,
                        classification,
                        &format!("status {}", response.status),
                    );
                    excluded.insert(account_id);
                    drop(lease);

                    let failure = Error::UpstreamFailed {
                        status: response.status,
                        body,
                    };
                    if reselects_left == 0 {
                        return Err(failure);
                    }
                    last_failure = Some(failure);
                    reselects_left -= 1;
                }
                Err(e) => {
                    let classification = match &e {
                        Error::Auth(upstream_auth::Error::InvalidCredentials(_)) => {
                            ErrorClassification::Permanent
                        }
                        _ => ErrorClassification::Transient,
                    };
                    self.note_failure(account_id, classification, &e.to_string());
                    excluded.insert(account_id);
                    drop(lease);

                    if reselects_left == 0 {
                        return Err(e);
                    }
                    last_failure = Some(e);
                    reselects_left -= 1;
                }
            }
        }
    }

    /// Issue the upstream call; on 401, force exactly one refresh and
    /// retry the same account exactly once.
    async fn call_with_auth_retry(
        &self,
        lease: &mut Lease,
        payload: &ProxyRequest,
        transport: &dyn Transport,
    ) -> Result<ProxyResponse> {
        let response = transport.execute(&lease.account, payload).await?;
        if response.status != 401 {
            return Ok(response);
        }

        info!(
            account_id = lease.account.id,
            "upstream 401, forcing token refresh and retrying once"
        );
        match self.tokens.force_refresh(lease.account.id).await {
            Ok(updated) => lease.account = updated,
            Err(upstream_auth::Error::RefreshInFlight(_)) => {
                // A concurrent refresh is underway; pick up its result
                if let Some(updated) = self.store.get(lease.account.id).await? {
                    lease.account = updated;
                }
            }
            Err(e) => return Err(e.into()),
        }
        transport.execute(&lease.account, payload).await
    }

    /// Success bookkeeping: failure count resets, session pins, last use
    /// is stamped for LRU rotation.
    async fn note_success(&self, lease: &Lease, request: &SelectionRequest<'_>) {
        self.failures.remove(&lease.account.id);
        if let Some(session_key) = request.session_key {
            self.affinity.pin(session_key, lease.account.id);
        }
        if let Err(e) = self.store.touch_last_used(lease.account.id).await {
            warn!(account_id = lease.account.id, error = %e, "failed to stamp last use");
        }
    }

    /// Count a failure and decide whether the account leaves rotation.
    /// 403-class rejections mark immediately; everything else waits for
    /// the consecutive-failure threshold to avoid flapping on transient
    /// upstream trouble.
    fn note_failure(&self, account_id: u64, classification: ErrorClassification, detail: &str) {
        let failures = {
            let mut entry = self.failures.entry(account_id).or_insert(0);
            *entry += 1;
            *entry
        };

        let mark = matches!(classification, ErrorClassification::Permanent)
            || failures >= self.config.unavailable_after_failures;
        if !mark {
            debug!(account_id, failures, detail, "upstream failure noted");
            return;
        }

        let reason = match classification {
            ErrorClassification::Permanent => format!("credentials rejected by upstream ({detail})"),
            ErrorClassification::QuotaExceeded => {
                format!("quota exhausted ({failures} consecutive failures, last: {detail})")
            }
            _ => format!("upstream failures ({failures} consecutive, last: {detail})"),
        };
        warn!(account_id, reason, "marking account unavailable");
        self.availability.mark_unavailable(account_id, &reason);
        self.failures.remove(&account_id);
    }

    /// Consecutive failure count for an account (health/admin output).
    pub fn failure_count(&self, account_id: u64) -> u32 {
        self.failures.get(&account_id).map(|e| *e).unwrap_or(0)
    }
}
