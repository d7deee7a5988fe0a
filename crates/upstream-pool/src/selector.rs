//! Account selection
//!
//! Picks one usable account for a proxied call. The affinity fast path
//! keeps conversations on their previous account when it is still
//! enabled, available, and has spare capacity; otherwise candidates are
//! scanned least-recently-used first (ties by id, so the order is
//! deterministic for a given store state). A candidate that fails slot
//! acquisition is skipped rather than waited on; exhausting all
//! candidates yields a structured no-eligible-account error carrying the
//! pool counts.

use std::collections::HashSet;
use std::sync::Arc;

use account_store::{Account, AccountStore};
use provider::Provider;
use tracing::debug;

use crate::affinity::SessionAffinity;
use crate::availability::AvailabilityTracker;
use crate::concurrency::{ConcurrencyLimiter, SlotGuard};
use crate::error::{Error, Result};

/// What the caller needs served: the provider, and optionally a session
/// key for stickiness and a model the account must be permitted to serve.
#[derive(Debug, Clone)]
pub struct SelectionRequest<'a> {
    pub provider: Provider,
    pub session_key: Option<&'a str>,
    pub model: Option<&'a str>,
}

/// A selected account holding its concurrency slot. Dropping the lease
/// releases the slot.
#[derive(Debug)]
pub struct Lease {
    pub account: Account,
    pub slot: SlotGuard,
}

/// Request-time account selection over the shared pool state.
pub struct AccountSelector {
    store: Arc<dyn AccountStore>,
    availability: Arc<AvailabilityTracker>,
    concurrency: Arc<ConcurrencyLimiter>,
    affinity: Arc<SessionAffinity>,
}

impl AccountSelector {
    pub fn new(
        store: Arc<dyn AccountStore>,
        availability: Arc<AvailabilityTracker>,
        concurrency: Arc<ConcurrencyLimiter>,
        affinity: Arc<SessionAffinity>,
    ) -> Self {
        Self {
            store,
            availability,
            concurrency,
            affinity,
        }
    }

    /// Select an account for `request`, skipping ids in `exclude`
    /// (accounts already tried by the current dispatch).
    pub async fn select(
        &self,
        request: &SelectionRequest<'_>,
        exclude: &HashSet<u64>,
    ) -> Result<Lease> {
        // Affinity fast path: reuse the pinned account when it is still fit
        if let Some(session_key) = request.session_key {
            if let Some(pinned) = self.affinity.resolve(session_key) {
                if !exclude.contains(&pinned) {
                    if let Some(lease) = self.try_pinned(pinned, request).await? {
                        debug!(
                            session_key,
                            account_id = pinned,
                            "affinity hit, reusing pinned account"
                        );
                        return Ok(lease);
                    }
                }
                // The pin no longer fits; drop it so success re-pins
                self.affinity.evict(session_key);
            }
        }

        let enabled = self.store.list_enabled(Some(request.provider)).await?;
        let total = enabled.len();

        let mut candidates: Vec<Account> = enabled
            .into_iter()
            .filter(|a| a.selectable())
            .filter(|a| !exclude.contains(&a.id))
            .filter(|a| a.allows_model(request.model))
            .filter(|a| self.availability.is_available(a.id))
            .collect();
        let eligible = candidates.len();

        // Least-recently-used first; never-used accounts sort before all
        candidates.sort_by_key(|a| (a.last_used_at.unwrap_or(0), a.id));

        for account in candidates {
            match self.concurrency.try_acquire(account.id, account.max_concurrency) {
                Some(slot) => {
                    debug!(account_id = account.id, provider = %request.provider, "account selected");
                    return Ok(Lease { account, slot });
                }
                None => {
                    debug!(account_id = account.id, "at concurrency ceiling, skipping");
                }
            }
        }

        Err(Error::NoEligibleAccount(
            serde_json::json!({
                "provider": request.provider.label(),
                "accounts_total": total,
                "accounts_eligible": eligible,
                "accounts_excluded": exclude.len(),
                "accounts_unavailable": self.availability.unavailable_count(),
            })
            .to_string(),
        ))
    }

    /// Check a pinned account against the same gates as the scan and
    /// acquire its slot. `None` means the pin no longer fits.
    async fn try_pinned(
        &self,
        account_id: u64,
        request: &SelectionRequest<'_>,
    ) -> Result<Option<Lease>> {
        let Some(account) = self.store.get(account_id).await? else {
            return Ok(None);
        };
        if !account.selectable()
            || account.provider != request.provider
            || !account.allows_model(request.model)
            || !self.availability.is_available(account_id)
        {
            return Ok(None);
        }
        Ok(self
            .concurrency
            .try_acquire(account_id, account.max_concurrency)
            .map(|slot| Lease { account, slot }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_store::JsonFileStore;
    use std::time::Duration;

    fn test_account(id: u64, provider: Provider) -> Account {
        Account {
            id,
            name: format!("acct-{id}"),
            provider,
            enabled: true,
            access_token: format!("at_{id}"),
            refresh_token: format!("rt_{id}"),
            token_expiry: None,
            client_id: None,
            client_secret: None,
            organization_id: None,
            project_id: None,
            gateway_url: None,
            plan_type: None,
            models: vec![],
            max_concurrency: 0,
            credential_expired: false,
            expired_reason: None,
            last_refreshed_at: None,
            last_used_at: None,
        }
    }

    struct Fixture {
        store: Arc<JsonFileStore>,
        availability: Arc<AvailabilityTracker>,
        concurrency: Arc<ConcurrencyLimiter>,
        affinity: Arc<SessionAffinity>,
        selector: AccountSelector,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonFileStore::load(dir.path().join("accounts.json"))
                .await
                .unwrap(),
        );
        let availability = Arc::new(AvailabilityTracker::new());
        let concurrency = Arc::new(ConcurrencyLimiter::new());
        let affinity = Arc::new(SessionAffinity::new(Duration::from_secs(60)));
        let selector = AccountSelector::new(
            store.clone(),
            availability.clone(),
            concurrency.clone(),
            affinity.clone(),
        );
        Fixture {
            store,
            availability,
            concurrency,
            affinity,
            selector,
            _dir: dir,
        }
    }

    fn request(provider: Provider) -> SelectionRequest<'static> {
        SelectionRequest {
            provider,
            session_key: None,
            model: None,
        }
    }

    #[tokio::test]
    async fn selects_least_recently_used_first() {
        let f = fixture().await;
        let mut a = test_account(1, Provider::ClaudeOfficial);
        a.last_used_at = Some(2_000);
        let mut b = test_account(2, Provider::ClaudeOfficial);
        b.last_used_at = Some(1_000);
        f.store.add(a).await.unwrap();
        f.store.add(b).await.unwrap();

        let lease = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(lease.account.id, 2, "older last-use wins");
    }

    #[tokio::test]
    async fn never_used_sorts_before_used_and_ties_break_by_id() {
        let f = fixture().await;
        let mut used = test_account(1, Provider::Gemini);
        used.last_used_at = Some(5_000);
        f.store.add(used).await.unwrap();
        f.store.add(test_account(3, Provider::Gemini)).await.unwrap();
        f.store.add(test_account(2, Provider::Gemini)).await.unwrap();

        let lease = f
            .selector
            .select(&request(Provider::Gemini), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(lease.account.id, 2, "never-used accounts first, lowest id");
    }

    #[tokio::test]
    async fn wrong_provider_is_never_selected() {
        let f = fixture().await;
        f.store
            .add(test_account(1, Provider::Gemini))
            .await
            .unwrap();

        let err = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEligibleAccount(_)));
    }

    #[tokio::test]
    async fn unavailable_accounts_are_excluded() {
        let f = fixture().await;
        f.store
            .add(test_account(1, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.store
            .add(test_account(2, Provider::ClaudeOfficial))
            .await
            .unwrap();

        f.availability.mark_unavailable(1, "probe failed");
        let lease = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(lease.account.id, 2);
    }

    #[tokio::test]
    async fn all_unavailable_is_no_eligible_account() {
        let f = fixture().await;
        f.store
            .add(test_account(1, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.availability.mark_unavailable(1, "down");

        let err = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap_err();
        let Error::NoEligibleAccount(message) = err else {
            panic!("expected NoEligibleAccount, got {err}");
        };
        let counts: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(counts["accounts_total"], 1);
        assert_eq!(counts["accounts_unavailable"], 1);
        assert_eq!(counts["accounts_eligible"], 0);
    }

    #[tokio::test]
    async fn expired_credential_is_excluded() {
        let f = fixture().await;
        let mut expired = test_account(1, Provider::GatewayRelay);
        expired.credential_expired = true;
        f.store.add(expired).await.unwrap();

        let err = f
            .selector
            .select(&request(Provider::GatewayRelay), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEligibleAccount(_)));
    }

    #[tokio::test]
    async fn model_constraint_filters_candidates() {
        let f = fixture().await;
        let mut restricted = test_account(1, Provider::ClaudeOfficial);
        restricted.models = vec!["claude-sonnet-4".into()];
        f.store.add(restricted).await.unwrap();
        f.store
            .add(test_account(2, Provider::ClaudeOfficial))
            .await
            .unwrap();

        let lease = f
            .selector
            .select(
                &SelectionRequest {
                    provider: Provider::ClaudeOfficial,
                    session_key: None,
                    model: Some("claude-opus-4"),
                },
                &HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(lease.account.id, 2, "account 1 may not serve this model");
    }

    #[tokio::test]
    async fn excluded_ids_are_skipped() {
        let f = fixture().await;
        f.store
            .add(test_account(1, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.store
            .add(test_account(2, Provider::ClaudeOfficial))
            .await
            .unwrap();

        let exclude: HashSet<u64> = [1].into();
        let lease = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &exclude)
            .await
            .unwrap();
        assert_eq!(lease.account.id, 2);
    }

    #[tokio::test]
    async fn saturated_candidates_are_skipped() {
        let f = fixture().await;
        let mut bounded = test_account(1, Provider::ClaudeOfficial);
        bounded.max_concurrency = 1;
        f.store.add(bounded).await.unwrap();
        f.store
            .add(test_account(2, Provider::ClaudeOfficial))
            .await
            .unwrap();

        // Saturate account 1
        let first = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(first.account.id, 1);

        let second = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(second.account.id, 2, "saturated account is skipped");
    }

    #[tokio::test]
    async fn all_saturated_is_no_eligible_account() {
        let f = fixture().await;
        let mut bounded = test_account(1, Provider::ClaudeOfficial);
        bounded.max_concurrency = 1;
        f.store.add(bounded).await.unwrap();

        let _held = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap();

        let err = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoEligibleAccount(_)));
    }

    #[tokio::test]
    async fn dropping_the_lease_frees_the_slot() {
        let f = fixture().await;
        let mut bounded = test_account(1, Provider::ClaudeOfficial);
        bounded.max_concurrency = 1;
        f.store.add(bounded).await.unwrap();

        let lease = f
            .selector
            .select(&request(Provider::ClaudeOfficial), &HashSet::new())
            .await
            .unwrap();
        drop(lease);

        assert_eq!(f.concurrency.in_flight(1), 0);
        assert!(
            f.selector
                .select(&request(Provider::ClaudeOfficial), &HashSet::new())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn affinity_pin_short_circuits_the_scan() {
        let f = fixture().await;
        // LRU would pick account 1; the pin must win
        f.store
            .add(test_account(1, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.store
            .add(test_account(2, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.affinity.pin("s1", 2);

        let lease = f
            .selector
            .select(
                &SelectionRequest {
                    provider: Provider::ClaudeOfficial,
                    session_key: Some("s1"),
                    model: None,
                },
                &HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(lease.account.id, 2);
    }

    #[tokio::test]
    async fn unusable_pin_falls_back_to_scan_and_is_evicted() {
        let f = fixture().await;
        f.store
            .add(test_account(1, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.store
            .add(test_account(2, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.affinity.pin("s1", 2);
        f.availability.mark_unavailable(2, "upstream failures");

        let lease = f
            .selector
            .select(
                &SelectionRequest {
                    provider: Provider::ClaudeOfficial,
                    session_key: Some("s1"),
                    model: None,
                },
                &HashSet::new(),
            )
            .await
            .unwrap();
        assert_eq!(lease.account.id, 1);
        assert_eq!(
            f.affinity.resolve("s1"),
            None,
            "stale pin is evicted so success re-pins"
        );
    }

    #[tokio::test]
    async fn excluded_pin_is_not_reused() {
        let f = fixture().await;
        f.store
            .add(test_account(1, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.store
            .add(test_account(2, Provider::ClaudeOfficial))
            .await
            .unwrap();
        f.affinity.pin("s1", 1);

        // Account 1 already failed this dispatch; the pin must not override
        let exclude: HashSet<u64> = [1].into();
        let lease = f
            .selector
            .select(
                &SelectionRequest {
                    provider: Provider::ClaudeOfficial,
                    session_key: Some("s1"),
                    model: None,
                },
                &exclude,
            )
            .await
            .unwrap();
        assert_eq!(lease.account.id, 2);
    }
}
