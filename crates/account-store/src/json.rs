//! File-backed account store
//!
//! Accounts live in one JSON file keyed by account id. All writes use
//! atomic temp-file + rename so a crash mid-write never corrupts the
//! registry, and the file is chmod 0600 since it holds OAuth tokens.
//! A tokio Mutex serializes writers; reads clone out of the in-memory map
//! so request-time reads do not block on background refresh persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use provider::Provider;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account::{Account, now_millis};
use crate::error::{Error, Result};
use crate::store::AccountStore;

/// Thread-safe JSON-file account registry.
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<HashMap<u64, Account>>,
}

impl JsonFileStore {
    /// Load accounts from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// accounts). Accounts are then added via the admin surface.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading account file: {e}")))?;
            let accounts: HashMap<u64, Account> = serde_json::from_str(&contents)
                .map_err(|e| Error::Parse(format!("parsing account file: {e}")))?;
            info!(path = %path.display(), accounts = accounts.len(), "loaded accounts");
            accounts
        } else {
            info!(path = %path.display(), "account file not found, starting with empty registry");
            let empty = HashMap::new();
            write_atomic(&path, &empty).await?;
            empty
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Add or replace an account and persist.
    pub async fn add(&self, account: Account) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(account_id = account.id, "added account");
        state.insert(account.id, account);
        write_atomic(&self.path, &state).await
    }

    /// Remove an account and persist. Returns the removed record if it existed.
    pub async fn remove(&self, id: u64) -> Result<Option<Account>> {
        let mut state = self.state.lock().await;
        let removed = state.remove(&id);
        if removed.is_some() {
            debug!(account_id = id, "removed account");
            write_atomic(&self.path, &state).await?;
        }
        Ok(removed)
    }

    /// Snapshot of every account, enabled or not, ordered by id.
    pub async fn list_all(&self) -> Vec<Account> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    /// Set the per-account concurrency ceiling (0 = unlimited) and persist.
    pub async fn set_max_concurrency(&self, id: u64, limit: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let account = state.get_mut(&id).ok_or(Error::NotFound(id))?;
        account.max_concurrency = limit;
        write_atomic(&self.path, &state).await
    }

    /// Clear the expired-credential marker (administrative re-authorize).
    pub async fn clear_credential_expired(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let account = state.get_mut(&id).ok_or(Error::NotFound(id))?;
        account.credential_expired = false;
        account.expired_reason = None;
        write_atomic(&self.path, &state).await
    }

    /// Number of stored accounts.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AccountStore for JsonFileStore {
    async fn get(&self, id: u64) -> Result<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.get(&id).cloned())
    }

    async fn list_enabled(&self, provider: Option<Provider>) -> Result<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .values()
            .filter(|a| a.enabled)
            .filter(|a| provider.is_none_or(|p| a.provider == p))
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn update_credential(
        &self,
        id: u64,
        access_token: String,
        refresh_token: Option<String>,
        token_expiry: Option<u64>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let account = state.get_mut(&id).ok_or(Error::NotFound(id))?;
        account.access_token = access_token;
        if let Some(refresh) = refresh_token {
            account.refresh_token = refresh;
        }
        account.token_expiry = token_expiry;
        account.last_refreshed_at = Some(now_millis());
        account.credential_expired = false;
        account.expired_reason = None;
        debug!(account_id = id, "updated credential");
        write_atomic(&self.path, &state).await
    }

    async fn update_relay_credential(
        &self,
        id: u64,
        access_token: String,
        organization_id: Option<String>,
        plan_type: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let account = state.get_mut(&id).ok_or(Error::NotFound(id))?;
        account.access_token = access_token;
        account.organization_id = organization_id;
        account.plan_type = plan_type;
        account.last_refreshed_at = Some(now_millis());
        account.credential_expired = false;
        account.expired_reason = None;
        debug!(account_id = id, "updated relay credential");
        write_atomic(&self.path, &state).await
    }

    async fn mark_credential_expired(&self, id: u64, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let account = state.get_mut(&id).ok_or(Error::NotFound(id))?;
        account.credential_expired = true;
        account.expired_reason = Some(reason.to_string());
        debug!(account_id = id, reason, "marked credential expired");
        write_atomic(&self.path, &state).await
    }

    async fn list_needing_stale_refresh(
        &self,
        provider: Provider,
        staleness: Duration,
    ) -> Result<Vec<Account>> {
        let cutoff = now_millis().saturating_sub(staleness.as_millis() as u64);
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .values()
            .filter(|a| a.enabled && a.provider == provider)
            .filter(|a| a.last_refreshed_at.is_none_or(|at| at < cutoff))
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn touch_last_used(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let account = state.get_mut(&id).ok_or(Error::NotFound(id))?;
        account.last_used_at = Some(now_millis());
        write_atomic(&self.path, &state).await
    }
}

/// Write the registry to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets 0600 permissions since the file contains OAuth tokens.
async fn write_atomic(path: &Path, data: &HashMap<u64, Account>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("account path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp account file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting account file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp account file: {e}")))?;

    debug!(path = %path.display(), "persisted accounts");
    Ok(())
}
