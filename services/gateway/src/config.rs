//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The admin token is loaded from the ADMIN_TOKEN env var or
//! admin_token_file, never stored in the TOML directly to avoid leaking
//! secrets.

use common::SecretString;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub upstreams: UpstreamConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Path to a file containing the admin bearer token (alternative to
    /// the ADMIN_TOKEN env var)
    #[serde(default)]
    pub admin_token_file: Option<PathBuf>,
    #[serde(skip)]
    pub admin_token: Option<SecretString>,
}

/// Account registry location
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
}

/// Token lifecycle tunables
#[derive(Debug, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_refresh_timeout_secs")]
    pub refresh_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_relay_sweep_interval_secs")]
    pub relay_sweep_interval_secs: u64,
    #[serde(default = "default_relay_staleness_hours")]
    pub relay_staleness_hours: u64,
}

/// Dispatch policy
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_reselects")]
    pub max_reselects: u32,
    #[serde(default = "default_unavailable_after_failures")]
    pub unavailable_after_failures: u32,
    #[serde(default = "default_affinity_ttl_secs")]
    pub affinity_ttl_secs: u64,
}

/// Caller-side rate limiting
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Failed admin-auth attempts per source address before lockout
    #[serde(default = "default_admin_auth_attempts")]
    pub admin_auth_attempts: i64,
    #[serde(default = "default_admin_auth_window_secs")]
    pub admin_auth_window_secs: u64,
    /// Window for per-caller request ceilings (the ceiling itself arrives
    /// per call from the authentication layer)
    #[serde(default = "default_caller_window_secs")]
    pub caller_window_secs: u64,
}

/// Upstream base URLs per provider family
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_claude_url")]
    pub claude_url: String,
    #[serde(default = "default_openai_url")]
    pub openai_url: String,
    #[serde(default = "default_gemini_url")]
    pub gemini_url: String,
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_connections() -> usize {
    1000
}
fn default_refresh_threshold_secs() -> u64 {
    300
}
fn default_refresh_timeout_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_relay_sweep_interval_secs() -> u64 {
    3600
}
fn default_relay_staleness_hours() -> u64 {
    24
}
fn default_max_reselects() -> u32 {
    1
}
fn default_unavailable_after_failures() -> u32 {
    2
}
fn default_affinity_ttl_secs() -> u64 {
    1800
}
fn default_admin_auth_attempts() -> i64 {
    5
}
fn default_admin_auth_window_secs() -> u64 {
    300
}
fn default_caller_window_secs() -> u64 {
    60
}
fn default_claude_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_openai_url() -> String {
    "https://chatgpt.com/backend-api".into()
}
fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn default_upstream_timeout_secs() -> u64 {
    60
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_threshold_secs: default_refresh_threshold_secs(),
            refresh_timeout_secs: default_refresh_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            relay_sweep_interval_secs: default_relay_sweep_interval_secs(),
            relay_staleness_hours: default_relay_staleness_hours(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_reselects: default_max_reselects(),
            unavailable_after_failures: default_unavailable_after_failures(),
            affinity_ttl_secs: default_affinity_ttl_secs(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            admin_auth_attempts: default_admin_auth_attempts(),
            admin_auth_window_secs: default_admin_auth_window_secs(),
            caller_window_secs: default_caller_window_secs(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            claude_url: default_claude_url(),
            openai_url: default_openai_url(),
            gemini_url: default_gemini_url(),
            timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment
    /// variables.
    ///
    /// Admin token resolution order:
    /// 1. ADMIN_TOKEN env var
    /// 2. admin_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| common::Error::Config(format!("parsing {}: {e}", path.display())))?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.tokens.refresh_timeout_secs == 0 {
            return Err(common::Error::Config(
                "refresh_timeout_secs must be greater than 0".into(),
            ));
        }
        if config.tokens.sweep_interval_secs == 0 || config.tokens.relay_sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "sweep intervals must be greater than 0".into(),
            ));
        }
        if config.tokens.relay_staleness_hours == 0 {
            return Err(common::Error::Config(
                "relay_staleness_hours must be greater than 0".into(),
            ));
        }
        for url in [
            &config.upstreams.claude_url,
            &config.upstreams.openai_url,
            &config.upstreams.gemini_url,
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "upstream URL must start with http:// or https://, got: {url}"
                )));
            }
        }

        // Resolve admin token: env var takes precedence over file
        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            config.server.admin_token = Some(SecretString::new(token));
        } else if let Some(ref token_file) = config.server.admin_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read admin_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.server.admin_token = Some(SecretString::new(token));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gateway.toml")
    }

    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.tokens.refresh_threshold_secs)
    }

    pub fn relay_staleness(&self) -> Duration {
        Duration::from_secs(self.tokens.relay_staleness_hours * 3600)
    }

    pub fn affinity_ttl(&self) -> Duration {
        Duration::from_secs(self.dispatch.affinity_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables,
    /// preventing data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:8080"

[store]
path = "/var/lib/gateway/accounts.json"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn load_valid_config_applies_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());
        unsafe { remove_env("ADMIN_TOKEN") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.tokens.refresh_threshold_secs, 300);
        assert_eq!(config.tokens.refresh_timeout_secs, 30);
        assert_eq!(config.tokens.sweep_interval_secs, 60);
        assert_eq!(config.tokens.relay_staleness_hours, 24);
        assert_eq!(config.dispatch.max_reselects, 1);
        assert_eq!(config.dispatch.unavailable_after_failures, 2);
        assert_eq!(config.dispatch.affinity_ttl_secs, 1800);
        assert!(config.server.admin_token.is_none());
    }

    #[test]
    fn load_missing_file_errors() {
        let result = Config::load(Path::new("/nonexistent/path/gateway.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_invalid_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn explicit_sections_override_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"
max_connections = 250

[store]
path = "/tmp/accounts.json"

[tokens]
refresh_threshold_secs = 120
sweep_interval_secs = 30

[dispatch]
max_reselects = 3
unavailable_after_failures = 5
"#,
        );
        unsafe { remove_env("ADMIN_TOKEN") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 250);
        assert_eq!(config.tokens.refresh_threshold_secs, 120);
        assert_eq!(config.tokens.sweep_interval_secs, 30);
        assert_eq!(config.dispatch.max_reselects, 3);
        assert_eq!(config.dispatch.unavailable_after_failures, 5);
    }

    #[test]
    fn zero_max_connections_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"
max_connections = 0

[store]
path = "/tmp/accounts.json"
"#,
        );
        unsafe { remove_env("ADMIN_TOKEN") };
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn zero_refresh_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[store]
path = "/tmp/accounts.json"

[tokens]
refresh_timeout_secs = 0
"#,
        );
        unsafe { remove_env("ADMIN_TOKEN") };
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn schemeless_upstream_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[store]
path = "/tmp/accounts.json"

[upstreams]
claude_url = "api.anthropic.com"
"#,
        );
        unsafe { remove_env("ADMIN_TOKEN") };

        let result = Config::load(&path);
        assert!(result.is_err());
        let err = format!("{}", result.unwrap_err());
        assert!(err.contains("http"), "error should explain the issue: {err}");
    }

    #[test]
    fn admin_token_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env("ADMIN_TOKEN", "tok-env-123") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.server.admin_token.as_ref().unwrap().expose(),
            "tok-env-123"
        );
        unsafe { remove_env("ADMIN_TOKEN") };
    }

    #[test]
    fn admin_token_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("admin_token");
        std::fs::write(&token_path, "tok-file-456\n").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_token_file = "{}"

[store]
path = "/tmp/accounts.json"
"#,
            token_path.display()
        );
        let path = write_config(&dir, &toml_content);

        unsafe { remove_env("ADMIN_TOKEN") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.server.admin_token.as_ref().unwrap().expose(),
            "tok-file-456"
        );
    }

    #[test]
    fn admin_token_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("admin_token");
        std::fs::write(&token_path, "tok-file-loses").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_token_file = "{}"

[store]
path = "/tmp/accounts.json"
"#,
            token_path.display()
        );
        let path = write_config(&dir, &toml_content);

        unsafe { set_env("ADMIN_TOKEN", "tok-env-wins") };
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.server.admin_token.as_ref().unwrap().expose(),
            "tok-env-wins"
        );
        unsafe { remove_env("ADMIN_TOKEN") };
    }

    #[test]
    fn whitespace_only_token_file_yields_none() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("admin_token");
        std::fs::write(&token_path, "  \n  ").unwrap();

        let toml_content = format!(
            r#"
[server]
listen_addr = "127.0.0.1:8080"
admin_token_file = "{}"

[store]
path = "/tmp/accounts.json"
"#,
            token_path.display()
        );
        let path = write_config(&dir, &toml_content);

        unsafe { remove_env("ADMIN_TOKEN") };
        let config = Config::load(&path).unwrap();
        assert!(config.server.admin_token.is_none());
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_env_then_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("gateway.toml"));
    }

    #[test]
    fn duration_helpers_convert_units() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());
        unsafe { remove_env("ADMIN_TOKEN") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.refresh_threshold(), Duration::from_secs(300));
        assert_eq!(config.relay_staleness(), Duration::from_secs(24 * 3600));
        assert_eq!(config.affinity_ttl(), Duration::from_secs(1800));
    }
}
