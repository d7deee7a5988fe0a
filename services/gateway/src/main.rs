//! AI provider gateway
//!
//! Single-binary service that fronts a pool of provider accounts:
//! 1. Loads the account registry and composes the scheduling core
//!    (token manager, availability, concurrency, affinity, dispatcher)
//! 2. Runs the background refresh sweeps
//! 3. Serves /proxy/{provider}/... dispatch, /admin management,
//!    /health and /metrics

mod admin;
mod config;
mod metrics;
mod proxy;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use account_store::{AccountStore, JsonFileStore};
use common::FixedWindowLimiter;
use upstream_auth::{TokenManager, TokenManagerConfig, spawn_expiry_sweep, spawn_relay_sweep};
use upstream_pool::{
    AccountSelector, AvailabilityTracker, ConcurrencyLimiter, DispatchConfig, Dispatcher,
    SessionAffinity,
};

use crate::admin::AdminState;
use crate::config::Config;
use crate::proxy::{ProxyState, ReqwestTransport};

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    store: Arc<JsonFileStore>,
    availability: Arc<AvailabilityTracker>,
    concurrency: Arc<ConcurrencyLimiter>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections` to bound
/// total in-flight requests across the process.
fn build_router(state: AppState, admin: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/proxy/{provider}/{*rest}", any(proxy_handler))
        .with_state(state)
        .merge(admin::build_admin_router(admin))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting ai-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        store_path = %config.store.path.display(),
        refresh_threshold_secs = config.tokens.refresh_threshold_secs,
        "configuration loaded"
    );

    let store = Arc::new(
        JsonFileStore::load(config.store.path.clone())
            .await
            .context("loading account registry")?,
    );
    let store_dyn: Arc<dyn AccountStore> = store.clone();

    // Scheduling core, composed once and shared
    let tokens = Arc::new(TokenManager::new(
        store_dyn.clone(),
        TokenManagerConfig {
            refresh_threshold: config.refresh_threshold(),
            http_timeout: Duration::from_secs(config.tokens.refresh_timeout_secs),
            endpoints: Default::default(),
        },
    ));
    let availability = Arc::new(AvailabilityTracker::new());
    let concurrency = Arc::new(ConcurrencyLimiter::new());
    let affinity = Arc::new(SessionAffinity::new(config.affinity_ttl()));
    let selector = AccountSelector::new(
        store_dyn.clone(),
        availability.clone(),
        concurrency.clone(),
        affinity.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        selector,
        tokens.clone(),
        store_dyn.clone(),
        availability.clone(),
        affinity.clone(),
        DispatchConfig {
            max_reselects: config.dispatch.max_reselects,
            unavailable_after_failures: config.dispatch.unavailable_after_failures,
        },
    ));

    // Background sweeps, stopped through the cancellation token on shutdown
    let sweep_cancel = CancellationToken::new();
    let expiry_sweep = spawn_expiry_sweep(
        tokens.clone(),
        Duration::from_secs(config.tokens.sweep_interval_secs),
        sweep_cancel.clone(),
    );
    let relay_sweep = spawn_relay_sweep(
        tokens.clone(),
        Duration::from_secs(config.tokens.relay_sweep_interval_secs),
        config.relay_staleness(),
        sweep_cancel.clone(),
    );

    let app_state = AppState {
        proxy: ProxyState {
            dispatcher,
            transport: Arc::new(ReqwestTransport::new(&config.upstreams)),
            caller_limiter: Arc::new(FixedWindowLimiter::new()),
            caller_window: Duration::from_secs(config.limits.caller_window_secs),
        },
        store: store.clone(),
        availability: availability.clone(),
        concurrency: concurrency.clone(),
        prometheus,
        started_at: Instant::now(),
    };
    let admin_state = AdminState {
        store,
        tokens,
        availability,
        concurrency,
        affinity,
        admin_token: config.server.admin_token.clone(),
        auth_limiter: Arc::new(FixedWindowLimiter::new()),
        auth_attempts: config.limits.admin_auth_attempts,
        auth_window: Duration::from_secs(config.limits.admin_auth_window_secs),
    };

    let app = build_router(app_state, admin_state, config.server.max_connections);

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "accepting requests");

    // Graceful shutdown: stop accepting, drain in-flight requests up to
    // DRAIN_TIMEOUT, stop the sweeps
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());
    sweep_cancel.cancel();

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    let _ = expiry_sweep.await;
    let _ = relay_sweep.await;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool counts and uptime. 200 while at least one
/// account is selectable, 503 when none are.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let accounts = state.store.list_enabled(None).await.unwrap_or_default();
    let total = accounts.len();

    let mut available = 0usize;
    let mut detail = Vec::new();
    for account in &accounts {
        let is_available = account.selectable() && state.availability.is_available(account.id);
        if is_available {
            available += 1;
        }
        detail.push(serde_json::json!({
            "id": account.id,
            "provider": account.provider.label(),
            "available": is_available,
            "in_flight": state.concurrency.in_flight(account.id),
        }));
    }

    let status = if available == total && total > 0 {
        "healthy"
    } else if available > 0 {
        "degraded"
    } else {
        "unhealthy"
    };
    let status_code = if available > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    let health = provider::ProviderHealth {
        status: status.to_string(),
        pool: Some(serde_json::json!({
            "accounts_total": total,
            "accounts_available": available,
            "accounts_unavailable": total - available,
            "accounts": detail,
        })),
    };
    let mut body = serde_json::to_value(&health).unwrap_or_default();
    body["uptime_seconds"] = serde_json::json!(state.started_at.elapsed().as_secs());

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint — text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Dispatch endpoint for all providers.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::handle(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_store::Account;
    use axum::http::StatusCode;
    use provider::Provider;
    use tower::ServiceExt;
    use upstream_auth::TokenManagerConfig;

    /// Create a PrometheusHandle without installing a global recorder, so
    /// multiple tests can run in one process.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

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

    struct TestApp {
        app: Router,
        store: Arc<JsonFileStore>,
        availability: Arc<AvailabilityTracker>,
        _dir: tempfile::TempDir,
    }

    async fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonFileStore::load(dir.path().join("accounts.json"))
                .await
                .unwrap(),
        );
        let store_dyn: Arc<dyn AccountStore> = store.clone();
        let tokens = Arc::new(TokenManager::new(
            store_dyn.clone(),
            TokenManagerConfig::default(),
        ));
        let availability = Arc::new(AvailabilityTracker::new());
        let concurrency = Arc::new(ConcurrencyLimiter::new());
        let affinity = Arc::new(SessionAffinity::new(Duration::from_secs(60)));
        let selector = AccountSelector::new(
            store_dyn.clone(),
            availability.clone(),
            concurrency.clone(),
            affinity.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            selector,
            tokens.clone(),
            store_dyn,
            availability.clone(),
            affinity.clone(),
            DispatchConfig::default(),
        ));

        let app_state = AppState {
            proxy: ProxyState {
                dispatcher,
                transport: Arc::new(ReqwestTransport::new(&config::UpstreamConfig::default())),
                caller_limiter: Arc::new(FixedWindowLimiter::new()),
                caller_window: Duration::from_secs(60),
            },
            store: store.clone(),
            availability: availability.clone(),
            concurrency: concurrency.clone(),
            prometheus: test_prometheus_handle(),
            started_at: Instant::now(),
        };
        let admin_state = AdminState {
            store: store.clone(),
            tokens,
            availability: availability.clone(),
            concurrency,
            affinity,
            admin_token: None,
            auth_limiter: Arc::new(FixedWindowLimiter::new()),
            auth_attempts: 5,
            auth_window: Duration::from_secs(60),
        };

        TestApp {
            app: build_router(app_state, admin_state, 100),
            store,
            availability,
            _dir: dir,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_pool_counts() {
        let t = test_app().await;
        t.store
            .add(test_account(1, Provider::ClaudeOfficial))
            .await
            .unwrap();
        t.store
            .add(test_account(2, Provider::Gemini))
            .await
            .unwrap();
        t.availability.mark_unavailable(2, "probe failed");

        let response = t
            .app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["pool"]["accounts_total"], 2);
        assert_eq!(json["pool"]["accounts_available"], 1);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_with_no_accounts_is_503() {
        let t = test_app().await;
        let response = t
            .app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_prometheus_text() {
        let t = test_app().await;
        let response = t
            .app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn proxy_route_rejects_unknown_provider() {
        let t = test_app().await;
        let response = t
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/proxy/mistral/v1/chat")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "unknown_provider");
        let request_id = json["error"]["request_id"].as_str().unwrap();
        assert!(request_id.starts_with("req_"), "got: {request_id}");
    }

    #[tokio::test]
    async fn proxy_route_without_accounts_is_503() {
        let t = test_app().await;
        let response = t
            .app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/proxy/claude_official/v1/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "no_upstream_account");
    }

    #[tokio::test]
    async fn admin_routes_are_mounted() {
        let t = test_app().await;
        let response = t
            .app
            .oneshot(
                Request::builder()
                    .uri("/admin/accounts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
