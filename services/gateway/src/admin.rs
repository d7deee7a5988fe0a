//! Admin API for pool management
//!
//! Passthrough endpoints over the scheduling core:
//!
//! - GET    /admin/accounts                      — list accounts (tokens masked)
//! - POST   /admin/accounts/{id}/refresh         — force a token refresh now
//! - POST   /admin/accounts/{id}/unavailable     — take an account out of rotation
//! - DELETE /admin/accounts/{id}/unavailable     — put it back
//! - GET    /admin/accounts/{id}/concurrency     — ceiling + current in-flight
//! - PUT    /admin/accounts/{id}/concurrency     — set the ceiling (0 = unlimited)
//! - GET    /admin/affinity                      — live session pins
//! - DELETE /admin/affinity/{session}            — evict one pin
//!
//! When an admin token is configured every route requires it as a bearer;
//! failed attempts are rate limited per source and the counter resets on
//! the first successful call, so a mistyped token doesn't lock out the
//! operator for the full window.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use common::{FixedWindowLimiter, SecretString, mask_token};
use serde::Deserialize;
use tracing::{info, warn};

use account_store::{AccountStore, JsonFileStore};
use upstream_auth::TokenManager;
use upstream_pool::{AvailabilityTracker, ConcurrencyLimiter, SessionAffinity};

use crate::metrics;

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<JsonFileStore>,
    pub tokens: Arc<TokenManager>,
    pub availability: Arc<AvailabilityTracker>,
    pub concurrency: Arc<ConcurrencyLimiter>,
    pub affinity: Arc<SessionAffinity>,
    pub admin_token: Option<SecretString>,
    pub auth_limiter: Arc<FixedWindowLimiter>,
    pub auth_attempts: i64,
    pub auth_window: Duration,
}

/// Build the admin router with bearer auth applied to every route.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/{id}/refresh", post(force_refresh))
        .route("/admin/accounts/{id}/unavailable", post(mark_unavailable))
        .route("/admin/accounts/{id}/unavailable", delete(clear_unavailable))
        .route("/admin/accounts/{id}/concurrency", get(get_concurrency))
        .route("/admin/accounts/{id}/concurrency", put(set_concurrency))
        .route("/admin/affinity", get(list_affinity))
        .route("/admin/affinity/{session}", delete(evict_affinity))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ))
        .with_state(state)
}

/// Bearer-token gate. Open when no token is configured (loopback-only
/// deployments); otherwise failed attempts count against a fixed window
/// keyed by source, and a success resets the counter.
async fn require_admin(State(state): State<AdminState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.admin_token else {
        return next.run(request).await;
    };

    let source = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
        .to_string();
    let limiter_key = format!("admin:{source}");

    let decision = state
        .auth_limiter
        .check(&limiter_key, state.auth_attempts, state.auth_window);
    if !decision.allowed {
        warn!(source, "admin auth locked out");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", decision.wait_secs.to_string())],
            error_body("auth_locked_out", "too many failed attempts"),
        )
            .into_response();
    }

    let presented = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(expected.expose()) {
        state.auth_limiter.reset(&limiter_key);
        return next.run(request).await;
    }

    warn!(source, "admin auth rejected");
    (
        StatusCode::UNAUTHORIZED,
        error_body("unauthorized", "missing or invalid admin token"),
    )
        .into_response()
}

/// GET /admin/accounts — every account with masked credentials and its
/// runtime state. Raw tokens never leave the process through this surface.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = state.store.list_all().await;
    let listing: Vec<serde_json::Value> = accounts
        .iter()
        .map(|account| {
            let unavailability = state.availability.get(account.id);
            serde_json::json!({
                "id": account.id,
                "name": account.name,
                "provider": account.provider.label(),
                "enabled": account.enabled,
                "access_token": mask_token(&account.access_token),
                "token_expiry": account.token_expiry,
                "credential_expired": account.credential_expired,
                "expired_reason": account.expired_reason,
                "max_concurrency": account.max_concurrency,
                "in_flight": state.concurrency.in_flight(account.id),
                "available": unavailability.is_none(),
                "unavailable_reason": unavailability.map(|u| u.reason),
                "last_refreshed_at": account.last_refreshed_at,
                "last_used_at": account.last_used_at,
            })
        })
        .collect();

    axum::Json(serde_json::json!({ "accounts": listing }))
}

/// POST /admin/accounts/{id}/refresh — synchronous forced refresh.
async fn force_refresh(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    let provider_label = match state.store.get(id).await {
        Ok(Some(account)) => account.provider.label(),
        _ => "unknown",
    };
    match state.tokens.force_refresh(id).await {
        Ok(account) => {
            info!(account_id = id, "administrative refresh succeeded");
            metrics::record_refresh(account.provider.label(), "success");
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({
                    "id": account.id,
                    "access_token": mask_token(&account.access_token),
                    "token_expiry": account.token_expiry,
                    "refreshed": true,
                })),
            )
                .into_response()
        }
        Err(upstream_auth::Error::NotFound(_)) => {
            (StatusCode::NOT_FOUND, error_body("not_found", "no such account")).into_response()
        }
        Err(upstream_auth::Error::RefreshInFlight(_)) => (
            StatusCode::CONFLICT,
            error_body("refresh_in_flight", "a refresh is already running"),
        )
            .into_response(),
        Err(e) => {
            warn!(account_id = id, error = %e, "administrative refresh failed");
            metrics::record_refresh(provider_label, "failure");
            (
                StatusCode::BAD_GATEWAY,
                error_body("refresh_failed", &e.to_string()),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarkUnavailableBody {
    #[serde(default)]
    reason: Option<String>,
}

/// POST /admin/accounts/{id}/unavailable — the body is optional JSON
/// carrying a reason.
async fn mark_unavailable(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    body: String,
) -> impl IntoResponse {
    let reason = serde_json::from_str::<MarkUnavailableBody>(&body)
        .ok()
        .and_then(|b| b.reason)
        .unwrap_or_else(|| "administrative override".to_string());
    state.availability.mark_unavailable(id, &reason);
    info!(account_id = id, reason, "account marked unavailable");
    axum::Json(serde_json::json!({ "id": id, "available": false }))
}

/// DELETE /admin/accounts/{id}/unavailable
async fn clear_unavailable(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    state.availability.clear(id);
    info!(account_id = id, "account cleared for selection");
    axum::Json(serde_json::json!({ "id": id, "available": true }))
}

/// GET /admin/accounts/{id}/concurrency
async fn get_concurrency(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match state.store.get(id).await {
        Ok(Some(account)) => (
            StatusCode::OK,
            axum::Json(serde_json::json!({
                "id": id,
                "max_concurrency": account.max_concurrency,
                "in_flight": state.concurrency.in_flight(id),
            })),
        )
            .into_response(),
        Ok(None) => {
            (StatusCode::NOT_FOUND, error_body("not_found", "no such account")).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internal_error", &e.to_string()),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SetConcurrencyBody {
    limit: u32,
}

/// PUT /admin/accounts/{id}/concurrency — persist and apply a new ceiling.
async fn set_concurrency(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    axum::Json(body): axum::Json<SetConcurrencyBody>,
) -> impl IntoResponse {
    match state.store.set_max_concurrency(id, body.limit).await {
        Ok(()) => {
            state.concurrency.set_limit(id, body.limit);
            info!(account_id = id, limit = body.limit, "concurrency ceiling updated");
            (
                StatusCode::OK,
                axum::Json(serde_json::json!({ "id": id, "max_concurrency": body.limit })),
            )
                .into_response()
        }
        Err(account_store::Error::NotFound(_)) => {
            (StatusCode::NOT_FOUND, error_body("not_found", "no such account")).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("internal_error", &e.to_string()),
        )
            .into_response(),
    }
}

/// GET /admin/affinity — live session pins.
async fn list_affinity(State(state): State<AdminState>) -> impl IntoResponse {
    let sessions: Vec<serde_json::Value> = state
        .affinity
        .entries()
        .into_iter()
        .map(|(session, account_id, idle_secs)| {
            serde_json::json!({
                "session": session,
                "account_id": account_id,
                "idle_secs": idle_secs,
            })
        })
        .collect();
    axum::Json(serde_json::json!({ "sessions": sessions }))
}

/// DELETE /admin/affinity/{session}
async fn evict_affinity(
    State(state): State<AdminState>,
    Path(session): Path<String>,
) -> impl IntoResponse {
    state.affinity.evict(&session);
    info!(session, "session pin evicted");
    StatusCode::NO_CONTENT
}

fn error_body(kind: &str, message: &str) -> String {
    serde_json::json!({ "error": { "type": kind, "message": message } }).to_string()
}
