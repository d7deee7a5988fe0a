//! Dispatch endpoint
//!
//! Routes `/proxy/{provider}/...` through the account pool: resolves the
//! provider from the path, applies the caller's per-key rate ceiling
//! (identity and ceiling arrive pre-resolved in headers from the external
//! authentication layer), and hands the call to the dispatcher over a
//! reqwest-backed transport. Upstream error statuses pass through to the
//! caller verbatim; pool-level failures map to structured JSON errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use account_store::Account;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use common::FixedWindowLimiter;
use provider::Provider;
use tracing::{info, warn};
use upstream_pool::{
    Dispatcher, Error as PoolError, ProxyRequest, ProxyResponse, SelectionRequest, Transport,
};

use crate::config::UpstreamConfig;
use crate::metrics;

/// Request body cap, matching the upstream providers' own limits.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Hop-by-hop headers that must not be forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Shared state for the dispatch handler.
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub transport: Arc<ReqwestTransport>,
    pub caller_limiter: Arc<FixedWindowLimiter>,
    pub caller_window: Duration,
}

/// reqwest-backed transport: provider family → base URL, bearer token from
/// the selected account. TLS profile selection beyond rustls is out of
/// scope here — a fingerprinting transport would implement the same trait.
pub struct ReqwestTransport {
    client: reqwest::Client,
    claude_url: String,
    openai_url: String,
    gemini_url: String,
}

impl ReqwestTransport {
    pub fn new(config: &UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("building upstream HTTP client");
        Self {
            client,
            claude_url: config.claude_url.clone(),
            openai_url: config.openai_url.clone(),
            gemini_url: config.gemini_url.clone(),
        }
    }

    /// Base URL for an account's provider family. Relay accounts carry
    /// their own gateway URL.
    fn base_url(&self, account: &Account) -> upstream_pool::Result<String> {
        match account.provider {
            Provider::ClaudeOfficial => Ok(self.claude_url.clone()),
            Provider::OpenAiOauth | Provider::OpenAiResponses => Ok(self.openai_url.clone()),
            Provider::Gemini => Ok(self.gemini_url.clone()),
            Provider::GatewayRelay => account
                .gateway_url
                .as_deref()
                .map(|url| format!("{}/backend-api/codex", url.trim_end_matches('/')))
                .ok_or_else(|| {
                    PoolError::Transport("relay account has no gateway URL".into())
                }),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        account: &Account,
        request: &ProxyRequest,
    ) -> upstream_pool::Result<ProxyResponse> {
        let base = self.base_url(account)?;
        let url = format!("{}{}", base.trim_end_matches('/'), request.path);

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| PoolError::Transport(format!("invalid method: {e}")))?;

        let mut builder = self
            .client
            .request(method, &url)
            .bearer_auth(&account.access_token);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| PoolError::Transport(format!("upstream request failed: {e}")))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| PoolError::Transport(format!("reading upstream body: {e}")))?
            .to_vec();

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

/// Handle one `/proxy/{provider}/...` call end to end.
pub async fn handle(state: &ProxyState, request: Request<Body>, request_id: String) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();

    // Path shape: /proxy/{provider}/{upstream path}
    let full_path = parts.uri.path().to_string();
    let rest = full_path.strip_prefix("/proxy/").unwrap_or("");
    let (provider_label, upstream_path) = match rest.split_once('/') {
        Some((label, path)) => (label, format!("/{path}")),
        None => (rest, String::from("/")),
    };
    let Ok(provider) = provider_label.parse::<Provider>() else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_provider",
            &format!("unknown provider: {provider_label}"),
            &request_id,
        );
    };

    // Caller rate ceiling, pre-resolved by the authentication layer
    let caller_key = header_value(&parts.headers, "x-caller-id");
    let caller_limit = header_value(&parts.headers, "x-rate-limit")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0);
    if let Some(caller) = &caller_key {
        if caller_limit > 0 {
            let decision = state.caller_limiter.check(
                &format!("apikey:{caller}"),
                caller_limit,
                state.caller_window,
            );
            if !decision.allowed {
                let mut response = error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    &format!("rate limit exceeded, retry in {}s", decision.wait_secs),
                    &request_id,
                );
                if let Ok(value) = decision.wait_secs.to_string().parse() {
                    response.headers_mut().insert("retry-after", value);
                }
                return response;
            }
        }
    }

    let session_key = header_value(&parts.headers, "x-session-id");

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "body_too_large",
                "request body exceeds 10MB limit",
                &request_id,
            );
        }
    };

    // Model constraint for selection, when the body carries one
    let model = serde_json::from_slice::<serde_json::Value>(&body_bytes)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(String::from));

    let mut upstream_path = upstream_path;
    if let Some(query) = parts.uri.query() {
        upstream_path = format!("{upstream_path}?{query}");
    }

    let forwarded_headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !HOP_BY_HOP.contains(&name)
                && name != "host"
                && name != "authorization"
                && name != "content-length"
                && !name.starts_with("x-caller")
                && name != "x-rate-limit"
                && name != "x-session-id"
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect();

    let payload = ProxyRequest {
        method: parts.method.to_string(),
        path: upstream_path,
        headers: forwarded_headers,
        body: body_bytes.to_vec(),
    };
    let selection = SelectionRequest {
        provider,
        session_key: session_key.as_deref(),
        model: model.as_deref(),
    };

    let result = state
        .dispatcher
        .dispatch(&selection, &payload, state.transport.as_ref())
        .await;
    let duration = started.elapsed().as_secs_f64();

    match result {
        Ok(response) => {
            info!(
                request_id,
                provider = %provider,
                status = response.status,
                duration_ms = (duration * 1000.0) as u64,
                "dispatch complete"
            );
            metrics::record_dispatch(provider.label(), response.status, duration);
            passthrough_response(response)
        }
        Err(PoolError::NoEligibleAccount(counts)) => {
            warn!(request_id, provider = %provider, "no eligible account");
            metrics::record_dispatch_error(provider.label(), "no_eligible_account");
            let pool = serde_json::from_str::<serde_json::Value>(&counts).unwrap_or_default();
            let body = serde_json::json!({
                "error": {
                    "type": "no_upstream_account",
                    "message": "no upstream account available",
                    "pool": pool,
                    "request_id": request_id,
                }
            });
            json_response(StatusCode::SERVICE_UNAVAILABLE, body)
        }
        Err(PoolError::UpstreamFailed { status, body }) => {
            warn!(request_id, provider = %provider, status, "upstream failure surfaced");
            metrics::record_dispatch(provider.label(), status, duration);
            metrics::record_dispatch_error(provider.label(), "upstream_failed");
            passthrough_response(ProxyResponse {
                status,
                headers: vec![],
                body: body.into_bytes(),
            })
        }
        Err(PoolError::Auth(e)) => {
            warn!(request_id, provider = %provider, error = %e, "credential failure surfaced");
            metrics::record_dispatch_error(provider.label(), "credential_error");
            error_response(
                StatusCode::BAD_GATEWAY,
                "credential_error",
                &e.to_string(),
                &request_id,
            )
        }
        Err(PoolError::Transport(message)) => {
            warn!(request_id, provider = %provider, error = %message, "transport failure surfaced");
            metrics::record_dispatch_error(provider.label(), "transport_error");
            error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                &message,
                &request_id,
            )
        }
        Err(PoolError::Store(e)) => {
            warn!(request_id, provider = %provider, error = %e, "store failure surfaced");
            metrics::record_dispatch_error(provider.label(), "store_error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                &e.to_string(),
                &request_id,
            )
        }
    }
}

fn header_value(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Rebuild an upstream response for the caller, forwarding status, body,
/// and non-hop-by-hop headers.
fn passthrough_response(upstream: ProxyResponse) -> Response {
    let mut builder = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(upstream.body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(Body::from("invalid upstream response"))
                .expect("static fallback response")
        })
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("building JSON response")
}

fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    json_response(
        status,
        serde_json::json!({
            "error": {
                "type": kind,
                "message": message,
                "request_id": request_id,
            }
        }),
    )
}
