//! Provider refresh wire protocols
//!
//! Three OAuth token-exchange shapes plus the relay-gateway shape, each
//! parsed into a canonical grant:
//!
//! - Claude: JSON body `{grant_type, refresh_token, client_id}`
//! - OpenAI: form-encoded `grant_type/client_id/refresh_token`
//! - Google: form-encoded with the account's own client id/secret pair
//! - Relay:  JSON `{refresh_token}` against `{gateway_url}/auth/refresh`
//!
//! A 401/403 from a token endpoint means the refresh token itself is
//! revoked or invalid — surfaced as `InvalidCredentials`, distinct from
//! transient exchange failures.

use serde::Deserialize;

use crate::endpoints::{CLAUDE_CLIENT_ID, OPENAI_CLIENT_ID, relay_refresh_url};
use crate::error::{Error, Result};

/// Canonical result of an OAuth token refresh.
///
/// `expires_in` is a delta in seconds from the response time; the manager
/// converts it to an absolute unix millisecond expiry when persisting.
/// `refresh_token` is `None` when the endpoint does not rotate it.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Result of a relay-gateway credential re-issue.
///
/// Relay tokens carry no expiry; the staleness sweep re-issues them on a
/// schedule instead. `team`/`k12` plans resolve an organization id from
/// the first reported team.
#[derive(Debug, Clone)]
pub struct RelayGrant {
    pub access_token: String,
    pub organization_id: Option<String>,
    pub plan_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OauthTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct RelayTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "accountCheckInfo", default)]
    account_check_info: RelayAccountCheckInfo,
}

#[derive(Debug, Default, Deserialize)]
struct RelayAccountCheckInfo {
    #[serde(default)]
    team_ids: Vec<String>,
    #[serde(default)]
    plan_type: Option<String>,
}

/// Refresh a Claude access token (JSON token exchange).
pub async fn refresh_claude(
    client: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
) -> Result<TokenGrant> {
    if refresh_token.is_empty() {
        return Err(Error::MissingRefreshToken);
    }

    let response = client
        .post(token_url)
        .json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": CLAUDE_CLIENT_ID,
        }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("claude token refresh request failed: {e}")))?;

    parse_oauth_response(response).await
}

/// Refresh an OpenAI access token (form-encoded token exchange, shared by
/// the oauth and responses account families).
pub async fn refresh_openai(
    client: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
) -> Result<TokenGrant> {
    if refresh_token.is_empty() {
        return Err(Error::MissingRefreshToken);
    }

    let response = client
        .post(token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", OPENAI_CLIENT_ID),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("openai token refresh request failed: {e}")))?;

    parse_oauth_response(response).await
}

/// Refresh a Gemini access token using the account's client pair.
/// Google never rotates the refresh token on this exchange.
pub async fn refresh_gemini(
    client: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> Result<TokenGrant> {
    if refresh_token.is_empty() {
        return Err(Error::MissingRefreshToken);
    }

    let mut form: Vec<(&str, &str)> = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if let Some(id) = client_id {
        form.push(("client_id", id));
    }
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret));
    }

    let response = client
        .post(token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("gemini token refresh request failed: {e}")))?;

    let grant = parse_oauth_response(response).await?;
    // Google omits refresh_token from refresh responses; never rotate it
    Ok(TokenGrant {
        refresh_token: None,
        ..grant
    })
}

/// Re-issue a relay-gateway credential against the account's gateway.
pub async fn refresh_relay(
    client: &reqwest::Client,
    gateway_url: &str,
    refresh_token: &str,
) -> Result<RelayGrant> {
    if refresh_token.is_empty() {
        return Err(Error::MissingRefreshToken);
    }

    let url = relay_refresh_url(gateway_url);
    let response = client
        .post(&url)
        .json(&serde_json::json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("relay refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Exchange(format!(
            "relay refresh returned {status}: {body}"
        )));
    }

    let parsed: RelayTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::Parse(format!("invalid relay refresh response: {e}")))?;

    let plan_type = parsed.account_check_info.plan_type;
    let organization_id = match plan_type.as_deref() {
        Some("team") | Some("k12") => parsed.account_check_info.team_ids.first().cloned(),
        _ => None,
    };

    Ok(RelayGrant {
        access_token: parsed.access_token,
        organization_id,
        plan_type,
    })
}

/// Parse an OAuth token response, mapping 401/403 to `InvalidCredentials`.
async fn parse_oauth_response(response: reqwest::Response) -> Result<TokenGrant> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }
        return Err(Error::Exchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    let parsed: OauthTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::Parse(format!("invalid token response: {e}")))?;

    Ok(TokenGrant {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_in: parsed.expires_in,
    })
}
