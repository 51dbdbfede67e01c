//! HTTP client for the credential authority.
//!
//! Endpoints (relative to `authority.url`):
//! - `POST /register`        JSON registration -> identity
//! - `POST /login`           form `username` / `password` -> credential
//! - `POST /validate-token`  `Authorization: Bearer` -> `{valid, identity, ...}`
//! - `GET  /health`          -> `{status, service}`
//!
//! Status classification: 2xx is an answer, 401/403/404 on validate is a
//! rejection, 5xx and transport errors are `Unavailable`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::error::AuthnReason;
use crate::auth::verdict::Identity;
use crate::config::AuthorityConfig;

use super::{
    AuthorityError, ComponentHealth, CredentialAuthority, IssuedCredential, Registration,
    Validation,
};

pub struct HttpAuthority {
    base_url: String,
    /// Whole-request limit, from connect until the body is read.  The
    /// shared client only bounds connecting.
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpAuthority {
    pub fn new(config: &AuthorityConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Identity as the authority serialises it.  Numeric ids are accepted and
/// normalised to strings.
#[derive(Debug, Deserialize)]
struct WireIdentity {
    id: serde_json::Value,
    #[serde(default)]
    email: Option<String>,
    #[serde(default = "bool_true", alias = "is_active")]
    active: bool,
    #[serde(default, alias = "is_admin")]
    privileged: bool,
}

fn bool_true() -> bool {
    true
}

impl WireIdentity {
    fn into_identity(self) -> Result<Identity, AuthorityError> {
        let id = match self.id {
            serde_json::Value::String(s) if !s.is_empty() => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(AuthorityError::Unavailable(format!(
                    "authority returned unusable identity id: {other}"
                )))
            }
        };
        Ok(Identity {
            id,
            email: self.email,
            active: self.active,
            privileged: self.privileged,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireValidation {
    valid: bool,
    #[serde(default)]
    identity: Option<WireIdentity>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRejection {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

fn rejection_reason(raw: Option<&str>) -> AuthnReason {
    match raw {
        Some(r) if r.to_ascii_lowercase().contains("expired") => AuthnReason::ExpiredCredential,
        _ => AuthnReason::InvalidCredential,
    }
}

/// Interpret a `validate-token` reply.
fn parse_validation(status: StatusCode, body: &[u8]) -> Result<Validation, AuthorityError> {
    if status.is_server_error() {
        return Err(AuthorityError::Unavailable(format!(
            "validate returned {status}"
        )));
    }

    if status.is_client_error() {
        let hint = serde_json::from_slice::<WireRejection>(body)
            .ok()
            .and_then(|r| r.reason.or(r.detail));
        return Ok(Validation::Rejected {
            reason: rejection_reason(hint.as_deref()),
        });
    }

    let wire: WireValidation = serde_json::from_slice(body)
        .map_err(|e| AuthorityError::Unavailable(format!("unparseable validate reply: {e}")))?;

    if !wire.valid {
        return Ok(Validation::Rejected {
            reason: rejection_reason(wire.reason.as_deref()),
        });
    }

    let (Some(identity), Some(expires_at)) = (wire.identity, wire.expires_at) else {
        return Err(AuthorityError::Unavailable(
            "validate reply accepted without identity or expiry".to_string(),
        ));
    };
    let identity = identity.into_identity()?;
    let issued_at = wire.issued_at.unwrap_or(DateTime::<Utc>::MIN_UTC);

    Ok(Validation::Accepted {
        identity,
        issued_at,
        expires_at,
    })
}

/// Shared status handling for register/login.
fn classify_failure(status: StatusCode, body: &str) -> AuthorityError {
    let detail = serde_json::from_str::<WireRejection>(body)
        .ok()
        .and_then(|r| r.detail.or(r.reason))
        .unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AuthorityError::Unauthenticated(detail)
        }
        s if s.is_client_error() => AuthorityError::Invalid(detail),
        _ => AuthorityError::Unavailable(detail),
    }
}

fn transport(e: reqwest::Error) -> AuthorityError {
    AuthorityError::Unavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl CredentialAuthority for HttpAuthority {
    async fn register(&self, registration: &Registration) -> Result<Identity, AuthorityError> {
        let resp = self
            .client
            .post(self.url("register"))
            .timeout(self.timeout)
            .json(registration)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(transport)?;
        if !status.is_success() {
            warn!(%status, "authority rejected registration");
            return Err(classify_failure(status, &body));
        }

        let wire: WireIdentity = serde_json::from_str(&body)
            .map_err(|e| AuthorityError::Unavailable(format!("unparseable register reply: {e}")))?;
        wire.into_identity()
    }

    async fn login(
        &self,
        identifier: &str,
        secret: &str,
    ) -> Result<IssuedCredential, AuthorityError> {
        let resp = self
            .client
            .post(self.url("login"))
            .timeout(self.timeout)
            .form(&[("username", identifier), ("password", secret)])
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let body = resp.text().await.map_err(transport)?;
        if !status.is_success() {
            debug!(%status, "authority refused login");
            return Err(classify_failure(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| AuthorityError::Unavailable(format!("unparseable login reply: {e}")))
    }

    async fn validate(&self, credential: &str) -> Result<Validation, AuthorityError> {
        let resp = self
            .client
            .post(self.url("validate-token"))
            .timeout(self.timeout)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(transport)?;
        parse_validation(status, &body)
    }

    async fn health_check(&self) -> Result<ComponentHealth, AuthorityError> {
        let resp = self
            .client
            .get(self.url("health"))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        let health: ComponentHealth = resp
            .json()
            .await
            .map_err(|e| AuthorityError::Unavailable(format!("health reply ({status}): {e}")))?;
        Ok(health)
    }
}
