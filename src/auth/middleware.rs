use std::sync::Arc;

use axum::http::{header, HeaderMap};
use tracing::error;

use super::error::{AuthnReason, RelayError};
use super::relay::{AuthorizeRequest, Authorization, Relay};

/// Pull the bearer credential out of `Authorization`.
///
/// No header at all is `Ok(None)`; the relay decides whether the route
/// needs one.  A header that is present but not a usable bearer credential
/// is rejected outright.
pub fn bearer_credential(headers: &HeaderMap) -> Result<Option<String>, RelayError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let invalid = RelayError::Unauthenticated(AuthnReason::InvalidCredential);
    let value = value.to_str().map_err(|_| invalid.clone())?;
    let (scheme, token) = value.trim_start().split_once(' ').ok_or_else(|| invalid.clone())?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(invalid);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(RelayError::Unauthenticated(AuthnReason::MissingCredential));
    }
    Ok(Some(token.to_string()))
}

pub fn idempotency_key(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Run `authorize` on its own task.
///
/// If the caller goes away while the decision is pending, the handler's
/// future is dropped but the spawned task still finishes its cache and
/// ledger writes.  Its result is simply never forwarded.
pub async fn authorize_detached(
    relay: Arc<Relay>,
    request: AuthorizeRequest,
) -> Result<Authorization, RelayError> {
    let handle = tokio::spawn(async move { relay.authorize(&request).await });
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "authorize task failed");
            Err(RelayError::AuthorityUnavailable)
        }
    }
}
