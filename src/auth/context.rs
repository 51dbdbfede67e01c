//! Identity context attached to forwarded calls.
//!
//! Downstream services never see the raw bearer credential.  Instead the
//! relay attaches the resolved identity as base64url JSON together with a
//! timestamp and an HMAC-SHA256 over `"{timestamp}.{identity}"`.  A
//! downstream trusts the identity only if the signature verifies and the
//! timestamp is within its allowed skew.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::verdict::Identity;
use crate::auth::relay::Decision;

pub const IDENTITY_HEADER: &str = "x-relay-identity";
pub const TIMESTAMP_HEADER: &str = "x-relay-timestamp";
pub const SIGNATURE_HEADER: &str = "x-relay-signature";
/// Every inbound header with this prefix is stripped before forwarding.
pub const RELAY_HEADER_PREFIX: &str = "x-relay-";

type HmacSha256 = Hmac<Sha256>;

/// Per-request state: who the caller is and how that was decided.  Lives in
/// request extensions for the duration of one request only.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub identity: Option<Identity>,
    pub decision: Decision,
}

/// Header values for one signed identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedContext {
    pub identity: String,
    pub timestamp: String,
    pub signature: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("identity context header missing: {0}")]
    Missing(&'static str),
    #[error("identity context malformed: {0}")]
    Malformed(String),
    #[error("identity context signature mismatch")]
    BadSignature,
    #[error("identity context outside allowed skew")]
    Stale,
}

#[derive(Clone)]
pub struct ContextSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for ContextSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSigner").finish_non_exhaustive()
    }
}

impl ContextSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        anyhow::ensure!(key.len() >= 16, "identity context key must be at least 16 bytes");
        let mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| anyhow::anyhow!("invalid identity context key: {e}"))?;
        Ok(Self { mac })
    }

    /// Read the signing key from the environment variable named `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        let key = std::env::var(var)
            .with_context(|| format!("identity context key not set (env {var})"))?;
        Self::new(key.into_bytes())
    }

    pub fn sign(&self, identity: &Identity, now: DateTime<Utc>) -> Result<SignedContext> {
        let json = serde_json::to_vec(identity).context("serialize identity context")?;
        let encoded = URL_SAFE_NO_PAD.encode(json);
        let timestamp = now.timestamp().to_string();

        let mut mac = self.mac.clone();
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(encoded.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(SignedContext {
            identity: encoded,
            timestamp,
            signature,
        })
    }

    /// Check a signed context as a downstream service would.
    pub fn verify(
        &self,
        signed: &SignedContext,
        now: DateTime<Utc>,
        max_skew: Duration,
    ) -> Result<Identity, ContextError> {
        let signature = hex::decode(&signed.signature)
            .map_err(|e| ContextError::Malformed(format!("signature: {e}")))?;
        let mut mac = self.mac.clone();
        mac.update(signed.timestamp.as_bytes());
        mac.update(b".");
        mac.update(signed.identity.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ContextError::BadSignature)?;

        let issued: i64 = signed
            .timestamp
            .parse()
            .map_err(|e| ContextError::Malformed(format!("timestamp: {e}")))?;
        let skew = now.timestamp().abs_diff(issued);
        if skew > max_skew.as_secs() {
            return Err(ContextError::Stale);
        }

        let json = URL_SAFE_NO_PAD
            .decode(&signed.identity)
            .map_err(|e| ContextError::Malformed(format!("identity: {e}")))?;
        serde_json::from_slice(&json).map_err(|e| ContextError::Malformed(format!("identity: {e}")))
    }
}

/// Verify the identity context carried by a forwarded request.  Intended for
/// downstream services that share the signing key.
pub fn verify_identity_context(
    signer: &ContextSigner,
    headers: &axum::http::HeaderMap,
    now: DateTime<Utc>,
    max_skew: Duration,
) -> Result<Identity, ContextError> {
    let get = |name: &'static str| {
        headers
            .get(name)
            .ok_or(ContextError::Missing(name))?
            .to_str()
            .map(str::to_string)
            .map_err(|_| ContextError::Malformed(format!("{name} is not ASCII")))
    };
    let signed = SignedContext {
        identity: get(IDENTITY_HEADER)?,
        timestamp: get(TIMESTAMP_HEADER)?,
        signature: get(SIGNATURE_HEADER)?,
    };
    signer.verify(&signed, now, max_skew)
}
