//! Rejection taxonomy shared by the relay and the HTTP edge.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a credential did not authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthnReason {
    MissingCredential,
    InvalidCredential,
    ExpiredCredential,
}

impl AuthnReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthnReason::MissingCredential => "missing_credential",
            AuthnReason::InvalidCredential => "invalid_credential",
            AuthnReason::ExpiredCredential => "expired_credential",
        }
    }
}

impl fmt::Display for AuthnReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an authenticated identity was still turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthzReason {
    RateLimited,
    PermissionDenied,
    InactiveIdentity,
}

impl AuthzReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthzReason::RateLimited => "rate_limited",
            AuthzReason::PermissionDenied => "permission_denied",
            AuthzReason::InactiveIdentity => "inactive_identity",
        }
    }
}

impl fmt::Display for AuthzReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(AuthnReason),

    #[error("unauthorized: {reason}")]
    Unauthorized {
        reason: AuthzReason,
        /// Seconds until the current rate window rolls over.
        retry_after_secs: Option<u64>,
    },

    #[error("credential authority unavailable")]
    AuthorityUnavailable,

    #[error("rate ledger unavailable")]
    LedgerUnavailable,

    #[error("validation error: {0}")]
    Validation(String),
}

impl RelayError {
    pub fn unauthorized(reason: AuthzReason) -> Self {
        RelayError::Unauthorized {
            reason,
            retry_after_secs: None,
        }
    }

    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Unauthenticated(reason) => reason.as_str(),
            RelayError::Unauthorized { reason, .. } => reason.as_str(),
            RelayError::AuthorityUnavailable => "authority_unavailable",
            RelayError::LedgerUnavailable => "ledger_unavailable",
            RelayError::Validation(_) => "validation_error",
        }
    }

    /// Coarse category, matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Unauthenticated(_) => "unauthenticated",
            RelayError::Unauthorized { .. } => "unauthorized",
            RelayError::AuthorityUnavailable => "authority_unavailable",
            RelayError::LedgerUnavailable => "ledger_unavailable",
            RelayError::Validation(_) => "validation_error",
        }
    }

    /// Human-readable message that tells the client what to do next.
    pub fn message(&self) -> String {
        match self {
            RelayError::Unauthenticated(AuthnReason::MissingCredential) => {
                "Not authenticated".to_string()
            }
            RelayError::Unauthenticated(AuthnReason::ExpiredCredential) => {
                "Credential expired, log in again".to_string()
            }
            RelayError::Unauthenticated(AuthnReason::InvalidCredential) => {
                "Invalid authentication credentials".to_string()
            }
            RelayError::Unauthorized {
                reason: AuthzReason::RateLimited,
                ..
            } => "Request budget exhausted, slow down".to_string(),
            RelayError::Unauthorized {
                reason: AuthzReason::PermissionDenied,
                ..
            } => "Insufficient privileges for this operation".to_string(),
            RelayError::Unauthorized {
                reason: AuthzReason::InactiveIdentity,
                ..
            } => "Inactive user".to_string(),
            RelayError::AuthorityUnavailable => {
                "Identity service unavailable, try again later".to_string()
            }
            RelayError::LedgerUnavailable => {
                "Rate ledger unavailable, try again later".to_string()
            }
            RelayError::Validation(msg) => msg.clone(),
        }
    }
}
