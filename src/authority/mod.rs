//! Credential authority contract.
//!
//! The authority issues credentials at login and is the only component
//! that can say whether a presented credential is valid.  The relay talks
//! to it exclusively through [`CredentialAuthority`] so that transport
//! details stay inside this module.

pub mod http;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::error::AuthnReason;
use crate::auth::verdict::Identity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

/// A freshly issued bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// The authority's answer to `Validate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accepted {
        identity: Identity,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    Rejected {
        reason: AuthnReason,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(alias = "component")]
    pub service: String,
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    /// Login refused (unknown identifier or wrong secret).
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// The request itself was malformed or conflicted with existing state.
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Transport failure, timeout, 5xx or an unparseable reply.
    #[error("authority unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait CredentialAuthority: Send + Sync {
    async fn register(&self, registration: &Registration) -> Result<Identity, AuthorityError>;

    async fn login(&self, identifier: &str, secret: &str)
        -> Result<IssuedCredential, AuthorityError>;

    /// A rejected credential is `Ok(Validation::Rejected)`; only failures
    /// to obtain an answer are errors.
    async fn validate(&self, credential: &str) -> Result<Validation, AuthorityError>;

    async fn health_check(&self) -> Result<ComponentHealth, AuthorityError>;
}
