use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::AuthnReason;

/// The authenticated principal, as last reported by the credential
/// authority.  The relay only ever holds a read-through copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "bool_true")]
    pub active: bool,
    #[serde(default)]
    pub privileged: bool,
}

fn bool_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    Accept {
        identity: Identity,
        /// Issuance time declared by the authority.  The credential is not
        /// valid before it.  Entries written without it default to the epoch.
        #[serde(default)]
        credential_issued_at: DateTime<Utc>,
        /// Expiry declared by the authority for the credential itself.
        credential_expires_at: DateTime<Utc>,
    },
    Reject {
        reason: AuthnReason,
    },
}

impl Verdict {
    /// Whether an accepted credential is inside its own validity interval.
    /// Rejections are always "within" it.
    pub fn credential_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Verdict::Accept {
                credential_issued_at,
                credential_expires_at,
                ..
            } => *credential_issued_at <= now && now < *credential_expires_at,
            Verdict::Reject { .. } => true,
        }
    }
}

/// A verdict as stored in the shared validation cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedVerdict {
    #[serde(flatten)]
    pub verdict: Verdict,
    /// End of the nominal cache lifetime.  Never later than the credential's
    /// own expiry.
    pub valid_until: DateTime<Utc>,
    /// When the authority produced this verdict.
    pub cached_at: DateTime<Utc>,
}

impl CachedVerdict {
    pub fn accept(
        identity: Identity,
        credential_issued_at: DateTime<Utc>,
        credential_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let valid_until = credential_expires_at.min(saturating_add(now, ttl));
        Self {
            verdict: Verdict::Accept {
                identity,
                credential_issued_at,
                credential_expires_at,
            },
            valid_until,
            cached_at: now,
        }
    }

    pub fn reject(reason: AuthnReason, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            verdict: Verdict::Reject { reason },
            valid_until: saturating_add(now, ttl),
            cached_at: now,
        }
    }

    /// Whether the verdict may be used without asking the authority.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.valid_until && self.verdict.credential_valid_at(now)
    }

    /// The identity of an accepted verdict that is past its nominal TTL but
    /// still inside `max_staleness` and the credential's own lifetime.
    pub fn stale_identity(&self, now: DateTime<Utc>, max_staleness: Duration) -> Option<&Identity> {
        match &self.verdict {
            Verdict::Accept { identity, .. }
                if self.verdict.credential_valid_at(now)
                    && now < saturating_add(self.valid_until, max_staleness) =>
            {
                Some(identity)
            }
            _ => None,
        }
    }

    /// How long the shared store should keep this entry.  Accepted verdicts
    /// outlive their nominal TTL by `max_staleness` so degraded mode can use
    /// them, but never outlive the credential.
    pub fn store_ttl(&self, now: DateTime<Utc>, max_staleness: Duration) -> Duration {
        let until = match &self.verdict {
            Verdict::Accept {
                credential_expires_at,
                ..
            } => (*credential_expires_at).min(saturating_add(self.valid_until, max_staleness)),
            Verdict::Reject { .. } => self.valid_until,
        };
        (until - now).to_std().unwrap_or(Duration::ZERO)
    }
}

fn saturating_add(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
