//! The authorization relay.
//!
//! `authorize(credential, route)` runs two independent, sequential gates:
//!
//! 1. **Authentication.**  Fingerprint the credential and look for a live
//!    verdict in the shared cache.  On a miss, ask the credential authority
//!    (bounded retry, explicit timeout, guarded by the circuit breaker) and
//!    cache the answer; rejections are cached too, with a short TTL.  When
//!    the authority cannot be reached the degraded-mode policy decides
//!    between failing closed and serving a stale accepted verdict.
//! 2. **Budget.**  Charge `route.cost` to the identity's current fixed
//!    window in the shared rate ledger.
//!
//! No verdict ever outlives the credential's own expiry, and no failure of
//! the authority, cache or ledger is ever turned into an allow.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::{fingerprint, short, VerdictStore};
use super::circuit::{Admission, CircuitBreaker, CircuitSettings, CircuitState};
use super::error::{AuthnReason, AuthzReason, RelayError};
use super::verdict::{CachedVerdict, Identity, Verdict};
use crate::authority::{AuthorityError, CredentialAuthority, Validation};
use crate::clock::Clock;
use crate::config::{Config, DegradedPolicy};
use crate::ledger::{LedgerRequest, RateLedger, Window};
use crate::metrics::{AuthorityOutcome, LedgerOutcome, Metrics};
use crate::resilience::{self, CallError, RetryPolicy};
use crate::routes::Route;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub cache_ttl: Duration,
    pub negative_ttl: Duration,
    pub max_staleness: Duration,
    pub budget: u64,
    pub window: Duration,
    pub degraded_policy: DegradedPolicy,
    pub reachability_grace: Duration,
    pub circuit: CircuitSettings,
    pub authority_policy: RetryPolicy,
    pub store_policy: RetryPolicy,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_ttl: Duration::from_secs(config.cache.ttl_secs),
            negative_ttl: Duration::from_secs(config.cache.negative_ttl_secs),
            max_staleness: Duration::from_secs(config.cache.max_staleness_secs),
            budget: config.rate_limit.budget,
            window: Duration::from_secs(config.rate_limit.window_secs),
            degraded_policy: config.degraded.policy,
            reachability_grace: Duration::from_secs(config.degraded.reachability_grace_secs),
            circuit: CircuitSettings::from(&config.circuit),
            authority_policy: RetryPolicy::retry_once(
                Duration::from_millis(config.authority.timeout_ms),
                Duration::from_millis(config.authority.retry_backoff_ms),
            ),
            store_policy: RetryPolicy::retry_once(
                Duration::from_millis(config.keydb.op_timeout_ms),
                Duration::from_millis(config.authority.retry_backoff_ms),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / decision types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    /// Bearer credential, if one was presented.
    pub credential: Option<String>,
    pub route: Arc<Route>,
    /// Caller-supplied token identifying one logical request across retries.
    pub idempotency_key: Option<String>,
}

/// Where the identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// Public route, no credential presented.
    Public,
    Cache,
    Authority,
    /// Accepted verdict served past its TTL while the authority is down.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub source: DecisionSource,
    pub cost: u64,
    /// Budget left in the current window; `None` when nothing was charged.
    pub remaining: Option<u64>,
    pub window_resets_at: Option<DateTime<Utc>>,
    /// The ledger replayed an earlier decision for the same idempotency key.
    pub replayed: bool,
}

impl Decision {
    fn uncharged(source: DecisionSource) -> Self {
        Self {
            source,
            cost: 0,
            remaining: None,
            window_resets_at: None,
            replayed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub identity: Option<Identity>,
    pub decision: Decision,
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

pub struct Relay {
    settings: RelaySettings,
    authority: Arc<dyn CredentialAuthority>,
    verdicts: Arc<dyn VerdictStore>,
    ledger: Arc<dyn RateLedger>,
    circuit: CircuitBreaker,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl Relay {
    pub fn new(
        settings: RelaySettings,
        authority: Arc<dyn CredentialAuthority>,
        verdicts: Arc<dyn VerdictStore>,
        ledger: Arc<dyn RateLedger>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let circuit = CircuitBreaker::new(settings.circuit.clone());
        Self {
            settings,
            authority,
            verdicts,
            ledger,
            circuit,
            clock,
            metrics,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Authenticate the caller and charge the route's cost to its budget.
    pub async fn authorize(&self, request: &AuthorizeRequest) -> Result<Authorization, RelayError> {
        let started = Instant::now();
        let result = self.authorize_inner(request).await;
        self.metrics
            .authorize_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            self.metrics.rejection(e.code());
            debug!(route = %request.route.label(), code = e.code(), "request rejected");
        }
        result
    }

    async fn authorize_inner(&self, request: &AuthorizeRequest) -> Result<Authorization, RelayError> {
        let route = &request.route;
        let credential = request
            .credential
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let Some(credential) = credential else {
            if route.public {
                return Ok(Authorization {
                    identity: None,
                    decision: Decision::uncharged(DecisionSource::Public),
                });
            }
            return Err(RelayError::Unauthenticated(AuthnReason::MissingCredential));
        };

        let (identity, source) = self.authenticate(credential).await?;
        check_attributes(&identity, route)?;
        let decision = self
            .charge(&identity, route, request.idempotency_key.as_deref(), source)
            .await?;

        Ok(Authorization {
            identity: Some(identity),
            decision,
        })
    }

    // -- gate 1: authentication ---------------------------------------------

    async fn authenticate(&self, credential: &str) -> Result<(Identity, DecisionSource), RelayError> {
        let fp = fingerprint(credential);
        let now = self.clock.now();
        let cached = self.read_verdict(&fp).await;

        if let Some(verdict) = &cached {
            if verdict.is_live(now) {
                self.metrics.verdict_cache_hits.inc();
                return match &verdict.verdict {
                    Verdict::Accept { identity, .. } => Ok((identity.clone(), DecisionSource::Cache)),
                    Verdict::Reject { reason } => Err(RelayError::Unauthenticated(*reason)),
                };
            }
            // A credential is never valid at or after its own expiry; no need
            // to ask anyone.
            if let Verdict::Accept {
                credential_expires_at,
                ..
            } = &verdict.verdict
            {
                if now >= *credential_expires_at {
                    return Err(RelayError::Unauthenticated(AuthnReason::ExpiredCredential));
                }
            }
        }
        self.metrics.verdict_cache_misses.inc();

        let admission = self.circuit.admit(now);
        self.publish_circuit_state();
        let policy = match admission {
            Admission::Call => self.settings.authority_policy,
            Admission::Probe => {
                info!(fp = short(&fp), "probing credential authority");
                self.settings.authority_policy.single()
            }
            Admission::Rejected => {
                debug!(fp = short(&fp), "circuit open, authority not called");
                return self.degraded(&fp, cached.as_ref(), now);
            }
        };

        let answer = resilience::call(policy, "authority validate", || {
            self.authority.validate(credential)
        })
        .await;
        let now = self.clock.now();

        match answer {
            Ok(Validation::Accepted {
                identity,
                issued_at,
                expires_at,
            }) => {
                self.circuit.record_success(now);
                self.publish_circuit_state();
                self.metrics.authority_call(AuthorityOutcome::Accepted);
                if now >= expires_at {
                    warn!(fp = short(&fp), "authority accepted an expired credential");
                    return Err(RelayError::Unauthenticated(AuthnReason::ExpiredCredential));
                }
                if now < issued_at {
                    warn!(fp = short(&fp), %issued_at, "authority accepted a credential issued in the future");
                    return Err(RelayError::Unauthenticated(AuthnReason::InvalidCredential));
                }
                let verdict = CachedVerdict::accept(
                    identity.clone(),
                    issued_at,
                    expires_at,
                    now,
                    self.settings.cache_ttl,
                );
                self.write_verdict(&fp, &verdict, now).await;
                Ok((identity, DecisionSource::Authority))
            }
            Ok(Validation::Rejected { reason }) => {
                self.circuit.record_success(now);
                self.publish_circuit_state();
                self.metrics.authority_call(AuthorityOutcome::Rejected);
                let verdict = CachedVerdict::reject(reason, now, self.settings.negative_ttl);
                self.write_verdict(&fp, &verdict, now).await;
                Err(RelayError::Unauthenticated(reason))
            }
            Err(CallError::Failed(AuthorityError::Unauthenticated(detail)))
            | Err(CallError::Failed(AuthorityError::Invalid(detail))) => {
                // The authority answered, just not with a validation body.
                self.circuit.record_success(now);
                self.publish_circuit_state();
                self.metrics.authority_call(AuthorityOutcome::Rejected);
                debug!(fp = short(&fp), %detail, "authority refused credential");
                let reason = AuthnReason::InvalidCredential;
                let verdict = CachedVerdict::reject(reason, now, self.settings.negative_ttl);
                self.write_verdict(&fp, &verdict, now).await;
                Err(RelayError::Unauthenticated(reason))
            }
            Err(e) => {
                self.circuit.record_failure(now);
                self.publish_circuit_state();
                self.metrics.authority_call(AuthorityOutcome::Failed);
                warn!(fp = short(&fp), error = %e, "credential authority call failed");
                self.degraded(&fp, cached.as_ref(), now)
            }
        }
    }

    /// Authority unreachable or circuit open.  Never fabricates trust for a
    /// credential without a prior accepted verdict.
    fn degraded(
        &self,
        fp: &str,
        cached: Option<&CachedVerdict>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, DecisionSource), RelayError> {
        let Some(verdict) = cached else {
            return Err(RelayError::AuthorityUnavailable);
        };
        match &verdict.verdict {
            Verdict::Reject { reason } => Err(RelayError::Unauthenticated(*reason)),
            Verdict::Accept { .. } => {
                if self.settings.degraded_policy != DegradedPolicy::ServeStale
                    || !self.recently_reachable(verdict, now)
                {
                    return Err(RelayError::AuthorityUnavailable);
                }
                match verdict.stale_identity(now, self.settings.max_staleness) {
                    Some(identity) => {
                        self.metrics.stale_verdicts_served.inc();
                        warn!(
                            fp = short(fp),
                            cached_at = %verdict.cached_at,
                            "serving stale verdict in degraded mode"
                        );
                        Ok((identity.clone(), DecisionSource::Stale))
                    }
                    None => Err(RelayError::AuthorityUnavailable),
                }
            }
        }
    }

    /// Whether the authority was confirmed reachable recently enough for a
    /// stale verdict to be trusted.
    fn recently_reachable(&self, verdict: &CachedVerdict, now: DateTime<Utc>) -> bool {
        let last_seen = match self.circuit.last_success() {
            Some(at) => at.max(verdict.cached_at),
            None => verdict.cached_at,
        };
        (now - last_seen)
            .to_std()
            .map(|age| age <= self.settings.reachability_grace)
            .unwrap_or(true)
    }

    // -- gate 2: budget -----------------------------------------------------

    async fn charge(
        &self,
        identity: &Identity,
        route: &Route,
        idempotency_key: Option<&str>,
        source: DecisionSource,
    ) -> Result<Decision, RelayError> {
        if route.cost == 0 {
            return Ok(Decision::uncharged(source));
        }

        let now = self.clock.now();
        let window = Window::containing(now, self.settings.window);
        let scope = route.label();
        let request = LedgerRequest {
            identity: &identity.id,
            cost: route.cost,
            budget: self.settings.budget,
            window,
            scope: &scope,
            idempotency_key,
        };
        // Without an idempotency key a retried increment could double-charge.
        let policy = if idempotency_key.is_some() {
            self.settings.store_policy
        } else {
            self.settings.store_policy.single()
        };

        let decision = resilience::call(policy, "ledger check", || {
            self.ledger.check_and_increment(&request)
        })
        .await
        .map_err(|e| {
            self.metrics.ledger_decision(LedgerOutcome::Error);
            warn!(identity = %identity.id, error = %e, "rate ledger unavailable");
            RelayError::LedgerUnavailable
        })?;

        self.metrics.ledger_decision(match (decision.replayed, decision.allowed) {
            (true, _) => LedgerOutcome::Replayed,
            (false, true) => LedgerOutcome::Allowed,
            (false, false) => LedgerOutcome::Denied,
        });

        if !decision.allowed {
            info!(
                identity = %identity.id,
                route = %route.label(),
                count = decision.count,
                budget = self.settings.budget,
                "rate budget exhausted"
            );
            return Err(RelayError::Unauthorized {
                reason: AuthzReason::RateLimited,
                retry_after_secs: Some(window.retry_after_secs(now)),
            });
        }

        Ok(Decision {
            source,
            cost: route.cost,
            remaining: Some(decision.remaining),
            window_resets_at: Some(window.resets_at()),
            replayed: decision.replayed,
        })
    }

    // -- cache plumbing -----------------------------------------------------

    async fn read_verdict(&self, fp: &str) -> Option<CachedVerdict> {
        match resilience::call(self.settings.store_policy, "verdict get", || self.verdicts.get(fp)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(fp = short(fp), error = %e, "verdict cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write_verdict(&self, fp: &str, verdict: &CachedVerdict, now: DateTime<Utc>) {
        let ttl = verdict.store_ttl(now, self.settings.max_staleness);
        let written = resilience::call(self.settings.store_policy, "verdict put", || {
            self.verdicts.put(fp, verdict, ttl)
        })
        .await;
        if let Err(e) = written {
            warn!(fp = short(fp), error = %e, "verdict cache write failed");
        }
    }

    /// Drop any cached verdict for `credential`.  Called after a successful
    /// login so a stale negative verdict cannot shadow the fresh credential.
    pub async fn forget_credential(&self, credential: &str) -> anyhow::Result<bool> {
        let fp = fingerprint(credential);
        resilience::call(self.settings.store_policy, "verdict remove", || {
            self.verdicts.remove(&fp)
        })
        .await
        .map_err(|e| anyhow::anyhow!("verdict cache remove failed: {e}"))
    }

    fn publish_circuit_state(&self) {
        self.metrics
            .circuit_state
            .set(self.circuit.state().as_gauge());
    }
}

/// Attribute checks between authentication and budget.
fn check_attributes(identity: &Identity, route: &Route) -> Result<(), RelayError> {
    if !identity.active {
        return Err(RelayError::unauthorized(AuthzReason::InactiveIdentity));
    }
    if route.privileged && !identity.privileged {
        return Err(RelayError::unauthorized(AuthzReason::PermissionDenied));
    }
    Ok(())
}
