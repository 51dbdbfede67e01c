use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AuthorityOutcome {
    Accepted,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthorityLabels {
    pub outcome: AuthorityOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum LedgerOutcome {
    Allowed,
    Denied,
    Replayed,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LedgerLabels {
    pub outcome: LedgerOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    pub service: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the relay.
pub struct Metrics {
    // -- verdict cache --
    pub verdict_cache_hits: Counter,
    pub verdict_cache_misses: Counter,
    pub stale_verdicts_served: Counter,

    // -- authority --
    pub authority_calls: Family<AuthorityLabels, Counter>,
    pub circuit_state: Gauge,

    // -- ledger --
    pub ledger_decisions: Family<LedgerLabels, Counter>,

    // -- edge --
    pub rejections: Family<ReasonLabels, Counter>,
    pub forwarded_requests: Family<ServiceLabels, Counter>,
    pub authorize_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let verdict_cache_hits = Counter::default();
        registry.register(
            "authrelay_verdict_cache_hits",
            "Requests answered from a live cached verdict",
            verdict_cache_hits.clone(),
        );

        let verdict_cache_misses = Counter::default();
        registry.register(
            "authrelay_verdict_cache_misses",
            "Requests with no live cached verdict",
            verdict_cache_misses.clone(),
        );

        let stale_verdicts_served = Counter::default();
        registry.register(
            "authrelay_stale_verdicts_served",
            "Accepted verdicts served past their TTL in degraded mode",
            stale_verdicts_served.clone(),
        );

        let authority_calls = Family::<AuthorityLabels, Counter>::default();
        registry.register(
            "authrelay_authority_calls",
            "Credential authority validate calls by outcome",
            authority_calls.clone(),
        );

        let circuit_state: Gauge = Gauge::default();
        registry.register(
            "authrelay_circuit_state",
            "Authority circuit state (0 closed, 1 half-open, 2 open)",
            circuit_state.clone(),
        );

        let ledger_decisions = Family::<LedgerLabels, Counter>::default();
        registry.register(
            "authrelay_ledger_decisions",
            "Rate ledger decisions by outcome",
            ledger_decisions.clone(),
        );

        let rejections = Family::<ReasonLabels, Counter>::default();
        registry.register(
            "authrelay_rejections",
            "Rejected requests by reason code",
            rejections.clone(),
        );

        let forwarded_requests = Family::<ServiceLabels, Counter>::default();
        registry.register(
            "authrelay_forwarded_requests",
            "Requests forwarded downstream by service",
            forwarded_requests.clone(),
        );

        let authorize_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "authrelay_authorize_duration_seconds",
            "Time spent reaching an authorization decision",
            authorize_duration_seconds.clone(),
        );

        Self {
            verdict_cache_hits,
            verdict_cache_misses,
            stale_verdicts_served,
            authority_calls,
            circuit_state,
            ledger_decisions,
            rejections,
            forwarded_requests,
            authorize_duration_seconds,
        }
    }

    pub fn authority_call(&self, outcome: AuthorityOutcome) {
        self.authority_calls
            .get_or_create(&AuthorityLabels { outcome })
            .inc();
    }

    pub fn ledger_decision(&self, outcome: LedgerOutcome) {
        self.ledger_decisions
            .get_or_create(&LedgerLabels { outcome })
            .inc();
    }

    pub fn rejection(&self, reason: &str) {
        self.rejections
            .get_or_create(&ReasonLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn forwarded(&self, service: &str) {
        self.forwarded_requests
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Registry plus metrics, shared through `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)
            .map_err(|e| anyhow::anyhow!("metrics encoding failed: {e}"))?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
