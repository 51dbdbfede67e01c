use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    pub keydb: KeyDbConfig,
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub degraded: DegradedConfig,
    #[serde(default)]
    pub identity_context: IdentityContextConfig,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8000`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Name reported by `GET /health`.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            service_name: default_service_name(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_service_name() -> String {
    "api-gateway".to_string()
}

// ---------------------------------------------------------------------------
// KeyDB / Redis (verdict cache + rate ledger)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound on a single cache or ledger round trip.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_op_timeout_ms() -> u64 {
    250
}

// ---------------------------------------------------------------------------
// Credential authority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    /// Base URL of the credential authority (e.g. `http://auth-service:8000`).
    pub url: String,
    #[serde(default = "default_authority_timeout_ms")]
    pub timeout_ms: u64,
    /// Delay before the single retry of a failed authority call.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_authority_service_name")]
    pub service_name: String,
}

fn default_authority_timeout_ms() -> u64 {
    2_000
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_authority_service_name() -> String {
    "auth-service".to_string()
}

// ---------------------------------------------------------------------------
// Verdict cache TTLs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Positive verdict TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Negative (rejected) verdict TTL in seconds.
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl_secs: u64,
    /// How long past its nominal TTL an accepted verdict may still be served
    /// while the authority is unreachable.
    #[serde(default = "default_max_staleness")]
    pub max_staleness_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            negative_ttl_secs: default_negative_ttl(),
            max_staleness_secs: default_max_staleness(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_negative_ttl() -> u64 {
    30
}

fn default_max_staleness() -> u64 {
    900
}

// ---------------------------------------------------------------------------
// Rate ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Units of cost an identity may spend per window.
    #[serde(default = "default_budget")]
    pub budget: u64,
    /// Header carrying the caller's idempotency token.
    #[serde(default = "default_idempotency_header")]
    pub idempotency_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            budget: default_budget(),
            idempotency_header: default_idempotency_header(),
        }
    }
}

fn default_window_secs() -> u64 {
    60
}

fn default_budget() -> u64 {
    1000
}

fn default_idempotency_header() -> String {
    "Idempotency-Key".to_string()
}

// ---------------------------------------------------------------------------
// Circuit breaker + degraded mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive authority failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Failures further apart than this do not count as consecutive.
    #[serde(default = "default_error_window")]
    pub error_window_secs: u64,
    /// Time spent open before a half-open probe is allowed.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            error_window_secs: default_error_window(),
            cooldown_secs: default_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_error_window() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    15
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradedPolicy {
    /// Reject every request that needs the authority.
    #[default]
    FailClosed,
    /// Serve previously accepted verdicts past their TTL, bounded by
    /// `cache.max_staleness_secs` and the credential's own expiry.
    ServeStale,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DegradedConfig {
    #[serde(default)]
    pub policy: DegradedPolicy,
    /// Stale verdicts are only served if the authority answered within
    /// this many seconds.
    #[serde(default = "default_reachability_grace")]
    pub reachability_grace_secs: u64,
}

impl Default for DegradedConfig {
    fn default() -> Self {
        Self {
            policy: DegradedPolicy::default(),
            reachability_grace_secs: default_reachability_grace(),
        }
    }
}

fn default_reachability_grace() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Identity context propagation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityContextConfig {
    /// Name of the environment variable holding the HMAC key used to sign
    /// identity context for downstream services.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
    /// Maximum age of a signed identity context a downstream should accept.
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: u64,
}

impl Default for IdentityContextConfig {
    fn default() -> Self {
        Self {
            signing_key_env: default_signing_key_env(),
            max_skew_secs: default_max_skew(),
        }
    }
}

fn default_signing_key_env() -> String {
    "AUTHRELAY_CONTEXT_KEY".to_string()
}

fn default_max_skew() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Downstream services + routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the downstream service.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub method: String,
    /// Path template, e.g. `/appointments/{id}`.
    pub path: String,
    pub service: String,
    /// Rate budget units consumed per call.
    #[serde(default = "default_route_cost")]
    pub cost: u64,
    /// Public routes skip authorization when no credential is presented.
    #[serde(default)]
    pub public: bool,
    /// Only privileged identities may call this route.
    #[serde(default)]
    pub privileged: bool,
}

fn default_route_cost() -> u64 {
    1
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`, then apply
/// environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Override selected options from the environment.  `lookup` is injected so
/// tests do not have to mutate the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("AUTHRELAY_AUTHORITY_URL") {
        config.authority.url = url;
    }
    if let Some(endpoint) = lookup("AUTHRELAY_KEYDB_ENDPOINT") {
        config.keydb.endpoint = endpoint;
    }
    if let Some(budget) = lookup("AUTHRELAY_RATE_BUDGET") {
        config.rate_limit.budget = budget
            .parse()
            .with_context(|| format!("invalid AUTHRELAY_RATE_BUDGET: {budget}"))?;
    }
    if let Some(window) = lookup("AUTHRELAY_RATE_WINDOW_SECS") {
        config.rate_limit.window_secs = window
            .parse()
            .with_context(|| format!("invalid AUTHRELAY_RATE_WINDOW_SECS: {window}"))?;
    }
    if let Some(ttl) = lookup("AUTHRELAY_CACHE_TTL_SECS") {
        config.cache.ttl_secs = ttl
            .parse()
            .with_context(|| format!("invalid AUTHRELAY_CACHE_TTL_SECS: {ttl}"))?;
    }
    Ok(())
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.rate_limit.budget > 0, "rate_limit.budget must be > 0");
    anyhow::ensure!(
        config.rate_limit.window_secs > 0,
        "rate_limit.window_secs must be > 0"
    );
    anyhow::ensure!(config.cache.ttl_secs > 0, "cache.ttl_secs must be > 0");
    anyhow::ensure!(
        config.cache.negative_ttl_secs <= config.cache.ttl_secs,
        "cache.negative_ttl_secs must not exceed cache.ttl_secs"
    );
    anyhow::ensure!(
        config.circuit.failure_threshold > 0,
        "circuit.failure_threshold must be > 0"
    );
    anyhow::ensure!(config.keydb.op_timeout_ms > 0, "keydb.op_timeout_ms must be > 0");
    anyhow::ensure!(config.authority.timeout_ms > 0, "authority.timeout_ms must be > 0");

    let mut seen = HashSet::new();
    for route in &config.routes {
        anyhow::ensure!(
            config.services.contains_key(&route.service),
            "route {} {} references unknown service '{}'",
            route.method,
            route.path,
            route.service
        );
        anyhow::ensure!(
            route.public || route.cost > 0,
            "route {} {} must have a cost > 0",
            route.method,
            route.path
        );
        anyhow::ensure!(
            route.path.starts_with('/'),
            "route path must start with '/': {}",
            route.path
        );
        anyhow::ensure!(
            seen.insert((route.method.to_ascii_uppercase(), route.path.clone())),
            "duplicate route {} {}",
            route.method,
            route.path
        );
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_config() -> Config {
    let yaml = r#"
keydb:
  endpoint: redis://keydb.local:6379
authority:
  url: http://auth-service:8000
services:
  scheduling:
    url: http://appointment-service:8000
  notification:
    url: http://notification-service:8000
routes:
  - { method: POST, path: /appointments, service: scheduling }
  - { method: GET, path: /appointments, service: scheduling }
  - { method: GET, path: "/appointments/{id}", service: scheduling }
  - { method: POST, path: /notifications/batch, service: notification, cost: 10, privileged: true }
  - { method: GET, path: /slots, service: scheduling, public: true }
"#;
    serde_yaml::from_str(yaml).unwrap()
}
