use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::authority::ComponentHealth;
use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub service: String,
    pub services: BTreeMap<String, CheckResult>,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: Some(detail.into()),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn bounded<F>(limit: Duration, what: &str, check: F) -> CheckResult
where
    F: Future<Output = CheckResult>,
{
    tokio::time::timeout(limit, check)
        .await
        .unwrap_or_else(|_| CheckResult::unhealthy(format!("{what} timed out after {limit:?}")))
}

async fn check_keydb(state: &AppState) -> CheckResult {
    match state.verdicts.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e:#}")),
    }
}

async fn check_authority(state: &AppState) -> CheckResult {
    match state.authority.health_check().await {
        Ok(health) if health.is_healthy() => CheckResult::healthy(),
        Ok(health) => CheckResult::unhealthy(format!("reported {}", health.status)),
        Err(e) => CheckResult::unhealthy(e.to_string()),
    }
}

/// `GET {base}/health`.  A 2xx answer counts as healthy unless its body
/// explicitly reports another status.
async fn check_downstream(client: &reqwest::Client, base: &str) -> CheckResult {
    let url = format!("{}/health", base.trim_end_matches('/'));
    let resp = match client.get(&url).send().await {
        Ok(resp) => resp,
        Err(e) => return CheckResult::unhealthy(format!("GET {url} failed: {e}")),
    };
    let status = resp.status();
    if !status.is_success() {
        return CheckResult::unhealthy(format!("GET {url} returned {status}"));
    }
    match resp.json::<ComponentHealth>().await {
        Ok(health) if !health.is_healthy() => {
            CheckResult::unhealthy(format!("reported {}", health.status))
        }
        _ => CheckResult::healthy(),
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub async fn collect(state: &AppState) -> HealthResponse {
    let authority_limit = Duration::from_millis(state.config.authority.timeout_ms);
    let keydb_limit = Duration::from_millis(state.config.keydb.op_timeout_ms);

    let downstream = futures::future::join_all(state.config.services.iter().map(
        move |(name, service)| async move {
            let result = bounded(
                authority_limit,
                name,
                check_downstream(&state.http_client, &service.url),
            )
            .await;
            (name.clone(), result)
        },
    ));

    let (keydb, authority, downstream) = tokio::join!(
        bounded(keydb_limit, "keydb", check_keydb(state)),
        bounded(authority_limit, "authority", check_authority(state)),
        downstream,
    );

    let mut services = BTreeMap::new();
    services.insert("keydb".to_string(), keydb);
    services.insert(state.config.authority.service_name.clone(), authority);
    services.extend(downstream);

    let status = if services.values().all(CheckResult::is_healthy) {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy
    };

    HealthResponse {
        status,
        service: state.config.proxy.service_name.clone(),
        services,
    }
}

pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = collect(&state).await;
    let code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(response))
}
