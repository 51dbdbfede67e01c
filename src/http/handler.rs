//! Axum router and request handlers for the relay.
//!
//! Routes:
//! - `POST /auth/register` - account creation, passed to the authority
//! - `POST /auth/login`    - form login, returns a bearer credential
//! - `GET  /auth/me`       - the caller's identity, resolved by the relay
//! - `GET  /health`        - dependency health
//! - `GET  /metrics`       - Prometheus metrics
//! - anything else         - matched against the route table, authorised
//!   and forwarded to the owning service

use std::sync::Arc;

use axum::{
    extract::{rejection::FormRejection, rejection::JsonRejection, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::error::AppError;
use super::forward;
use super::request_id::{self, RequestId};
use crate::auth::cache::{fingerprint, short};
use crate::auth::context::RequestContext;
use crate::auth::error::{AuthnReason, RelayError};
use crate::auth::middleware::{authorize_detached, bearer_credential, idempotency_key};
use crate::auth::relay::{AuthorizeRequest, Authorization, Decision};
use crate::authority::Registration;
use crate::routes::{Route, RouteLookup};
use crate::AppState;

pub const RATE_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_RESET_HEADER: &str = "x-ratelimit-reset";

const MIN_PASSWORD_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/register", post(handle_register))
        .route("/auth/login", post(handle_login))
        .route("/auth/me", get(handle_me))
        .route("/health", get(crate::health::handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_forward)
        .layer(middleware::from_fn(request_id::assign_request_id))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Account handlers
// ---------------------------------------------------------------------------

/// Edge checks on a registration before the authority sees it.
pub fn validate_registration(registration: &Registration) -> Result<(), RelayError> {
    let email = registration.email.trim();
    if email.is_empty() {
        return Err(RelayError::Validation("email is required".to_string()));
    }
    let well_formed = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        }
        None => false,
    };
    if !well_formed || email.chars().any(char::is_whitespace) {
        return Err(RelayError::Validation(format!("invalid email address: {email}")));
    }
    if registration.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(RelayError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if registration.full_name.trim().is_empty() {
        return Err(RelayError::Validation("full_name is required".to_string()));
    }
    Ok(())
}

/// `POST /auth/register`
#[instrument(skip_all)]
async fn handle_register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Registration>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(mut registration) =
        payload.map_err(|e| RelayError::Validation(e.body_text()))?;
    registration.email = registration.email.trim().to_string();
    validate_registration(&registration)?;

    let identity = state.authority.register(&registration).await?;
    info!(identity = %identity.id, "account registered");
    Ok((StatusCode::CREATED, Json(identity)).into_response())
}

/// `POST /auth/login`
///
/// On success any cached verdict for the new credential is dropped, so a
/// negative verdict cached for an earlier holder of the same fingerprint
/// cannot shadow it.
#[instrument(skip_all)]
async fn handle_login(
    State(state): State<Arc<AppState>>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Form(form) = form.map_err(|e| RelayError::Validation(e.body_text()))?;
    if form.username.trim().is_empty() || form.password.is_empty() {
        return Err(RelayError::Validation("username and password are required".to_string()).into());
    }

    let issued = state
        .authority
        .login(form.username.trim(), &form.password)
        .await?;

    match state.relay.forget_credential(&issued.access_token).await {
        Ok(true) => info!(
            fp = short(&fingerprint(&issued.access_token)),
            "dropped cached verdict for new credential"
        ),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "could not invalidate cached verdict at login"),
    }

    Ok(Json(LoginResponse {
        access_token: issued.access_token,
        token_type: issued.token_type,
        expires_at: issued.expires_at,
    }))
}

/// `GET /auth/me`
#[instrument(skip_all)]
async fn handle_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let route = state.routes.current_identity().clone();
    let authorization = authorize(&state, &headers, route).await?;
    let Some(identity) = authorization.identity else {
        return Err(RelayError::Unauthenticated(AuthnReason::MissingCredential).into());
    };
    let mut response = Json(identity).into_response();
    rate_headers(response.headers_mut(), &authorization.decision, state.config.rate_limit.budget);
    Ok(response)
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let body = state.metrics.encode()?;
    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Forwarding
// ---------------------------------------------------------------------------

/// Fallback: route-table lookup, authorization, then pass-through.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
async fn handle_forward(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, AppError> {
    let described = format!("{} {}", request.method(), request.uri().path());
    let route = match state.routes.lookup(request.method(), request.uri().path()) {
        RouteLookup::Found(route) => route.clone(),
        RouteLookup::MethodNotAllowed => return Err(AppError::MethodNotAllowed(described)),
        RouteLookup::NotFound => return Err(AppError::NotFound(described)),
    };
    let Some(service) = route.service.clone() else {
        return Err(AppError::NotFound(described));
    };

    let authorization = authorize(&state, request.headers(), route).await?;

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let ctx = RequestContext {
        request_id,
        identity: authorization.identity,
        decision: authorization.decision,
    };

    let mut response = forward::forward(&state, &service, request, &ctx).await?;
    rate_headers(response.headers_mut(), &ctx.decision, state.config.rate_limit.budget);
    Ok(response)
}

/// Extract credential and idempotency key, then run the relay on its own
/// task.
async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    route: Arc<Route>,
) -> Result<Authorization, AppError> {
    let credential = bearer_credential(headers)?;
    let request = AuthorizeRequest {
        credential,
        route,
        idempotency_key: idempotency_key(headers, &state.config.rate_limit.idempotency_header),
    };
    Ok(authorize_detached(state.relay.clone(), request).await?)
}

/// `X-RateLimit-*` headers for a charged decision.
fn rate_headers(headers: &mut HeaderMap, decision: &Decision, budget: u64) {
    let Some(remaining) = decision.remaining else {
        return;
    };
    headers.insert(RATE_LIMIT_HEADER, HeaderValue::from(budget));
    headers.insert(RATE_REMAINING_HEADER, HeaderValue::from(remaining));
    if let Some(resets_at) = decision.window_resets_at {
        headers.insert(RATE_RESET_HEADER, HeaderValue::from(resets_at.timestamp()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::context::verify_identity_context;
    use crate::auth::verdict::Identity;
    use crate::authority::CredentialAuthority;
    use crate::clock::Clock;
    use crate::config::{Config, ServiceConfig};
    use crate::testing::{identity, serve, TestApp};

    fn registration(email: &str, password: &str, full_name: &str) -> Registration {
        Registration {
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.to_string(),
        }
    }

    /// Config whose services all point at `url`.
    fn config_for(url: &str) -> Config {
        let mut config = crate::config::sample_config();
        for service in config.services.values_mut() {
            *service = ServiceConfig {
                url: url.to_string(),
            };
        }
        config
    }

    fn offline_config() -> Config {
        config_for("http://127.0.0.1:9")
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str, token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::get(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    /// Downstream double that echoes what it received.
    async fn echo_service(app: &TestApp) -> String {
        let signer = app.state.signer.clone();
        let clock = app.clock.clone();
        serve(axum::Router::new().fallback(move |request: Request| {
            let signer = signer.clone();
            let clock = clock.clone();
            async move {
                let headers = request.headers().clone();
                let uri = request.uri().to_string();
                let identity =
                    verify_identity_context(&signer, &headers, clock.now(), Duration::from_secs(30))
                        .ok();
                let body = request.into_body().collect().await.unwrap().to_bytes();
                Json(serde_json::json!({
                    "uri": uri,
                    "identity": identity,
                    "authorization": headers.get(header::AUTHORIZATION).map(|v| v.to_str().unwrap().to_string()),
                    "request_id": headers.get("x-request-id").map(|v| v.to_str().unwrap().to_string()),
                    "body": String::from_utf8_lossy(&body),
                }))
            }
        }))
        .await
    }

    #[test]
    fn registration_rules() {
        assert!(validate_registration(&registration("a@b.io", "longenough", "Ann")).is_ok());
        for bad in [
            registration("", "longenough", "Ann"),
            registration("ann", "longenough", "Ann"),
            registration("ann@localhost", "longenough", "Ann"),
            registration("@b.io", "longenough", "Ann"),
            registration("a b@c.io", "longenough", "Ann"),
            registration("a@b.io", "short", "Ann"),
            registration("a@b.io", "longenough", "  "),
        ] {
            let err = validate_registration(&bad).unwrap_err();
            assert_eq!(err.code(), "validation_error", "{bad:?}");
        }
    }

    #[tokio::test]
    async fn register_then_login_then_me() {
        let app = TestApp::new(offline_config());
        let router = create_router(app.state.clone());

        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::post("/auth/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"{"email":"ann@example.com","password":"correct horse","full_name":"Ann"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(resp.headers().contains_key("x-request-id"));

        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::post("/auth/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("username=ann%40example.com&password=correct+horse"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let login = body_json(resp).await;
        assert_eq!(login["token_type"], "bearer");
        let token = login["access_token"].as_str().unwrap().to_string();

        let resp = router.oneshot(get("/auth/me", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[RATE_REMAINING_HEADER], "999");
        assert_eq!(resp.headers()[RATE_LIMIT_HEADER], "1000");
        let me = body_json(resp).await;
        assert_eq!(me["email"], "ann@example.com");
    }

    #[tokio::test]
    async fn register_rejects_bad_input_before_the_authority() {
        let app = TestApp::new(offline_config());
        app.authority.set_down(true);
        let resp = create_router(app.state.clone())
            .oneshot(
                axum::http::Request::post("/auth/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"email":"nope","password":"x","full_name":"N"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["reason"], "validation_error");
        assert!(body["error"]["request_id"].is_string());
    }

    #[tokio::test]
    async fn duplicate_registration_is_400() {
        let app = TestApp::new(offline_config());
        let router = create_router(app.state.clone());
        let request = || {
            axum::http::Request::post("/auth/register")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"email":"bo@example.com","password":"longenough","full_name":"Bo"}"#,
                ))
                .unwrap()
        };
        assert_eq!(router.clone().oneshot(request()).await.unwrap().status(), StatusCode::CREATED);
        assert_eq!(router.oneshot(request()).await.unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_password_is_401() {
        let app = TestApp::new(offline_config());
        let resp = create_router(app.state.clone())
            .oneshot(
                axum::http::Request::post("/auth/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("username=nobody%40example.com&password=whatever1"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[tokio::test]
    async fn login_drops_a_cached_rejection() {
        let app = TestApp::new(offline_config());
        let router = create_router(app.state.clone());
        app.authority
            .register(&registration("cy@example.com", "longenough", "Cy"))
            .await
            .unwrap();

        // The token the authority will issue next, already cached as invalid.
        let token = format!("tok-1-{}", app.clock.now().timestamp_micros());
        let resp = router.clone().oneshot(get("/auth/me", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(app.verdicts.peek(&fingerprint(&token)).is_some());

        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::post("/auth/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("username=cy%40example.com&password=longenough"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let login = body_json(resp).await;
        assert_eq!(login["access_token"], token.as_str());
        assert!(app.verdicts.peek(&fingerprint(&token)).is_none());

        let resp = router.oneshot(get("/auth/me", Some(&token))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn me_without_credential_is_401() {
        let app = TestApp::new(offline_config());
        let resp = create_router(app.state.clone())
            .oneshot(get("/auth/me", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["reason"], "missing_credential");
    }

    #[tokio::test]
    async fn unknown_route_is_404_and_wrong_method_is_405() {
        let app = TestApp::new(offline_config());
        let router = create_router(app.state.clone());
        let resp = router.clone().oneshot(get("/billing", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = router
            .oneshot(
                axum::http::Request::delete("/slots")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn dot_segment_path_is_404_and_uncharged() {
        let app = TestApp::new(offline_config());
        app.grant("good", identity("42"));
        let resp = create_router(app.state.clone())
            .oneshot(get("/appointments/..", Some("good")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(app.ledger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn protected_route_rejects_before_forwarding() {
        let app = TestApp::new(offline_config());
        let resp = create_router(app.state.clone())
            .oneshot(get("/appointments", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn authority_outage_is_503() {
        let app = TestApp::new(offline_config());
        app.authority.set_down(true);
        let resp = create_router(app.state.clone())
            .oneshot(get("/appointments", Some("never-seen")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["reason"], "authority_unavailable");
    }

    #[tokio::test]
    async fn privileged_route_is_403_for_plain_identity() {
        let app = TestApp::new(offline_config());
        app.grant("plain", identity("7"));
        let resp = create_router(app.state.clone())
            .oneshot(
                axum::http::Request::post("/notifications/batch")
                    .header(header::AUTHORIZATION, "Bearer plain")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["reason"], "permission_denied");
    }

    #[tokio::test]
    async fn forwarded_call_carries_signed_identity_not_credential() {
        let mut app = TestApp::new(offline_config());
        let url = echo_service(&app).await;
        app = app.with_config(config_for(&url));
        app.grant("good", identity("42"));

        let resp = create_router(app.state.clone())
            .oneshot(
                axum::http::Request::post("/appointments")
                    .header(header::AUTHORIZATION, "Bearer good")
                    .header("x-relay-identity", "forged")
                    .header("x-request-id", "req-123")
                    .body(Body::from("{\"slot\":3}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(resp.headers()["x-request-id"], "req-123");
        assert_eq!(resp.headers()[RATE_REMAINING_HEADER], "999");

        let echoed = body_json(resp).await;
        let seen: Identity = serde_json::from_value(echoed["identity"].clone()).unwrap();
        assert_eq!(seen.id, "42");
        assert!(echoed["authorization"].is_null());
        assert_eq!(echoed["request_id"], "req-123");
        assert_eq!(echoed["body"], "{\"slot\":3}");
        assert_eq!(app.ledger.count("42", app.window_index()), 1);
    }

    #[tokio::test]
    async fn public_route_forwards_anonymously() {
        let mut app = TestApp::new(offline_config());
        let url = echo_service(&app).await;
        app = app.with_config(config_for(&url));

        let resp = create_router(app.state.clone())
            .oneshot(get("/slots?day=mon", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(RATE_REMAINING_HEADER).is_none());
        let echoed = body_json(resp).await;
        assert!(echoed["identity"].is_null());
        assert_eq!(echoed["uri"], "/slots?day=mon");
        assert_eq!(app.ledger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_budget_is_429_with_retry_after() {
        let mut config = offline_config();
        config.rate_limit.budget = 2;
        let app = TestApp::new(config);
        app.grant("busy", identity("9"));
        let router = create_router(app.state.clone());

        for _ in 0..2 {
            let resp = router.clone().oneshot(get("/auth/me", Some("busy"))).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
        app.clock.advance(Duration::from_secs(45));
        let resp = router.oneshot(get("/auth/me", Some("busy"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "15");
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "unauthorized");
        assert_eq!(body["error"]["reason"], "rate_limited");
    }

    #[tokio::test]
    async fn unreachable_downstream_is_502() {
        let app = TestApp::new(offline_config());
        app.grant("good", identity("1"));
        let resp = create_router(app.state.clone())
            .oneshot(get("/appointments", Some("good")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn metrics_are_exposed() {
        let app = TestApp::new(offline_config());
        let router = create_router(app.state.clone());
        let _ = router.clone().oneshot(get("/auth/me", None)).await.unwrap();
        let resp = router.oneshot(get("/metrics", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("authrelay_rejections_total{reason=\"missing_credential\"} 1"));
    }
}
