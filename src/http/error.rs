//! Edge error type and its JSON rendering.
//!
//! Every rejection carries a coarse `code` (what kind of problem), a stable
//! `reason` (which one exactly) and a human `message`:
//!
//! ```json
//! {"error": {"code": "unauthorized", "reason": "rate_limited",
//!            "message": "...", "request_id": "..."}}
//! ```

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use super::request_id::current_request_id;
use crate::auth::error::{AuthzReason, RelayError};
use crate::authority::AuthorityError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error("no route for {0}")]
    NotFound(String),

    #[error("method not allowed for {0}")]
    MethodNotAllowed(String),

    #[error("downstream {service} unavailable: {detail}")]
    BadGateway { service: String, detail: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub reason: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

struct Rendered {
    status: StatusCode,
    code: &'static str,
    reason: &'static str,
    message: String,
    retry_after: Option<u64>,
}

fn render_relay(err: &RelayError) -> Rendered {
    let status = match err {
        RelayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        RelayError::Unauthorized {
            reason: AuthzReason::RateLimited,
            ..
        } => StatusCode::TOO_MANY_REQUESTS,
        RelayError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        RelayError::AuthorityUnavailable | RelayError::LedgerUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RelayError::Validation(_) => StatusCode::BAD_REQUEST,
    };
    let retry_after = match err {
        RelayError::Unauthorized {
            retry_after_secs, ..
        } => *retry_after_secs,
        _ => None,
    };
    Rendered {
        status,
        code: err.kind(),
        reason: err.code(),
        message: err.message(),
        retry_after,
    }
}

impl AppError {
    fn render(&self) -> Rendered {
        match self {
            AppError::Relay(err) => render_relay(err),
            AppError::Authority(AuthorityError::Unauthenticated(detail)) => Rendered {
                status: StatusCode::UNAUTHORIZED,
                code: "unauthenticated",
                reason: "invalid_credential",
                message: detail.clone(),
                retry_after: None,
            },
            AppError::Authority(AuthorityError::Invalid(detail)) => Rendered {
                status: StatusCode::BAD_REQUEST,
                code: "validation_error",
                reason: "validation_error",
                message: detail.clone(),
                retry_after: None,
            },
            AppError::Authority(AuthorityError::Unavailable(detail)) => {
                warn!(%detail, "credential authority unavailable");
                render_relay(&RelayError::AuthorityUnavailable)
            }
            AppError::NotFound(what) => Rendered {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                reason: "no_route",
                message: format!("No route for {what}"),
                retry_after: None,
            },
            AppError::MethodNotAllowed(what) => Rendered {
                status: StatusCode::METHOD_NOT_ALLOWED,
                code: "not_found",
                reason: "method_not_allowed",
                message: format!("Method not allowed for {what}"),
                retry_after: None,
            },
            AppError::BadGateway { service, detail } => {
                warn!(%service, %detail, "downstream call failed");
                Rendered {
                    status: StatusCode::BAD_GATEWAY,
                    code: "bad_gateway",
                    reason: "downstream_unavailable",
                    message: format!("Service {service} is unavailable, try again later"),
                    retry_after: None,
                }
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                Rendered {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal_error",
                    reason: "internal_error",
                    message: "Internal server error".to_string(),
                    retry_after: None,
                }
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let rendered = self.render();
        let body = ErrorResponse {
            error: ErrorBody {
                code: rendered.code.to_string(),
                reason: rendered.reason.to_string(),
                message: rendered.message,
                request_id: current_request_id(),
            },
        };

        let mut resp = (rendered.status, Json(body)).into_response();
        if rendered.status == StatusCode::UNAUTHORIZED {
            resp.headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if let Some(secs) = rendered.retry_after {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        resp
    }
}
