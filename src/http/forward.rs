//! Pass-through of authorised requests to their downstream service.

use anyhow::Context as _;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Uri};
use axum::response::Response;
use tracing::{debug, instrument};

use super::error::AppError;
use super::request_id::REQUEST_ID_HEADER;
use crate::auth::context::{
    RequestContext, SignedContext, IDENTITY_HEADER, RELAY_HEADER_PREFIX, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
use crate::AppState;

/// Connection-level headers that must not cross the relay (RFC 9110 §7.6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// `base` joined with the inbound path and query.
pub fn target_url(base: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Inbound headers that may be passed to a downstream service.
///
/// The bearer credential never leaves the relay, and any `x-relay-*` header
/// the caller sent is dropped so it cannot pose as a signed identity.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name)
            || name == header::HOST
            || name == header::CONTENT_LENGTH
            || name == header::AUTHORIZATION
            || name.as_str().starts_with(RELAY_HEADER_PREFIX)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Downstream response headers that may be returned to the caller.
pub fn returnable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

pub fn attach_identity_context(headers: &mut HeaderMap, signed: &SignedContext) -> anyhow::Result<()> {
    headers.insert(
        IDENTITY_HEADER,
        HeaderValue::from_str(&signed.identity).context("identity header value")?,
    );
    headers.insert(
        TIMESTAMP_HEADER,
        HeaderValue::from_str(&signed.timestamp).context("timestamp header value")?,
    );
    headers.insert(
        SIGNATURE_HEADER,
        HeaderValue::from_str(&signed.signature).context("signature header value")?,
    );
    Ok(())
}

/// Send `request` to `service` with the caller's identity context attached
/// and stream the answer back.
#[instrument(skip(state, request, ctx), fields(%service, request_id = %ctx.request_id))]
pub async fn forward(
    state: &AppState,
    service: &str,
    request: Request<Body>,
    ctx: &RequestContext,
) -> Result<Response, AppError> {
    let base = state
        .config
        .services
        .get(service)
        .map(|s| s.url.as_str())
        .with_context(|| format!("route references unconfigured service {service}"))?;

    let (parts, body) = request.into_parts();
    let url = target_url(base, &parts.uri);

    let mut headers = forwardable_headers(&parts.headers);
    if let Some(identity) = &ctx.identity {
        let signed = state.signer.sign(identity, state.relay.now())?;
        attach_identity_context(&mut headers, &signed)?;
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    debug!(%url, method = %parts.method, "forwarding request");

    let upstream = state
        .http_client
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await
        .map_err(|e| AppError::BadGateway {
            service: service.to_string(),
            detail: e.to_string(),
        })?;

    state.metrics.metrics.forwarded(service);

    let status = upstream.status();
    let headers = returnable_headers(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
