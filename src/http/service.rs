//! HTTP handlers exposing the gatekeeper as a check service.
//!
//! A fronting proxy or application calls these endpoints with the original
//! client's forwarding headers and acts on the status code.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::identity::client_identifier;
use crate::access::{AccessDecision, DenyReason};
use crate::gatekeeper::{Admission, Gatekeeper, LoginGate};
use crate::ratelimit::{seconds_until, Endpoint, RateLimitStatus};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared handler state.
pub struct AppState {
    pub gatekeeper: Arc<Gatekeeper>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Build the service router.
pub fn router(gatekeeper: Arc<Gatekeeper>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/throttle/:endpoint", post(throttle))
        .route("/v1/login/precheck", post(login_precheck))
        .route("/v1/login/failure", post(login_failure))
        .route("/v1/login/success", post(login_success))
        .with_state(Arc::new(AppState { gatekeeper }))
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Admit a request to an endpoint class.
#[instrument(skip_all)]
pub async fn throttle(
    State(state): State<Arc<AppState>>,
    Path(endpoint): Path<Endpoint>,
    headers: HeaderMap,
) -> Response {
    let identifier = client_identifier(&headers);
    let admission = state.gatekeeper.admit(endpoint, &identifier);

    debug!(
        endpoint = %endpoint,
        identifier = %identifier,
        allowed = admission.is_allowed(),
        "Processed throttle check"
    );

    let code = match admission {
        Admission::Admitted { .. } => StatusCode::OK,
        Admission::Denied { .. } => StatusCode::FORBIDDEN,
        Admission::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
    };

    let mut response = (code, Json(admission)).into_response();
    match admission {
        Admission::Admitted { status } => insert_rate_limit_headers(response.headers_mut(), &status),
        Admission::Throttled { status } => {
            insert_rate_limit_headers(response.headers_mut(), &status);
            insert_retry_after(response.headers_mut(), status.reset_in_secs);
        }
        Admission::Denied { access } => insert_block_retry_after(response.headers_mut(), &access),
    }
    response
}

/// Decide whether the caller may have its credentials checked.
#[instrument(skip_all)]
pub async fn login_precheck(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identifier = client_identifier(&headers);
    let gate = state.gatekeeper.precheck_login(&identifier);

    debug!(identifier = %identifier, open = gate.is_open(), "Processed login precheck");

    let code = match gate {
        LoginGate::Open { .. } => StatusCode::OK,
        LoginGate::Denied { .. } => StatusCode::FORBIDDEN,
        LoginGate::Throttled { .. } | LoginGate::LockedOut { .. } => StatusCode::TOO_MANY_REQUESTS,
    };

    let mut response = (code, Json(gate)).into_response();
    if let Some(rate_limit) = gate.rate_limit() {
        insert_rate_limit_headers(response.headers_mut(), rate_limit);
    }
    match gate {
        LoginGate::Open { .. } => {}
        LoginGate::Denied { access } => insert_block_retry_after(response.headers_mut(), &access),
        LoginGate::Throttled { status } => {
            insert_retry_after(response.headers_mut(), status.reset_in_secs)
        }
        LoginGate::LockedOut {
            retry_after_secs, ..
        } => insert_retry_after(response.headers_mut(), retry_after_secs),
    }
    response
}

/// Record rejected credentials for the caller.
#[instrument(skip_all)]
pub async fn login_failure(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let identifier = client_identifier(&headers);
    let outcome = state.gatekeeper.record_login_failure(&identifier);

    if outcome.blocked {
        info!(identifier = %identifier, "Login failure reported for locked identifier");
    }

    (StatusCode::OK, Json(outcome)).into_response()
}

/// Record accepted credentials for the caller.
#[instrument(skip_all)]
pub async fn login_success(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    let identifier = client_identifier(&headers);
    state.gatekeeper.record_login_success(&identifier);
    StatusCode::NO_CONTENT
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(status.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(status.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(status.reset_in_secs));
}

fn insert_retry_after(headers: &mut HeaderMap, secs: u64) {
    headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
}

fn insert_block_retry_after(headers: &mut HeaderMap, access: &AccessDecision) {
    if let Some(DenyReason::TemporarilyBlocked { until }) = access.reason {
        insert_retry_after(headers, seconds_until(until, chrono::Utc::now()));
    }
}
