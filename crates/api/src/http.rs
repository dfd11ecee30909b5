use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use compliance_store::ComplianceStore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::identity_cache::IdentityCaches;
use crate::resolver::Resolver;

mod events;

pub const COMPLIANCE_EVENTS_ROUTE: &str = "/api/v1/compliance-events";

#[derive(Clone)]
pub struct AppState {
    resolver: Resolver,
}

impl AppState {
    pub fn new(store: Arc<dyn ComplianceStore>, caches: IdentityCaches) -> Self {
        Self {
            resolver: Resolver::new(store, caches),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            COMPLIANCE_EVENTS_ROUTE,
            post(events::post_compliance_event).fallback(method_not_allowed),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = state.resolver.store().ping().await.is_ok();
    checks.insert("store", store_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn method_not_allowed() -> ApiError {
    json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let out = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        .take(MAX_LEN)
        .collect::<String>();

    (!out.is_empty()).then_some(out)
}

/// Body of every non-2xx response. The message is shown to the caller, so it
/// must never carry store or internal error detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
}

fn internal_error() -> ApiError {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error")
}
