use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::{HeaderMap, StatusCode};
use chrono::SecondsFormat;
use compliance_contracts::{ComplianceEvent, StoredComplianceEvent};
use compliance_store::EventRecord;
use tracing::Instrument;

use super::{
    ApiError, AppState, COMPLIANCE_EVENTS_ROUTE, extract_request_id, internal_error, json_error,
};
use crate::resolver::{Resolvable, ResolveError};

pub(super) async fn post_compliance_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<StoredComplianceEvent>), ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let span = tracing::info_span!(
        "compliance_event.ingest",
        request_id = %request_id,
        cluster_id = tracing::field::Empty,
        policy_name = tracing::field::Empty,
        event_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = ingest(&state, body).instrument(span.clone()).await;

    let status = match &result {
        Ok((status, _)) => *status,
        Err((status, _)) => *status,
    };
    span.record("latency_ms", started.elapsed().as_millis() as u64);
    span.record("outcome", outcome_label(status));
    crate::metrics::observe_http_request(
        COMPLIANCE_EVENTS_ROUTE,
        "POST",
        status.as_u16(),
        started.elapsed(),
    );

    result
}

async fn ingest(
    state: &AppState,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<StoredComplianceEvent>), ApiError> {
    let body = body.map_err(|err| {
        tracing::warn!(error = %err, "error reading request body");
        json_error(StatusCode::BAD_REQUEST, "Could not read request body")
    })?;

    let mut event = serde_json::from_slice::<ComplianceEvent>(&body).map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "Incorrectly formatted request body, must be valid JSON",
        )
    })?;

    event
        .validate()
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.message))?;

    let span = tracing::Span::current();
    span.record("cluster_id", event.cluster.identifier.as_str());
    span.record("policy_name", event.policy.name.as_str());

    event
        .policy
        .fill_spec_hash()
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    if event.event.timestamp.is_none() {
        event.event.timestamp =
            Some(chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    }

    let resolver = &state.resolver;

    let cluster_id = resolver
        .resolve(&event.cluster)
        .await
        .map_err(|err| resolve_error_response::<compliance_contracts::Cluster>(&err))?;

    let parent_policy_id = match &event.parent_policy {
        Some(parent) => Some(
            resolver
                .resolve(parent)
                .await
                .map_err(|err| {
                    resolve_error_response::<compliance_contracts::ParentPolicy>(&err)
                })?,
        ),
        None => None,
    };

    let policy_id = resolver
        .resolve(&event.policy)
        .await
        .map_err(|err| resolve_error_response::<compliance_contracts::Policy>(&err))?;

    let event_id = resolver
        .store()
        .insert_event(EventRecord {
            cluster_id,
            parent_policy_id,
            policy_id,
            event: &event.event,
        })
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "error inserting compliance event");
            internal_error()
        })?;

    span.record("event_id", event_id);
    tracing::info!(
        event_id,
        cluster_key = cluster_id,
        policy_key = policy_id,
        "compliance event recorded"
    );

    // Respond with the hash only; the spec can be large.
    event.policy.spec = None;

    Ok((
        StatusCode::CREATED,
        Json(StoredComplianceEvent {
            event_id,
            cluster_id,
            parent_policy_id,
            policy_id,
            body: event,
        }),
    ))
}

fn outcome_label(status: StatusCode) -> &'static str {
    if status.is_success() {
        "created"
    } else if status.is_server_error() {
        "failed"
    } else {
        "rejected"
    }
}

fn resolve_error_response<R: Resolvable>(err: &ResolveError) -> ApiError {
    if err.is_client_error() {
        return json_error(StatusCode::BAD_REQUEST, err.to_string());
    }

    tracing::error!(kind = R::KIND, error = %err, "error getting foreign key");
    internal_error()
}
