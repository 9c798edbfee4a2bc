use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::Value;

use crate::crm::CrmDispatcher;
use crate::processor::Processor;
use crate::signing::{compute_signature, parse_signature_header, verify};
use crate::spool::FallbackLog;
use crate::storage::EventStore;
use crate::types::{EventQuery, NewWebhookEvent, SortOrder, WebhookEvent};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub processor: Arc<Processor>,
    pub crm: Arc<CrmDispatcher>,
    pub spool: Arc<FallbackLog>,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: u64,
    /// Name of the inbound header carrying the signature.
    pub signature_header: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/:provider", post(receive_webhook))
        .route("/api/analyze", post(analyze_event))
        .route("/api/analyze/next", post(analyze_next))
        .route("/api/events", get(list_events))
        .route("/api/events/:id", get(get_event))
        .route("/api/events/:id/resend-crm", post(resend_crm))
        .route("/api/events/:id/reanalyze", post(reanalyze))
        .route("/health", get(health))
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, details: Option<String>) -> Response {
    let mut body = serde_json::Map::new();
    body.insert("error".to_string(), Value::String(code.to_string()));
    if let Some(details) = details {
        body.insert("details".to_string(), Value::String(details));
    }
    (status, Json(Value::Object(body))).into_response()
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Webhook intake: verify the signature over the raw bytes, store the event,
/// then hand it to the background pipeline. The response only reflects
/// durable storage; processing happens after the 200.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_value = headers
        .get(&state.signature_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if let Err(err) = verify(
        header_value,
        &body,
        state.webhook_secret.as_bytes(),
        state.webhook_tolerance_secs,
        now_epoch_secs(),
    ) {
        let parsed = parse_signature_header(header_value);
        let expected = parsed
            .timestamp
            .as_deref()
            .map(|ts| compute_signature(state.webhook_secret.as_bytes(), ts, &body));
        tracing::warn!(
            provider = %provider,
            error = %err,
            provided = parsed.signature.as_deref().unwrap_or("<none>"),
            expected = expected.as_deref().unwrap_or("<n/a>"),
            "webhook signature rejected"
        );
        return (StatusCode::UNAUTHORIZED, "invalid signature").into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_json",
                Some(err.to_string()),
            )
        }
    };

    match state
        .store
        .insert_event(NewWebhookEvent::from_payload(payload.clone()))
        .await
    {
        Ok(id) => {
            tracing::info!(provider = %provider, event_id = id, "webhook stored");
            match state.store.get_event(id).await {
                Ok(Some(event)) => state.processor.spawn_process(event),
                Ok(None) => tracing::error!(event_id = id, "stored event vanished before processing"),
                Err(err) => tracing::error!(event_id = id, error = %err, "failed to reload stored event"),
            }
            (StatusCode::OK, "ok").into_response()
        }
        Err(err) => {
            tracing::error!(provider = %provider, error = %err, "event insert failed, spooling");
            if let Err(spool_err) = state.spool.append(&payload).await {
                tracing::error!(error = %spool_err, "fallback spool write failed");
            }
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                Some(err.to_string()),
            )
        }
    }
}

#[derive(Deserialize)]
struct AnalyzeRequest {
    event: Option<Value>,
}

/// Analyze a caller-supplied event. The event must carry both an `id` and a
/// `payload`; a stored row with the same id wins over the supplied body so
/// reanalysis picks up the canonical payload.
async fn analyze_event(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Response {
    let Some(supplied) = request.event else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            Some("missing event".to_string()),
        );
    };
    let (Some(id), Some(payload)) = (
        supplied.get("id").and_then(Value::as_i64).filter(|id| *id > 0),
        supplied.get("payload").filter(|p| p.is_object()).cloned(),
    ) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "bad_request",
            Some("event id and payload are required".to_string()),
        );
    };

    let stored = match state.store.get_event(id).await {
        Ok(row) => row,
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_failed",
                Some(err.to_string()),
            )
        }
    };
    let event: WebhookEvent =
        stored.unwrap_or_else(|| NewWebhookEvent::from_payload(payload).into_event(id));

    match state.processor.process_event(&event, false).await {
        Ok(report) => Json(serde_json::json!({
            "analysis_id": report.analysis_id,
            "result": report.result,
        }))
        .into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "analysis_failed",
            Some(err.to_string()),
        ),
    }
}

/// Analyze the oldest unprocessed event, if any.
async fn analyze_next(State(state): State<AppState>) -> Response {
    match state.processor.process_next().await {
        Ok(Some(report)) => Json(serde_json::json!({
            "event_id": report.event_id,
            "analysis_id": report.analysis_id,
            "result": report.result,
        }))
        .into_response(),
        Ok(None) => Json(serde_json::json!({"message": "nothing_to_analyze"})).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "analysis_failed",
            Some(err.to_string()),
        ),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListParams {
    page: Option<u32>,
    limit: Option<u32>,
    date_from: Option<String>,
    date_to: Option<String>,
    agent_id: Option<String>,
    quality: Option<i64>,
    topic: Option<String>,
    client_name: Option<String>,
    phone: Option<String>,
    sort_order: Option<String>,
}

/// RFC 3339 or raw epoch seconds.
fn parse_date_bound(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .ok()
        .or_else(|| raw.parse::<i64>().ok())
}

/// Upper bound on the listing page size; larger requests are clamped rather
/// than rejected.
const MAX_LIST_LIMIT: u32 = 100;

impl ListParams {
    fn into_query(self) -> EventQuery {
        let defaults = EventQuery::default();
        EventQuery {
            page: self.page.unwrap_or(defaults.page).max(1),
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, MAX_LIST_LIMIT),
            date_from: self.date_from.as_deref().and_then(parse_date_bound),
            date_to: self.date_to.as_deref().and_then(parse_date_bound),
            agent_id: self.agent_id.filter(|s| !s.is_empty()),
            quality: self.quality,
            topic: self.topic.filter(|s| !s.is_empty()),
            client_name: self.client_name.filter(|s| !s.is_empty()),
            phone: self.phone.filter(|s| !s.is_empty()),
            sort_order: match self.sort_order.as_deref() {
                Some("asc") => SortOrder::Asc,
                _ => SortOrder::Desc,
            },
        }
    }
}

async fn list_events(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    match state.store.list_events(&params.into_query()).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_failed",
            Some(err.to_string()),
        ),
    }
}

async fn get_event(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let event = match state.store.get_event(id).await {
        Ok(Some(event)) => event,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "not_found", None),
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_failed",
                Some(err.to_string()),
            )
        }
    };
    match state.store.latest_analysis(id).await {
        Ok(analysis) => Json(serde_json::json!({
            "event": event,
            "analysis": analysis,
        }))
        .into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_failed",
            Some(err.to_string()),
        ),
    }
}

#[derive(Deserialize, Default)]
struct ResendParams {
    force: Option<bool>,
}

/// Re-dispatch the latest analysis of a stored event to the CRM.
async fn resend_crm(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ResendParams>,
) -> Response {
    let event = match state.store.get_event(id).await {
        Ok(Some(event)) => event,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "not_found", None),
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_failed",
                Some(err.to_string()),
            )
        }
    };
    let analysis = match state.store.latest_analysis(id).await {
        Ok(Some(analysis)) => analysis,
        Ok(None) => return error_response(StatusCode::CONFLICT, "no_analysis", None),
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_failed",
                Some(err.to_string()),
            )
        }
    };

    match state
        .crm
        .dispatch(&event, &analysis.fields(), params.force.unwrap_or(false))
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_failed",
            Some(err.to_string()),
        ),
    }
}

/// Run a fresh analysis over a stored event and force-dispatch the result.
/// An empty transcript is rejected before any row is written.
async fn reanalyze(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let event = match state.store.get_event(id).await {
        Ok(Some(event)) => event,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "not_found", None),
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_failed",
                Some(err.to_string()),
            )
        }
    };
    if event.transcript().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty_transcript", None);
    }

    match state.processor.process_event(&event, true).await {
        Ok(report) => Json(serde_json::json!({
            "analysis_id": report.analysis_id,
            "result": report.result,
            "dispatch": report.dispatch,
        }))
        .into_response(),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "analysis_failed",
            Some(err.to_string()),
        ),
    }
}

async fn health() -> &'static str {
    "ok"
}
