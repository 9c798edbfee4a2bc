use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One durably stored record of an inbound webhook call.
///
/// The identity (`id`) is store-assigned and monotonic. Everything except the
/// `processed` trio and `processor_note` is immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub event_type: String,
    /// Caller-supplied epoch seconds; queue ordering key.
    pub event_timestamp: i64,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub status: Option<String>,
    pub has_audio: bool,
    pub has_user_audio: bool,
    pub has_response_audio: bool,
    /// The full original event body, stored verbatim.
    pub payload: Value,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub processor_note: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Ordered transcript turns from the original payload, if any.
    pub fn transcript(&self) -> Vec<TranscriptTurn> {
        match self.payload.pointer("/data/transcript") {
            Some(Value::Array(turns)) => turns
                .iter()
                .map(|t| TranscriptTurn {
                    role: t.get("role").and_then(Value::as_str).map(str::to_string),
                    message: t.get("message").and_then(Value::as_str).map(str::to_string),
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Insert-side view of an event, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWebhookEvent {
    pub event_type: String,
    pub event_timestamp: i64,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub status: Option<String>,
    pub has_audio: bool,
    pub has_user_audio: bool,
    pub has_response_audio: bool,
    pub payload: Value,
}

impl NewWebhookEvent {
    /// Project the stored columns out of a raw webhook body.
    ///
    /// Correlation keys may live at the top level or under `data`; both are
    /// accepted. The full body is kept as the opaque `payload`.
    pub fn from_payload(payload: Value) -> Self {
        let top = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        let nested = |key: &str| {
            top(key).or_else(|| {
                payload
                    .pointer(&format!("/data/{key}"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
        };
        let flag = |key: &str| payload.get(key).and_then(Value::as_bool).unwrap_or(false);

        Self {
            event_type: top("type").unwrap_or_else(|| "unknown".to_string()),
            event_timestamp: payload
                .get("event_timestamp")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            agent_id: nested("agent_id"),
            conversation_id: nested("conversation_id"),
            status: nested("status"),
            has_audio: flag("has_audio"),
            has_user_audio: flag("has_user_audio"),
            has_response_audio: flag("has_response_audio"),
            payload,
        }
    }

    /// Materialize an unsaved event row, for callers that supply the event
    /// body directly instead of referencing a stored row.
    pub fn into_event(self, id: i64) -> WebhookEvent {
        WebhookEvent {
            id,
            event_type: self.event_type,
            event_timestamp: self.event_timestamp,
            agent_id: self.agent_id,
            conversation_id: self.conversation_id,
            status: self.status,
            has_audio: self.has_audio,
            has_user_audio: self.has_user_audio,
            has_response_audio: self.has_response_audio,
            payload: self.payload,
            processed: false,
            processed_at: None,
            processor_note: None,
            received_at: Utc::now(),
        }
    }
}

/// One speaker turn of a conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: Option<String>,
    pub message: Option<String>,
}

/// Recognized fields of an analysis result.
///
/// The stored blob is opaque; these are the fields downstream consumers know
/// about. All are optional. `quality` is expected in 1..=5 but is passed
/// through unvalidated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFields {
    pub topic: Option<String>,
    pub intent: Option<String>,
    pub quality: Option<i64>,
    pub outcome: Option<String>,
    pub summary: Option<String>,
    pub recommendations: Option<String>,
    pub client_name: Option<String>,
    pub phone: Option<String>,
}

impl AnalysisFields {
    /// Extract the recognized fields from an opaque result blob.
    ///
    /// Field-tolerant: a malformed individual field is dropped without
    /// affecting the others.
    pub fn from_value(result: &Value) -> Self {
        let text = |key: &str| result.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            topic: text("topic"),
            intent: text("intent"),
            quality: result.get("quality").and_then(Value::as_i64),
            outcome: text("outcome"),
            summary: text("summary"),
            recommendations: text("recommendations"),
            client_name: text("client_name"),
            phone: text("phone"),
        }
    }
}

/// One stored analysis of an event. Multiple rows per event are allowed;
/// "latest" is `created_at` descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: i64,
    pub event_id: i64,
    pub model: String,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn fields(&self) -> AnalysisFields {
        AnalysisFields::from_value(&self.result)
    }
}

/// Terminal status of one CRM delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Success,
    Error,
    DryRun,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Success => "success",
            DispatchStatus::Error => "error",
            DispatchStatus::DryRun => "dry_run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(DispatchStatus::Success),
            "error" => Some(DispatchStatus::Error),
            "dry_run" => Some(DispatchStatus::DryRun),
            _ => None,
        }
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of one outbound CRM delivery attempt.
///
/// The tracker rows, not any in-memory flag, are the source of truth for
/// "already delivered" and therefore survive process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub id: i64,
    pub event_id: i64,
    /// The exact outbound body that was (or would have been) sent.
    pub payload: Value,
    pub status: DispatchStatus,
    pub response_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Sort direction for event listings, keyed on `event_timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Filter and pagination parameters for the event listing query.
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
    /// Epoch-second bounds on `event_timestamp`.
    pub date_from: Option<i64>,
    pub date_to: Option<i64>,
    pub agent_id: Option<String>,
    /// Filters below match against the latest analysis of each event.
    pub quality: Option<i64>,
    pub topic: Option<String>,
    pub client_name: Option<String>,
    pub phone: Option<String>,
    pub sort_order: SortOrder,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            date_from: None,
            date_to: None,
            agent_id: None,
            quality: None,
            topic: None,
            client_name: None,
            phone: None,
            sort_order: SortOrder::default(),
        }
    }
}

/// One event row joined with its latest-analysis fields.
#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub id: i64,
    pub event_type: String,
    pub event_timestamp: i64,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub status: Option<String>,
    pub has_audio: bool,
    pub has_user_audio: bool,
    pub has_response_audio: bool,
    pub received_at: DateTime<Utc>,
    pub topic: Option<String>,
    pub quality: Option<i64>,
    pub outcome: Option<String>,
    pub client_name: Option<String>,
    pub phone: Option<String>,
}

/// Pagination totals for a listing response.
#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    #[serde(rename = "totalPages")]
    pub total_pages: u64,
}

/// A page of event summaries plus pagination totals, shaped as the listing
/// response body: `{data, pagination}`.
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub data: Vec<EventSummary>,
    pub pagination: Pagination,
}
