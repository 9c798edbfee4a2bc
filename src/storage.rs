use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::error::StorageError;
use crate::types::{
    AnalysisRecord, DispatchAttempt, DispatchStatus, EventPage, EventQuery, EventSummary,
    NewWebhookEvent, Pagination, SortOrder, WebhookEvent,
};

/// Durable event and analysis storage.
///
/// Owns the `WebhookEvent` and `AnalysisRecord` lifecycles. No component
/// caches a second copy of this state; "next unprocessed?" is always a store
/// query.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a new event row and return its store-assigned id.
    ///
    /// Duplicate deliveries are not detected here: idempotency at ingest is
    /// the sender's responsibility, and downstream dedup lives in the
    /// dispatch tracker.
    async fn insert_event(&self, event: NewWebhookEvent) -> Result<i64, StorageError>;

    /// Unprocessed events ordered by `event_timestamp` ascending, so backlogs
    /// drain in arrival order rather than insertion order.
    async fn fetch_unprocessed(&self, limit: u32) -> Result<Vec<WebhookEvent>, StorageError>;

    /// Flip `processed` to true for the given ids. Idempotent: already
    /// processed rows are skipped and only false→true flips are counted.
    async fn mark_processed(&self, ids: &[i64], note: Option<&str>) -> Result<u64, StorageError>;

    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, StorageError>;

    /// Append an analysis row; reanalysis adds rows, never replaces them.
    async fn insert_analysis(
        &self,
        event_id: i64,
        model: &str,
        result: &Value,
    ) -> Result<i64, StorageError>;

    /// The newest analysis for an event, by `created_at` descending.
    async fn latest_analysis(&self, event_id: i64) -> Result<Option<AnalysisRecord>, StorageError>;

    /// Paginated event listing joined with latest-analysis fields.
    async fn list_events(&self, query: &EventQuery) -> Result<EventPage, StorageError>;
}

/// Append-only record of CRM delivery attempts; the sole idempotency gate
/// for outbound dispatch.
#[async_trait]
pub trait DispatchTracker: Send + Sync {
    /// True iff a `success` attempt exists for the event.
    async fn has_successful_dispatch(&self, event_id: i64) -> Result<bool, StorageError>;

    /// Append one attempt. Prior attempts are never mutated.
    async fn record_attempt(
        &self,
        event_id: i64,
        payload: &Value,
        status: DispatchStatus,
        response_text: Option<&str>,
    ) -> Result<(), StorageError>;
}

/// Select the configured store: postgres when `DATABASE_URL` is set and the
/// feature is compiled in, the in-memory store otherwise.
pub async fn build_store(
    config: &Config,
) -> Result<(Arc<dyn EventStore>, Arc<dyn DispatchTracker>), StorageError> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.database_url {
        let store = Arc::new(crate::storage_postgres::PostgresStore::connect(url).await?);
        store.ensure_schema().await?;
        tracing::info!("using postgres store");
        return Ok((store.clone(), store));
    }

    #[cfg(not(feature = "postgres"))]
    if config.database_url.is_some() {
        tracing::warn!("DATABASE_URL is set but the postgres feature is disabled");
    }

    tracing::info!("using in-memory store");
    let store = Arc::new(InMemoryStore::new());
    Ok((store.clone(), store))
}

#[derive(Default)]
struct Inner {
    next_event_id: i64,
    next_analysis_id: i64,
    next_attempt_id: i64,
    events: Vec<WebhookEvent>,
    analyses: Vec<AnalysisRecord>,
    attempts: Vec<DispatchAttempt>,
}

/// In-memory store for tests and single-process deployments without a
/// database. Implements both the event store and the dispatch tracker.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded attempts for an event, oldest first. Test/introspection
    /// helper; the dispatch path only ever needs the gate query.
    pub async fn attempts_for_event(&self, event_id: i64) -> Vec<DispatchAttempt> {
        let inner = self.inner.lock().await;
        inner
            .attempts
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Number of stored analyses for an event. Test helper.
    pub async fn analysis_count(&self, event_id: i64) -> usize {
        let inner = self.inner.lock().await;
        inner.analyses.iter().filter(|a| a.event_id == event_id).count()
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, event: NewWebhookEvent) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.next_event_id += 1;
        let id = inner.next_event_id;
        let row = event.into_event(id);
        inner.events.push(row);
        Ok(id)
    }

    async fn fetch_unprocessed(&self, limit: u32) -> Result<Vec<WebhookEvent>, StorageError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<WebhookEvent> = inner
            .events
            .iter()
            .filter(|e| !e.processed)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.event_timestamp);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn mark_processed(&self, ids: &[i64], note: Option<&str>) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut updated = 0;
        for event in inner.events.iter_mut() {
            if ids.contains(&event.id) && !event.processed {
                event.processed = true;
                event.processed_at = Some(now);
                if let Some(note) = note {
                    event.processor_note = Some(note.to_string());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.iter().find(|e| e.id == id).cloned())
    }

    async fn insert_analysis(
        &self,
        event_id: i64,
        model: &str,
        result: &Value,
    ) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.next_analysis_id += 1;
        let id = inner.next_analysis_id;
        inner.analyses.push(AnalysisRecord {
            id,
            event_id,
            model: model.to_string(),
            result: result.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn latest_analysis(&self, event_id: i64) -> Result<Option<AnalysisRecord>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .analyses
            .iter()
            .filter(|a| a.event_id == event_id)
            .max_by_key(|a| (a.created_at, a.id))
            .cloned())
    }

    async fn list_events(&self, query: &EventQuery) -> Result<EventPage, StorageError> {
        let inner = self.inner.lock().await;

        let mut rows: Vec<EventSummary> = inner
            .events
            .iter()
            .map(|e| {
                let fields = inner
                    .analyses
                    .iter()
                    .filter(|a| a.event_id == e.id)
                    .max_by_key(|a| (a.created_at, a.id))
                    .map(|a| a.fields())
                    .unwrap_or_default();
                EventSummary {
                    id: e.id,
                    event_type: e.event_type.clone(),
                    event_timestamp: e.event_timestamp,
                    agent_id: e.agent_id.clone(),
                    conversation_id: e.conversation_id.clone(),
                    status: e.status.clone(),
                    has_audio: e.has_audio,
                    has_user_audio: e.has_user_audio,
                    has_response_audio: e.has_response_audio,
                    received_at: e.received_at,
                    topic: fields.topic,
                    quality: fields.quality,
                    outcome: fields.outcome,
                    client_name: fields.client_name,
                    phone: fields.phone,
                }
            })
            .filter(|row| {
                if let Some(from) = query.date_from {
                    if row.event_timestamp < from {
                        return false;
                    }
                }
                if let Some(to) = query.date_to {
                    if row.event_timestamp > to {
                        return false;
                    }
                }
                if let Some(agent) = &query.agent_id {
                    if row.agent_id.as_deref() != Some(agent.as_str()) {
                        return false;
                    }
                }
                if let Some(quality) = query.quality {
                    if row.quality != Some(quality) {
                        return false;
                    }
                }
                if let Some(topic) = &query.topic {
                    if row.topic.as_deref() != Some(topic.as_str()) {
                        return false;
                    }
                }
                if let Some(name) = &query.client_name {
                    match &row.client_name {
                        Some(have) if contains_ci(have, name) => {}
                        _ => return false,
                    }
                }
                if let Some(phone) = &query.phone {
                    match &row.phone {
                        Some(have) if have.contains(phone.as_str()) => {}
                        _ => return false,
                    }
                }
                true
            })
            .collect();

        match query.sort_order {
            SortOrder::Asc => rows.sort_by_key(|r| (r.event_timestamp, r.id)),
            SortOrder::Desc => {
                rows.sort_by_key(|r| (std::cmp::Reverse(r.event_timestamp), std::cmp::Reverse(r.id)))
            }
        }

        let total = rows.len() as u64;
        let limit = query.limit.max(1);
        let page = query.page.max(1);
        let offset = ((page - 1) * limit) as usize;
        let data: Vec<EventSummary> = rows.into_iter().skip(offset).take(limit as usize).collect();
        let total_pages = if total == 0 {
            0
        } else {
            total.div_ceil(limit as u64)
        };

        Ok(EventPage {
            data,
            pagination: Pagination {
                page,
                limit,
                total,
                total_pages,
            },
        })
    }
}

#[async_trait]
impl DispatchTracker for InMemoryStore {
    async fn has_successful_dispatch(&self, event_id: i64) -> Result<bool, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .attempts
            .iter()
            .any(|a| a.event_id == event_id && a.status == DispatchStatus::Success))
    }

    async fn record_attempt(
        &self,
        event_id: i64,
        payload: &Value,
        status: DispatchStatus,
        response_text: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.next_attempt_id += 1;
        let id = inner.next_attempt_id;
        inner.attempts.push(DispatchAttempt {
            id,
            event_id,
            payload: payload.clone(),
            status,
            response_text: response_text.map(str::to_string),
            created_at: Utc::now(),
        });
        Ok(())
    }
}
