use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};

use crate::error::StorageError;
use crate::storage::{DispatchTracker, EventStore};
use crate::types::{
    AnalysisFields, AnalysisRecord, DispatchStatus, EventPage, EventQuery, EventSummary,
    NewWebhookEvent, Pagination, WebhookEvent,
};

impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Query(err.to_string())
    }
}

const SCHEMA: &str = "
create table if not exists webhook_events (
  id bigserial primary key,
  event_type text not null,
  event_timestamp bigint not null,
  agent_id text,
  conversation_id text,
  status text,
  has_audio boolean,
  has_user_audio boolean,
  has_response_audio boolean,
  payload jsonb not null,
  processed boolean default false,
  processed_at timestamptz,
  processor_note text,
  received_at timestamptz default now()
);

create table if not exists analyses (
  id bigserial primary key,
  event_id bigint not null references webhook_events(id) on delete cascade,
  model text not null,
  result jsonb not null,
  created_at timestamptz default now()
);

create table if not exists crm_dispatches (
  id bigserial primary key,
  event_id bigint not null references webhook_events(id) on delete cascade,
  payload jsonb not null,
  response_text text,
  status text not null,
  created_at timestamptz default now()
);
";

// Indexes go in a second batch so the tables already exist on an empty
// database.
const INDEXES: &str = "
create index if not exists webhook_events_agent_id_idx
  on webhook_events (agent_id);
create index if not exists webhook_events_conversation_id_idx
  on webhook_events (conversation_id);
create index if not exists webhook_events_event_timestamp_idx
  on webhook_events (event_timestamp);
create index if not exists webhook_events_processed_idx
  on webhook_events (processed, event_timestamp);

create index if not exists analyses_event_id_idx
  on analyses (event_id);
create index if not exists analyses_quality_idx
  on analyses using gin ((result->'quality'));
create index if not exists analyses_topic_idx
  on analyses using gin ((result->'topic'));
create index if not exists analyses_client_name_idx
  on analyses using gin ((result->'client_name'));
create index if not exists analyses_phone_idx
  on analyses using gin ((result->'phone'));

create index if not exists crm_dispatches_event_status_idx
  on crm_dispatches (event_id, status, created_at desc);
";

const EVENT_COLUMNS: &str = "id, event_type, event_timestamp, agent_id, conversation_id, status, \
     has_audio, has_user_audio, has_response_audio, payload, processed, processed_at, \
     processor_note, received_at";

/// Postgres-backed store implementing both storage traits.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Connect and spawn the connection driver task.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::error!(error = %err, "postgres connection terminated");
            }
        });
        Ok(Self { client })
    }

    /// Create tables and indexes if missing. Safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.client.batch_execute(SCHEMA).await?;
        self.client.batch_execute(INDEXES).await?;
        Ok(())
    }
}

fn event_from_row(row: &Row) -> WebhookEvent {
    WebhookEvent {
        id: row.get("id"),
        event_type: row.get("event_type"),
        event_timestamp: row.get("event_timestamp"),
        agent_id: row.get("agent_id"),
        conversation_id: row.get("conversation_id"),
        status: row.get("status"),
        has_audio: row.get::<_, Option<bool>>("has_audio").unwrap_or(false),
        has_user_audio: row.get::<_, Option<bool>>("has_user_audio").unwrap_or(false),
        has_response_audio: row
            .get::<_, Option<bool>>("has_response_audio")
            .unwrap_or(false),
        payload: row.get("payload"),
        processed: row.get::<_, Option<bool>>("processed").unwrap_or(false),
        processed_at: row.get("processed_at"),
        processor_note: row.get("processor_note"),
        received_at: row
            .get::<_, Option<DateTime<Utc>>>("received_at")
            .unwrap_or_else(Utc::now),
    }
}

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Build the shared `where` clause for the listing query. Filters against
/// the latest analysis reference the lateral alias `a`.
fn list_where_clauses(query: &EventQuery) -> (Vec<String>, Vec<BoxedParam>) {
    let mut clauses = Vec::new();
    let mut params: Vec<BoxedParam> = Vec::new();

    if let Some(from) = query.date_from {
        params.push(Box::new(from));
        clauses.push(format!("e.event_timestamp >= ${}", params.len()));
    }
    if let Some(to) = query.date_to {
        params.push(Box::new(to));
        clauses.push(format!("e.event_timestamp <= ${}", params.len()));
    }
    if let Some(agent_id) = &query.agent_id {
        params.push(Box::new(agent_id.clone()));
        clauses.push(format!("e.agent_id = ${}", params.len()));
    }
    if let Some(quality) = query.quality {
        params.push(Box::new(quality));
        clauses.push(format!("(a.result->>'quality')::bigint = ${}", params.len()));
    }
    if let Some(topic) = &query.topic {
        params.push(Box::new(topic.clone()));
        clauses.push(format!("a.result->>'topic' = ${}", params.len()));
    }
    if let Some(client_name) = &query.client_name {
        params.push(Box::new(client_name.clone()));
        clauses.push(format!(
            "a.result->>'client_name' ilike '%' || ${} || '%'",
            params.len()
        ));
    }
    if let Some(phone) = &query.phone {
        params.push(Box::new(phone.clone()));
        clauses.push(format!("a.result->>'phone' like '%' || ${} || '%'", params.len()));
    }

    (clauses, params)
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("where {}", clauses.join(" and "))
    }
}

const LIST_FROM: &str = "
from webhook_events e
left join lateral (
  select result
  from analyses a
  where a.event_id = e.id
  order by a.created_at desc, a.id desc
  limit 1
) a on true
";

#[async_trait]
impl EventStore for PostgresStore {
    async fn insert_event(&self, event: NewWebhookEvent) -> Result<i64, StorageError> {
        let row = self
            .client
            .query_one(
                "insert into webhook_events (
                   event_type, event_timestamp, agent_id, conversation_id, status,
                   has_audio, has_user_audio, has_response_audio, payload
                 ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9) returning id",
                &[
                    &event.event_type,
                    &event.event_timestamp,
                    &event.agent_id,
                    &event.conversation_id,
                    &event.status,
                    &event.has_audio,
                    &event.has_user_audio,
                    &event.has_response_audio,
                    &event.payload,
                ],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn fetch_unprocessed(&self, limit: u32) -> Result<Vec<WebhookEvent>, StorageError> {
        let rows = self
            .client
            .query(
                &format!(
                    "select {EVENT_COLUMNS} from webhook_events
                     where processed = false
                     order by event_timestamp asc
                     limit $1"
                ),
                &[&(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(event_from_row).collect())
    }

    async fn mark_processed(&self, ids: &[i64], note: Option<&str>) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = ids.to_vec();
        let updated = self
            .client
            .execute(
                "update webhook_events
                 set processed = true,
                     processed_at = now(),
                     processor_note = coalesce($2, processor_note)
                 where id = any($1) and processed = false",
                &[&ids, &note],
            )
            .await?;
        Ok(updated)
    }

    async fn get_event(&self, id: i64) -> Result<Option<WebhookEvent>, StorageError> {
        let row = self
            .client
            .query_opt(
                &format!("select {EVENT_COLUMNS} from webhook_events where id = $1"),
                &[&id],
            )
            .await?;
        Ok(row.as_ref().map(event_from_row))
    }

    async fn insert_analysis(
        &self,
        event_id: i64,
        model: &str,
        result: &Value,
    ) -> Result<i64, StorageError> {
        let row = self
            .client
            .query_one(
                "insert into analyses (event_id, model, result) values ($1,$2,$3) returning id",
                &[&event_id, &model, result],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn latest_analysis(&self, event_id: i64) -> Result<Option<AnalysisRecord>, StorageError> {
        let row = self
            .client
            .query_opt(
                "select id, event_id, model, result, created_at
                 from analyses
                 where event_id = $1
                 order by created_at desc, id desc
                 limit 1",
                &[&event_id],
            )
            .await?;
        Ok(row.map(|row| AnalysisRecord {
            id: row.get("id"),
            event_id: row.get("event_id"),
            model: row.get("model"),
            result: row.get("result"),
            created_at: row
                .get::<_, Option<DateTime<Utc>>>("created_at")
                .unwrap_or_else(Utc::now),
        }))
    }

    async fn list_events(&self, query: &EventQuery) -> Result<EventPage, StorageError> {
        let (clauses, mut params) = list_where_clauses(query);
        let where_sql = where_sql(&clauses);

        let count_sql = format!("select count(*) {LIST_FROM} {where_sql}");
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| &**p as &(dyn ToSql + Sync)).collect();
        let total: i64 = self.client.query_one(&count_sql, &param_refs).await?.get(0);

        let limit = query.limit.max(1);
        let page = query.page.max(1);
        params.push(Box::new(limit as i64));
        let limit_idx = params.len();
        params.push(Box::new(((page - 1) * limit) as i64));
        let offset_idx = params.len();

        let order = query.sort_order.as_sql();
        let list_sql = format!(
            "select e.id, e.event_type, e.event_timestamp, e.agent_id, e.conversation_id,
                    e.status, e.has_audio, e.has_user_audio, e.has_response_audio,
                    e.received_at, a.result as analysis_result
             {LIST_FROM} {where_sql}
             order by e.event_timestamp {order}, e.id {order}
             limit ${limit_idx} offset ${offset_idx}"
        );
        let param_refs: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| &**p as &(dyn ToSql + Sync)).collect();
        let rows = self.client.query(&list_sql, &param_refs).await?;

        let data = rows
            .iter()
            .map(|row| {
                let fields = row
                    .get::<_, Option<Value>>("analysis_result")
                    .map(|result| AnalysisFields::from_value(&result))
                    .unwrap_or_default();
                EventSummary {
                    id: row.get("id"),
                    event_type: row.get("event_type"),
                    event_timestamp: row.get("event_timestamp"),
                    agent_id: row.get("agent_id"),
                    conversation_id: row.get("conversation_id"),
                    status: row.get("status"),
                    has_audio: row.get::<_, Option<bool>>("has_audio").unwrap_or(false),
                    has_user_audio: row.get::<_, Option<bool>>("has_user_audio").unwrap_or(false),
                    has_response_audio: row
                        .get::<_, Option<bool>>("has_response_audio")
                        .unwrap_or(false),
                    received_at: row
                        .get::<_, Option<DateTime<Utc>>>("received_at")
                        .unwrap_or_else(Utc::now),
                    topic: fields.topic,
                    quality: fields.quality,
                    outcome: fields.outcome,
                    client_name: fields.client_name,
                    phone: fields.phone,
                }
            })
            .collect();

        let total = total as u64;
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
impl DispatchTracker for PostgresStore {
    async fn has_successful_dispatch(&self, event_id: i64) -> Result<bool, StorageError> {
        let row = self
            .client
            .query_opt(
                "select 1 from crm_dispatches where event_id = $1 and status = $2 limit 1",
                &[&event_id, &DispatchStatus::Success.as_str()],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn record_attempt(
        &self,
        event_id: i64,
        payload: &Value,
        status: DispatchStatus,
        response_text: Option<&str>,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "insert into crm_dispatches (event_id, payload, status, response_text)
                 values ($1,$2,$3,$4)",
                &[&event_id, payload, &status.as_str(), &response_text],
            )
            .await?;
        Ok(())
    }
}
