use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::StorageError;
use crate::storage::DispatchTracker;
use crate::types::{AnalysisFields, DispatchStatus, WebhookEvent};

/// Outbound CRM configuration.
#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub enabled: bool,
    /// Build and record the payload without performing network I/O.
    pub dry_run: bool,
    pub service_url: String,
    pub landing_id: String,
    pub basic_auth_user: String,
    pub basic_auth_pass: String,
    /// Optional extra trust header sent with every request.
    pub trust_header: Option<(String, String)>,
    pub request_timeout: Duration,
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Backoff between attempts grows linearly: `retry_base_delay * attempt`.
    pub retry_base_delay: Duration,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: false,
            service_url: String::new(),
            landing_id: String::new(),
            basic_auth_user: String::new(),
            basic_auth_pass: String::new(),
            trust_header: None,
            request_timeout: Duration::from_millis(8_000),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(300),
        }
    }
}

/// Why a dispatch was skipped before any payload was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NotConfigured,
    AlreadySent,
}

/// Terminal state of one dispatch request.
///
/// `Failed` is a soft, reported outcome, never a process error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Skipped { reason: SkipReason },
    DryRun,
    Sent,
    Failed {
        status: Option<u16>,
        body: Option<String>,
    },
}

/// Candidate sources for contact resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactSource {
    /// `payload.data.contact.{fullName|name, phone, email}`.
    ExplicitContact,
    /// Top-level `user_name` / `user_phone` / `user_email`.
    TopLevelUser,
    /// `client_name` / `phone` extracted by the analysis step.
    AnalysisExtraction,
}

/// Business rule, not an implementation detail: contact fields are resolved
/// by walking these sources in order, first non-empty value wins per field.
pub const CONTACT_SOURCE_ORDER: [ContactSource; 3] = [
    ContactSource::ExplicitContact,
    ContactSource::TopLevelUser,
    ContactSource::AnalysisExtraction,
];

/// Resolved contact information for the outbound payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contact {
    pub full_name: String,
    pub phone: String,
    pub email: String,
}

fn payload_str(payload: &Value, pointer: &str) -> String {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn candidate_for(source: ContactSource, event: &WebhookEvent, analysis: &AnalysisFields) -> Contact {
    match source {
        ContactSource::ExplicitContact => {
            let full_name = {
                let name = payload_str(&event.payload, "/data/contact/fullName");
                if name.is_empty() {
                    payload_str(&event.payload, "/data/contact/name")
                } else {
                    name
                }
            };
            Contact {
                full_name,
                phone: payload_str(&event.payload, "/data/contact/phone"),
                email: payload_str(&event.payload, "/data/contact/email"),
            }
        }
        ContactSource::TopLevelUser => Contact {
            full_name: payload_str(&event.payload, "/user_name"),
            phone: payload_str(&event.payload, "/user_phone"),
            email: payload_str(&event.payload, "/user_email"),
        },
        ContactSource::AnalysisExtraction => Contact {
            full_name: analysis.client_name.clone().unwrap_or_default(),
            phone: analysis.phone.clone().unwrap_or_default(),
            email: String::new(),
        },
    }
}

/// Resolve the outbound contact by walking [`CONTACT_SOURCE_ORDER`].
pub fn resolve_contact(event: &WebhookEvent, analysis: &AnalysisFields) -> Contact {
    let mut resolved = Contact::default();
    for source in CONTACT_SOURCE_ORDER {
        let candidate = candidate_for(source, event, analysis);
        if resolved.full_name.is_empty() {
            resolved.full_name = candidate.full_name;
        }
        if resolved.phone.is_empty() {
            resolved.phone = candidate.phone;
        }
        if resolved.email.is_empty() {
            resolved.email = candidate.email;
        }
    }
    resolved
}

/// Length of the local part of a split phone number.
pub const PHONE_LOCAL_DIGITS: usize = 7;

/// Placeholders used when no phone number could be resolved, so that
/// CRM-mandatory phone fields are always populated.
pub const PHONE_PLACEHOLDER_PREFIX: &str = "+0";
pub const PHONE_PLACEHOLDER_LOCAL: &str = "0000000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneParts {
    pub prefix: String,
    pub local: String,
}

impl PhoneParts {
    pub fn placeholder() -> Self {
        Self {
            prefix: PHONE_PLACEHOLDER_PREFIX.to_string(),
            local: PHONE_PLACEHOLDER_LOCAL.to_string(),
        }
    }
}

/// Split a raw phone number into a country-code prefix and a 7-digit local
/// suffix. Numbers of 7 or fewer digits are entirely local with an empty
/// prefix; a number with no digits at all yields `None`.
pub fn split_phone(raw: &str) -> Option<PhoneParts> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if digits.len() <= PHONE_LOCAL_DIGITS {
        return Some(PhoneParts {
            prefix: String::new(),
            local: digits,
        });
    }

    let mut normalized = String::new();
    if raw.trim_start().starts_with('+') {
        normalized.push('+');
    }
    normalized.push_str(&digits);

    let local = digits[digits.len() - PHONE_LOCAL_DIGITS..].to_string();
    let prefix = normalized[..normalized.len() - (PHONE_LOCAL_DIGITS + 1)].to_string();
    Some(PhoneParts { prefix, local })
}

/// Field names always included in the outbound payload, even when empty.
pub const MANDATORY_FIELDS: &[&str] = &["Commentary", "UsrEventId"];

/// Contact field names always included, even when empty (the phone pair is
/// populated from placeholders when absent).
pub const MANDATORY_CONTACT_FIELDS: &[&str] = &["PhoneCode", "Phone"];

/// One human-readable commentary line joining the analysis fields and the
/// correlation ids.
pub fn build_commentary(event: &WebhookEvent, analysis: &AnalysisFields) -> String {
    let mut parts = Vec::new();
    if let Some(topic) = analysis.topic.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Topic: {topic}"));
    }
    if let Some(intent) = analysis.intent.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Intent: {intent}"));
    }
    if let Some(quality) = analysis.quality {
        parts.push(format!("Quality: {quality}"));
    }
    if let Some(outcome) = analysis.outcome.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Outcome: {outcome}"));
    }
    if let Some(summary) = analysis.summary.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Summary: {summary}"));
    }
    if let Some(recs) = analysis.recommendations.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Recommendations: {recs}"));
    }
    parts.push(format!(
        "IDs: event={}, agent={}, conv={}",
        event.id,
        event.agent_id.as_deref().unwrap_or("n/a"),
        event.conversation_id.as_deref().unwrap_or("n/a"),
    ));
    parts.join(" | ")
}

fn name_value_array(entries: Vec<(&str, String)>, mandatory: &[&str]) -> Value {
    Value::Array(
        entries
            .into_iter()
            .filter(|(name, value)| mandatory.contains(name) || !value.is_empty())
            .map(|(name, value)| serde_json::json!({"name": name, "value": value}))
            .collect(),
    )
}

/// Build the exact outbound body for one event + analysis pair.
pub fn build_payload(landing_id: &str, event: &WebhookEvent, analysis: &AnalysisFields) -> Value {
    let commentary = build_commentary(event, analysis);
    let contact = resolve_contact(event, analysis);
    let phone = split_phone(&contact.phone).unwrap_or_else(PhoneParts::placeholder);

    let fields = name_value_array(
        vec![
            ("Commentary", commentary.clone()),
            ("UsrQualificationComment", commentary),
            ("UsrTSLeadStatus", analysis.outcome.clone().unwrap_or_default()),
            ("UsrQualificationTopic", analysis.topic.clone().unwrap_or_default()),
            ("UsrIntent", analysis.intent.clone().unwrap_or_default()),
            (
                "UsrQualityScore",
                analysis.quality.map(|q| q.to_string()).unwrap_or_default(),
            ),
            ("UsrEventId", event.id.to_string()),
            ("UsrAgentId", event.agent_id.clone().unwrap_or_default()),
            (
                "UsrConversationId",
                event.conversation_id.clone().unwrap_or_default(),
            ),
        ],
        MANDATORY_FIELDS,
    );

    let contact_fields = name_value_array(
        vec![
            ("FullName", contact.full_name),
            ("PhoneCode", phone.prefix),
            ("Phone", phone.local),
            ("Email", contact.email),
        ],
        MANDATORY_CONTACT_FIELDS,
    );

    serde_json::json!({
        "landingId": landing_id,
        "fields": fields,
        "contactFields": contact_fields,
    })
}

/// CRM dispatcher: builds the outbound payload, performs bounded retries
/// with linear backoff, and consults/updates the dispatch tracker.
pub struct CrmDispatcher {
    config: CrmConfig,
    client: reqwest::Client,
    tracker: Arc<dyn DispatchTracker>,
}

impl CrmDispatcher {
    pub fn new(config: CrmConfig, tracker: Arc<dyn DispatchTracker>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            tracker,
        }
    }

    pub fn config(&self) -> &CrmConfig {
        &self.config
    }

    /// Run the dispatch state machine for one event.
    ///
    /// Unless `force` is set, an event with a recorded successful dispatch is
    /// skipped: at most one outbound send reaches `success` per event under
    /// normal operation, even when the webhook or analysis step is retried.
    /// A failed gate query aborts with `StorageError`; everything past the
    /// gate degrades to a recorded outcome.
    pub async fn dispatch(
        &self,
        event: &WebhookEvent,
        analysis: &AnalysisFields,
        force: bool,
    ) -> Result<DispatchOutcome, StorageError> {
        if !self.config.enabled {
            tracing::debug!(event_id = event.id, "crm dispatch disabled, skipping");
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::Disabled,
            });
        }
        if self.config.service_url.is_empty() || self.config.landing_id.is_empty() {
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::NotConfigured,
            });
        }
        if !force && self.tracker.has_successful_dispatch(event.id).await? {
            tracing::debug!(event_id = event.id, "already dispatched, skipping");
            return Ok(DispatchOutcome::Skipped {
                reason: SkipReason::AlreadySent,
            });
        }

        let payload = build_payload(&self.config.landing_id, event, analysis);

        if self.config.dry_run {
            self.record(event.id, &payload, DispatchStatus::DryRun, None).await;
            return Ok(DispatchOutcome::DryRun);
        }

        // Explicit bounded retry loop; the attempt counter drives the
        // linear backoff.
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.post_payload(&payload).await {
                Ok((status, body)) if (200..300).contains(&status) => {
                    self.record(event.id, &payload, DispatchStatus::Success, Some(&body))
                        .await;
                    tracing::info!(event_id = event.id, status, attempt, "crm dispatch sent");
                    return Ok(DispatchOutcome::Sent);
                }
                Ok((status, body)) => {
                    let note = format!("HTTP {status}: {body}");
                    self.record(event.id, &payload, DispatchStatus::Error, Some(&note))
                        .await;
                    if attempt >= max_attempts {
                        tracing::warn!(
                            event_id = event.id,
                            status,
                            attempt,
                            "crm dispatch failed, retries exhausted"
                        );
                        return Ok(DispatchOutcome::Failed {
                            status: Some(status),
                            body: Some(body),
                        });
                    }
                }
                Err(err) => {
                    let note = err.to_string();
                    self.record(event.id, &payload, DispatchStatus::Error, Some(&note))
                        .await;
                    if attempt >= max_attempts {
                        tracing::warn!(
                            event_id = event.id,
                            error = %err,
                            attempt,
                            "crm dispatch failed, retries exhausted"
                        );
                        return Ok(DispatchOutcome::Failed {
                            status: None,
                            body: Some(note),
                        });
                    }
                }
            }
            tokio::time::sleep(self.config.retry_base_delay * attempt).await;
        }
    }

    async fn post_payload(&self, payload: &Value) -> Result<(u16, String), reqwest::Error> {
        let mut request = self
            .client
            .post(&self.config.service_url)
            .timeout(self.config.request_timeout)
            .json(payload);
        if !self.config.basic_auth_user.is_empty() && !self.config.basic_auth_pass.is_empty() {
            request = request.basic_auth(
                &self.config.basic_auth_user,
                Some(&self.config.basic_auth_pass),
            );
        }
        if let Some((name, value)) = &self.config.trust_header {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok((status, body))
    }

    async fn record(
        &self,
        event_id: i64,
        payload: &Value,
        status: DispatchStatus,
        response_text: Option<&str>,
    ) {
        // The delivery already happened (or was deliberately skipped); a
        // bookkeeping failure must not change the reported outcome.
        if let Err(err) = self
            .tracker
            .record_attempt(event_id, payload, status, response_text)
            .await
        {
            tracing::warn!(event_id, error = %err, "failed to record dispatch attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use crate::types::NewWebhookEvent;
    use axum::{http::StatusCode, routing::post, Router};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event_with_payload(id: i64, payload: Value) -> WebhookEvent {
        NewWebhookEvent::from_payload(payload).into_event(id)
    }

    fn analysis(topic: &str) -> AnalysisFields {
        AnalysisFields {
            topic: Some(topic.to_string()),
            quality: Some(4),
            outcome: Some("interested".to_string()),
            ..AnalysisFields::default()
        }
    }

    /// Stub CRM endpoint answering with the given status per request index,
    /// then 200 from there on.
    async fn stub_crm(responses: Vec<u16>) -> (SocketAddr, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_handler = hits.clone();
        let responses = Arc::new(responses);
        let app = Router::new().route(
            "/lead",
            post(move || {
                let hits = hits_handler.clone();
                let responses = responses.clone();
                async move {
                    let index = hits.fetch_add(1, Ordering::SeqCst);
                    let status = responses.get(index).copied().unwrap_or(200);
                    StatusCode::from_u16(status).unwrap()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, hits)
    }

    fn test_config(url: String) -> CrmConfig {
        CrmConfig {
            enabled: true,
            service_url: url,
            landing_id: "landing-1".to_string(),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(5),
            ..CrmConfig::default()
        }
    }

    #[test]
    fn splits_long_phone_into_prefix_and_local() {
        assert_eq!(
            split_phone("+79991234567"),
            Some(PhoneParts {
                prefix: "+799".to_string(),
                local: "1234567".to_string()
            })
        );
    }

    #[test]
    fn short_phone_is_entirely_local() {
        assert_eq!(
            split_phone("12345"),
            Some(PhoneParts {
                prefix: String::new(),
                local: "12345".to_string()
            })
        );
        assert_eq!(
            split_phone("1234567"),
            Some(PhoneParts {
                prefix: String::new(),
                local: "1234567".to_string()
            })
        );
    }

    #[test]
    fn phone_without_digits_is_absent() {
        assert_eq!(split_phone(""), None);
        assert_eq!(split_phone("call me"), None);
    }

    #[test]
    fn contact_precedence_is_first_non_empty_per_field() {
        let event = event_with_payload(
            1,
            json!({
                "user_name": "Top Level",
                "user_email": "top@example.com",
                "data": {"contact": {"fullName": "Explicit Name"}}
            }),
        );
        let fields = AnalysisFields {
            client_name: Some("Extracted".to_string()),
            phone: Some("+79991234567".to_string()),
            ..AnalysisFields::default()
        };

        let contact = resolve_contact(&event, &fields);
        // Name comes from the explicit contact block, phone falls all the
        // way through to the analysis extraction, email from user fields.
        assert_eq!(contact.full_name, "Explicit Name");
        assert_eq!(contact.phone, "+79991234567");
        assert_eq!(contact.email, "top@example.com");

        assert_eq!(
            CONTACT_SOURCE_ORDER,
            [
                ContactSource::ExplicitContact,
                ContactSource::TopLevelUser,
                ContactSource::AnalysisExtraction
            ]
        );
    }

    #[test]
    fn payload_keeps_mandatory_fields_and_drops_empty_optionals() {
        let event = event_with_payload(42, json!({}));
        let payload = build_payload("landing-1", &event, &AnalysisFields::default());

        assert_eq!(payload["landingId"], "landing-1");

        let names: Vec<&str> = payload["fields"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["name"].as_str().unwrap())
            .collect();
        assert!(names.contains(&"Commentary"));
        assert!(names.contains(&"UsrEventId"));
        // Optional fields with no value are not included.
        assert!(!names.contains(&"UsrIntent"));
        assert!(!names.contains(&"UsrQualityScore"));

        let contact_fields = payload["contactFields"].as_array().unwrap();
        let get = |name: &str| {
            contact_fields
                .iter()
                .find(|f| f["name"] == name)
                .map(|f| f["value"].as_str().unwrap().to_string())
        };
        // Absent phone falls back to the fixed placeholders.
        assert_eq!(get("PhoneCode").as_deref(), Some(PHONE_PLACEHOLDER_PREFIX));
        assert_eq!(get("Phone").as_deref(), Some(PHONE_PLACEHOLDER_LOCAL));
        assert_eq!(get("FullName"), None);
        assert_eq!(get("Email"), None);
    }

    #[test]
    fn outbound_field_names_match_the_crm_schema() {
        let event = event_with_payload(42, json!({}));
        let payload = build_payload("landing-1", &event, &analysis("real estate"));
        let fields = payload["fields"].as_array().unwrap();
        let get = |name: &str| {
            fields
                .iter()
                .find(|f| f["name"] == name)
                .map(|f| f["value"].as_str().unwrap().to_string())
        };
        // The receiving CRM's field schema, spelled exactly.
        assert_eq!(get("UsrTSLeadStatus").as_deref(), Some("interested"));
        assert_eq!(get("UsrQualificationTopic").as_deref(), Some("real estate"));
        assert_eq!(get("UsrQualityScore").as_deref(), Some("4"));
        assert_eq!(get("UsrEventId").as_deref(), Some("42"));
        assert_eq!(get("UsrLeadStatus"), None);
    }

    #[test]
    fn commentary_always_carries_correlation_ids() {
        let event = event_with_payload(
            7,
            json!({"data": {"agent_id": "agent-1", "conversation_id": "conv-2"}}),
        );
        let commentary = build_commentary(&event, &analysis("real estate"));
        assert!(commentary.contains("Topic: real estate"));
        assert!(commentary.contains("Quality: 4"));
        assert!(commentary.ends_with("IDs: event=7, agent=agent-1, conv=conv-2"));

        let bare = build_commentary(&event, &AnalysisFields::default());
        assert_eq!(bare, "IDs: event=7, agent=agent-1, conv=conv-2");
    }

    #[tokio::test]
    async fn disabled_and_unconfigured_skip_without_recording() {
        let store = Arc::new(InMemoryStore::new());
        let event = event_with_payload(1, json!({}));

        let dispatcher = CrmDispatcher::new(CrmConfig::default(), store.clone());
        assert_eq!(
            dispatcher.dispatch(&event, &analysis("t"), false).await.unwrap(),
            DispatchOutcome::Skipped {
                reason: SkipReason::Disabled
            }
        );

        let dispatcher = CrmDispatcher::new(
            CrmConfig {
                enabled: true,
                ..CrmConfig::default()
            },
            store.clone(),
        );
        assert_eq!(
            dispatcher.dispatch(&event, &analysis("t"), false).await.unwrap(),
            DispatchOutcome::Skipped {
                reason: SkipReason::NotConfigured
            }
        );

        assert!(store.attempts_for_event(1).await.is_empty());
    }

    #[tokio::test]
    async fn dry_run_records_payload_without_network() {
        let store = Arc::new(InMemoryStore::new());
        let event = event_with_payload(1, json!({}));
        // Unroutable URL: dry-run must return before any I/O happens.
        let dispatcher = CrmDispatcher::new(
            CrmConfig {
                dry_run: true,
                ..test_config("http://127.0.0.1:9/lead".to_string())
            },
            store.clone(),
        );

        let outcome = dispatcher.dispatch(&event, &analysis("t"), false).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::DryRun);

        let attempts = store.attempts_for_event(1).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, DispatchStatus::DryRun);
        assert_eq!(attempts[0].payload["landingId"], "landing-1");
        assert!(attempts[0].payload["fields"].is_array());
    }

    #[tokio::test]
    async fn retries_with_backoff_until_success() {
        let (addr, hits) = stub_crm(vec![500, 200]).await;
        let store = Arc::new(InMemoryStore::new());
        let event = event_with_payload(1, json!({}));
        let dispatcher =
            CrmDispatcher::new(test_config(format!("http://{addr}/lead")), store.clone());

        let outcome = dispatcher.dispatch(&event, &analysis("t"), false).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Sent);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let attempts = store.attempts_for_event(1).await;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].status, DispatchStatus::Error);
        assert!(attempts[0].response_text.as_deref().unwrap().starts_with("HTTP 500"));
        assert_eq!(attempts[1].status, DispatchStatus::Success);
    }

    #[tokio::test]
    async fn exhausted_retries_degrade_to_failed() {
        let (addr, hits) = stub_crm(vec![502, 502, 502, 502]).await;
        let store = Arc::new(InMemoryStore::new());
        let event = event_with_payload(1, json!({}));
        let dispatcher = CrmDispatcher::new(
            CrmConfig {
                max_retries: 1,
                ..test_config(format!("http://{addr}/lead"))
            },
            store.clone(),
        );

        let outcome = dispatcher.dispatch(&event, &analysis("t"), false).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Failed {
                status: Some(502),
                body: Some(String::new()),
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(store.attempts_for_event(1).await.len(), 2);
    }

    #[tokio::test]
    async fn transport_errors_degrade_to_failed() {
        let store = Arc::new(InMemoryStore::new());
        let event = event_with_payload(1, json!({}));
        let dispatcher = CrmDispatcher::new(
            CrmConfig {
                max_retries: 0,
                ..test_config("http://127.0.0.1:9/lead".to_string())
            },
            store.clone(),
        );

        let outcome = dispatcher.dispatch(&event, &analysis("t"), false).await.unwrap();
        match outcome {
            DispatchOutcome::Failed { status: None, body: Some(_) } => {}
            other => panic!("expected transport failure, got {other:?}"),
        }
        let attempts = store.attempts_for_event(1).await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, DispatchStatus::Error);
    }

    #[tokio::test]
    async fn idempotency_gate_blocks_second_send_unless_forced() {
        let (addr, hits) = stub_crm(vec![]).await;
        let store = Arc::new(InMemoryStore::new());
        let event = event_with_payload(1, json!({}));
        let dispatcher =
            CrmDispatcher::new(test_config(format!("http://{addr}/lead")), store.clone());

        assert_eq!(
            dispatcher.dispatch(&event, &analysis("t"), false).await.unwrap(),
            DispatchOutcome::Sent
        );

        // Concurrent re-dispatches both observe the recorded success.
        let analysis_result = analysis("t");
        let (first, second) = tokio::join!(
            dispatcher.dispatch(&event, &analysis_result, false),
            dispatcher.dispatch(&event, &analysis_result, false),
        );
        for outcome in [first.unwrap(), second.unwrap()] {
            assert_eq!(
                outcome,
                DispatchOutcome::Skipped {
                    reason: SkipReason::AlreadySent
                }
            );
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let successes = store
            .attempts_for_event(1)
            .await
            .iter()
            .filter(|a| a.status == DispatchStatus::Success)
            .count();
        assert_eq!(successes, 1);

        // Force bypasses the gate.
        assert_eq!(
            dispatcher.dispatch(&event, &analysis("t"), true).await.unwrap(),
            DispatchOutcome::Sent
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
