//! End-to-end pipeline tests driving the HTTP surface against the in-memory
//! store, a mock analysis backend, and a local CRM stub.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use voicehook::{
    compute_signature, AnalysisBackend, AnalysisError, AnalyzeOptions, Analyzer, AppState,
    CompletionRequest, CrmConfig, CrmDispatcher, CrmJournal, DispatchStatus, EventStore,
    FallbackLog, InMemoryStore, NewWebhookEvent, Processor, Scheduler,
};

const SECRET: &str = "integration-secret";

const ANALYSIS_JSON: &str = r#"{
  "topic": "real estate",
  "intent": "buying an apartment",
  "quality": 4,
  "outcome": "client interested",
  "summary": "The client asked about two-bedroom flats.",
  "recommendations": "Send the catalogue.",
  "client_name": "Anna",
  "phone": "+79991234567"
}"#;

struct MockBackend {
    content: String,
}

#[async_trait]
impl AnalysisBackend for MockBackend {
    fn model(&self) -> &str {
        "mock-model"
    }

    fn is_configured(&self) -> bool {
        true
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<String, AnalysisError> {
        Ok(self.content.clone())
    }
}

async fn stub_crm() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handler = hits.clone();
    let app = Router::new().route(
        "/lead",
        post(move || {
            let hits = hits_handler.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::OK
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

fn build_app(crm_config: CrmConfig) -> (Router, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let crm = Arc::new(CrmDispatcher::new(crm_config, store.clone()));
    let processor = Arc::new(Processor::new(
        store.clone(),
        Analyzer::new(Arc::new(MockBackend {
            content: ANALYSIS_JSON.to_string(),
        })),
        Scheduler::new(1, Duration::ZERO),
        crm.clone(),
        CrmJournal::disabled(),
    ));
    let spool_path = std::env::temp_dir().join(format!(
        "voicehook-pipeline-test-{}.jsonl",
        std::process::id()
    ));
    let state = AppState {
        store: store.clone(),
        processor,
        crm,
        spool: Arc::new(FallbackLog::new(spool_path)),
        webhook_secret: SECRET.to_string(),
        webhook_tolerance_secs: 1800,
        signature_header: "ElevenLabs-Signature".to_string(),
    };
    (voicehook::router(state), store)
}

fn transcript_body() -> String {
    json!({
        "type": "post_call_transcription",
        "event_timestamp": 1_724_000_000,
        "data": {
            "agent_id": "agent-1",
            "conversation_id": "conv-1",
            "transcript": [
                {"role": "agent", "message": "Hello, how can I help?"},
                {"role": "user", "message": "I am looking for a flat"},
                {"role": "agent", "message": "I can send you our catalogue"}
            ]
        }
    })
    .to_string()
}

fn signed_webhook(body: &str) -> Request<Body> {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        .to_string();
    let sig = compute_signature(SECRET.as_bytes(), &ts, body.as_bytes());
    Request::builder()
        .method("POST")
        .uri("/webhook/elevenlabs")
        .header("ElevenLabs-Signature", format!("t={ts}, s={sig}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

async fn post_empty(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    (status, body_json(response).await)
}

/// Poll until the background pipeline has stored an analysis for the event.
async fn wait_for_analysis(app: &Router, id: i64) -> Value {
    for _ in 0..200 {
        let (status, body) = get_json(app, &format!("/api/events/{id}")).await;
        if status == StatusCode::OK && !body["analysis"].is_null() {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("analysis never appeared for event {id}");
}

#[tokio::test]
async fn signed_webhook_flows_through_analysis_and_dispatch() {
    let crm_config = CrmConfig {
        enabled: true,
        dry_run: true,
        service_url: "http://127.0.0.1:9/lead".to_string(),
        landing_id: "landing-1".to_string(),
        ..CrmConfig::default()
    };
    let (app, store) = build_app(crm_config);

    let response = app
        .clone()
        .oneshot(signed_webhook(&transcript_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"ok");

    let body = wait_for_analysis(&app, 1).await;
    assert_eq!(body["event"]["event_type"], "post_call_transcription");
    assert_eq!(body["event"]["processed"], true);
    assert_eq!(body["analysis"]["result"]["topic"], "real estate");
    assert_eq!(body["analysis"]["model"], "mock-model");

    // The dry-run dispatch follows the analysis insert; poll briefly.
    let mut attempts = store.attempts_for_event(1).await;
    for _ in 0..200 {
        if !attempts.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        attempts = store.attempts_for_event(1).await;
    }
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, DispatchStatus::DryRun);
    assert_eq!(attempts[0].payload["landingId"], "landing-1");

    // The listing joins the latest-analysis fields.
    let (status, page) = get_json(&app, "/api/events?topic=real%20estate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["pagination"]["total"], 1);
    assert_eq!(page["data"][0]["client_name"], "Anna");
}

#[tokio::test]
async fn tampered_webhook_is_rejected_before_storage() {
    let (app, store) = build_app(CrmConfig::default());

    let body = transcript_body();
    let mut request = signed_webhook(&body);
    *request.body_mut() = Body::from(format!("{body} "));
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(store.get_event(1).await.unwrap().is_none());
}

#[tokio::test]
async fn analyze_next_drains_the_backlog_in_order() {
    let (app, store) = build_app(CrmConfig::default());
    for ts in [200, 100] {
        store
            .insert_event(NewWebhookEvent::from_payload(json!({
                "type": "post_call_transcription",
                "event_timestamp": ts,
                "data": {"transcript": [{"role": "user", "message": "hi"}]}
            })))
            .await
            .unwrap();
    }

    // Oldest event timestamp first, regardless of insertion order.
    let (status, first) = post_empty(&app, "/api/analyze/next").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["event_id"], 2);
    assert_eq!(first["result"]["topic"], "real estate");

    let (_, second) = post_empty(&app, "/api/analyze/next").await;
    assert_eq!(second["event_id"], 1);

    let (_, drained) = post_empty(&app, "/api/analyze/next").await;
    assert_eq!(drained["message"], "nothing_to_analyze");
}

#[tokio::test]
async fn reanalyze_appends_a_row_and_forces_dispatch() {
    let (addr, hits) = stub_crm().await;
    let crm_config = CrmConfig {
        enabled: true,
        service_url: format!("http://{addr}/lead"),
        landing_id: "landing-1".to_string(),
        retry_base_delay: Duration::from_millis(5),
        ..CrmConfig::default()
    };
    let (app, store) = build_app(crm_config);
    let id = store
        .insert_event(NewWebhookEvent::from_payload(json!({
            "type": "post_call_transcription",
            "event_timestamp": 100,
            "data": {"transcript": [{"role": "user", "message": "hi"}]}
        })))
        .await
        .unwrap();

    let (status, first) = post_empty(&app, "/api/analyze/next").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["event_id"], id);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(store.analysis_count(id).await, 1);

    // Reanalysis adds a second row and bypasses the idempotency gate.
    let (status, again) = post_empty(&app, &format!("/api/events/{id}/reanalyze")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["dispatch"]["outcome"], "sent");
    assert_eq!(store.analysis_count(id).await, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn resend_is_idempotent_unless_forced() {
    let (addr, hits) = stub_crm().await;
    let crm_config = CrmConfig {
        enabled: true,
        service_url: format!("http://{addr}/lead"),
        landing_id: "landing-1".to_string(),
        retry_base_delay: Duration::from_millis(5),
        ..CrmConfig::default()
    };
    let (app, store) = build_app(crm_config);
    let id = store
        .insert_event(NewWebhookEvent::from_payload(json!({
            "type": "post_call_transcription",
            "event_timestamp": 100,
            "data": {"transcript": [{"role": "user", "message": "hi"}]}
        })))
        .await
        .unwrap();

    let (status, _) = post_empty(&app, "/api/analyze/next").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Concurrent resends both observe the recorded success.
    let uri = format!("/api/events/{id}/resend-crm");
    let (first, second) = tokio::join!(post_empty(&app, &uri), post_empty(&app, &uri));
    for (status, outcome) in [first, second] {
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "skipped");
        assert_eq!(outcome["reason"], "already_sent");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let successes = store
        .attempts_for_event(id)
        .await
        .iter()
        .filter(|a| a.status == DispatchStatus::Success)
        .count();
    assert_eq!(successes, 1);

    let (status, forced) = post_empty(&app, &format!("{uri}?force=true")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(forced["outcome"], "sent");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn resend_without_analysis_conflicts() {
    let (app, store) = build_app(CrmConfig::default());
    let id = store
        .insert_event(NewWebhookEvent::from_payload(json!({"type": "x"})))
        .await
        .unwrap();

    let (status, body) = post_empty(&app, &format!("/api/events/{id}/resend-crm")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "no_analysis");
}

#[tokio::test]
async fn analyze_requires_event_id_and_payload() {
    let (app, store) = build_app(CrmConfig::default());

    // No id at all, and an id without a payload: both rejected before any
    // analysis or storage happens.
    for event in [
        json!({"type": "x", "data": {"transcript": [{"role": "user", "message": "hi"}]}}),
        json!({"id": 7}),
    ] {
        let request = Request::builder()
            .method("POST")
            .uri("/api/analyze")
            .header("content-type", "application/json")
            .body(Body::from(json!({"event": event}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "bad_request");
    }
    assert_eq!(store.analysis_count(0).await, 0);
    assert_eq!(store.analysis_count(7).await, 0);
}

#[tokio::test]
async fn analyze_prefers_the_stored_row_for_a_known_id() {
    let (app, store) = build_app(CrmConfig::default());
    let id = store
        .insert_event(NewWebhookEvent::from_payload(json!({
            "type": "post_call_transcription",
            "event_timestamp": 100,
            "data": {"transcript": [{"role": "user", "message": "hi"}]}
        })))
        .await
        .unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/api/analyze")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "event": {
                    "id": id,
                    "payload": {"type": "stale_copy", "data": {"transcript": []}}
                }
            })
            .to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"]["topic"], "real estate");
    assert!(body["analysis_id"].as_i64().unwrap() > 0);
    assert_eq!(store.analysis_count(id).await, 1);
    assert!(store.get_event(id).await.unwrap().unwrap().processed);
}

// AnalyzeOptions is part of the public analysis surface; exercise the
// custom-prompt path through the library API.
#[tokio::test]
async fn analyzer_accepts_custom_instructions() {
    let analyzer = Analyzer::new(Arc::new(MockBackend {
        content: ANALYSIS_JSON.to_string(),
    }));
    let result = analyzer
        .analyze_text(
            "USER: hi",
            &AnalyzeOptions {
                custom_prompt: Some("Focus on budget".to_string()),
                extra_user_content: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result["topic"], "real estate");
}
