//! Voice-agent webhook ingestion, transcript analysis and CRM dispatch.
//!
//! This crate receives **signed** voice-agent webhooks, stores them, analyzes
//! conversation transcripts through an injected backend, and forwards
//! qualified leads to an external CRM.
//!
//! ## Guarantees
//! - Signature verification over the exact raw bytes, constant-time compare
//! - Acceptance response reflects durable storage, never processing
//! - At most one successful CRM delivery per event under normal operation
//! - Bounded, rate-limited analysis concurrency
//!
//! ## Non-Guarantees
//! - Exactly-once CRM delivery (a crash between send and record can repeat)
//! - Deduplication of repeated webhook deliveries at ingest
//! - Analysis quality validation (model output is stored as-is)

mod analysis;
mod config;
mod crm;
mod error;
mod journal;
mod processor;
mod scheduler;
mod server;
mod signing;
mod spool;
mod storage;
mod types;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use analysis::{
    AnalysisBackend, AnalyzeOptions, Analyzer, CompletionRequest, OpenAiBackend, SYSTEM_PROMPT,
};
pub use config::Config;
pub use crm::{
    build_commentary, build_payload, resolve_contact, split_phone, Contact, ContactSource,
    CrmConfig, CrmDispatcher, DispatchOutcome, PhoneParts, SkipReason, CONTACT_SOURCE_ORDER,
    MANDATORY_CONTACT_FIELDS, MANDATORY_FIELDS,
};
pub use error::{AnalysisError, ProcessError, StorageError};
pub use journal::CrmJournal;
pub use processor::{ProcessReport, Processor};
pub use scheduler::Scheduler;
pub use server::{router, AppState};
pub use signing::{
    compute_signature, parse_signature_header, verify, ParsedSignature, VerificationError,
    SIGNATURE_KEYS, TIMESTAMP_KEYS,
};
pub use spool::FallbackLog;
pub use storage::{build_store, DispatchTracker, EventStore, InMemoryStore};
pub use types::{
    AnalysisFields, AnalysisRecord, DispatchAttempt, DispatchStatus, EventPage, EventQuery,
    EventSummary, NewWebhookEvent, Pagination, SortOrder, TranscriptTurn, WebhookEvent,
};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
