use thiserror::Error;

/// Errors surfaced by the event store and dispatch tracker.
///
/// Callers must treat the store as possibly degraded: an error aborts the
/// current operation but never crashes the process.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying store cannot be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A query or statement failed.
    #[error("storage query failed: {0}")]
    Query(String),
}

/// Errors from the external analysis backend.
///
/// Not retried internally; retry policy belongs to the caller. An event whose
/// analysis fails stays `processed = false` and is picked up again by a later
/// unprocessed pass or a manual reanalyze.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis backend not configured")]
    NotConfigured,

    #[error("analysis request timed out")]
    Timeout,

    #[error("analysis transport error: {0}")]
    Transport(String),

    #[error("analysis backend returned status {status}: {body}")]
    Backend { status: u16, body: String },
}

/// Errors from one event's processing pass (analyze, persist, mark).
///
/// CRM dispatch failures are deliberately absent: dispatch always degrades to
/// a recorded `Failed` outcome instead of an error.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}
