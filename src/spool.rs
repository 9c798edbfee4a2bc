use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Append-only JSONL fallback log.
///
/// Written by the webhook handler when the store rejects an insert, so the
/// raw event survives long enough to be replayed by hand. One JSON envelope
/// per line, `{"received_at": ..., "event": <raw body>}`.
pub struct FallbackLog {
    path: PathBuf,
}

impl FallbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one raw event body as a single line.
    pub async fn append(&self, event: &Value) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let envelope = serde_json::json!({
            "received_at": Utc::now().to_rfc3339(),
            "event": event,
        });
        let mut line = serde_json::to_string(&envelope)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
