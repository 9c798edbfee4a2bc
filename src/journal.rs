use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::types::{AnalysisFields, WebhookEvent};

/// Append-only markdown journal of analyzed conversations.
///
/// One entry per pipeline pass, written best-effort alongside the external
/// CRM send; a write failure never affects the pipeline outcome.
pub struct CrmJournal {
    enabled: bool,
    path: PathBuf,
}

fn or_na(value: Option<&str>) -> &str {
    value.filter(|s| !s.is_empty()).unwrap_or("n/a")
}

impl CrmJournal {
    pub fn new(enabled: bool, path: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            path: path.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, "")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render one journal entry.
    pub fn format_entry(event: &WebhookEvent, fields: &AnalysisFields) -> String {
        let quality = fields.quality.map(|q| q.to_string());
        format!(
            "\n\n## Analytics entry {} (event_id: {})\n\n\
             - Agent: {}\n\
             - Conversation: {}\n\
             - Source: {} webhook, status: {}\n\
             - Topic: {}\n\
             - Intent: {}\n\
             - Agent answer quality (1-5): {}\n\
             - Outcome: {}\n\
             - Summary: {}\n\
             - Recommendations: {}",
            Utc::now().to_rfc3339(),
            event.id,
            or_na(event.agent_id.as_deref()),
            or_na(event.conversation_id.as_deref()),
            event.event_type,
            or_na(event.status.as_deref()),
            or_na(fields.topic.as_deref()),
            or_na(fields.intent.as_deref()),
            or_na(quality.as_deref()),
            or_na(fields.outcome.as_deref()),
            or_na(fields.summary.as_deref()),
            or_na(fields.recommendations.as_deref()),
        )
    }

    /// Append one entry. `Ok(false)` means the journal is disabled and
    /// nothing was written.
    pub async fn append(
        &self,
        event: &WebhookEvent,
        fields: &AnalysisFields,
    ) -> std::io::Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let entry = Self::format_entry(event, fields);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(true)
    }
}
