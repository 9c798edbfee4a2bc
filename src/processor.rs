use std::sync::Arc;

use serde_json::Value;

use crate::analysis::{AnalyzeOptions, Analyzer};
use crate::crm::{CrmDispatcher, DispatchOutcome};
use crate::error::ProcessError;
use crate::journal::CrmJournal;
use crate::scheduler::Scheduler;
use crate::storage::EventStore;
use crate::types::{AnalysisFields, WebhookEvent};

/// Result of one full processing pass over an event.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    pub event_id: i64,
    pub analysis_id: i64,
    /// The stored analysis blob.
    pub result: Value,
    /// `None` when the dispatch step itself errored before producing an
    /// outcome; the analysis is still stored in that case.
    pub dispatch: Option<DispatchOutcome>,
}

/// Per-event pipeline: analyze, persist, mark processed, dispatch.
pub struct Processor {
    store: Arc<dyn EventStore>,
    analyzer: Analyzer,
    scheduler: Scheduler,
    crm: Arc<CrmDispatcher>,
    journal: CrmJournal,
}

impl Processor {
    pub fn new(
        store: Arc<dyn EventStore>,
        analyzer: Analyzer,
        scheduler: Scheduler,
        crm: Arc<CrmDispatcher>,
        journal: CrmJournal,
    ) -> Self {
        Self {
            store,
            analyzer,
            scheduler,
            crm,
            journal,
        }
    }

    /// Run the full pipeline for one event.
    ///
    /// The analysis call goes through the scheduler's rate bounds. An
    /// analysis or storage failure propagates and leaves the event
    /// unprocessed, so a later pass picks it up again. Dispatch is
    /// best-effort: its outcome is reported but never fails the pipeline.
    pub async fn process_event(
        &self,
        event: &WebhookEvent,
        force_dispatch: bool,
    ) -> Result<ProcessReport, ProcessError> {
        let turns = event.transcript();
        let options = AnalyzeOptions::default();
        let result = self
            .scheduler
            .run(|| self.analyzer.analyze_transcript(&turns, &options))
            .await?;

        let analysis_id = self
            .store
            .insert_analysis(event.id, self.analyzer.model(), &result)
            .await?;
        self.store.mark_processed(&[event.id], Some("analyzed")).await?;
        tracing::info!(event_id = event.id, analysis_id, "event analyzed");

        let fields = AnalysisFields::from_value(&result);
        if let Err(err) = self.journal.append(event, &fields).await {
            tracing::warn!(event_id = event.id, error = %err, "crm journal write failed");
        }
        let dispatch = match self.crm.dispatch(event, &fields, force_dispatch).await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::warn!(event_id = event.id, error = %err, "crm dispatch errored");
                None
            }
        };

        Ok(ProcessReport {
            event_id: event.id,
            analysis_id,
            result,
            dispatch,
        })
    }

    /// Process the oldest unprocessed event, if any.
    pub async fn process_next(&self) -> Result<Option<ProcessReport>, ProcessError> {
        let mut batch = self.store.fetch_unprocessed(1).await?;
        let Some(event) = batch.pop() else {
            return Ok(None);
        };
        self.process_event(&event, false).await.map(Some)
    }

    /// Background job spawned after webhook acceptance. Failures are logged
    /// and the event stays unprocessed; the accept response is unaffected.
    pub fn spawn_process(self: &Arc<Self>, event: WebhookEvent) {
        let processor = self.clone();
        tokio::spawn(async move {
            match processor.process_event(&event, false).await {
                Ok(report) => tracing::debug!(
                    event_id = report.event_id,
                    analysis_id = report.analysis_id,
                    "background processing complete"
                ),
                Err(err) => tracing::warn!(
                    event_id = event.id,
                    error = %err,
                    "background processing failed"
                ),
            }
        });
    }
}
