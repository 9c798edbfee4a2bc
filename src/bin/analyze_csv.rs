//! Offline batch analysis over a CSV export of dialogue transcripts.
//!
//! Reads one column of raw dialogue text, runs each non-empty cell through
//! the analyzer under the usual rate bounds, and stores a synthetic
//! `offline_csv` event plus its analysis row per cell.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;
use voicehook::{
    build_store, AnalysisBackend, AnalyzeOptions, Analyzer, Config, EventStore, OpenAiBackend,
    Scheduler,
};

#[derive(Parser)]
#[command(name = "analyze-csv")]
#[command(about = "Analyze dialogue transcripts from a CSV column and store the results")]
struct Cli {
    /// CSV file to read.
    #[arg(long, short)]
    file: PathBuf,

    /// Header of the column holding the dialogue text.
    #[arg(long, default_value = "dialog")]
    col: String,

    /// Stop after this many analyzed rows.
    #[arg(long)]
    limit: Option<usize>,

    /// Extra instructions appended to the analysis prompt.
    #[arg(long)]
    custom_prompt: Option<String>,
}

fn column_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h.trim() == name)
}

fn offline_event(text: &str, timestamp: i64) -> voicehook::NewWebhookEvent {
    let mut event = voicehook::NewWebhookEvent::from_payload(json!({
        "type": "offline_csv",
        "event_timestamp": timestamp,
        "data": { "raw_text": text },
    }));
    event.status = Some("done".to_string());
    event
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let (store, _tracker) = build_store(&config).await?;

    let backend = Arc::new(OpenAiBackend::new(
        config.openai_api_key.clone(),
        config.analyze_model.clone(),
        config.analysis_timeout,
    ));
    if !backend.is_configured() {
        tracing::warn!("OPENAI_API_KEY not set, analysis requests will fail");
    }
    let analyzer = Analyzer::new(backend);
    let scheduler = Scheduler::new(config.analyze_max_concurrency, config.analyze_min_spacing);
    let options = AnalyzeOptions {
        custom_prompt: cli.custom_prompt.clone(),
        extra_user_content: None,
    };

    let mut reader = csv::Reader::from_path(&cli.file)?;
    let headers = reader.headers()?.clone();
    let Some(col) = column_index(&headers, &cli.col) else {
        return Err(format!("column {:?} not found in {}", cli.col, cli.file.display()).into());
    };

    let limit = cli.limit.unwrap_or(usize::MAX);
    let mut analyzed = 0usize;
    let mut skipped = 0usize;
    for record in reader.records() {
        if analyzed >= limit {
            break;
        }
        let record = record?;
        let text = record.get(col).unwrap_or("").trim().to_string();
        if text.is_empty() {
            skipped += 1;
            continue;
        }

        let result = scheduler
            .run(|| analyzer.analyze_text(&text, &options))
            .await?;

        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let event_id = store.insert_event(offline_event(&text, timestamp)).await?;
        store
            .insert_analysis(event_id, analyzer.model(), &result)
            .await?;
        store.mark_processed(&[event_id], Some("offline_csv")).await?;

        analyzed += 1;
        if analyzed % 10 == 0 {
            tracing::info!(analyzed, "progress");
        }
    }

    tracing::info!(analyzed, skipped, "csv analysis complete");
    Ok(())
}
