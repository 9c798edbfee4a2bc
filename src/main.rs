use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use voicehook::{
    build_store, router, AnalysisBackend, Analyzer, AppState, Config, CrmDispatcher, CrmJournal,
    FallbackLog, OpenAiBackend, Processor, Scheduler,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    let (store, tracker) = build_store(&config).await?;

    let backend = Arc::new(OpenAiBackend::new(
        config.openai_api_key.clone(),
        config.analyze_model.clone(),
        config.analysis_timeout,
    ));
    if !backend.is_configured() {
        tracing::warn!("OPENAI_API_KEY not set, analysis requests will fail");
    }

    let crm = Arc::new(CrmDispatcher::new(config.crm.clone(), tracker));
    let processor = Arc::new(Processor::new(
        store.clone(),
        Analyzer::new(backend),
        Scheduler::new(config.analyze_max_concurrency, config.analyze_min_spacing),
        crm.clone(),
        CrmJournal::new(config.crm_md_enabled, &config.crm_md_path),
    ));

    let state = AppState {
        store,
        processor,
        crm,
        spool: Arc::new(FallbackLog::new(&config.fallback_log_path)),
        webhook_secret: config.webhook_secret.clone(),
        webhook_tolerance_secs: config.webhook_tolerance_secs,
        signature_header: config.signature_header.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(bind = %config.bind, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
