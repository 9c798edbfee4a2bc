use std::env;
use std::time::Duration;

use crate::crm::CrmConfig;

/// Process configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    /// Shared webhook secret; empty means verification fails closed.
    pub webhook_secret: String,
    pub webhook_tolerance_secs: u64,
    /// HTTP header carrying the webhook signature.
    pub signature_header: String,
    /// Postgres connection string; absent means the in-memory store.
    pub database_url: Option<String>,
    pub openai_api_key: String,
    pub analyze_model: String,
    pub analysis_timeout: Duration,
    pub analyze_max_concurrency: usize,
    pub analyze_min_spacing: Duration,
    pub crm: CrmConfig,
    pub fallback_log_path: String,
    /// Markdown journal of analyzed conversations, kept next to the CRM send.
    pub crm_md_enabled: bool,
    pub crm_md_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind: env_str("BIND", "0.0.0.0:3000"),
            webhook_secret: env_str("WEBHOOK_SECRET", ""),
            webhook_tolerance_secs: env_u64("WEBHOOK_TOLERANCE_SEC", 1_800),
            signature_header: env_str("SIGNATURE_HEADER", "ElevenLabs-Signature"),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            openai_api_key: env_str("OPENAI_API_KEY", ""),
            analyze_model: env_str("ANALYZE_MODEL", "gpt-5"),
            analysis_timeout: Duration::from_millis(env_u64("ANALYSIS_TIMEOUT_MS", 30_000)),
            analyze_max_concurrency: env_u64("ANALYZE_MAX_CONCURRENCY", 1).max(1) as usize,
            analyze_min_spacing: Duration::from_millis(env_u64("ANALYZE_MIN_MS", 1_500)),
            crm: crm_from_env(),
            fallback_log_path: env_str("FALLBACK_LOG_PATH", "data/fallback-events.jsonl"),
            crm_md_enabled: env_bool("CRM_MD_ENABLED", true),
            crm_md_path: env_str("CRM_MD_PATH", "memory-bank/crm.md"),
        }
    }
}

fn crm_from_env() -> CrmConfig {
    let defaults = CrmConfig::default();
    CrmConfig {
        enabled: env_bool("CRM_ENABLED", false),
        dry_run: env_bool("CRM_DRY_RUN", false),
        service_url: env_str("CRM_SERVICE_URL", ""),
        landing_id: env_str("CRM_LANDING_ID", ""),
        basic_auth_user: env_str("CRM_AUTH_USER", ""),
        basic_auth_pass: env_str("CRM_AUTH_PASS", ""),
        trust_header: match (env::var("CRM_TRUST_HEADER_NAME"), env::var("CRM_TRUST_HEADER_VALUE")) {
            (Ok(name), Ok(value)) if !name.is_empty() => Some((name, value)),
            _ => None,
        },
        request_timeout: Duration::from_millis(env_u64(
            "CRM_TIMEOUT_MS",
            defaults.request_timeout.as_millis() as u64,
        )),
        max_retries: env_u64("CRM_MAX_RETRIES", defaults.max_retries as u64) as u32,
        retry_base_delay: Duration::from_millis(env_u64(
            "CRM_RETRY_BASE_MS",
            defaults.retry_base_delay.as_millis() as u64,
        )),
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "off" | "no"
        ),
        Err(_) => default,
    }
}
