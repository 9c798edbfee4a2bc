use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AnalysisError;
use crate::types::TranscriptTurn;

/// Fixed instruction template for transcript analysis.
///
/// The backend is asked for a JSON object with exactly these eight fields;
/// downstream code treats anything else as unrecognized.
pub const SYSTEM_PROMPT: &str = "\
You are an analyst of calls and dialogues.
Analyze the conversation transcript and return structured information.

TASKS:
1. topic - the conversation topic in one word or a short phrase (e.g. \"real estate\", \"consultation\", \"complaint\").
2. intent - the client's intent (e.g. \"buying an apartment\", \"getting information\", \"resolving a problem\").
3. quality - rate the agent's answers on a scale from 1 to 5 (5 = excellent: helpful, empathetic, specific).
4. outcome - the conversation outcome (e.g. \"client interested\", \"refusal\", \"manager callback required\", \"left contact\").
5. summary - a short summary of the conversation (2-4 sentences).
6. recommendations - recommendations for improvement (1-2 sentences, what could be better or the next steps).
7. client_name - the client's name if explicitly mentioned in the dialogue. Return an empty string \"\" if not found.
8. phone - the client's phone number with country code (for example +79990009999). Return an empty string \"\" if not found.

Return the answer strictly as JSON (all 8 fields required):
{
  \"topic\": \"...\",
  \"intent\": \"...\",
  \"quality\": 3,
  \"outcome\": \"...\",
  \"summary\": \"...\",
  \"recommendations\": \"...\",
  \"client_name\": \"...\",
  \"phone\": \"...\"
}";

/// Optional caller-supplied additions to the fixed template.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeOptions {
    pub custom_prompt: Option<String>,
    pub extra_user_content: Option<String>,
}

/// One completion request as seen by a backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
}

/// External text-analysis capability.
///
/// Injected rather than globally constructed so call sites can take test
/// doubles; one implementation per external provider.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Model identifier recorded alongside each analysis row.
    fn model(&self) -> &str;

    fn is_configured(&self) -> bool;

    /// Run one completion and return the raw response content.
    async fn complete(&self, request: CompletionRequest) -> Result<String, AnalysisError>;
}

/// OpenAI-compatible chat-completions backend.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            timeout,
        }
    }

    /// Point at a different OpenAI-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl AnalysisBackend for OpenAiBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, AnalysisError> {
        if !self.is_configured() {
            return Err(AnalysisError::NotConfigured);
        }

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user}
            ],
            "response_format": {"type": "json_object"}
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AnalysisError::Timeout
                } else {
                    AnalysisError::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| AnalysisError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(AnalysisError::Backend {
                status: status.as_u16(),
                body: text,
            });
        }

        let envelope: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or("{}")
            .to_string();
        Ok(content)
    }
}

/// Analysis invoker: flattens transcripts, builds the prompt, calls the
/// injected backend, and shapes the result.
#[derive(Clone)]
pub struct Analyzer {
    backend: Arc<dyn AnalysisBackend>,
}

impl Analyzer {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self { backend }
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    /// Flatten ordered turns into a role-prefixed text block.
    pub fn transcript_to_text(turns: &[TranscriptTurn]) -> String {
        turns
            .iter()
            .map(|turn| {
                format!(
                    "{}: {}",
                    turn.role.as_deref().unwrap_or("unknown").to_uppercase(),
                    turn.message.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Analyze a structured transcript. See [`Analyzer::analyze_text`] for
    /// the result contract.
    pub async fn analyze_transcript(
        &self,
        turns: &[TranscriptTurn],
        options: &AnalyzeOptions,
    ) -> Result<Value, AnalysisError> {
        let text = Self::transcript_to_text(turns);
        self.invoke("Transcript", &text, options).await
    }

    /// Analyze raw dialogue text.
    ///
    /// Returns the backend's JSON object. An unparseable response yields an
    /// empty object rather than an error: callers must treat that as
    /// "analysis produced no usable signal". Transport failures and timeouts
    /// surface as [`AnalysisError`] and are not retried here.
    pub async fn analyze_text(
        &self,
        text: &str,
        options: &AnalyzeOptions,
    ) -> Result<Value, AnalysisError> {
        self.invoke("Dialogue (raw text)", text, options).await
    }

    async fn invoke(
        &self,
        label: &str,
        text: &str,
        options: &AnalyzeOptions,
    ) -> Result<Value, AnalysisError> {
        let user = build_user_content(label, text, options);
        tracing::debug!(
            user_len = user.len(),
            model = self.backend.model(),
            "invoking analysis backend"
        );

        let content = self
            .backend
            .complete(CompletionRequest {
                system: SYSTEM_PROMPT.to_string(),
                user,
            })
            .await?;

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(Value::Object(map)),
            _ => {
                tracing::debug!(len = content.len(), "unparseable analysis response, returning empty result");
                Ok(Value::Object(serde_json::Map::new()))
            }
        }
    }
}

fn build_user_content(label: &str, text: &str, options: &AnalyzeOptions) -> String {
    let mut sections = Vec::new();
    if let Some(custom) = options.custom_prompt.as_deref().filter(|s| !s.is_empty()) {
        sections.push(format!("Instructions (custom):\n{custom}"));
    }
    sections.push(format!("{label}:\n{text}"));
    if let Some(extra) = options.extra_user_content.as_deref().filter(|s| !s.is_empty()) {
        sections.push(format!("Additional context:\n{extra}"));
    }
    sections.join("\n\n")
}


#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;
    use crate::types::AnalysisFields;

    fn turns() -> Vec<TranscriptTurn> {
        vec![
            TranscriptTurn {
                role: Some("agent".to_string()),
                message: Some("Hello, how can I help?".to_string()),
            },
            TranscriptTurn {
                role: None,
                message: Some("I want a flat".to_string()),
            },
            TranscriptTurn {
                role: Some("user".to_string()),
                message: None,
            },
        ]
    }

    #[test]
    fn flattens_transcript_with_role_prefixes() {
        let text = Analyzer::transcript_to_text(&turns());
        assert_eq!(text, "AGENT: Hello, how can I help?\nUNKNOWN: I want a flat\nUSER: ");
    }

    #[tokio::test]
    async fn builds_prompt_with_custom_sections() {
        let backend = Arc::new(FakeBackend::returning("{}"));
        let analyzer = Analyzer::new(backend.clone());

        let options = AnalyzeOptions {
            custom_prompt: Some("Focus on the budget.".to_string()),
            extra_user_content: Some("Second call.".to_string()),
        };
        analyzer.analyze_transcript(&turns(), &options).await.unwrap();

        let requests = backend.requests.lock().await;
        let request = &requests[0];
        assert_eq!(request.system, SYSTEM_PROMPT);
        assert!(request.user.starts_with("Instructions (custom):\nFocus on the budget."));
        assert!(request.user.contains("Transcript:\nAGENT: Hello"));
        assert!(request.user.ends_with("Additional context:\nSecond call."));
    }

    #[tokio::test]
    async fn parses_recognized_fields() {
        let backend = Arc::new(FakeBackend::returning(
            r#"{"topic":"real estate","intent":"buy","quality":4,"outcome":"interested",
                "summary":"s","recommendations":"r","client_name":"Ivan","phone":"+79991234567"}"#,
        ));
        let analyzer = Analyzer::new(backend);
        let result = analyzer
            .analyze_text("USER: hi", &AnalyzeOptions::default())
            .await
            .unwrap();
        let fields = AnalysisFields::from_value(&result);
        assert_eq!(fields.topic.as_deref(), Some("real estate"));
        assert_eq!(fields.quality, Some(4));
        assert_eq!(fields.phone.as_deref(), Some("+79991234567"));
    }

    #[tokio::test]
    async fn unparseable_response_becomes_empty_result() {
        for garbage in ["not json at all", "[1,2,3]", "\"just a string\""] {
            let analyzer = Analyzer::new(Arc::new(FakeBackend::returning(garbage)));
            let result = analyzer
                .analyze_text("USER: hi", &AnalyzeOptions::default())
                .await
                .unwrap();
            assert_eq!(result, serde_json::json!({}), "for {garbage:?}");
            assert_eq!(AnalysisFields::from_value(&result), AnalysisFields::default());
        }
    }

    #[tokio::test]
    async fn out_of_range_quality_passes_through() {
        let analyzer = Analyzer::new(Arc::new(FakeBackend::returning(r#"{"quality":11}"#)));
        let result = analyzer
            .analyze_text("USER: hi", &AnalyzeOptions::default())
            .await
            .unwrap();
        assert_eq!(AnalysisFields::from_value(&result).quality, Some(11));
    }
}
