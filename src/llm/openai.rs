use super::{ChatMessage, CompletionError, NO_RESPONSE_FALLBACK};
use crate::config::LlmConfig;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint (OpenRouter by default).
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    config: LlmConfig,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Result<Self, CompletionError> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Send the turns and return the assistant text.
    ///
    /// A 2xx response without a usable choice yields [`NO_RESPONSE_FALLBACK`]
    /// rather than an error.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, CompletionError> {
        let body = OpenAiRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", &self.config.http_referer)
            .header("X-Title", &self.config.app_title)
            .json(&body);

        if !self.config.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        tracing::debug!(model = %self.config.model, turns = messages.len(), "sending completion request");
        let resp = req.send().await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "completion API returned an error");
            return Err(CompletionError::api(status.as_u16(), &text));
        }

        Ok(parse_reply(&text))
    }
}

fn parse_reply(body: &str) -> String {
    match serde_json::from_str::<OpenAiResponse>(body) {
        Ok(data) => data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_else(|| NO_RESPONSE_FALLBACK.to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "unparsable completion response");
            NO_RESPONSE_FALLBACK.to_string()
        }
    }
}
