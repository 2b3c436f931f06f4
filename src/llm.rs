//! OpenRouter chat-completion client. Used for schema mapping inference and
//! for refining search-derived estimates. Everything degrades gracefully when
//! no key is configured, so the client is always optional.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::clients::TextCompleter;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenRouterClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .context("Failed to build completion HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }

    /// Build from `OPENROUTER_API_KEY`, with `OPENROUTER_MODEL` overriding
    /// the default model. Returns `None` when the key is unset.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY").ok()?;
        let model =
            std::env::var("OPENROUTER_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(api_key, model).ok()
    }
}

#[async_trait]
impl TextCompleter for OpenRouterClient {
    async fn complete(&self, prompt: &str, temperature: f32, max_tokens: u32) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        let response = self
            .client
            .post(OPENROUTER_URL)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .context("Completion request failed")?
            .error_for_status()
            .context("Completion API returned an error status")?;
        let body: ChatResponse = response
            .json()
            .await
            .context("Completion API returned invalid JSON")?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("Completion response had no choices"))
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}
