//! OpenAI-compatible chat-completions client
//!
//! Implements [`TextGenerator`] over `POST {base_url}/chat/completions`. Any server
//! speaking that protocol works (hosted APIs, local inference servers).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::LlmSettings;
use crate::error::{AgentError, Result};
use crate::translator::TextGenerator;

const SYSTEM_PROMPT: &str = "You are a database assistant that converts natural language \
requests into SQL. You only answer with SQL that is valid for the stated database and that \
uses the tables and columns you were given.";

/// Chat-completions text generator
pub struct ChatCompletions {
    http_client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl ChatCompletions {
    /// Build a client from settings
    ///
    /// The API key is read from `settings.api_key_env`; a missing key is allowed for
    /// local servers that do not check it.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::debug!(
                env = %settings.api_key_env,
                "no API key set, sending unauthenticated requests"
            );
        }

        let mut builder = Client::builder();
        if let Some(ms) = settings.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let http_client = builder
            .build()
            .map_err(|e| AgentError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            api_key,
        })
    }
}

#[async_trait]
impl TextGenerator for ChatCompletions {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": prompt },
            ],
        });

        let mut request = self.http_client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::generation(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AgentError::generation(format!(
                "API error (status {status}): {error_text}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AgentError::generation(format!("Failed to parse response: {e}")))?;

        message_content(&payload)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// `choices[0].message.content` of a chat-completions response
fn message_content(payload: &Value) -> Result<String> {
    payload["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .and_then(|choice| choice["message"]["content"].as_str())
        .map(str::to_string)
        .ok_or_else(|| AgentError::generation("response contained no message content"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_content() {
        let payload = json!({
            "id": "chatcmpl-1",
            "choices": [
                { "index": 0, "message": { "role": "assistant", "content": "SELECT 1" } }
            ]
        });
        assert_eq!(message_content(&payload).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_message_content_missing() {
        let err = message_content(&json!({ "choices": [] })).unwrap_err();
        assert!(matches!(err, AgentError::Generation(_)));

        let err = message_content(&json!({ "error": { "message": "quota" } })).unwrap_err();
        assert!(err.message().contains("no message content"));
    }

    #[test]
    fn test_from_settings_trims_base_url() {
        let settings = LlmSettings {
            base_url: "http://localhost:11434/v1/".to_string(),
            api_key_env: "SQLAGENT_TEST_UNSET_KEY".to_string(),
            ..LlmSettings::default()
        };
        let client = ChatCompletions::from_settings(&settings).unwrap();
        assert_eq!(client.base_url, "http://localhost:11434/v1");
        assert!(client.api_key.is_none());
    }
}
