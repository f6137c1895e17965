//! Ollama chat client, via its OpenAI-compatible endpoint.
//!
//! Some local models cannot emit structured tool calls and instead inline
//! `<tool_call>{...}</tool_call>` into the text; the Ollama protocol adapter
//! handles that shape downstream.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::http::{completions_body, stream_chat_completions};
use super::{LlmClient, LlmError, ProviderOutcome, ProviderRequest};

/// Client for a local Ollama server (`OLLAMA_API_URL`, `OLLAMA_MODEL`).
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        "local"
    }

    async fn stream_chat(
        &self,
        request: ProviderRequest,
        delta_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ProviderOutcome, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = completions_body(model, &request.messages, &request.tools);
        stream_chat_completions(&self.client, &self.completions_url(), None, body, delta_tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_url_appends_v1_path() {
        let c = OllamaClient::new("http://127.0.0.1:11434", "qwen2.5:7b");
        assert_eq!(
            c.completions_url(),
            "http://127.0.0.1:11434/v1/chat/completions"
        );
    }
}
