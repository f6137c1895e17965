//! Volcengine Ark chat client (OpenAI-compatible chat completions).

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::http::{completions_body, stream_chat_completions};
use super::{LlmClient, LlmError, ProviderOutcome, ProviderRequest};

/// Client for an Ark endpoint (`ARK_API_URL`, `ARK_API_KEY`).
pub struct ArkClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ArkClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmClient for ArkClient {
    fn name(&self) -> &str {
        "volcano"
    }

    async fn stream_chat(
        &self,
        request: ProviderRequest,
        delta_tx: Option<mpsc::Sender<String>>,
    ) -> Result<ProviderOutcome, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = completions_body(model, &request.messages, &request.tools);
        stream_chat_completions(
            &self.client,
            &self.completions_url(),
            Some(&self.api_key),
            body,
            delta_tx,
        )
        .await
    }
}
