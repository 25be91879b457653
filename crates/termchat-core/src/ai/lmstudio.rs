use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::state::ChatTurn;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:1234";
pub const DEFAULT_MODEL: &str = "default";

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_thinking: Option<bool>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

/// Text carried by one streamed completion chunk. May be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeltaToken {
    pub text: String,
}

impl DeltaToken {
    /// Extract `choices[0].delta.content` from a data payload.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        let chunk: StreamChunk = serde_json::from_str(payload)?;
        let text = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .unwrap_or_default();
        Ok(Self { text })
    }
}

/// Client for an OpenAI-compatible local server (LM Studio and friends)
#[derive(Clone)]
pub struct LmStudioClient {
    client: Client,
    base_url: String,
}

impl LmStudioClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a streaming chat completion and hand back the live response.
    ///
    /// A non-success status is drained and returned as
    /// [`RelayError::BackendRejected`] with the body verbatim.
    pub async fn stream_chat(
        &self,
        model: &str,
        messages: &[ChatTurn],
        disable_extended_reasoning: bool,
    ) -> Result<Response, RelayError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let request = CompletionRequest {
            model,
            messages,
            stream: true,
            enable_thinking: disable_extended_reasoning.then_some(false),
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RelayError::BackendUnreachable {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::BackendRejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    pub async fn list_models(&self) -> Result<Vec<String>, RelayError> {
        let url = format!("{}/v1/models", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayError::BackendUnreachable {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::BackendRejected {
                status: status.as_u16(),
                body,
            });
        }

        let models: ModelsResponse =
            response
                .json()
                .await
                .map_err(|e| RelayError::BackendRejected {
                    status: status.as_u16(),
                    body: format!("unexpected model list: {}", e),
                })?;

        Ok(models.data.into_iter().map(|model| model.id).collect())
    }
}
