//! Language-model access for the agent loop and the memory modules.
//!
//! The [`LanguageModel`] trait is the seam the runtime depends on; the
//! production implementation is [`GeminiClient`] against the Gemini
//! generateContent API with JSON-mode output. Messages are role + parts so
//! image bytes ride alongside text for vision calls.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

/// Hard per-call deadline. A timeout fails the cycle as transient.
pub const LLM_DEADLINE: Duration = Duration::from_secs(90);

/// Default model for normal turns.
pub const STANDARD_MODEL: &str = "gemini-3-flash-preview";
/// Low-latency model used during voice calls (fast mode).
pub const FAST_MODEL: &str = "gemini-2.5-flash-lite";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm call timed out after {0:?}")]
    Timeout(Duration),
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("empty response from llm")]
    EmptyResponse,
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::Transport(_) => true,
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            LlmError::EmptyResponse => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    User,
    Model,
}

/// One part of a message: text or inline binary (e.g. an image).
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    Blob { mime_type: String, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub parts: Vec<Part>,
}

impl LlmMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: LlmRole::Model,
            parts: vec![Part::Text(text.into())],
        }
    }

    pub fn user_parts(parts: Vec<Part>) -> Self {
        Self {
            role: LlmRole::User,
            parts,
        }
    }
}

/// Seam between the runtime and the model provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one generation returning the raw response text. The model is
    /// instructed to emit JSON; `fast_mode` selects the low-latency variant.
    async fn generate_json(&self, messages: &[LlmMessage], fast_mode: bool)
        -> Result<String, LlmError>;
}

/// Gemini generateContent client.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    standard_model: String,
    fast_model: String,
}

impl GeminiClient {
    pub fn new(api_key: &str) -> Result<Self, LlmError> {
        Self::with_base_url(api_key, "https://generativelanguage.googleapis.com")
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(LLM_DEADLINE)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            standard_model: STANDARD_MODEL.to_string(),
            fast_model: FAST_MODEL.to_string(),
        })
    }

    fn encode_messages(messages: &[LlmMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|message| {
                let parts: Vec<serde_json::Value> = message
                    .parts
                    .iter()
                    .map(|part| match part {
                        Part::Text(text) => json!({ "text": text }),
                        Part::Blob { mime_type, data } => json!({
                            "inline_data": {
                                "mime_type": mime_type,
                                "data": base64::engine::general_purpose::STANDARD.encode(data),
                            }
                        }),
                    })
                    .collect();
                let role = match message.role {
                    LlmRole::User => "user",
                    LlmRole::Model => "model",
                };
                json!({ "role": role, "parts": parts })
            })
            .collect()
    }
}

/// Pull the concatenated text out of a generateContent response body.
pub fn extract_text(body: &serde_json::Value) -> Result<String, LlmError> {
    let parts = body["candidates"][0]["content"]["parts"]
        .as_array()
        .ok_or(LlmError::EmptyResponse)?;
    let text: String = parts
        .iter()
        .filter_map(|p| p["text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    if text.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(text.trim().to_string())
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate_json(
        &self,
        messages: &[LlmMessage],
        fast_mode: bool,
    ) -> Result<String, LlmError> {
        let model = if fast_mode {
            &self.fast_model
        } else {
            &self.standard_model
        };
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let payload = json!({
            "contents": Self::encode_messages(messages),
            "generationConfig": { "response_mime_type": "application/json" },
        });

        debug!(model, message_count = messages.len(), "calling llm");
        let request = self.http.post(&url).json(&payload).send();
        let response = tokio::time::timeout(LLM_DEADLINE, request)
            .await
            .map_err(|_| LlmError::Timeout(LLM_DEADLINE))?
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(LLM_DEADLINE)
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        let text = extract_text(&body)?;
        info!(model, reply_len = text.len(), "llm reply received");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::Timeout(LLM_DEADLINE).is_transient());
        assert!(LlmError::Transport("connection reset".into()).is_transient());
        assert!(LlmError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(LlmError::Api {
            status: 429,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::Api {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!LlmError::EmptyResponse.is_transient());
    }

    #[test]
    fn extract_text_joins_parts() {
        let body = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{"text": "{\"thought\""}, {"text": ": \"hi\"}"}] }
            }]
        });
        assert_eq!(extract_text(&body).unwrap(), "{\"thought\": \"hi\"}");
    }

    #[test]
    fn extract_text_rejects_empty() {
        let body = serde_json::json!({ "candidates": [] });
        assert!(matches!(extract_text(&body), Err(LlmError::EmptyResponse)));
        let blank = serde_json::json!({
            "candidates": [{ "content": { "parts": [{"text": "  "}] } }]
        });
        assert!(matches!(extract_text(&blank), Err(LlmError::EmptyResponse)));
    }

    #[test]
    fn blob_parts_encode_as_inline_data() {
        let messages = vec![LlmMessage::user_parts(vec![
            Part::Text("look".into()),
            Part::Blob {
                mime_type: "image/png".into(),
                data: vec![1, 2, 3],
            },
        ])];
        let encoded = GeminiClient::encode_messages(&messages);
        assert_eq!(encoded[0]["parts"][0]["text"], "look");
        assert_eq!(encoded[0]["parts"][1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(encoded[0]["parts"][1]["inline_data"]["data"], "AQID");
    }
}
