use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    ActivePrompt, AgentState, AgentStatus, InternalKey, MessageRole, ProcessingState,
    PromptSection, StateStore, StoreError, StoreResult, StoredMessage,
};

/// Best-effort user-facing pushes through the gateway notification endpoints.
#[async_trait]
pub trait GatewayEgress: Send + Sync {
    async fn post_action_status(&self, session_id: &str, action_description: &str)
        -> StoreResult<()>;
    async fn post_user_message(&self, session_id: Option<&str>, message: &str) -> StoreResult<()>;
    async fn post_browser_screenshot(
        &self,
        session_id: Option<&str>,
        screenshot_base64: &str,
        current_url: Option<&str>,
        task: Option<&str>,
    ) -> StoreResult<()>;
}

/// HTTP client for the API gateway's agent-state, transcript, and prompt
/// endpoints. All requests carry the `X-Internal-Key` header; a 401 reloads
/// the key from its shared path and retries the request exactly once.
pub struct GatewayStore {
    http: reqwest::Client,
    base_url: String,
    agent_name: String,
    key: Arc<InternalKey>,
}

impl GatewayStore {
    pub fn new(base_url: &str, agent_name: &str, key: Arc<InternalKey>) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_name: agent_name.to_string(),
            key,
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> StoreResult<serde_json::Value> {
        match self.request_once(method.clone(), path, body).await {
            Err(StoreError::Unauthorized) => {
                warn!("gateway returned 401, reloading internal key");
                if self.key.reload() {
                    self.request_once(method, path, body).await
                } else {
                    Err(StoreError::Unauthorized)
                }
            }
            other => other,
        }
    }

    async fn request_once(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> StoreResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, &url);
        if let Some(key) = self.key.current() {
            builder = builder.header("X-Internal-Key", key);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            StoreError::Unavailable(format!("request to {url} failed: {e}"))
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(StoreError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

#[async_trait]
impl StateStore for GatewayStore {
    async fn processing_state(&self) -> StoreResult<ProcessingState> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/agents/{}/processing-state", self.agent_name),
                None,
            )
            .await?;
        serde_json::from_value(value["processing_state"].clone())
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn set_processing_state(&self, state: ProcessingState) -> StoreResult<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/api/v1/agents/{}/processing-state", self.agent_name),
            Some(&json!({ "processing_state": state })),
        )
        .await?;
        debug!(?state, "processing state updated");
        Ok(())
    }

    async fn agent_status(&self) -> StoreResult<AgentStatus> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/agents/{}/status", self.agent_name),
                None,
            )
            .await?;
        serde_json::from_value(value["status"].clone())
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn set_agent_status(&self, status: AgentStatus) -> StoreResult<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/api/v1/agents/{}/status", self.agent_name),
            Some(&json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    async fn agent_state(&self) -> StoreResult<AgentState> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/agents/{}/state", self.agent_name),
                None,
            )
            .await?;
        serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn message_history(&self, limit: usize, offset: usize) -> StoreResult<Vec<StoredMessage>> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!(
                    "/api/v1/transcript/{}?limit={limit}&offset={offset}",
                    self.agent_name
                ),
                None,
            )
            .await?;
        serde_json::from_value(value["messages"].clone())
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn append_message(
        &self,
        role: MessageRole,
        content: serde_json::Value,
        documents: Vec<serde_json::Value>,
    ) -> StoreResult<()> {
        self.request(
            reqwest::Method::POST,
            "/api/v1/transcript/append",
            Some(&json!({
                "agent_id": self.agent_name,
                "role": role,
                "content": content,
                "documents": documents,
            })),
        )
        .await?;
        Ok(())
    }

    async fn update_system_prompt(&self, content: &str) -> StoreResult<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/api/v1/transcript/{}/system-prompt", self.agent_name),
            Some(&json!({ "content": content })),
        )
        .await?;
        Ok(())
    }

    async fn active_prompt(&self) -> StoreResult<Option<ActivePrompt>> {
        let result = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/system-prompts/agents/{}/active", self.agent_name),
                None,
            )
            .await;
        match result {
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::Decode(e.to_string())),
            Err(StoreError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn prompt_sections(&self, ids: &[String]) -> StoreResult<Vec<PromptSection>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/system-prompts/sections?ids={}", ids.join(",")),
                None,
            )
            .await?;
        serde_json::from_value(value["sections"].clone())
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn update_agent_metadata(&self, patch: serde_json::Value) -> StoreResult<()> {
        self.request(
            reqwest::Method::PUT,
            &format!("/api/v1/agents/{}/metadata", self.agent_name),
            Some(&json!({ "metadata": patch })),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GatewayEgress for GatewayStore {
    async fn post_action_status(
        &self,
        session_id: &str,
        action_description: &str,
    ) -> StoreResult<()> {
        self.request(
            reqwest::Method::POST,
            "/api/v1/notifications/action-status",
            Some(&json!({
                "agent_id": self.agent_name,
                "session_id": session_id,
                "action_description": action_description,
                "timestamp": chrono::Utc::now(),
            })),
        )
        .await?;
        Ok(())
    }

    async fn post_user_message(&self, session_id: Option<&str>, message: &str) -> StoreResult<()> {
        self.request(
            reqwest::Method::POST,
            "/api/v1/notifications/user-message",
            Some(&json!({
                "agent_id": self.agent_name,
                "session_id": session_id,
                "message": message,
                "timestamp": chrono::Utc::now(),
            })),
        )
        .await?;
        Ok(())
    }

    async fn post_browser_screenshot(
        &self,
        session_id: Option<&str>,
        screenshot_base64: &str,
        current_url: Option<&str>,
        task: Option<&str>,
    ) -> StoreResult<()> {
        self.request(
            reqwest::Method::POST,
            "/api/v1/notifications/browser-screenshot",
            Some(&json!({
                "agent_id": self.agent_name,
                "session_id": session_id,
                "screenshot_base64": screenshot_base64,
                "current_url": current_url,
                "task": task,
            })),
        )
        .await?;
        Ok(())
    }
}
