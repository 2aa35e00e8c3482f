//! Persistence of agent status, processing state, transcript, and metadata.
//!
//! The [`StateStore`] trait is the seam: the production implementation
//! ([`GatewayStore`]) talks HTTP to the API gateway with internal-key
//! authentication, while [`MemoryStateStore`] backs tests and standalone
//! runs.

mod gateway;
mod keys;
mod memory;

pub use gateway::{GatewayEgress, GatewayStore};
pub use keys::InternalKey;
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("authentication expired")]
    Unauthorized,
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Intra-cycle sub-state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Idle,
    Thinking,
    ExecutingTools,
}

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Sleeping,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

/// One transcript row. Content is always a JSON object, never raw text, so
/// structured sub-types (`text`, `notifications`, `proactive_memories`,
/// `tool_calls`) survive storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: serde_json::Value,
    #[serde(default)]
    pub documents: Vec<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,
    pub processing_state: ProcessingState,
    pub last_updated: DateTime<Utc>,
    pub total_messages: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Where the rendered tools section goes relative to a database prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolsPosition {
    Start,
    #[default]
    End,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivePrompt {
    pub content: String,
    #[serde(default)]
    pub section_ids: Vec<String>,
    #[serde(default)]
    pub tools_position: ToolsPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSection {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub display_order: i64,
}

#[derive(Debug, Clone)]
pub struct FullPrompt {
    pub full_content: String,
    pub tools_position: ToolsPosition,
}

/// Expand an active prompt record: sections sorted by `display_order` are
/// appended after the main body.
pub fn assemble_full_prompt(prompt: &ActivePrompt, mut sections: Vec<PromptSection>) -> FullPrompt {
    sections.sort_by_key(|s| s.display_order);
    let mut parts = vec![prompt.content.clone()];
    parts.extend(sections.into_iter().map(|s| s.content));
    FullPrompt {
        full_content: parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        tools_position: prompt.tools_position,
    }
}

/// Persistence operations the processing loop depends on.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn processing_state(&self) -> StoreResult<ProcessingState>;
    async fn set_processing_state(&self, state: ProcessingState) -> StoreResult<()>;
    async fn agent_status(&self) -> StoreResult<AgentStatus>;
    async fn set_agent_status(&self, status: AgentStatus) -> StoreResult<()>;
    async fn agent_state(&self) -> StoreResult<AgentState>;

    /// Ordered ascending by insertion.
    async fn message_history(&self, limit: usize, offset: usize) -> StoreResult<Vec<StoredMessage>>;
    /// Atomically appends and increments `total_messages`.
    async fn append_message(
        &self,
        role: MessageRole,
        content: serde_json::Value,
        documents: Vec<serde_json::Value>,
    ) -> StoreResult<()>;
    /// Replaces the first system message only; idempotent for identical
    /// content.
    async fn update_system_prompt(&self, content: &str) -> StoreResult<()>;

    async fn active_prompt(&self) -> StoreResult<Option<ActivePrompt>>;
    async fn prompt_sections(&self, ids: &[String]) -> StoreResult<Vec<PromptSection>>;

    /// Active prompt with sections expanded in `display_order`.
    async fn full_prompt_content(&self) -> StoreResult<Option<FullPrompt>> {
        let Some(prompt) = self.active_prompt().await? else {
            return Ok(None);
        };
        let sections = self.prompt_sections(&prompt.section_ids).await?;
        Ok(Some(assemble_full_prompt(&prompt, sections)))
    }

    /// Merge-patch semantics: top-level keys in `patch` overwrite, `null`
    /// removes.
    async fn update_agent_metadata(&self, patch: serde_json::Value) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ProcessingState::ExecutingTools).unwrap(),
            "\"executing_tools\""
        );
        assert_eq!(
            serde_json::to_string(&AgentStatus::Sleeping).unwrap(),
            "\"sleeping\""
        );
    }

    #[test]
    fn full_prompt_assembles_sections_in_display_order() {
        let prompt = ActivePrompt {
            content: "Main body".into(),
            section_ids: vec!["a".into(), "b".into()],
            tools_position: ToolsPosition::Start,
        };
        let sections = vec![
            PromptSection {
                id: "b".into(),
                content: "Second".into(),
                display_order: 2,
            },
            PromptSection {
                id: "a".into(),
                content: "First".into(),
                display_order: 1,
            },
        ];
        let full = assemble_full_prompt(&prompt, sections);
        assert_eq!(full.full_content, "Main body\n\nFirst\n\nSecond");
        assert_eq!(full.tools_position, ToolsPosition::Start);
    }

    #[test]
    fn empty_sections_are_skipped() {
        let prompt = ActivePrompt {
            content: "Body".into(),
            section_ids: vec![],
            tools_position: ToolsPosition::None,
        };
        let sections = vec![PromptSection {
            id: "x".into(),
            content: "   ".into(),
            display_order: 0,
        }];
        let full = assemble_full_prompt(&prompt, sections);
        assert_eq!(full.full_content, "Body");
    }
}
