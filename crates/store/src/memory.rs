use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    ActivePrompt, AgentState, AgentStatus, GatewayEgress, MessageRole, ProcessingState,
    PromptSection, StateStore, StoreResult, StoredMessage,
};

/// In-process state store used by tests and standalone runs.
///
/// Behaves like the gateway-backed store: appending bumps `total_messages`,
/// every state write refreshes `last_updated`, metadata patches merge.
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

struct Inner {
    status: AgentStatus,
    processing_state: ProcessingState,
    last_updated: DateTime<Utc>,
    total_messages: u64,
    metadata: Value,
    messages: Vec<StoredMessage>,
    active_prompt: Option<ActivePrompt>,
    sections: Vec<PromptSection>,
    action_statuses: Vec<(String, String)>,
    user_messages: Vec<String>,
    screenshots: Vec<String>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: AgentStatus::Active,
                processing_state: ProcessingState::Idle,
                last_updated: Utc::now(),
                total_messages: 0,
                metadata: Value::Object(Default::default()),
                messages: Vec::new(),
                active_prompt: None,
                sections: Vec::new(),
                action_statuses: Vec::new(),
                user_messages: Vec::new(),
                screenshots: Vec::new(),
            }),
        }
    }

    pub fn set_active_prompt(&self, prompt: Option<ActivePrompt>, sections: Vec<PromptSection>) {
        let mut inner = self.inner.lock();
        inner.active_prompt = prompt;
        inner.sections = sections;
    }

    /// Backdate `last_updated` so tests can exercise stale-state recovery.
    pub fn set_last_updated(&self, when: DateTime<Utc>) {
        self.inner.lock().last_updated = when;
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.inner.lock().messages.clone()
    }

    pub fn metadata(&self) -> Value {
        self.inner.lock().metadata.clone()
    }

    pub fn action_statuses(&self) -> Vec<(String, String)> {
        self.inner.lock().action_statuses.clone()
    }

    pub fn user_messages(&self) -> Vec<String> {
        self.inner.lock().user_messages.clone()
    }

    pub fn screenshots(&self) -> Vec<String> {
        self.inner.lock().screenshots.clone()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn processing_state(&self) -> StoreResult<ProcessingState> {
        Ok(self.inner.lock().processing_state)
    }

    async fn set_processing_state(&self, state: ProcessingState) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.processing_state = state;
        inner.last_updated = Utc::now();
        Ok(())
    }

    async fn agent_status(&self) -> StoreResult<AgentStatus> {
        Ok(self.inner.lock().status)
    }

    async fn set_agent_status(&self, status: AgentStatus) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.status = status;
        inner.last_updated = Utc::now();
        Ok(())
    }

    async fn agent_state(&self) -> StoreResult<AgentState> {
        let inner = self.inner.lock();
        Ok(AgentState {
            status: inner.status,
            processing_state: inner.processing_state,
            last_updated: inner.last_updated,
            total_messages: inner.total_messages,
            metadata: inner.metadata.clone(),
        })
    }

    async fn message_history(&self, limit: usize, offset: usize) -> StoreResult<Vec<StoredMessage>> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .skip(offset)
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect())
    }

    async fn append_message(
        &self,
        role: MessageRole,
        content: Value,
        documents: Vec<Value>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.messages.push(StoredMessage {
            role,
            content,
            documents,
            timestamp: Utc::now(),
        });
        inner.total_messages += 1;
        inner.last_updated = Utc::now();
        Ok(())
    }

    async fn update_system_prompt(&self, content: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let new_content = serde_json::json!({ "text": content });
        match inner.messages.first_mut() {
            Some(first) if first.role == MessageRole::System => {
                if first.content != new_content {
                    first.content = new_content;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn active_prompt(&self) -> StoreResult<Option<ActivePrompt>> {
        Ok(self.inner.lock().active_prompt.clone())
    }

    async fn prompt_sections(&self, ids: &[String]) -> StoreResult<Vec<PromptSection>> {
        let inner = self.inner.lock();
        Ok(inner
            .sections
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect())
    }

    async fn update_agent_metadata(&self, patch: Value) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let (Value::Object(current), Value::Object(patch)) = (&mut inner.metadata, patch) {
            for (key, value) in patch {
                if value.is_null() {
                    current.remove(&key);
                } else {
                    current.insert(key, value);
                }
            }
        }
        inner.last_updated = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl GatewayEgress for MemoryStateStore {
    async fn post_action_status(
        &self,
        session_id: &str,
        action_description: &str,
    ) -> StoreResult<()> {
        self.inner
            .lock()
            .action_statuses
            .push((session_id.to_string(), action_description.to_string()));
        Ok(())
    }

    async fn post_user_message(&self, _session_id: Option<&str>, message: &str) -> StoreResult<()> {
        self.inner.lock().user_messages.push(message.to_string());
        Ok(())
    }

    async fn post_browser_screenshot(
        &self,
        _session_id: Option<&str>,
        screenshot_base64: &str,
        _current_url: Option<&str>,
        _task: Option<&str>,
    ) -> StoreResult<()> {
        self.inner
            .lock()
            .screenshots
            .push(screenshot_base64.to_string());
        Ok(())
    }
}
