use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The eight kinds of memory the modules may persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    UserPreference,
    UserFact,
    ConversationContext,
    AgentProcedure,
    Knowledge,
    EventPattern,
    ErrorHandling,
    ProactiveAction,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::UserPreference => "user_preference",
            MemoryType::UserFact => "user_fact",
            MemoryType::ConversationContext => "conversation_context",
            MemoryType::AgentProcedure => "agent_procedure",
            MemoryType::Knowledge => "knowledge",
            MemoryType::EventPattern => "event_pattern",
            MemoryType::ErrorHandling => "error_handling",
            MemoryType::ProactiveAction => "proactive_action",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    Individual,
    #[default]
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    UserExplicit,
    Inferred,
    ProactiveAgent,
    AgentLearning,
}

/// A semantic memory record. The 768-dim embedding vector lives outside the
/// property set, keyed by the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub content: String,
    pub memory_type: MemoryType,
    pub scope: MemoryScope,
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: f32,
    pub confidence: f32,
    pub source: MemorySource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub related_memory_ids: Vec<Uuid>,
}

impl MemoryRecord {
    pub fn new(
        content: impl Into<String>,
        memory_type: MemoryType,
        scope: MemoryScope,
        agent_id: impl Into<String>,
        source: MemorySource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            memory_type,
            scope,
            agent_id: agent_id.into(),
            session_id: None,
            tags: Vec::new(),
            importance: 0.5,
            confidence: 1.0,
            source,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            access_count: 0,
            success_count: 0,
            failure_count: 0,
            expires_at: None,
            related_memory_ids: Vec::new(),
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self.clamp_scores();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Importance and confidence always live in [0, 1].
    pub fn clamp_scores(&mut self) {
        self.importance = self.importance.clamp(0.0, 1.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
    }
}

/// Partial update applied by [`crate::MemoryStore::update`].
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub content: Option<String>,
    pub importance: Option<f32>,
    pub confidence: Option<f32>,
    pub tags: Option<Vec<String>>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub related_memory_ids: Option<Vec<Uuid>>,
}
