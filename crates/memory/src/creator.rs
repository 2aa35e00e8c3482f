use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use murmur_llm::{LanguageModel, LlmMessage};
use murmur_store::{StateStore, StoredMessage};

use crate::json_util::{format_messages, strip_code_fences};
use crate::{Embedder, MemoryRecord, MemoryScope, MemorySource, MemoryStore, MemoryType};
use crate::{SearchFilters, SortBy};

/// Metadata key carrying an unfinished disclosure across turns.
const WAIT_TOPIC_KEY: &str = "memory_creator_wait_topic";

/// How many previously created memories the prompt shows for duplicate
/// avoidance.
const PAST_MEMORIES: usize = 5;

#[derive(Debug, Deserialize)]
struct CreatorDecision {
    #[serde(default)]
    reflection: String,
    decision: String,
    #[serde(default)]
    memories: Vec<ProposedMemory>,
    #[serde(default)]
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProposedMemory {
    content: String,
    memory_type: MemoryType,
    #[serde(default)]
    importance: Option<f32>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    scope: MemoryScope,
}

/// Subconscious write path: decides after a turn whether the exchange
/// produced something worth persisting.
///
/// Failures never propagate; the Creator is a background contributor and
/// the main loop proceeds regardless.
pub struct MemoryCreator {
    agent_name: String,
    llm: Arc<dyn LanguageModel>,
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    state: Arc<dyn StateStore>,
    enabled: bool,
    run_every_n_turns: u64,
    context_messages: usize,
}

impl MemoryCreator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_name: &str,
        llm: Arc<dyn LanguageModel>,
        store: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        state: Arc<dyn StateStore>,
        enabled: bool,
        run_every_n_turns: u64,
        context_messages: usize,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            llm,
            store,
            embedder,
            state,
            enabled,
            run_every_n_turns: run_every_n_turns.max(1),
            context_messages,
        }
    }

    pub fn should_run(&self, turn_number: u64) -> bool {
        self.enabled && turn_number % self.run_every_n_turns == 0
    }

    /// Run one creation pass over the recent exchange. Logs and swallows all
    /// errors.
    pub async fn run(&self, messages: &[StoredMessage]) {
        if let Err(err) = self.try_run(messages).await {
            warn!(error = %err, "memory creator failed");
        }
    }

    async fn try_run(&self, messages: &[StoredMessage]) -> Result<()> {
        let past = self.past_memories()?;
        let wait_topic = self.wait_topic().await;
        let context = self.build_context(messages, &past, wait_topic.as_deref());

        let response = self
            .llm
            .generate_json(
                &[
                    LlmMessage::user(format!("System: {}", system_prompt())),
                    LlmMessage::user(context),
                ],
                true,
            )
            .await
            .context("creator llm call")?;

        let decision: CreatorDecision =
            match serde_json::from_str(strip_code_fences(&response)) {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(error = %err, "creator response unparseable, treating as IGNORE");
                    self.set_wait_topic(None).await;
                    return Ok(());
                }
            };
        debug!(decision = %decision.decision, reflection = %decision.reflection, "creator decision");

        match decision.decision.as_str() {
            "CREATE_NOW" => {
                info!(count = decision.memories.len(), "creator persisting memories");
                for proposed in decision.memories {
                    if let Err(err) = self.persist(proposed).await {
                        warn!(error = %err, "failed to persist proposed memory");
                    }
                }
                self.set_wait_topic(None).await;
            }
            "WAIT" => {
                let topic = decision.topic.unwrap_or_else(|| "unspecified topic".to_string());
                info!(topic = %topic, "creator waiting for more context");
                self.set_wait_topic(Some(&topic)).await;
            }
            _ => {
                self.set_wait_topic(None).await;
            }
        }
        Ok(())
    }

    async fn persist(&self, proposed: ProposedMemory) -> Result<()> {
        let vector = self.embedder.embed_memory(&proposed.content).await?;
        let mut record = MemoryRecord::new(
            proposed.content,
            proposed.memory_type,
            proposed.scope,
            &self.agent_name,
            MemorySource::ProactiveAgent,
        );
        if let Some(importance) = proposed.importance {
            record.importance = importance;
        }
        if let Some(confidence) = proposed.confidence {
            record.confidence = confidence;
        }
        record.tags = proposed.tags;
        record.clamp_scores();
        let id = self.store.create(record, vector)?;
        info!(%id, "memory created");
        Ok(())
    }

    /// The last few memories this agent created, newest first.
    fn past_memories(&self) -> Result<Vec<MemoryRecord>> {
        let filters = SearchFilters {
            agent_id: Some(self.agent_name.clone()),
            ..Default::default()
        };
        self.store
            .search(None, &filters, PAST_MEMORIES, SortBy::CreatedAt, false)
    }

    async fn wait_topic(&self) -> Option<String> {
        let state = self.state.agent_state().await.ok()?;
        state
            .metadata
            .get(WAIT_TOPIC_KEY)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    async fn set_wait_topic(&self, topic: Option<&str>) {
        let patch = match topic {
            Some(topic) => serde_json::json!({ WAIT_TOPIC_KEY: topic }),
            None => serde_json::json!({ WAIT_TOPIC_KEY: serde_json::Value::Null }),
        };
        if let Err(err) = self.state.update_agent_metadata(patch).await {
            warn!(error = %err, "failed to update creator wait topic");
        }
    }

    fn build_context(
        &self,
        messages: &[StoredMessage],
        past: &[MemoryRecord],
        wait_topic: Option<&str>,
    ) -> String {
        let mut parts = vec![
            "# Recent Conversation".to_string(),
            format_messages(messages, self.context_messages),
        ];
        if !past.is_empty() {
            parts.push("\n# Past 5 Created Memories (check these to avoid duplicates)".to_string());
            for memory in past {
                parts.push(format!("- [{}] {}", memory.memory_type.as_str(), memory.content));
            }
        }
        if let Some(topic) = wait_topic {
            parts.push(format!("\n# WAIT State Topic: {topic}"));
        }
        parts.join("\n\n")
    }
}

fn system_prompt() -> String {
    r#"You are the agent's subconscious memory system. Identify and store information that will matter in future conversations.

BE HIGHLY SELECTIVE. Most turns deserve no memory at all.

CREATE memories ONLY for:
- Explicit user preferences or corrections ("I prefer...", "Don't...", "Always...")
- Personal facts about the user (name, job, location, relationships, interests)
- Significant project context or goals that will matter across sessions
- Procedures that worked or failed in notable ways
- Recurring event patterns, error-handling lessons, or actions worth taking proactively

NEVER create memories for:
- General knowledge the agent can look up
- Trivial exchanges (greetings, thanks, small talk)
- Anything already covered by the past 5 memories shown to you
- Temporary context that will not matter later

MEMORY TYPES:
- user_preference: how the user wants things done
- user_fact: who the user is
- conversation_context: ongoing topics, projects, goals
- agent_procedure: what worked or failed for this agent
- knowledge: durable domain facts worth keeping locally
- event_pattern: recurring situations and their timing
- error_handling: how to handle a specific failure
- proactive_action: when to act without being asked

DECISIONS:
- CREATE_NOW: complete, valuable, NEW information not covered by recent memories
- WAIT: the user started sharing something important but has not finished
- IGNORE: nothing significant, or already covered (your most common decision)

OUTPUT (JSON):
{
  "reflection": "<brief reasoning, including why this is not a duplicate>",
  "decision": "CREATE_NOW" | "WAIT" | "IGNORE",
  "memories": [
    {"content": "<clear, standalone statement>", "memory_type": "<type>",
     "importance": <0.0-1.0>, "tags": ["<searchable>"], "scope": "shared" | "individual"}
  ],
  "topic": "<only for WAIT>"
}

Write memory content as standalone statements that will make sense months from now."#
        .to_string()
}
