use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_llm::{LanguageModel, LlmMessage};
use murmur_store::StoredMessage;

use crate::embed::cosine_similarity;
use crate::json_util::{format_messages, strip_code_fences};
use crate::{Embedder, MemoryRecord, MemoryStore, MemoryType, SearchFilters, SortBy};

/// Cosine threshold above which two candidate memories count as duplicates.
const DEDUP_SIMILARITY: f32 = 0.85;

/// Results fetched per query.
const RESULTS_PER_QUERY: usize = 3;

/// How many recently provided memories are shown as a suppression list.
const PAST_PROVIDED: usize = 10;

#[derive(Debug, Deserialize)]
struct RetrieverDecision {
    #[serde(default)]
    reflection: String,
    decision: String,
    #[serde(default)]
    queries: Vec<serde_json::Value>,
    #[serde(default)]
    memory_ids: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryFilters {
    #[serde(default)]
    memory_type: Option<MemoryType>,
    #[serde(default)]
    min_importance: Option<f32>,
    #[serde(default)]
    created_after: Option<DateTime<Utc>>,
    #[serde(default)]
    created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Subconscious read path: surfaces one or two directly relevant memories
/// that were not already provided recently.
///
/// Output is a list; the loop owns appending it to the transcript and
/// injecting it into context. Never mutates the transcript itself.
pub struct MemoryRetriever {
    agent_name: String,
    llm: Arc<dyn LanguageModel>,
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    enabled: bool,
    run_every_n_turns: u64,
    context_messages: usize,
    max_iterations: usize,
}

impl MemoryRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_name: &str,
        llm: Arc<dyn LanguageModel>,
        store: Arc<MemoryStore>,
        embedder: Arc<dyn Embedder>,
        enabled: bool,
        run_every_n_turns: u64,
        context_messages: usize,
        max_iterations: usize,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            llm,
            store,
            embedder,
            enabled,
            run_every_n_turns: run_every_n_turns.max(1),
            context_messages,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn should_run(&self, turn_number: u64) -> bool {
        self.enabled && turn_number % self.run_every_n_turns == 0
    }

    /// Run the iterative retrieval loop. Errors degrade to an empty result.
    pub async fn run(&self, messages: &[StoredMessage]) -> Vec<MemoryRecord> {
        match self.try_run(messages).await {
            Ok(memories) => memories,
            Err(err) => {
                warn!(error = %err, "memory retriever failed");
                Vec::new()
            }
        }
    }

    async fn try_run(&self, messages: &[StoredMessage]) -> Result<Vec<MemoryRecord>> {
        let past_provided = self.past_provided_memories();

        let mut context_parts = vec![
            "# Recent Conversation".to_string(),
            format_messages(messages, self.context_messages),
        ];
        if !past_provided.is_empty() {
            context_parts
                .push("\n# Past 10 Provided Memories (DO NOT re-provide these)".to_string());
            for memory in &past_provided {
                context_parts.push(format!(
                    "- [ID: {}] [{}] {}",
                    memory.id,
                    memory.memory_type.as_str(),
                    memory.content
                ));
            }
        }

        // Union of everything discovered across iterations, keyed by id.
        let mut discovered: HashMap<Uuid, MemoryRecord> = HashMap::new();

        for iteration in 1..=self.max_iterations {
            let context = context_parts.join("\n\n");
            let response = self
                .llm
                .generate_json(
                    &[
                        LlmMessage::user(format!("System: {}", self.system_prompt())),
                        LlmMessage::user(context),
                    ],
                    true,
                )
                .await
                .context("retriever llm call")?;

            let decision: RetrieverDecision =
                match serde_json::from_str(strip_code_fences(&response)) {
                    Ok(decision) => decision,
                    Err(err) => {
                        warn!(error = %err, "retriever response unparseable, treating as IGNORE");
                        return Ok(Vec::new());
                    }
                };
            debug!(
                iteration,
                decision = %decision.decision,
                reflection = %decision.reflection,
                "retriever decision"
            );

            match decision.decision.as_str() {
                "GET_MEMORIES" => {
                    if decision.queries.is_empty() || decision.queries.len() > 5 {
                        warn!(count = decision.queries.len(), "invalid query count, treating as IGNORE");
                        return Ok(Vec::new());
                    }
                    let found = self.search(&decision.queries).await;
                    info!(iteration, found = found.len(), "retriever search pass");

                    context_parts.push(format!("\n# Search Results (Iteration {iteration})"));
                    context_parts.push(format_memories(&found));
                    for memory in found {
                        discovered.entry(memory.id).or_insert(memory);
                    }
                }
                "GIVE_MEMORIES" => {
                    let selected: Vec<MemoryRecord> = decision
                        .memory_ids
                        .iter()
                        .filter_map(|raw| Uuid::parse_str(raw).ok())
                        .filter_map(|id| discovered.get(&id).cloned())
                        .collect();

                    let deduplicated = self.deduplicate(selected);
                    if deduplicated.is_empty() {
                        return Ok(Vec::new());
                    }
                    let ids: Vec<Uuid> = deduplicated.iter().map(|m| m.id).collect();
                    if let Err(err) = self.store.mark_provided(&ids) {
                        warn!(error = %err, "failed to mark memories provided");
                    }
                    info!(count = deduplicated.len(), "retriever providing memories");
                    return Ok(deduplicated);
                }
                _ => return Ok(Vec::new()),
            }
        }

        debug!("retriever exhausted iterations without a final decision");
        Ok(Vec::new())
    }

    /// Top recently-accessed memories, the proxy for "already provided".
    fn past_provided_memories(&self) -> Vec<MemoryRecord> {
        self.store
            .search(
                None,
                &SearchFilters::default(),
                PAST_PROVIDED,
                SortBy::LastAccessedAt,
                false,
            )
            .unwrap_or_else(|err| {
                warn!(error = %err, "failed to load provided memories");
                Vec::new()
            })
    }

    /// Run every query (plain string or `{text, filters}`), union by id.
    async fn search(&self, queries: &[serde_json::Value]) -> Vec<MemoryRecord> {
        let mut results: Vec<MemoryRecord> = Vec::new();
        let mut seen: std::collections::HashSet<Uuid> = Default::default();

        for query_item in queries {
            let (text, filters) = match query_item {
                serde_json::Value::String(text) => (text.clone(), SearchFilters::default()),
                serde_json::Value::Object(_) => {
                    let text = query_item["text"].as_str().unwrap_or_default().to_string();
                    let parsed: QueryFilters = query_item
                        .get("filters")
                        .and_then(|f| serde_json::from_value(f.clone()).ok())
                        .unwrap_or_default();
                    (
                        text,
                        SearchFilters {
                            memory_type: parsed.memory_type,
                            min_importance: parsed.min_importance,
                            created_after: parsed.created_after,
                            created_before: parsed.created_before,
                            tags: parsed.tags,
                            ..Default::default()
                        },
                    )
                }
                _ => continue,
            };
            if text.is_empty() {
                continue;
            }

            let vector = match self.embedder.embed_query(&text).await {
                Ok(vector) => vector,
                Err(err) => {
                    warn!(error = %err, query = %text, "query embedding failed");
                    continue;
                }
            };
            match self.store.search(
                Some(&vector),
                &filters,
                RESULTS_PER_QUERY,
                SortBy::CreatedAt,
                false,
            ) {
                Ok(found) => {
                    for memory in found {
                        if seen.insert(memory.id) {
                            results.push(memory);
                        }
                    }
                }
                Err(err) => warn!(error = %err, query = %text, "memory search failed"),
            }
        }
        results
    }

    /// Collapse near-duplicate candidates (cosine ≥ 0.85 on their stored
    /// embeddings), keeping one representative per cluster by importance
    /// then recency.
    fn deduplicate(&self, memories: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
        if memories.len() <= 1 {
            return memories;
        }

        let vectors: Vec<Option<Vec<f32>>> =
            memories.iter().map(|m| self.store.vector(m.id)).collect();

        let mut used = vec![false; memories.len()];
        let mut kept = Vec::new();

        for i in 0..memories.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            let mut cluster = vec![i];
            for j in (i + 1)..memories.len() {
                if used[j] {
                    continue;
                }
                let similar = match (&vectors[i], &vectors[j]) {
                    (Some(a), Some(b)) => cosine_similarity(a, b) >= DEDUP_SIMILARITY,
                    _ => false,
                };
                if similar {
                    cluster.push(j);
                    used[j] = true;
                }
            }

            let best = cluster
                .into_iter()
                .max_by(|&a, &b| {
                    memories[a]
                        .importance
                        .total_cmp(&memories[b].importance)
                        .then(memories[a].created_at.cmp(&memories[b].created_at))
                })
                .expect("cluster is non-empty");
            kept.push(memories[best].clone());
        }

        if kept.len() < memories.len() {
            info!(
                before = memories.len(),
                after = kept.len(),
                "deduplicated similar memories"
            );
        }
        kept
    }

    fn system_prompt(&self) -> String {
        format!(
            r#"You are the agent's subconscious memory system. Surface memories that would help the current conversation.

SEARCH when the user asks about themselves, references past conversations, or would benefit from personalization.
IGNORE purely factual requests, conversations that already have the needed context, and anything already in the provided-memories list.

CRITICAL RULES:
1. Return 1-2 memories maximum. Never more.
2. Never return similar or redundant memories; keep only the best one.
3. Do not re-provide anything from the "Past 10 Provided Memories" list.
4. If everything relevant was provided recently, return IGNORE.

PROCESS (max {max_iterations} iterations):
1. Generate 1-5 focused search queries, optionally with filters.
2. Review results and discard duplicates.
3. Select at most 1-2 memories that are relevant and not recently provided.

DECISIONS:
- GET_MEMORIES: search needed; provide queries
- GIVE_MEMORIES: found 1-2 relevant memories; provide their IDs
- IGNORE: nothing needed or everything already provided

OUTPUT (JSON):
{{
  "reflection": "<brief reasoning>",
  "decision": "GET_MEMORIES" | "GIVE_MEMORIES" | "IGNORE",
  "queries": ["<query>", {{"text": "<query>", "filters": {{"memory_type": "user_fact", "min_importance": 0.5, "tags": ["<tag>"]}}}}],
  "memory_ids": ["<uuid>"]
}}"#,
            max_iterations = self.max_iterations
        )
    }
}

fn format_memories(memories: &[MemoryRecord]) -> String {
    if memories.is_empty() {
        return "No memories found.".to_string();
    }
    memories
        .iter()
        .map(|memory| {
            format!(
                "ID: {}\nType: {}\nContent: {}\nImportance: {}\nTags: {}",
                memory.id,
                memory.memory_type.as_str(),
                memory.content,
                memory.importance,
                memory.tags.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
