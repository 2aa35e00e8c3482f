use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embed::{cosine_similarity, EMBEDDING_DIM};
use crate::schema::{MemoryPatch, MemoryRecord, MemoryScope, MemoryType};

/// Record properties: `uuid string → json(MemoryRecord)`.
const RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("memories");
/// Embedding vectors: `uuid string → little-endian f32 bytes`.
const VECTORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("memory_vectors");

/// Conjunctive filter set for [`MemoryStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub memory_type: Option<MemoryType>,
    pub scope: Option<MemoryScope>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    /// Matches when the record's tag set intersects this one.
    pub tags: Vec<String>,
    pub min_importance: Option<f32>,
    pub min_confidence: Option<f32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
}

impl SearchFilters {
    fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(memory_type) = self.memory_type {
            if record.memory_type != memory_type {
                return false;
            }
        }
        if let Some(scope) = self.scope {
            if record.scope != scope {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if &record.agent_id != agent_id {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if record.session_id.as_ref() != Some(session_id) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| record.tags.contains(t)) {
            return false;
        }
        if let Some(min) = self.min_importance {
            if record.importance < min {
                return false;
            }
        }
        if let Some(min) = self.min_confidence {
            if record.confidence < min {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if record.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if record.created_at >= before {
                return false;
            }
        }
        if let Some(after) = self.updated_after {
            if record.updated_at <= after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if record.updated_at >= before {
                return false;
            }
        }
        true
    }
}

/// Sort key for non-vector searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    CreatedAt,
    UpdatedAt,
    LastAccessedAt,
    Importance,
}

/// Embedded memory store.
///
/// Record properties live in durable redb tables; vectors are additionally
/// mirrored into RAM at open for ranking (rebuilt from the vector table, the
/// durable copy is authoritative). Cosine ranking and filtering happen
/// in-process.
pub struct MemoryStore {
    db: Database,
    path: PathBuf,
    vectors: RwLock<HashMap<Uuid, Vec<f32>>>,
}

impl MemoryStore {
    /// Open or create the store. Schema setup is idempotent.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)
            .with_context(|| format!("opening memory store at {}", path.display()))?;
        {
            let tx = db.begin_write()?;
            tx.open_table(RECORDS_TABLE)?;
            tx.open_table(VECTORS_TABLE)?;
            tx.commit()?;
        }

        let store = Self {
            db,
            path,
            vectors: RwLock::new(HashMap::new()),
        };
        let loaded = store.rebuild_vector_cache()?;
        info!(vectors = loaded, path = %store.path.display(), "memory store opened");
        Ok(store)
    }

    fn rebuild_vector_cache(&self) -> Result<usize> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(VECTORS_TABLE)?;
        let mut cache = self.vectors.write();
        cache.clear();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let Ok(id) = Uuid::parse_str(key.value()) else {
                warn!(key = key.value(), "skipping unparseable vector key");
                continue;
            };
            cache.insert(id, decode_vector(value.value()));
        }
        Ok(cache.len())
    }

    /// Persist a record with its 768-dim embedding.
    pub fn create(&self, mut record: MemoryRecord, vector: Vec<f32>) -> Result<Uuid> {
        check_dim(&vector)?;
        record.clamp_scores();
        let id = record.id;
        self.write_record(&record, Some(&vector))?;
        self.vectors.write().insert(id, vector);
        debug!(%id, memory_type = record.memory_type.as_str(), "memory created");
        Ok(id)
    }

    /// Hybrid search. With a query vector the results are ranked by cosine
    /// similarity; otherwise they are ordered by `sort_by`.
    pub fn search(
        &self,
        query_vector: Option<&[f32]>,
        filters: &SearchFilters,
        limit: usize,
        sort_by: SortBy,
        sort_ascending: bool,
    ) -> Result<Vec<MemoryRecord>> {
        if let Some(vector) = query_vector {
            check_dim(vector)?;
        }

        let mut matched: Vec<MemoryRecord> = self
            .all_records()?
            .into_iter()
            .filter(|r| filters.matches(r))
            .collect();

        match query_vector {
            Some(query) => {
                let vectors = self.vectors.read();
                let mut scored: Vec<(f32, MemoryRecord)> = matched
                    .into_iter()
                    .filter_map(|record| {
                        vectors
                            .get(&record.id)
                            .map(|v| (cosine_similarity(query, v), record))
                    })
                    .collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                matched = scored.into_iter().map(|(_, r)| r).collect();
            }
            None => {
                matched.sort_by(|a, b| {
                    let ordering = match sort_by {
                        SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
                        SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
                        SortBy::LastAccessedAt => a.last_accessed_at.cmp(&b.last_accessed_at),
                        SortBy::Importance => a.importance.total_cmp(&b.importance),
                    };
                    if sort_ascending {
                        ordering
                    } else {
                        ordering.reverse()
                    }
                });
            }
        }

        if limit > 0 {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    /// Fetch one record and bump its access counters (best-effort: a failed
    /// bump does not fail the read).
    pub fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let Some(mut record) = self.read_record(id)? else {
            return Ok(None);
        };
        record.access_count += 1;
        record.last_accessed_at = Utc::now();
        if let Err(err) = self.write_record(&record, None) {
            warn!(%id, error = %err, "access bump failed");
        }
        Ok(Some(record))
    }

    /// Apply a partial update. Patching content requires the caller to
    /// supply a re-embedded vector.
    pub fn update(
        &self,
        id: Uuid,
        patch: MemoryPatch,
        vector: Option<Vec<f32>>,
    ) -> Result<MemoryRecord> {
        let mut record = self
            .read_record(id)?
            .with_context(|| format!("memory {id} not found"))?;

        if let Some(content) = patch.content {
            if vector.is_none() {
                bail!("content update for {id} requires a re-embedded vector");
            }
            record.content = content;
        }
        if let Some(importance) = patch.importance {
            record.importance = importance;
        }
        if let Some(confidence) = patch.confidence {
            record.confidence = confidence;
        }
        if let Some(tags) = patch.tags {
            record.tags = tags;
        }
        if let Some(expires_at) = patch.expires_at {
            record.expires_at = expires_at;
        }
        if let Some(related) = patch.related_memory_ids {
            record.related_memory_ids = related;
        }
        record.clamp_scores();
        record.updated_at = Utc::now();

        if let Some(vector) = &vector {
            check_dim(vector)?;
        }
        self.write_record(&record, vector.as_deref())?;
        if let Some(vector) = vector {
            self.vectors.write().insert(id, vector);
        }
        Ok(record)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let key = id.to_string();
        let tx = self.db.begin_write()?;
        {
            let mut records = tx.open_table(RECORDS_TABLE)?;
            records.remove(key.as_str())?;
            let mut vectors = tx.open_table(VECTORS_TABLE)?;
            vectors.remove(key.as_str())?;
        }
        tx.commit()?;
        self.vectors.write().remove(&id);
        Ok(())
    }

    /// Record an explicit handoff to the agent: bumps `last_accessed_at` and
    /// `access_count` atomically for each id. Distinct from [`Self::get`]:
    /// this is the signal the Retriever uses to suppress re-providing.
    pub fn mark_provided(&self, ids: &[Uuid]) -> Result<()> {
        let now = Utc::now();
        for &id in ids {
            let Some(mut record) = self.read_record(id)? else {
                warn!(%id, "mark_provided: memory missing");
                continue;
            };
            record.last_accessed_at = now;
            record.access_count += 1;
            self.write_record(&record, None)?;
        }
        Ok(())
    }

    /// Stored embedding for `id`, if any.
    pub fn vector(&self, id: Uuid) -> Option<Vec<f32>> {
        self.vectors.read().get(&id).cloned()
    }

    pub fn len(&self) -> Result<usize> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS_TABLE)?;
        Ok(table.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn all_records(&self) -> Result<Vec<MemoryRecord>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS_TABLE)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            match serde_json::from_slice::<MemoryRecord>(value.value()) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "skipping undecodable memory record"),
            }
        }
        Ok(records)
    }

    fn read_record(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let key = id.to_string();
        let tx = self.db.begin_read()?;
        let table = tx.open_table(RECORDS_TABLE)?;
        match table.get(key.as_str())? {
            None => Ok(None),
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
        }
    }

    fn write_record(&self, record: &MemoryRecord, vector: Option<&[f32]>) -> Result<()> {
        let key = record.id.to_string();
        let bytes = serde_json::to_vec(record)?;
        let tx = self.db.begin_write()?;
        {
            let mut records = tx.open_table(RECORDS_TABLE)?;
            records.insert(key.as_str(), bytes.as_slice())?;
            if let Some(vector) = vector {
                let mut vectors = tx.open_table(VECTORS_TABLE)?;
                let encoded = encode_vector(vector);
                vectors.insert(key.as_str(), encoded.as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn check_dim(vector: &[f32]) -> Result<()> {
    if vector.len() != EMBEDDING_DIM {
        bail!(
            "vector dimension {} violates the {}-dim contract",
            vector.len(),
            EMBEDDING_DIM
        );
    }
    Ok(())
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
