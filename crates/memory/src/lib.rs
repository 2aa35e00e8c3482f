//! Long-lived semantic memory: the record model, the embedded vector store,
//! the embedding service, and the two autonomous modules (Creator and
//! Retriever) that operate on it between turns.

mod creator;
mod embed;
mod json_util;
mod retriever;
mod schema;
mod store;

pub use creator::MemoryCreator;
pub use embed::{cosine_similarity, Embedder, GeminiEmbedder, HashEmbedder, EMBEDDING_DIM};
pub use retriever::MemoryRetriever;
pub use schema::{MemoryPatch, MemoryRecord, MemoryScope, MemorySource, MemoryType};
pub use store::{MemoryStore, SearchFilters, SortBy};
