use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};

/// All memory vectors are exactly this many dimensions.
pub const EMBEDDING_DIM: usize = 768;

/// Task-type markers prefixed to inputs before embedding.
const DOCUMENT_PREFIX: &str = "search_document: ";
const QUERY_PREFIX: &str = "search_query: ";

/// Produces the vectors the store ranks by. Memories and queries use
/// different task markers so asymmetric embedding models behave.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_memory(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Gemini embedContent client producing 768-dim vectors.
pub struct GeminiEmbedder {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiEmbedder {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(api_key, "https://generativelanguage.googleapis.com")
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: "gemini-embedding-001".to_string(),
        })
    }

    async fn embed(&self, text: &str, prefix: &str) -> Result<Vec<f32>> {
        let url = format!(
            "{}/v1beta/models/{}:embedContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let payload = json!({
            "content": { "parts": [{ "text": format!("{prefix}{text}") }] },
            "output_dimensionality": EMBEDDING_DIM,
        });
        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("embedding request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("embedding api error ({status})");
        }
        let body: serde_json::Value = response.json().await?;
        let values = body["embedding"]["values"]
            .as_array()
            .context("embedding response missing values")?;
        let vector: Vec<f32> = values
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if vector.len() != EMBEDDING_DIM {
            bail!(
                "embedding dimension mismatch: got {}, expected {}",
                vector.len(),
                EMBEDDING_DIM
            );
        }
        Ok(vector)
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    async fn embed_memory(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text, DOCUMENT_PREFIX).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text, QUERY_PREFIX).await
    }
}

/// Deterministic hash-based embedder for tests and offline runs. Identical
/// inputs give identical unit-norm vectors; unrelated inputs are close to
/// orthogonal.
pub struct HashEmbedder;

impl HashEmbedder {
    fn encode(text: &str, prefix: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());
        hasher.update(text.as_bytes());
        let mut seed = hasher.finalize().to_vec();

        let mut offset = 0;
        while offset < EMBEDDING_DIM {
            let mut next = Sha256::new();
            next.update(&seed);
            seed = next.finalize().to_vec();
            for chunk in seed.chunks(4) {
                if offset >= EMBEDDING_DIM {
                    break;
                }
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                vector[offset] = (raw as f32 / u32::MAX as f32) * 2.0 - 1.0;
                offset += 1;
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        for value in &mut vector {
            *value /= norm;
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_memory(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::encode(text, DOCUMENT_PREFIX))
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::encode(text, QUERY_PREFIX))
    }
}
