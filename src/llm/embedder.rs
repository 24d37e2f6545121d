//! Embedding facade with per-fingerprint memoisation.
//!
//! The canonical text for an intent is its sanitised prose, desires and
//! constraints joined with newlines. Vectors are memoised under the intent
//! fingerprint; first writer wins. A deterministic hash-to-vector fallback
//! exists for development and logs a warning on every use.

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{MediatorError, MediatorResult};
use crate::llm::client::EmbeddingClient;
use crate::llm::sanitize::sanitize_intent_text;
use crate::types::{Fingerprint, Intent};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

/// Produces fixed-dimension vectors for intents.
pub struct Embedder {
    client: Option<EmbeddingClient>,
    dimension: usize,
    memo: DashMap<Fingerprint, Arc<Vec<f32>>>,
}

impl Embedder {
    pub fn new(config: &EmbeddingConfig) -> MediatorResult<Self> {
        let client = match config.provider {
            EmbeddingProvider::Fallback => None,
            _ => Some(EmbeddingClient::new(config)?),
        };
        Ok(Self {
            client,
            dimension: config.dimension,
            memo: DashMap::new(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Memoised vectors currently held.
    pub fn memo_len(&self) -> usize {
        self.memo.len()
    }

    pub fn cached(&self, fingerprint: &str) -> Option<Arc<Vec<f32>>> {
        self.memo.get(fingerprint).map(|v| v.clone())
    }

    /// Drop the memoised vector for an intent that left candidacy.
    pub fn remove(&self, fingerprint: &str) {
        self.memo.remove(fingerprint);
    }

    /// Canonical embedding text: prose ∥ "\n" ∥ desires ∥ "\n" ∥ constraints,
    /// after injection neutralisation. The embedder always runs on the
    /// sanitised form so flagged intents still index normally.
    pub fn canonical_text(intent: &Intent) -> String {
        let (prose, desires, constraints) = sanitize_intent_text(
            &intent.fingerprint,
            &intent.prose,
            &intent.desires,
            &intent.constraints,
        );
        let desires: Vec<String> = desires.into_iter().map(|s| s.text).collect();
        let constraints: Vec<String> = constraints.into_iter().map(|s| s.text).collect();
        format!(
            "{}\n{}\n{}",
            prose.text,
            desires.join(", "),
            constraints.join(", ")
        )
    }

    /// Vector for an intent, memoised under its fingerprint.
    pub async fn embed(&self, intent: &Intent) -> MediatorResult<Arc<Vec<f32>>> {
        if let Some(hit) = self.memo.get(&intent.fingerprint) {
            return Ok(hit.clone());
        }

        let text = Self::canonical_text(intent);
        let vector = match &self.client {
            Some(client) => client.embed(&text).await?,
            None => {
                warn!(
                    fingerprint = %intent.fingerprint,
                    "using deterministic fallback embeddings; not for production"
                );
                hash_to_vector(&text, self.dimension)
            }
        };

        if vector.len() != self.dimension {
            return Err(MediatorError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        // First-writer-wins: a racing embed of the same fingerprint keeps
        // the already-stored vector.
        let stored = self
            .memo
            .entry(intent.fingerprint.clone())
            .or_insert_with(|| Arc::new(vector));
        Ok(stored.clone())
    }

}

/// Deterministic hash-to-vector embedding: a blake3 XOF expanded into unit
/// floats. Same text, same vector; unrelated texts land roughly orthogonal.
fn hash_to_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    let mut reader = hasher.finalize_xof();
    let mut bytes = vec![0u8; dimension * 4];
    reader.fill(&mut bytes);

    let mut vector: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| {
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            (raw as f32 / u32::MAX as f32) * 2.0 - 1.0
        })
        .collect();

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
