//! Local embedding model and the bounded blocking pool it runs on.
//!
//! Inference is a deterministic feature-hashed bag of words, so the engine
//! stays fully local and testable. Embedding work is CPU-bound and never
//! runs on an async worker thread: callers go through `EmbeddingPool`.

use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use unicode_normalization::UnicodeNormalization;

use crate::error::EngineError;

pub const DEFAULT_DIMENSION: usize = 384;

#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingModelStatus {
    Ready { dimension: usize },
    Unavailable { reason: String },
}

#[derive(Debug)]
pub struct EmbeddingModel {
    state: RwLock<EmbeddingModelStatus>,
}

impl Default for EmbeddingModel {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel {
    /// A ready model with the default dimension.
    pub fn new() -> Self {
        Self::with_dimension(DEFAULT_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        let status = if dimension == 0 {
            EmbeddingModelStatus::Unavailable {
                reason: "embedding dimension must be positive".to_string(),
            }
        } else {
            EmbeddingModelStatus::Ready { dimension }
        };
        Self {
            state: RwLock::new(status),
        }
    }

    pub fn set_unavailable(&self, reason: String) {
        if let Ok(mut guard) = self.state.write() {
            *guard = EmbeddingModelStatus::Unavailable { reason };
        }
    }

    pub fn status(&self) -> EmbeddingModelStatus {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or(EmbeddingModelStatus::Unavailable {
                reason: "embedding model lock poisoned".to_string(),
            })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status(), EmbeddingModelStatus::Ready { .. })
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        match self.status() {
            EmbeddingModelStatus::Ready { dimension } => Ok(hash_embed(text, dimension)),
            EmbeddingModelStatus::Unavailable { reason } => Err(EngineError::Embedding(reason)),
        }
    }
}

fn hash_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vec = vec![0.0_f32; dimension];
    let normalized: String = text.nfkc().collect::<String>().to_lowercase();

    let mut seen = 0usize;
    for token in normalized.split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let hash = u64::from_le_bytes(bytes);
        let idx = (hash % dimension as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign;
        seen += 1;
    }

    if seen == 0 {
        return vec;
    }

    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vec {
            *value /= norm;
        }
    }

    vec
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (va, vb) in a.iter().zip(b.iter()) {
        dot += va * vb;
        norm_a += va * va;
        norm_b += vb * vb;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

/// Runs embedding jobs on `spawn_blocking`, at most `workers` at a time.
#[derive(Debug, Clone)]
pub struct EmbeddingPool {
    model: Arc<EmbeddingModel>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl EmbeddingPool {
    pub fn new(model: Arc<EmbeddingModel>, workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            model,
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` against the model on the blocking pool.
    ///
    /// Waits for a free permit first; the permit is held until the job ends.
    pub async fn run<F, T>(&self, job: F) -> Result<T, EngineError>
    where
        F: FnOnce(&EmbeddingModel) -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        let model = Arc::clone(&self.model);
        let out = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(&model)
        })
        .await?;
        Ok(out)
    }
}
