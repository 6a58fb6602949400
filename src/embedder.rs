//! Embedder interface: the text→vector collaborator
//!
//! The embedding model itself lives outside this crate (ONNX runtime,
//! remote API, whatever the caller wires in). The pipeline only relies on
//! the contract here: a deterministic map from a batch of strings to
//! L2-normalized vectors of a fixed dimension.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbedderError {
    /// The whole batch failed; the runner records every query in the batch
    /// as skipped.
    #[error("embedding failed: {0}")]
    Failed(String),
    #[error("batch contains no texts")]
    EmptyBatch,
}

/// An L2-normalized embedding vector.
///
/// Rows coming out of an [`Embedder`] satisfy `|‖v‖ − 1| ≤ 1e-4`; the store
/// re-verifies this whenever a persisted blob is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(data: Vec<f32>) -> Self {
        Self(data)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Dimension of the embedding.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Batch text embedder.
///
/// Implementations must be deterministic for a fixed `model_id` (the store
/// keys persisted matrices on it) and must return one vector per input, in
/// input order, each of dimension [`dim`](Embedder::dim) and unit L2 norm.
/// A failure fails the whole batch.
pub trait Embedder: Send + Sync {
    /// Identifier of the underlying model, e.g. `"BAAI/bge-large-en-v1.5"`.
    fn model_id(&self) -> &str;

    /// Output dimension D of every embedding this model produces.
    fn dim(&self) -> usize;

    /// Embed a batch of texts.
    fn embed(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbedderError>;
}

/// Shared test helper: deterministic normalized embedding from a seed.
/// Sin-based values give reproducible but varied directions.
#[cfg(test)]
pub(crate) fn make_test_embedding(seed: u32, dim: usize) -> Embedding {
    let mut v = vec![0.0f32; dim];
    for (i, val) in v.iter_mut().enumerate() {
        *val = ((seed as f32 * 0.7) + (i as f32 * 0.13)).sin();
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for val in &mut v {
            *val /= norm;
        }
    }
    Embedding::new(v)
}

/// Test embedder: hashes each text into a deterministic unit vector.
#[cfg(test)]
pub(crate) struct SeededEmbedder {
    pub dim: usize,
    /// When set, `embed` fails for any text containing this marker.
    pub fail_on: Option<String>,
}

#[cfg(test)]
impl SeededEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim, fail_on: None }
    }
}

#[cfg(test)]
impl Embedder for SeededEmbedder {
    fn model_id(&self) -> &str {
        "test/seeded"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbedderError> {
        if texts.is_empty() {
            return Err(EmbedderError::EmptyBatch);
        }
        if let Some(marker) = &self.fail_on {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(EmbedderError::Failed("poisoned batch".into()));
            }
        }
        Ok(texts
            .iter()
            .map(|t| {
                let seed = t.bytes().fold(0u32, |acc, b| {
                    acc.wrapping_mul(31).wrapping_add(b as u32)
                });
                make_test_embedding(seed, self.dim)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedding_accessors() {
        let emb = Embedding::new(vec![0.6, 0.8]);
        assert_eq!(emb.len(), 2);
        assert!(!emb.is_empty());
        assert_eq!(emb.as_slice(), &[0.6, 0.8]);
        assert_eq!(emb.into_inner(), vec![0.6, 0.8]);
    }

    #[test]
    fn test_make_test_embedding_is_unit_norm() {
        let emb = make_test_embedding(7, 32);
        let norm: f32 = emb.as_slice().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm was {}", norm);
    }

    #[test]
    fn test_seeded_embedder_is_deterministic() {
        let embedder = SeededEmbedder::new(16);
        let a = embedder.embed(&["hello", "world"]).unwrap();
        let b = embedder.embed(&["hello", "world"]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a[0], a[1], "distinct texts should embed differently");
    }

    #[test]
    fn test_seeded_embedder_fails_whole_batch() {
        let mut embedder = SeededEmbedder::new(16);
        embedder.fail_on = Some("poison".into());
        let result = embedder.embed(&["fine", "poison pill"]);
        assert!(matches!(result, Err(EmbedderError::Failed(_))));
    }
}
