//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::HashEmbedder;
//! ```

// Each test binary compiles its own copy; not every binary uses every helper.
#![allow(dead_code)]

use hotdocs::{Embedder, EmbedderError, Embedding, TextSet};

/// Deterministic unit vector derived from a seed. Sin-based values give
/// reproducible but varied directions.
pub fn embedding_for_seed(seed: u32, dim: usize) -> Embedding {
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

/// Deterministic embedder: hashes each text into a unit vector.
///
/// Optionally fails any batch containing `fail_marker`, which is how the
/// skipped-query path gets exercised end to end.
pub struct HashEmbedder {
    pub dim: usize,
    pub fail_marker: Option<String>,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            fail_marker: None,
        }
    }

    pub fn embed_one(&self, text: &str) -> Embedding {
        let seed = text
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        embedding_for_seed(seed, self.dim)
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        "test/hash-v1"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbedderError> {
        if let Some(marker) = &self.fail_marker {
            if texts.iter().any(|t| t.contains(marker.as_str())) {
                return Err(EmbedderError::Failed("poisoned batch".into()));
            }
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

pub fn corpus(n: usize) -> TextSet {
    TextSet::new(
        "it-corpus",
        (0..n)
            .map(|i| format!("passage about subject {} and its details", i))
            .collect(),
    )
}

pub fn workload(n: usize) -> TextSet {
    TextSet::new(
        "it-queries",
        (0..n).map(|i| format!("question regarding subject {}", i)).collect(),
    )
}
