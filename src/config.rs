//! Run configuration
//!
//! `RunConfig` is the command surface the (external) CLI fills in: which
//! corpus/model/workload triple to run, the retrieval depth k, and the
//! analytics knobs. An optional `hotdocs.toml` next to the artifacts
//! directory supplies project defaults; explicit caller values override.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::freq::{DEFAULT_NGRAM_SIZES, DEFAULT_P_HEAD};
use crate::hnsw::{HnswParams, DEFAULT_EF_CONSTRUCTION, DEFAULT_EF_SEARCH, DEFAULT_M};
use crate::runner::RunOptions;
use crate::store::BuildOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("k must be at least 1")]
    ZeroK,
    #[error("p_head {0} outside (0, 1]")]
    BadHeadFraction(f64),
    #[error("n-gram size {0} below 2")]
    BadNgramSize(usize),
    #[error("m={0} (need m >= 2)")]
    BadM(usize),
    #[error("ef_construction {ef} below m={m}")]
    BadEfConstruction { ef: usize, m: usize },
}

/// Parameters of one (corpus, workload, k) analytics run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Identifiers echoed into the result bundle and used to key blobs.
    pub corpus_id: String,
    pub model_id: String,
    pub query_set_id: String,

    /// Retrieval depth per query.
    pub k: usize,
    /// Layer-0 beam width; defaults to the index default, clamped to k.
    pub ef_search: Option<usize>,
    /// Head fraction for concentration summaries.
    pub p_head: f64,
    /// Ordered n-gram window sizes.
    pub ngram_sizes: Vec<usize>,

    /// Directory holding embedding and index blobs.
    pub index_dir: PathBuf,

    // Index build parameters
    pub m: usize,
    pub ef_construction: usize,
    pub seed: u64,

    // Batch plumbing
    pub embed_chunk_size: usize,
    pub query_batch_size: usize,
    pub channel_depth: usize,

    /// Persist and reuse query embeddings keyed by (query-set-id, model-id).
    pub cache_query_embeddings: bool,
    pub quiet: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            corpus_id: String::new(),
            model_id: String::new(),
            query_set_id: String::new(),
            k: 10,
            ef_search: None,
            p_head: DEFAULT_P_HEAD,
            ngram_sizes: DEFAULT_NGRAM_SIZES.to_vec(),
            index_dir: PathBuf::from(".hotdocs"),
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            seed: 42,
            embed_chunk_size: 512,
            query_batch_size: 64,
            channel_depth: 256,
            cache_query_embeddings: false,
            quiet: false,
        }
    }
}

impl RunConfig {
    /// Load defaults layered from `<root>/hotdocs.toml` when present.
    /// Missing or unparseable files fall back to built-in defaults (with a
    /// warning for the latter).
    pub fn load(root: &Path) -> Self {
        let path = root.join("hotdocs.toml");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str::<Self>(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "Loaded config");
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 {
            return Err(ConfigError::ZeroK);
        }
        if !(self.p_head > 0.0 && self.p_head <= 1.0) {
            return Err(ConfigError::BadHeadFraction(self.p_head));
        }
        for &n in &self.ngram_sizes {
            if n < 2 {
                return Err(ConfigError::BadNgramSize(n));
            }
        }
        if self.m < 2 {
            return Err(ConfigError::BadM(self.m));
        }
        if self.ef_construction < self.m {
            return Err(ConfigError::BadEfConstruction {
                ef: self.ef_construction,
                m: self.m,
            });
        }
        Ok(())
    }

    /// Beam width actually used at query time.
    pub fn effective_ef_search(&self) -> usize {
        self.ef_search.unwrap_or(DEFAULT_EF_SEARCH).max(self.k)
    }

    pub fn hnsw_params(&self) -> HnswParams {
        HnswParams {
            m: self.m,
            ef_construction: self.ef_construction,
            seed: self.seed,
        }
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            chunk_size: self.embed_chunk_size,
            quiet: self.quiet,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            batch_size: self.query_batch_size,
            channel_depth: self.channel_depth,
            ef_search: self.effective_ef_search(),
        }
    }

    /// Index blob path for this run's corpus/model/m triple.
    pub fn index_path(&self, corpus_id: &str, model_id: &str) -> PathBuf {
        self.index_dir.join(format!(
            "{}--{}--m{}.hnsw",
            crate::store::sanitize(corpus_id),
            crate::store::sanitize(model_id),
            self.m
        ))
    }
}
