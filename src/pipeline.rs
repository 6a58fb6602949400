//! Run orchestration
//!
//! Composes the whole measurement: embedding store → index → retrieval
//! runner → frequency aggregator → graph inspector, and returns a typed
//! result bundle for the reporting layer to render. The aggregator is the
//! single consumer of the runner's bounded channel, so counters never see
//! contention and the output is deterministic for a given index and
//! workload.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::{ConfigError, RunConfig};
use crate::corpus::TextSet;
use crate::embedder::Embedder;
use crate::freq::{FrequencyAggregator, FrequencyReport};
use crate::hnsw::{self, HnswError};
use crate::inspect::{self, GraphReport};
use crate::runner::{RetrievalRunner, RunnerError};
use crate::store::{EmbeddingStore, StoreError};
use crate::CancelToken;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Hnsw(HnswError),
    #[error(transparent)]
    Runner(RunnerError),
    #[error("run cancelled")]
    Cancelled,
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Store(other),
        }
    }
}

impl From<HnswError> for PipelineError {
    fn from(e: HnswError) -> Self {
        match e {
            HnswError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Hnsw(other),
        }
    }
}

impl From<RunnerError> for PipelineError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::Cancelled => PipelineError::Cancelled,
            RunnerError::Hnsw(HnswError::Cancelled) => PipelineError::Cancelled,
            other => PipelineError::Runner(other),
        }
    }
}

/// Echo of the parameters a bundle was produced under.
#[derive(Debug, Clone, Serialize)]
pub struct RunParams {
    pub corpus_id: String,
    pub model_id: String,
    pub query_set_id: String,
    pub k: usize,
    pub ef_search: usize,
    pub p_head: f64,
    pub ngram_sizes: Vec<usize>,
    pub m: usize,
    pub ef_construction: usize,
    pub seed: u64,
}

/// Concentration (top-⌈p·|keys|⌉ cumulative mass) per axis.
#[derive(Debug, Clone, Serialize)]
pub struct Concentrations {
    pub doc: f64,
    /// Keyed by n-gram size.
    pub ngram: BTreeMap<usize, f64>,
    pub ordered_combo: f64,
    pub unordered_combo: f64,
}

/// Everything a run produces, ready for the reporting layer.
#[derive(Debug, Clone, Serialize)]
pub struct RunBundle {
    pub params: RunParams,
    /// Total workload size, including skipped queries.
    pub queries: u64,
    pub skipped_queries: u64,
    /// The five ranked distributions.
    pub freq: FrequencyReport,
    pub concentrations: Concentrations,
    pub graph: GraphReport,
}

impl RunBundle {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Execute one full (corpus, workload, k) run.
///
/// Embeddings and the index are loaded from the blob cache when the inputs
/// are unchanged and built (and persisted) otherwise.
pub fn run(
    config: &RunConfig,
    corpus: &TextSet,
    queries: &TextSet,
    embedder: Arc<dyn Embedder>,
    cancel: &CancelToken,
) -> Result<RunBundle, PipelineError> {
    config.validate()?;
    let model_id = embedder.model_id().to_string();
    let _span = tracing::info_span!(
        "run",
        corpus = %corpus.id,
        queries = %queries.id,
        k = config.k
    )
    .entered();

    let store = EmbeddingStore::open(&config.index_dir)?;
    let matrix = store.get_or_build(
        &corpus.id,
        &model_id,
        &corpus.as_strs(),
        embedder.as_ref(),
        &config.build_options(),
        cancel,
    )?;
    let matrix = Arc::new(matrix);

    let index_path = config.index_path(&corpus.id, &model_id);
    let index = Arc::new(hnsw::open_or_build(
        &index_path,
        Arc::clone(&matrix),
        &config.hnsw_params(),
        cancel,
    )?);

    let runner = RetrievalRunner::new(Arc::clone(&embedder), Arc::clone(&index));
    let stream = if config.cache_query_embeddings {
        let qmatrix = store.get_or_build(
            &queries.id,
            &model_id,
            &queries.as_strs(),
            embedder.as_ref(),
            &config.build_options(),
            cancel,
        )?;
        runner.run_from_matrix(
            Arc::new(qmatrix),
            config.k,
            config.run_options(),
            cancel.clone(),
        )?
    } else {
        runner.run(
            queries.texts.clone(),
            config.k,
            config.run_options(),
            cancel.clone(),
        )?
    };

    // Single-consumer aggregation over the bounded stream
    let mut aggregator = FrequencyAggregator::new(&config.ngram_sizes);
    let mut stream = stream;
    for seq in stream.by_ref() {
        aggregator.observe(&seq);
    }
    let totals = stream.finish()?;

    let freq = aggregator.finalize();
    let graph = inspect::inspect(&freq.doc, &index, config.p_head)?;

    let concentrations = Concentrations {
        doc: freq.doc.concentration(config.p_head),
        ngram: freq
            .ngrams
            .iter()
            .map(|(&n, dist)| (n, dist.concentration(config.p_head)))
            .collect(),
        ordered_combo: freq.ordered_combo.concentration(config.p_head),
        unordered_combo: freq.unordered_combo.concentration(config.p_head),
    };

    let bundle = RunBundle {
        params: RunParams {
            corpus_id: corpus.id.clone(),
            model_id,
            query_set_id: queries.id.clone(),
            k: config.k,
            ef_search: config.effective_ef_search(),
            p_head: config.p_head,
            ngram_sizes: config.ngram_sizes.clone(),
            m: config.m,
            ef_construction: config.ef_construction,
            seed: config.seed,
        },
        queries: totals.queries,
        skipped_queries: totals.skipped,
        freq,
        concentrations,
        graph,
    };

    tracing::info!(
        queries = bundle.queries,
        skipped = bundle.skipped_queries,
        doc_concentration = bundle.concentrations.doc,
        "Run complete"
    );
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::SeededEmbedder;

    fn corpus(n: usize) -> TextSet {
        TextSet::new(
            "test-corpus",
            (0..n).map(|i| format!("document body {}", i)).collect(),
        )
    }

    fn workload(n: usize) -> TextSet {
        TextSet::new(
            "test-queries",
            (0..n).map(|i| format!("what about topic {}?", i)).collect(),
        )
    }

    fn config(dir: &std::path::Path, k: usize) -> RunConfig {
        RunConfig {
            corpus_id: "test-corpus".into(),
            model_id: "test/seeded".into(),
            query_set_id: "test-queries".into(),
            k,
            m: 6,
            ef_construction: 24,
            index_dir: dir.to_path_buf(),
            quiet: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_end_to_end_invariants() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 3);
        let embedder: Arc<dyn Embedder> = Arc::new(SeededEmbedder::new(24));

        let bundle = run(
            &config,
            &corpus(40),
            &workload(15),
            embedder,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(bundle.queries, 15);
        assert_eq!(bundle.skipped_queries, 0);
        assert_eq!(bundle.freq.queries, 15);

        // DocFreq total is Q·k; n-gram totals are Q·(k-n+1) clamped at 0
        assert_eq!(bundle.freq.doc.total, 15 * 3);
        assert_eq!(bundle.freq.ngrams[&2].total, 15 * 2);
        assert_eq!(bundle.freq.ngrams[&3].total, 15);
        assert_eq!(bundle.freq.ngrams[&4].total, 0);
        assert_eq!(bundle.freq.ordered_combo.total, 15);
        assert_eq!(bundle.freq.unordered_combo.total, 15);

        // Concentration at p = 1 is exactly 1 on non-empty axes
        assert!((bundle.freq.doc.concentration(1.0) - 1.0).abs() < 1e-12);

        // Graph summary covers the whole corpus
        assert_eq!(bundle.graph.summary.n, 40);
        assert_eq!(bundle.graph.summary.layer_counts[0], 40);
        assert!(bundle.graph.head.len() >= 1);

        // Blobs persisted for reuse
        assert!(dir.path().join("test-corpus--test_seeded.emb").exists());
        assert!(config.index_path("test-corpus", "test/seeded").exists());
        assert_eq!(
            config.index_path("test-corpus", "test/seeded"),
            dir.path().join("test-corpus--test_seeded--m6.hnsw")
        );
    }

    #[test]
    fn test_second_run_reproduces_distributions() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let embedder: Arc<dyn Embedder> = Arc::new(SeededEmbedder::new(24));

        let first = run(
            &config,
            &corpus(30),
            &workload(10),
            Arc::clone(&embedder),
            &CancelToken::new(),
        )
        .unwrap();
        // Second run loads both blobs from cache and must agree exactly
        let second = run(
            &config,
            &corpus(30),
            &workload(10),
            embedder,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(first.freq.doc.entries, second.freq.doc.entries);
        assert_eq!(
            first.freq.ordered_combo.entries,
            second.freq.ordered_combo.entries
        );
        assert_eq!(
            first.graph.summary.layer_counts,
            second.graph.summary.layer_counts
        );
    }

    #[test]
    fn test_cached_query_embeddings_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.cache_query_embeddings = true;
        let embedder: Arc<dyn Embedder> = Arc::new(SeededEmbedder::new(24));

        let via_cache = run(
            &config,
            &corpus(25),
            &workload(8),
            Arc::clone(&embedder),
            &CancelToken::new(),
        )
        .unwrap();
        assert!(dir.path().join("test-queries--test_seeded.emb").exists());

        config.cache_query_embeddings = false;
        let direct = run(
            &config,
            &corpus(25),
            &workload(8),
            embedder,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(via_cache.freq.doc.entries, direct.freq.doc.entries);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 3);
        config.k = 0;
        let embedder: Arc<dyn Embedder> = Arc::new(SeededEmbedder::new(24));
        let result = run(
            &config,
            &corpus(10),
            &workload(4),
            embedder,
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 3);
        let embedder: Arc<dyn Embedder> = Arc::new(SeededEmbedder::new(24));
        let token = CancelToken::new();
        token.cancel();
        let result = run(&config, &corpus(10), &workload(4), embedder, &token);
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }

    #[test]
    fn test_bundle_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let embedder: Arc<dyn Embedder> = Arc::new(SeededEmbedder::new(24));
        let bundle = run(
            &config,
            &corpus(12),
            &workload(5),
            embedder,
            &CancelToken::new(),
        )
        .unwrap();

        let json = bundle.to_json().unwrap();
        assert!(json.contains("\"corpus_id\": \"test-corpus\""));
        assert!(json.contains("\"concentrations\""));
    }
}
