//! # hotdocs - Retrieval-Concentration Analytics
//!
//! Measures how dense-retrieval traffic concentrates on a small subset of a
//! document corpus when a graph-based ANN index answers a large query
//! workload. For each (corpus, workload, k) run it produces per-document
//! retrieval frequencies, ordered n-gram and combination distributions over
//! the result sequences, and the correlation between document hotness and
//! the document's position in the HNSW graph (layer and degree).
//!
//! ## Pipeline
//!
//! corpus text → [`Embedder`] → [`EmbeddingStore`] → [`HnswIndex`] →
//! [`RetrievalRunner`] → [`FrequencyAggregator`] → [`RunBundle`], with the
//! graph inspector joining on doc ids at the end.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hotdocs::{pipeline, CancelToken, RunConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! # let embedder: Arc<dyn hotdocs::Embedder> = unimplemented!();
//! let corpus = hotdocs::TextSet::from_corpus_json("wiki-100k", "wikipedia_100k.json".as_ref())?;
//! let queries = hotdocs::TextSet::from_query_json("nq", "dataset_cache/nq_validation.json".as_ref())?;
//!
//! let config = RunConfig {
//!     corpus_id: corpus.id.clone(),
//!     query_set_id: queries.id.clone(),
//!     model_id: embedder.model_id().to_string(),
//!     k: 10,
//!     ..RunConfig::default()
//! };
//! let bundle = pipeline::run(&config, &corpus, &queries, embedder, &CancelToken::new())?;
//! println!("top-10% doc concentration: {:.2}%", bundle.concentrations.doc * 100.0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod corpus;
pub mod embedder;
pub mod freq;
pub mod hnsw;
pub mod inspect;
pub mod pipeline;
pub mod runner;
pub mod store;

pub(crate) mod math;

pub use config::{ConfigError, RunConfig};
pub use corpus::{CorpusError, TextSet};
pub use embedder::{Embedder, EmbedderError, Embedding};
pub use freq::{FrequencyAggregator, FrequencyReport, RankedDistribution};
pub use hnsw::{HnswError, HnswIndex, HnswParams, Neighbor};
pub use inspect::{GraphReport, GraphSummary, HotDoc};
pub use pipeline::{Concentrations, PipelineError, RunBundle, RunParams};
pub use runner::{ResultSequence, RetrievalRunner, RunOptions, RunTotals, RunnerError};
pub use store::{BuildOptions, EmbeddingMatrix, EmbeddingStore, StoreError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Document identifier: the position of the document in corpus order.
pub type DocId = u32;

/// Cooperative cancellation flag shared between a run and its caller.
///
/// Workers check it between embedding chunks, between index insertions, and
/// between query batches; in-memory search itself is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
