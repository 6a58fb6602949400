//! Retrieval runner: drives batched queries through embedder and index
//!
//! A producer thread embeds each query batch (one embedder call per batch),
//! runs the batch through `search_batch`, and hands one result sequence per
//! query to the consumer over a bounded channel. Sequences arrive in
//! query-id order no matter how the search parallelizes internally; the
//! bounded channel gives the single-consumer aggregator backpressure
//! against a fast producer.
//!
//! An embedder failure skips that whole batch (each of its queries becomes
//! an empty sequence and counts toward `skipped`) and the run continues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};
use thiserror::Error;

use crate::embedder::Embedder;
use crate::hnsw::{HnswError, HnswIndex, DEFAULT_EF_SEARCH};
use crate::store::EmbeddingMatrix;
use crate::{CancelToken, DocId};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("dimension mismatch: index has D={index}, embedder produces D={embedder}")]
    DimensionMismatch { index: usize, embedder: usize },
    #[error(transparent)]
    Hnsw(#[from] HnswError),
    #[error("run cancelled")]
    Cancelled,
}

/// Ordered top-k result of one query.
///
/// Ids are sorted by descending score (ties toward the smaller id) and are
/// distinct. A skipped query (embedder failure for its batch) has empty
/// `ids` and `scores`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSequence {
    pub query_id: u32,
    pub ids: Vec<DocId>,
    pub scores: Vec<f32>,
}

impl ResultSequence {
    pub fn is_skipped(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Options for a retrieval run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Queries per embedder call / search batch.
    pub batch_size: usize,
    /// Bounded-channel depth between producer and consumer.
    pub channel_depth: usize,
    /// Beam width at layer 0; clamped to at least k.
    pub ef_search: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            channel_depth: 256,
            ef_search: DEFAULT_EF_SEARCH,
        }
    }
}

/// Drives query workloads through an embedder and a frozen index.
pub struct RetrievalRunner {
    embedder: Arc<dyn Embedder>,
    index: Arc<HnswIndex>,
}

/// Consumer side of a run: iterate the sequences, then call
/// [`finish`](RunStream::finish) for the totals.
pub struct RunStream {
    rx: Receiver<ResultSequence>,
    skipped: Arc<AtomicU64>,
    seen: u64,
    handle: Option<JoinHandle<Result<(), RunnerError>>>,
}

/// Totals for a completed run.
#[derive(Debug, Clone, Copy)]
pub struct RunTotals {
    pub queries: u64,
    pub skipped: u64,
}

impl Iterator for RunStream {
    type Item = ResultSequence;

    fn next(&mut self) -> Option<ResultSequence> {
        let seq = self.rx.recv().ok();
        if seq.is_some() {
            self.seen += 1;
        }
        seq
    }
}

impl RunStream {
    /// Join the producer and report totals over every emitted sequence,
    /// draining any the consumer did not pull.
    pub fn finish(mut self) -> Result<RunTotals, RunnerError> {
        for _ in self.by_ref() {}
        let handle = self.handle.take().expect("finish is called once");
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(panic) => std::panic::resume_unwind(panic),
        }
        Ok(RunTotals {
            queries: self.seen,
            skipped: self.skipped.load(Ordering::Relaxed),
        })
    }
}

impl RetrievalRunner {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<HnswIndex>) -> Self {
        Self { embedder, index }
    }

    /// Start a run over `queries`, yielding one sequence per query in
    /// workload order.
    ///
    /// Fails up front on an embedder/index dimension disagreement: no
    /// partial results for a mis-wired pair. `finish` reports
    /// [`RunnerError::Cancelled`] if the token fired mid-run.
    pub fn run(
        &self,
        queries: Vec<String>,
        k: usize,
        opts: RunOptions,
        cancel: CancelToken,
    ) -> Result<RunStream, RunnerError> {
        if self.embedder.dim() != self.index.dim() && !self.index.is_empty() {
            return Err(RunnerError::DimensionMismatch {
                index: self.index.dim(),
                embedder: self.embedder.dim(),
            });
        }

        let (tx, rx) = bounded::<ResultSequence>(opts.channel_depth.max(1));
        let skipped = Arc::new(AtomicU64::new(0));
        let skipped_for_thread = Arc::clone(&skipped);
        let embedder = Arc::clone(&self.embedder);
        let index = Arc::clone(&self.index);
        let batch_size = opts.batch_size.max(1);
        let ef = opts.ef_search;

        let handle = std::thread::spawn(move || -> Result<(), RunnerError> {
            let _span = tracing::info_span!("retrieval_run", queries = queries.len()).entered();

            for (batch_idx, batch) in queries.chunks(batch_size).enumerate() {
                if cancel.is_cancelled() {
                    tracing::info!(batch = batch_idx, "Run cancelled between batches");
                    return Err(RunnerError::Cancelled);
                }
                let base = (batch_idx * batch_size) as u32;
                let texts: Vec<&str> = batch.iter().map(String::as_str).collect();

                let results = match embedder.embed(&texts) {
                    Ok(rows) => {
                        let slices: Vec<&[f32]> = rows.iter().map(|r| r.as_slice()).collect();
                        Some(index.search_batch(&slices, k, ef)?)
                    }
                    Err(e) => {
                        tracing::warn!(
                            batch = batch_idx,
                            queries = batch.len(),
                            error = %e,
                            "Embedder failed, skipping batch"
                        );
                        skipped_for_thread.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        None
                    }
                };

                for offset in 0..batch.len() {
                    let seq = match &results {
                        Some(batch_results) => {
                            let hits = &batch_results[offset];
                            ResultSequence {
                                query_id: base + offset as u32,
                                ids: hits.iter().map(|n| n.id).collect(),
                                scores: hits.iter().map(|n| n.score).collect(),
                            }
                        }
                        None => ResultSequence {
                            query_id: base + offset as u32,
                            ids: Vec::new(),
                            scores: Vec::new(),
                        },
                    };
                    // Consumer hung up; stop producing
                    if tx.send(seq).is_err() {
                        return Ok(());
                    }
                }
            }
            Ok(())
        });

        Ok(RunStream {
            rx,
            skipped,
            seen: 0,
            handle: Some(handle),
        })
    }

    /// Run directly from a pre-embedded query matrix (cached query
    /// embeddings), bypassing the embedder entirely. No queries can be
    /// skipped on this path.
    pub fn run_from_matrix(
        &self,
        queries: Arc<EmbeddingMatrix>,
        k: usize,
        opts: RunOptions,
        cancel: CancelToken,
    ) -> Result<RunStream, RunnerError> {
        if queries.d() != self.index.dim() && !self.index.is_empty() && !queries.is_empty() {
            return Err(RunnerError::DimensionMismatch {
                index: self.index.dim(),
                embedder: queries.d(),
            });
        }

        let (tx, rx) = bounded::<ResultSequence>(opts.channel_depth.max(1));
        let skipped = Arc::new(AtomicU64::new(0));
        let index = Arc::clone(&self.index);
        let batch_size = opts.batch_size.max(1);
        let ef = opts.ef_search;

        let handle = std::thread::spawn(move || -> Result<(), RunnerError> {
            let n = queries.n();
            let _span = tracing::info_span!("retrieval_run_cached", queries = n).entered();

            let mut start = 0usize;
            while start < n {
                if cancel.is_cancelled() {
                    return Err(RunnerError::Cancelled);
                }
                let end = (start + batch_size).min(n);
                let slices: Vec<&[f32]> = (start..end).map(|i| queries.row(i)).collect();
                let batch_results = index.search_batch(&slices, k, ef)?;

                for (offset, hits) in batch_results.iter().enumerate() {
                    let seq = ResultSequence {
                        query_id: (start + offset) as u32,
                        ids: hits.iter().map(|n| n.id).collect(),
                        scores: hits.iter().map(|n| n.score).collect(),
                    };
                    if tx.send(seq).is_err() {
                        return Ok(());
                    }
                }
                start = end;
            }
            Ok(())
        });

        Ok(RunStream {
            rx,
            skipped,
            seen: 0,
            handle: Some(handle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::SeededEmbedder;
    use crate::hnsw::{test_matrix, HnswParams};

    const DIM: usize = 16;

    fn make_index(n: usize) -> Arc<HnswIndex> {
        Arc::new(
            HnswIndex::build(
                test_matrix(n, DIM),
                HnswParams {
                    m: 6,
                    ef_construction: 24,
                    seed: 4,
                },
            )
            .unwrap(),
        )
    }

    fn queries(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("query {}", i)).collect()
    }

    #[test]
    fn test_sequences_arrive_in_query_order() {
        let runner = RetrievalRunner::new(Arc::new(SeededEmbedder::new(DIM)), make_index(30));
        let stream = runner
            .run(
                queries(10),
                3,
                RunOptions {
                    batch_size: 4,
                    ..Default::default()
                },
                CancelToken::new(),
            )
            .unwrap();

        let seqs: Vec<ResultSequence> = stream.collect();
        assert_eq!(seqs.len(), 10);
        for (i, seq) in seqs.iter().enumerate() {
            assert_eq!(seq.query_id, i as u32);
            assert_eq!(seq.ids.len(), 3);
            let mut distinct = std::collections::HashSet::new();
            for &id in &seq.ids {
                assert!((id as usize) < 30);
                assert!(distinct.insert(id), "duplicate id within a sequence");
            }
        }
    }

    #[test]
    fn test_failed_batch_is_skipped_not_fatal() {
        let mut embedder = SeededEmbedder::new(DIM);
        // Batches are 4 wide; queries 4..8 land in the poisoned batch
        embedder.fail_on = Some("query 5".into());
        let runner = RetrievalRunner::new(Arc::new(embedder), make_index(20));

        let stream = runner
            .run(
                queries(12),
                2,
                RunOptions {
                    batch_size: 4,
                    ..Default::default()
                },
                CancelToken::new(),
            )
            .unwrap();

        let mut seqs = Vec::new();
        let mut stream = stream;
        for seq in stream.by_ref() {
            seqs.push(seq);
        }
        let totals = stream.finish().unwrap();

        assert_eq!(seqs.len(), 12);
        assert_eq!(totals.queries, 12);
        assert_eq!(totals.skipped, 4);
        for seq in &seqs {
            let in_poisoned_batch = (4..8).contains(&seq.query_id);
            assert_eq!(seq.is_skipped(), in_poisoned_batch, "query {}", seq.query_id);
        }
    }

    #[test]
    fn test_dimension_mismatch_fails_before_streaming() {
        let runner = RetrievalRunner::new(Arc::new(SeededEmbedder::new(DIM * 2)), make_index(10));
        let result = runner.run(queries(4), 2, RunOptions::default(), CancelToken::new());
        assert!(matches!(
            result,
            Err(RunnerError::DimensionMismatch {
                index: DIM,
                embedder: 32
            })
        ));
    }

    #[test]
    fn test_cancelled_run_surfaces_in_finish() {
        let token = CancelToken::new();
        token.cancel();
        let runner = RetrievalRunner::new(Arc::new(SeededEmbedder::new(DIM)), make_index(10));
        let stream = runner
            .run(queries(8), 2, RunOptions::default(), token)
            .unwrap();
        assert!(matches!(stream.finish(), Err(RunnerError::Cancelled)));
    }

    #[test]
    fn test_empty_workload() {
        let runner = RetrievalRunner::new(Arc::new(SeededEmbedder::new(DIM)), make_index(10));
        let stream = runner
            .run(Vec::new(), 3, RunOptions::default(), CancelToken::new())
            .unwrap();
        let totals = stream.finish().unwrap();
        assert_eq!(totals.queries, 0);
        assert_eq!(totals.skipped, 0);
    }

    #[test]
    fn test_run_from_matrix_matches_embedder_path() {
        let embedder = Arc::new(SeededEmbedder::new(DIM));
        let index = make_index(25);
        let runner = RetrievalRunner::new(Arc::clone(&embedder) as Arc<dyn Embedder>, index);
        let owned = queries(9);

        let via_embedder: Vec<ResultSequence> = runner
            .run(owned.clone(), 3, RunOptions::default(), CancelToken::new())
            .unwrap()
            .collect();

        let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
        let rows = embedder.embed(&refs).unwrap();
        let qmatrix = Arc::new(EmbeddingMatrix::from_rows(rows, DIM).unwrap());
        let via_matrix: Vec<ResultSequence> = runner
            .run_from_matrix(qmatrix, 3, RunOptions::default(), CancelToken::new())
            .unwrap()
            .collect();

        assert_eq!(via_embedder, via_matrix);
    }
}
