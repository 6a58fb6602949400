//! Layer search and batched k-NN queries
//!
//! One beam-search routine serves both the builder (over its mutable
//! adjacency lists) and the frozen index (over the per-layer CSR); the two
//! only differ in how neighbors are looked up.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use rayon::prelude::*;

use crate::math::dot;
use crate::store::EmbeddingMatrix;
use crate::DocId;

use super::{HnswError, HnswIndex, Neighbor};

/// A candidate with its similarity to the query.
///
/// Ordering: higher score is greater; equal scores order the *smaller* id
/// as greater, so heap pops and sorts both prefer small ids on ties.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scored {
    pub(crate) score: f32,
    pub(crate) id: DocId,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Neighbor lookup abstraction shared by build-time and frozen graphs.
pub(crate) trait NeighborSource {
    fn neighbors_of(&self, id: DocId, layer: usize) -> &[u32];
}

impl NeighborSource for HnswIndex {
    fn neighbors_of(&self, id: DocId, layer: usize) -> &[u32] {
        match self.layers.get(layer) {
            Some(csr) => csr.of(id),
            None => &[],
        }
    }
}

/// Beam search on one layer: explore from `entries`, keep the best `ef`
/// visited nodes. Returns them sorted best-first.
pub(crate) fn search_layer<S: NeighborSource>(
    matrix: &EmbeddingMatrix,
    query: &[f32],
    source: &S,
    layer: usize,
    entries: &[DocId],
    ef: usize,
) -> Vec<Scored> {
    debug_assert!(ef >= 1);
    let mut visited: HashSet<DocId> = HashSet::with_capacity(ef * 4);
    // Max-heap of nodes still to expand, best first
    let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
    // Min-heap of the best ef seen so far, worst on top
    let mut results: BinaryHeap<std::cmp::Reverse<Scored>> = BinaryHeap::new();

    for &ep in entries {
        if !visited.insert(ep) {
            continue;
        }
        let scored = Scored {
            score: dot(query, matrix.row(ep as usize)),
            id: ep,
        };
        candidates.push(scored);
        results.push(std::cmp::Reverse(scored));
        if results.len() > ef {
            results.pop();
        }
    }

    while let Some(current) = candidates.pop() {
        if results.len() >= ef {
            let worst = results.peek().expect("results non-empty").0;
            if current < worst {
                break;
            }
        }
        for &nb in source.neighbors_of(current.id, layer) {
            if !visited.insert(nb) {
                continue;
            }
            let scored = Scored {
                score: dot(query, matrix.row(nb as usize)),
                id: nb,
            };
            let admit = match results.peek() {
                Some(worst) if results.len() >= ef => scored > worst.0,
                _ => true,
            };
            if admit {
                candidates.push(scored);
                results.push(std::cmp::Reverse(scored));
                if results.len() > ef {
                    results.pop();
                }
            }
        }
    }

    let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
    out.sort_unstable_by(|a, b| b.cmp(a));
    out
}

/// Greedy 1-nearest descent from the entry point down to (and excluding)
/// `stop_layer`. Returns the entry for the next phase.
pub(crate) fn greedy_descend<S: NeighborSource>(
    matrix: &EmbeddingMatrix,
    query: &[f32],
    source: &S,
    from_layer: u32,
    stop_layer: u32,
    entry: DocId,
) -> DocId {
    let mut current = entry;
    let mut layer = from_layer;
    while layer > stop_layer {
        let best = search_layer(matrix, query, source, layer as usize, &[current], 1);
        if let Some(first) = best.first() {
            current = first.id;
        }
        layer -= 1;
    }
    current
}

impl HnswIndex {
    /// Top-k search for one query vector.
    ///
    /// `ef` is the layer-0 beam width and is clamped to at least `k`.
    /// Results are sorted by descending score, ties by ascending id, and
    /// are distinct within the query. Never panics on a frozen index;
    /// the only error is a query of the wrong dimension.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<Neighbor>, HnswError> {
        if query.len() != self.dim() {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim(),
                actual: query.len(),
            });
        }
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let ef = ef.max(k);
        let entry = greedy_descend(&self.vectors, query, self, self.max_layer(), 0, self.entry);
        let found = search_layer(&self.vectors, query, self, 0, &[entry], ef);

        Ok(found
            .into_iter()
            .take(k)
            .map(|s| Neighbor {
                id: s.id,
                score: s.score,
            })
            .collect())
    }

    /// Top-k search for a batch of query vectors, parallelized across the
    /// batch. Row order of the output matches the input.
    pub fn search_batch(
        &self,
        queries: &[&[f32]],
        k: usize,
        ef: usize,
    ) -> Result<Vec<Vec<Neighbor>>, HnswError> {
        // Validate every row before doing any work: a bad query dimension
        // fails the whole batch with no partial results.
        for q in queries {
            if q.len() != self.dim() {
                return Err(HnswError::DimensionMismatch {
                    expected: self.dim(),
                    actual: q.len(),
                });
            }
        }
        queries
            .par_iter()
            .map(|q| self.search(q, k, ef))
            .collect()
    }
}
