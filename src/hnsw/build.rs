//! Graph construction
//!
//! Nodes are inserted in doc-id order. Each draws its top layer from the
//! exponential level distribution, greedy-descends from the entry point to
//! its insertion band, then links into every layer it joins via an
//! ef_construction-wide beam search and the diversity heuristic from the
//! HNSW paper (a candidate is kept only while it is closer to the new node
//! than to any neighbor already selected). Reverse links that overflow a
//! node's capacity re-run the same heuristic on that node's list.
//!
//! With a fixed seed the whole construction is deterministic, which is what
//! makes run bundles reproducible across hosts.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::math::dot;
use crate::store::EmbeddingMatrix;
use crate::{CancelToken, DocId};

use super::search::{greedy_descend, search_layer, NeighborSource, Scored};
use super::{HnswError, HnswIndex, HnswParams, LayerCsr, MAX_LEVEL};

/// Mutable adjacency while the graph is under construction:
/// `adj[node][layer]` is the neighbor list of `node` at `layer`.
struct GraphBuilder<'a> {
    matrix: &'a EmbeddingMatrix,
    params: &'a HnswParams,
    adj: Vec<Vec<Vec<u32>>>,
    node_layers: Vec<u32>,
    entry: DocId,
    max_layer: u32,
}

impl NeighborSource for GraphBuilder<'_> {
    fn neighbors_of(&self, id: DocId, layer: usize) -> &[u32] {
        match self.adj[id as usize].get(layer) {
            Some(list) => list,
            None => &[],
        }
    }
}

impl<'a> GraphBuilder<'a> {
    fn new(matrix: &'a EmbeddingMatrix, params: &'a HnswParams) -> Self {
        Self {
            matrix,
            params,
            adj: Vec::with_capacity(matrix.n()),
            node_layers: Vec::with_capacity(matrix.n()),
            entry: 0,
            max_layer: 0,
        }
    }

    /// Draw a top layer: ⌊−ln(U)·mL⌋ with U uniform in (0, 1].
    fn draw_level(&self, rng: &mut StdRng) -> u32 {
        let u: f64 = 1.0 - rng.random::<f64>();
        let level = (-u.ln() * self.params.ml()).floor();
        (level as u32).min(MAX_LEVEL)
    }

    /// Diversity-preserving neighbor selection (Algorithm 4): walk the
    /// candidates best-first, keep one only while it is closer to the new
    /// node than to anything already kept, backfill from the pruned set if
    /// the quota is not met.
    fn select_neighbors(&self, candidates: &[Scored], m: usize) -> Vec<u32> {
        if candidates.len() <= m {
            return candidates.iter().map(|c| c.id).collect();
        }

        let mut selected: Vec<Scored> = Vec::with_capacity(m);
        let mut pruned: Vec<u32> = Vec::new();

        for &cand in candidates {
            if selected.len() >= m {
                break;
            }
            let cand_vec = self.matrix.row(cand.id as usize);
            let dominated = selected.iter().any(|kept| {
                dot(cand_vec, self.matrix.row(kept.id as usize)) > cand.score
            });
            if dominated {
                pruned.push(cand.id);
            } else {
                selected.push(cand);
            }
        }

        let mut out: Vec<u32> = selected.into_iter().map(|s| s.id).collect();
        for id in pruned {
            if out.len() >= m {
                break;
            }
            out.push(id);
        }
        out
    }

    /// Re-prune a node whose reverse links exceeded its capacity.
    fn prune(&mut self, node: DocId, layer: usize) {
        let cap = self.params.capacity(layer);
        if self.adj[node as usize][layer].len() <= cap {
            return;
        }
        let node_vec = self.matrix.row(node as usize);
        let mut scored: Vec<Scored> = self.adj[node as usize][layer]
            .iter()
            .map(|&nb| Scored {
                score: dot(node_vec, self.matrix.row(nb as usize)),
                id: nb,
            })
            .collect();
        scored.sort_unstable_by(|a, b| b.cmp(a));
        self.adj[node as usize][layer] = self.select_neighbors(&scored, cap);
    }

    fn insert(&mut self, node: DocId, level: u32) {
        let query = self.matrix.row(node as usize);
        self.node_layers.push(level);
        self.adj.push(vec![Vec::new(); level as usize + 1]);

        if node == 0 {
            self.entry = 0;
            self.max_layer = level;
            return;
        }

        // Descend through the layers above the insertion band
        let mut current = self.entry;
        if self.max_layer > level {
            current = greedy_descend(self.matrix, query, self, self.max_layer, level, self.entry);
        }

        // Link into every layer the node joins, top-down
        let mut entries = vec![current];
        let top = level.min(self.max_layer);
        for layer in (0..=top as usize).rev() {
            let candidates = search_layer(
                self.matrix,
                query,
                self,
                layer,
                &entries,
                self.params.ef_construction,
            );
            let selected = self.select_neighbors(&candidates, self.params.capacity(layer));

            for &nb in &selected {
                self.adj[node as usize][layer].push(nb);
                self.adj[nb as usize][layer].push(node);
                self.prune(nb, layer);
            }

            // The wider candidate set seeds the next layer down
            entries = candidates.iter().map(|c| c.id).collect();
            if entries.is_empty() {
                entries = vec![current];
            }
        }

        if level > self.max_layer {
            self.entry = node;
            self.max_layer = level;
        }
    }

    /// Flatten the adjacency lists into one dense CSR per layer.
    fn freeze(self, vectors: Arc<EmbeddingMatrix>, params: HnswParams) -> HnswIndex {
        let n = self.adj.len();
        let layer_count = self.max_layer as usize + 1;
        let mut layers = Vec::with_capacity(layer_count);

        for layer in 0..layer_count {
            let mut offsets = Vec::with_capacity(n + 1);
            let mut neighbors = Vec::new();
            offsets.push(0u64);
            for node in 0..n {
                if let Some(list) = self.adj[node].get(layer) {
                    neighbors.extend_from_slice(list);
                }
                offsets.push(neighbors.len() as u64);
            }
            layers.push(LayerCsr { offsets, neighbors });
        }

        HnswIndex {
            params,
            vectors,
            node_layers: self.node_layers,
            layers,
            entry: self.entry,
        }
    }
}

impl HnswIndex {
    /// Build the graph over all rows of `vectors`.
    pub fn build(vectors: Arc<EmbeddingMatrix>, params: HnswParams) -> Result<Self, HnswError> {
        Self::build_with_cancel(vectors, params, &CancelToken::new())
    }

    /// Build, checking the cancellation flag between insertions.
    pub fn build_with_cancel(
        vectors: Arc<EmbeddingMatrix>,
        params: HnswParams,
        cancel: &CancelToken,
    ) -> Result<Self, HnswError> {
        params.validate()?;
        let n = vectors.n();
        let _span = tracing::info_span!("hnsw_build", n, m = params.m).entered();

        if n == 0 {
            return Ok(HnswIndex {
                params,
                vectors,
                node_layers: Vec::new(),
                layers: vec![LayerCsr {
                    offsets: vec![0],
                    neighbors: Vec::new(),
                }],
                entry: 0,
            });
        }

        tracing::info!(n, d = vectors.d(), m = params.m, seed = params.seed, "Building HNSW graph");

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut builder = GraphBuilder::new(&vectors, &params);
        for node in 0..n as u32 {
            if cancel.is_cancelled() {
                return Err(HnswError::Cancelled);
            }
            let level = builder.draw_level(&mut rng);
            builder.insert(node, level);
        }

        let index = builder.freeze(Arc::clone(&vectors), params.clone());
        tracing::info!(
            n,
            max_layer = index.max_layer(),
            entry = index.entry,
            "HNSW graph built"
        );
        Ok(index)
    }
}
