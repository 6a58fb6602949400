//! HNSW (Hierarchical Navigable Small World) index
//!
//! A layered proximity graph over the embedding matrix, built natively so
//! the analytics side can read per-node structure: layer membership,
//! neighbor lists, and degrees are first-class, not an implementation
//! detail hidden behind a search API.
//!
//! Similarity is inner product on unit-norm vectors (equal to cosine).
//! Ties between equal-score candidates break toward the smaller doc-id
//! everywhere, so runs are reproducible bit for bit.
//!
//! The frozen graph is a flat CSR per layer (offset + neighbor arrays),
//! which keeps search cache-friendly and maps directly onto the persisted
//! binary format.

mod build;
mod persist;
mod search;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::EmbeddingMatrix;
use crate::DocId;

pub use persist::open_or_build;

/// M parameter: target neighbors per node on layers above the bottom.
pub const DEFAULT_M: usize = 32;
/// Candidate-list width while inserting (one-time build cost).
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
/// Beam width at layer 0 for queries.
pub const DEFAULT_EF_SEARCH: usize = 100;

/// Hard cap on the drawn layer; with mL = 1/ln(M) the draw exceeding this
/// is vanishingly rare for any realistic corpus.
pub(crate) const MAX_LEVEL: u32 = 16;

#[derive(Error, Debug)]
pub enum HnswError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HNSW index not found at {0}")]
    NotFound(String),
    #[error("dimension mismatch: index has D={expected}, query has D={actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("doc id {id} out of range for index of {len} nodes")]
    OutOfRange { id: DocId, len: usize },
    #[error("corrupt index blob {path}: {reason}")]
    IndexCorrupt { path: String, reason: String },
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("index blob {path} was built over a different matrix: {reason}")]
    Stale { path: String, reason: String },
    #[error("invalid build parameters: {0}")]
    InvalidParams(String),
    #[error("index build cancelled")]
    Cancelled,
}

/// Build-time parameters.
///
/// `m0` (bottom-layer capacity) is fixed at `2·m` and the level-assignment
/// factor at `1/ln(m)`, the standard choices. Builds with the same
/// parameters over the same matrix produce identical graphs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
    /// Seed for the level-assignment draws.
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            seed: 0x5eed_f00d,
        }
    }
}

impl HnswParams {
    pub(crate) fn m0(&self) -> usize {
        self.m * 2
    }

    pub(crate) fn ml(&self) -> f64 {
        1.0 / (self.m as f64).ln()
    }

    /// Neighbor capacity at a layer.
    pub(crate) fn capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0()
        } else {
            self.m
        }
    }

    pub(crate) fn validate(&self) -> Result<(), HnswError> {
        if self.m < 2 {
            return Err(HnswError::InvalidParams(format!("m={} (need m >= 2)", self.m)));
        }
        if self.ef_construction < self.m {
            return Err(HnswError::InvalidParams(format!(
                "ef_construction={} < m={}",
                self.ef_construction, self.m
            )));
        }
        Ok(())
    }
}

/// A single search hit: doc id plus inner-product similarity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: DocId,
    pub score: f32,
}

/// Flat adjacency for one layer: dense CSR over all node ids. Nodes absent
/// from the layer have an empty range.
pub(crate) struct LayerCsr {
    pub(crate) offsets: Vec<u64>,
    pub(crate) neighbors: Vec<u32>,
}

impl LayerCsr {
    pub(crate) fn of(&self, id: DocId) -> &[u32] {
        let start = self.offsets[id as usize] as usize;
        let end = self.offsets[id as usize + 1] as usize;
        &self.neighbors[start..end]
    }
}

/// Frozen, queryable HNSW graph over a shared embedding matrix.
///
/// Immutable after build; concurrent searches are safe and independent.
pub struct HnswIndex {
    pub(crate) params: HnswParams,
    pub(crate) vectors: Arc<EmbeddingMatrix>,
    /// Top layer of each node.
    pub(crate) node_layers: Vec<u32>,
    /// Adjacency per layer, index 0 = bottom.
    pub(crate) layers: Vec<LayerCsr>,
    pub(crate) entry: DocId,
}

impl HnswIndex {
    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.node_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_layers.is_empty()
    }

    /// Vector dimension D.
    pub fn dim(&self) -> usize {
        self.vectors.d()
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    pub fn vectors(&self) -> &Arc<EmbeddingMatrix> {
        &self.vectors
    }

    /// Highest populated layer. 0 for an empty or single-layer graph.
    pub fn max_layer(&self) -> u32 {
        (self.layers.len().saturating_sub(1)) as u32
    }

    /// The node holding the globally maximum layer, if any nodes exist.
    pub fn entry_point(&self) -> Option<DocId> {
        if self.is_empty() {
            None
        } else {
            Some(self.entry)
        }
    }

    fn check_id(&self, id: DocId) -> Result<(), HnswError> {
        if (id as usize) < self.len() {
            Ok(())
        } else {
            Err(HnswError::OutOfRange {
                id,
                len: self.len(),
            })
        }
    }

    /// Top layer of a node.
    pub fn layer(&self, id: DocId) -> Result<u32, HnswError> {
        self.check_id(id)?;
        Ok(self.node_layers[id as usize])
    }

    /// Neighbors of a node on one layer (empty if the node is not present
    /// on that layer).
    pub fn neighbors_at(&self, id: DocId, layer: u32) -> Result<&[u32], HnswError> {
        self.check_id(id)?;
        match self.layers.get(layer as usize) {
            Some(csr) => Ok(csr.of(id)),
            None => Ok(&[]),
        }
    }

    /// All neighbors of a node, concatenated across the layers it
    /// participates in (bottom first).
    pub fn neighbors(&self, id: DocId) -> Result<Vec<u32>, HnswError> {
        self.check_id(id)?;
        let top = self.node_layers[id as usize];
        let mut all = Vec::new();
        for layer in 0..=top {
            all.extend_from_slice(self.layers[layer as usize].of(id));
        }
        Ok(all)
    }

    /// Total neighbor count of a node summed across all its layers.
    pub fn degree(&self, id: DocId) -> Result<usize, HnswError> {
        self.check_id(id)?;
        let top = self.node_layers[id as usize];
        Ok((0..=top)
            .map(|layer| self.layers[layer as usize].of(id).len())
            .sum())
    }

    /// Nodes present at each layer: entry ℓ counts nodes whose top layer
    /// is ≥ ℓ (every node is present at layer 0).
    pub fn layer_counts(&self) -> Vec<u64> {
        let mut counts = vec![0u64; self.layers.len().max(1)];
        for &top in &self.node_layers {
            for slot in counts.iter_mut().take(top as usize + 1) {
                *slot += 1;
            }
        }
        counts
    }

    /// Nodes above the bottom layer.
    pub fn upper_layer_nodes(&self) -> u64 {
        self.node_layers.iter().filter(|&&l| l > 0).count() as u64
    }

    /// Degree → node count, ascending by degree.
    pub fn degree_histogram(&self) -> BTreeMap<usize, u64> {
        let mut hist = BTreeMap::new();
        for id in 0..self.len() as u32 {
            let deg = self
                .degree(id)
                .expect("id < len by construction");
            *hist.entry(deg).or_insert(0u64) += 1;
        }
        hist
    }

    /// Mean total degree over all nodes; 0.0 for an empty index.
    pub fn mean_degree(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let total: usize = (0..self.len() as u32)
            .map(|id| self.degree(id).expect("id < len by construction"))
            .sum();
        total as f64 / self.len() as f64
    }

    /// Test-only constructor for hand-crafted graphs.
    #[cfg(test)]
    pub(crate) fn from_parts(
        params: HnswParams,
        vectors: Arc<EmbeddingMatrix>,
        node_layers: Vec<u32>,
        layers: Vec<LayerCsr>,
        entry: DocId,
    ) -> Self {
        Self {
            params,
            vectors,
            node_layers,
            layers,
            entry,
        }
    }
}

/// Shared test helper: a small matrix of deterministic unit vectors.
#[cfg(test)]
pub(crate) fn test_matrix(n: usize, d: usize) -> Arc<EmbeddingMatrix> {
    let rows: Vec<crate::Embedding> = (0..n)
        .map(|i| crate::embedder::make_test_embedding(i as u32, d))
        .collect();
    Arc::new(EmbeddingMatrix::from_rows(rows, d).expect("consistent test dims"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_defaults() {
        let p = HnswParams::default();
        assert_eq!(p.m, 32);
        assert_eq!(p.m0(), 64);
        assert!(p.ef_construction >= p.m);
        assert!((p.ml() - 1.0 / (32f64).ln()).abs() < 1e-12);
        p.validate().unwrap();
    }

    #[test]
    fn test_params_rejects_bad_values() {
        let p = HnswParams {
            m: 1,
            ..Default::default()
        };
        assert!(matches!(p.validate(), Err(HnswError::InvalidParams(_))));

        let p = HnswParams {
            m: 16,
            ef_construction: 8,
            ..Default::default()
        };
        assert!(matches!(p.validate(), Err(HnswError::InvalidParams(_))));
    }

    #[test]
    fn test_inspection_on_built_index() {
        let matrix = test_matrix(40, 16);
        let index = HnswIndex::build(
            Arc::clone(&matrix),
            HnswParams {
                m: 4,
                ef_construction: 16,
                seed: 7,
            },
        )
        .unwrap();

        assert_eq!(index.len(), 40);
        assert_eq!(index.dim(), 16);
        let entry = index.entry_point().expect("non-empty index has an entry");
        // Entry point holds the globally maximum layer
        assert_eq!(index.layer(entry).unwrap(), index.max_layer());

        // Every node participates in layers 0..=its top layer and none above
        for id in 0..40u32 {
            let top = index.layer(id).unwrap();
            assert!(top <= index.max_layer());
            for layer in (top + 1)..=index.max_layer() {
                assert!(
                    index.neighbors_at(id, layer).unwrap().is_empty(),
                    "node {} has neighbors above its top layer",
                    id
                );
            }
        }

        // Cumulative layer counts: layer 0 holds everyone, counts never grow
        let counts = index.layer_counts();
        assert_eq!(counts[0], 40);
        for w in counts.windows(2) {
            assert!(w[0] >= w[1]);
        }

        // Degree equals the sum of per-layer neighbor counts
        let deg0 = index.degree(0).unwrap();
        assert_eq!(deg0, index.neighbors(0).unwrap().len());

        let hist = index.degree_histogram();
        assert_eq!(hist.values().sum::<u64>(), 40);
        assert!(index.mean_degree() > 0.0);
    }

    #[test]
    fn test_out_of_range_id() {
        let matrix = test_matrix(5, 8);
        let index = HnswIndex::build(
            Arc::clone(&matrix),
            HnswParams {
                m: 4,
                ef_construction: 8,
                seed: 1,
            },
        )
        .unwrap();

        assert!(matches!(
            index.layer(5),
            Err(HnswError::OutOfRange { id: 5, len: 5 })
        ));
        assert!(matches!(index.degree(99), Err(HnswError::OutOfRange { .. })));
        assert!(matches!(
            index.neighbors(5),
            Err(HnswError::OutOfRange { .. })
        ));
    }
}
