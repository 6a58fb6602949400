//! Graph inspector: joins document hotness with HNSW structure
//!
//! Takes the finalized per-document ranked distribution and the index, and
//! answers the structural questions: do the hottest documents sit on upper
//! layers, are they better connected than average, and does the
//! rank-frequency curve look like a power law (Pearson correlation of
//! ln rank against ln frequency, near -1 for heavy tails).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::freq::RankedDistribution;
use crate::hnsw::{HnswError, HnswIndex};
use crate::math::pearson;
use crate::DocId;

/// One row of the head table: a hot document with its graph position.
#[derive(Debug, Clone, Serialize)]
pub struct HotDoc {
    /// 1-based hotness rank.
    pub rank: usize,
    pub doc_id: DocId,
    pub count: u64,
    pub layer: u32,
    pub degree: usize,
}

/// Whole-graph structure summary, independent of any workload.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub n: usize,
    pub d: usize,
    pub max_layer: u32,
    pub entry_point: Option<DocId>,
    /// Nodes present at each layer ℓ (top layer ≥ ℓ); index 0 counts
    /// every node.
    pub layer_counts: Vec<u64>,
    /// Nodes above the bottom layer, and their share of all nodes.
    pub upper_layer_nodes: u64,
    pub upper_layer_ratio: f64,
    pub mean_degree: f64,
    /// Degree → node count, ascending by degree.
    pub degree_histogram: BTreeMap<usize, u64>,
}

/// Hotness-vs-structure report for one run.
#[derive(Debug, Clone, Serialize)]
pub struct GraphReport {
    /// The top ⌈p·|keys|⌉ hottest documents with their graph positions.
    pub head: Vec<HotDoc>,
    /// Share of the head sitting above layer 0.
    pub head_upper_layer_fraction: f64,
    /// Layer → head-document count.
    pub head_layer_histogram: BTreeMap<u32, u64>,
    pub head_mean_degree: f64,
    pub global_mean_degree: f64,
    pub head_mean_ge_global: bool,
    /// Pearson correlation of (ln rank, ln count) over the whole ranked
    /// list; 0.0 when fewer than two distinct points exist.
    pub rank_frequency_correlation: f64,
    pub summary: GraphSummary,
}

/// Summarize the graph without reference to a workload.
pub fn summarize(index: &HnswIndex) -> GraphSummary {
    let n = index.len();
    let upper = index.upper_layer_nodes();
    GraphSummary {
        n,
        d: index.dim(),
        max_layer: index.max_layer(),
        entry_point: index.entry_point(),
        layer_counts: index.layer_counts(),
        upper_layer_nodes: upper,
        upper_layer_ratio: if n == 0 { 0.0 } else { upper as f64 / n as f64 },
        mean_degree: index.mean_degree(),
        degree_histogram: index.degree_histogram(),
    }
}

/// Join the ranked document distribution against the graph.
///
/// Fails only if the distribution references a doc-id the index does not
/// hold (a mismatched index/workload pairing).
pub fn inspect(
    doc_ranked: &RankedDistribution<DocId>,
    index: &HnswIndex,
    p_head: f64,
) -> Result<GraphReport, HnswError> {
    let head_len = doc_ranked.head_len(p_head);
    let mut head = Vec::with_capacity(head_len);
    let mut head_layer_histogram: BTreeMap<u32, u64> = BTreeMap::new();
    let mut upper = 0u64;
    let mut degree_sum = 0usize;

    for (rank0, &(doc_id, count)) in doc_ranked.entries[..head_len].iter().enumerate() {
        let layer = index.layer(doc_id)?;
        let degree = index.degree(doc_id)?;
        if layer > 0 {
            upper += 1;
        }
        *head_layer_histogram.entry(layer).or_insert(0) += 1;
        degree_sum += degree;
        head.push(HotDoc {
            rank: rank0 + 1,
            doc_id,
            count,
            layer,
            degree,
        });
    }

    let head_upper_layer_fraction = if head.is_empty() {
        0.0
    } else {
        upper as f64 / head.len() as f64
    };
    let head_mean_degree = if head.is_empty() {
        0.0
    } else {
        degree_sum as f64 / head.len() as f64
    };

    // Power-law shape check over the whole ranked list, not just the head
    let ln_ranks: Vec<f64> = (1..=doc_ranked.len()).map(|r| (r as f64).ln()).collect();
    let ln_counts: Vec<f64> = doc_ranked
        .entries
        .iter()
        .map(|&(_, c)| (c as f64).ln())
        .collect();
    let rank_frequency_correlation = pearson(&ln_ranks, &ln_counts);

    let summary = summarize(index);
    let report = GraphReport {
        head,
        head_upper_layer_fraction,
        head_layer_histogram,
        head_mean_degree,
        global_mean_degree: summary.mean_degree,
        head_mean_ge_global: head_mean_degree >= summary.mean_degree,
        rank_frequency_correlation,
        summary,
    };

    tracing::info!(
        head = report.head.len(),
        upper_fraction = report.head_upper_layer_fraction,
        correlation = report.rank_frequency_correlation,
        "Graph inspection complete"
    );
    Ok(report)
}
