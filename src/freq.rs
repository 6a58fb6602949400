//! Multi-axis frequency aggregation over result sequences
//!
//! One pass over the stream maintains five axes at once: per-document
//! counts, ordered n-grams (consecutive runs inside a sequence), the full
//! ordered tuple of each sequence, and its unordered set (canonicalized as
//! a sorted tuple). Each axis finalizes into a ranked distribution with
//! the cumulative-mass "concentration" summary: the share of all
//! observations captured by the hottest p fraction of keys.
//!
//! Sequences stream through; nothing holds the whole workload in memory.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::runner::ResultSequence;
use crate::DocId;

/// Default n-gram window sizes.
pub const DEFAULT_NGRAM_SIZES: [usize; 3] = [2, 3, 4];

/// Head fraction for the concentration summary (top 10%).
pub const DEFAULT_P_HEAD: f64 = 0.10;

/// A finalized axis: (key, count) entries sorted by count descending,
/// ties by ascending key.
#[derive(Debug, Clone, Serialize)]
pub struct RankedDistribution<K> {
    pub entries: Vec<(K, u64)>,
    /// Sum of all counts on the axis.
    pub total: u64,
}

impl<K: Ord> RankedDistribution<K> {
    pub(crate) fn from_counter(counter: HashMap<K, u64>) -> Self {
        let total = counter.values().sum();
        let mut entries: Vec<(K, u64)> = counter.into_iter().collect();
        entries.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Self { entries, total }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `n` hottest entries.
    pub fn top(&self, n: usize) -> &[(K, u64)] {
        &self.entries[..n.min(self.entries.len())]
    }

    /// Number of keys making up the head at fraction `p`: ⌈p·|keys|⌉,
    /// at least 1 for a non-empty axis.
    pub fn head_len(&self, p: f64) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        ((p * self.entries.len() as f64).ceil() as usize).clamp(1, self.entries.len())
    }

    /// Fraction of the axis total captured by the top ⌈p·|keys|⌉ keys.
    /// 0.0 for an empty axis; 1.0 at p = 1 for any non-empty axis.
    pub fn concentration(&self, p: f64) -> f64 {
        let head = self.head_len(p);
        if head == 0 || self.total == 0 {
            return 0.0;
        }
        let mass: u64 = self.entries[..head].iter().map(|(_, c)| c).sum();
        mass as f64 / self.total as f64
    }
}

/// All five finalized axes of a run.
#[derive(Debug, Clone, Serialize)]
pub struct FrequencyReport {
    pub doc: RankedDistribution<DocId>,
    /// Keyed by n; one ranked distribution per configured window size.
    pub ngrams: BTreeMap<usize, RankedDistribution<Box<[DocId]>>>,
    pub ordered_combo: RankedDistribution<Box<[DocId]>>,
    pub unordered_combo: RankedDistribution<Box<[DocId]>>,
    /// Successful (non-skipped) queries observed.
    pub queries: u64,
}

/// Streaming counter over result sequences.
///
/// Observe every sequence of a run, then [`finalize`](Self::finalize).
/// Skipped (empty) sequences are ignored on every axis.
pub struct FrequencyAggregator {
    doc: HashMap<DocId, u64>,
    ngrams: BTreeMap<usize, HashMap<Box<[DocId]>, u64>>,
    ordered: HashMap<Box<[DocId]>, u64>,
    unordered: HashMap<Box<[DocId]>, u64>,
    queries: u64,
}

impl FrequencyAggregator {
    /// Aggregator with the given n-gram window sizes (deduplicated).
    pub fn new(ngram_sizes: &[usize]) -> Self {
        let ngrams = ngram_sizes.iter().map(|&n| (n, HashMap::new())).collect();
        Self {
            doc: HashMap::new(),
            ngrams,
            ordered: HashMap::new(),
            unordered: HashMap::new(),
            queries: 0,
        }
    }

    /// Consume one result sequence, updating every axis.
    pub fn observe(&mut self, seq: &ResultSequence) {
        if seq.is_skipped() {
            return;
        }
        self.queries += 1;

        // Axis 1: each retrieved doc counts once per occurrence, so a
        // query contributes k observations.
        for &id in &seq.ids {
            *self.doc.entry(id).or_insert(0) += 1;
        }

        // Axis 2: ordered n-grams; a sequence of length k yields
        // max(0, k - n + 1) windows per n.
        for (&n, counter) in self.ngrams.iter_mut() {
            if n == 0 || seq.ids.len() < n {
                continue;
            }
            for window in seq.ids.windows(n) {
                *counter
                    .entry(window.to_vec().into_boxed_slice())
                    .or_insert(0) += 1;
            }
        }

        // Axes 3 and 4: the whole sequence, ordered and as a sorted set.
        let ordered_key = seq.ids.clone().into_boxed_slice();
        let mut sorted = seq.ids.clone();
        sorted.sort_unstable();
        let unordered_key = sorted.into_boxed_slice();
        *self.ordered.entry(ordered_key).or_insert(0) += 1;
        *self.unordered.entry(unordered_key).or_insert(0) += 1;
    }

    /// Freeze the counters into ranked distributions.
    pub fn finalize(self) -> FrequencyReport {
        let report = FrequencyReport {
            doc: RankedDistribution::from_counter(self.doc),
            ngrams: self
                .ngrams
                .into_iter()
                .map(|(n, counter)| (n, RankedDistribution::from_counter(counter)))
                .collect(),
            ordered_combo: RankedDistribution::from_counter(self.ordered),
            unordered_combo: RankedDistribution::from_counter(self.unordered),
            queries: self.queries,
        };
        tracing::info!(
            queries = report.queries,
            distinct_docs = report.doc.len(),
            "Frequency aggregation finalized"
        );
        report
    }
}
