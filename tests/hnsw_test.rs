//! HNSW integration tests at a scale where the hierarchy actually forms

mod common;

use std::sync::Arc;

use anyhow::Result;
use hotdocs::{Embedding, EmbeddingMatrix, HnswIndex, HnswParams};

use common::embedding_for_seed;

const DIM: usize = 32;

fn matrix(n: usize) -> Arc<EmbeddingMatrix> {
    let rows: Vec<Embedding> = (0..n)
        .map(|i| embedding_for_seed(i as u32, DIM))
        .collect();
    Arc::new(EmbeddingMatrix::from_rows(rows, DIM).expect("uniform dims"))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn brute_force_top_k(matrix: &EmbeddingMatrix, query: &[f32], k: usize) -> Vec<u32> {
    let mut scored: Vec<(f32, u32)> = (0..matrix.n() as u32)
        .map(|id| (dot(query, matrix.row(id as usize)), id))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    scored.into_iter().take(k).map(|(_, id)| id).collect()
}

fn build(n: usize, seed: u64) -> HnswIndex {
    HnswIndex::build(
        matrix(n),
        HnswParams {
            m: 8,
            ef_construction: 64,
            seed,
        },
    )
    .expect("build succeeds")
}

#[test]
fn recall_is_high_with_generous_beam() -> Result<()> {
    let n = 150;
    let index = build(n, 13);
    let vectors = Arc::clone(index.vectors());

    let mut hits = 0usize;
    let mut total = 0usize;
    for qseed in 0..20u32 {
        let query = embedding_for_seed(10_000 + qseed * 37, DIM);
        let got: Vec<u32> = index
            .search(query.as_slice(), 10, n)?
            .iter()
            .map(|r| r.id)
            .collect();
        let want = brute_force_top_k(&vectors, query.as_slice(), 10);

        assert_eq!(got.len(), 10);
        // Top-1 must match exactly with the beam covering the whole graph
        assert_eq!(got[0], want[0], "query {}", qseed);

        let want_set: std::collections::HashSet<u32> = want.iter().copied().collect();
        hits += got.iter().filter(|id| want_set.contains(id)).count();
        total += 10;
    }
    let recall = hits as f64 / total as f64;
    assert!(recall >= 0.9, "recall@10 was {}", recall);
    Ok(())
}

#[test]
fn hierarchy_invariants_hold_at_scale() -> Result<()> {
    let index = build(200, 99);

    // Entry point carries the maximum layer
    let entry = index.entry_point().expect("non-empty");
    assert_eq!(index.layer(entry)?, index.max_layer());

    // Cumulative layer counts decrease and start at n
    let counts = index.layer_counts();
    assert_eq!(counts[0], 200);
    for w in counts.windows(2) {
        assert!(w[0] >= w[1]);
    }

    // With m=8, roughly 1/8 of nodes should sit above layer 0; allow a
    // generous band around the expectation for a 200-node draw
    let upper = index.upper_layer_nodes();
    assert!(upper > 0, "no upper-layer nodes at all in 200 draws");
    assert!(upper < 100, "implausibly many upper-layer nodes: {}", upper);

    // Capacity bounds per layer
    for id in 0..200u32 {
        let top = index.layer(id)?;
        for layer in 0..=top {
            let cap = if layer == 0 { 16 } else { 8 };
            assert!(index.neighbors_at(id, layer)?.len() <= cap);
        }
    }
    Ok(())
}

#[test]
fn persisted_index_answers_identically() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("graph.hnsw");
    let params = HnswParams {
        m: 8,
        ef_construction: 64,
        seed: 5,
    };
    let vectors = matrix(120);

    let built = HnswIndex::build(Arc::clone(&vectors), params.clone())?;
    built.save(&path)?;
    let loaded = HnswIndex::load(&path, Arc::clone(&vectors), &params)?;

    for qseed in 0..10u32 {
        let query = embedding_for_seed(77_000 + qseed, DIM);
        let a = built.search(query.as_slice(), 7, 80)?;
        let b = loaded.search(query.as_slice(), 7, 80)?;
        assert_eq!(a, b, "query {} diverged after round trip", qseed);
    }

    // Structure is preserved node by node
    for id in 0..120u32 {
        assert_eq!(built.layer(id)?, loaded.layer(id)?);
        assert_eq!(built.degree(id)?, loaded.degree(id)?);
    }
    Ok(())
}

#[test]
fn degree_histogram_accounts_for_every_node() -> Result<()> {
    let index = build(80, 31);
    let hist = index.degree_histogram();
    assert_eq!(hist.values().sum::<u64>(), 80);

    let mean_from_hist: f64 = hist
        .iter()
        .map(|(&deg, &count)| deg as f64 * count as f64)
        .sum::<f64>()
        / 80.0;
    assert!((mean_from_hist - index.mean_degree()).abs() < 1e-9);
    Ok(())
}
