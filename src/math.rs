//! Math utilities shared across modules
//!
//! Dot product (= cosine similarity on unit-norm inputs) and the Pearson
//! correlation used for the rank-frequency power-law check.

/// Dot product of two equal-length vectors.
///
/// Inputs are L2-normalized, so this is cosine similarity. Uses SIMD
/// acceleration when available; falls back to an f64 accumulation on
/// unsupported architectures. Callers validate dimensions up front.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    use simsimd::SpatialSimilarity;
    f32::dot(a, b).unwrap_or_else(|| {
        a.iter()
            .zip(b)
            .map(|(&x, &y)| (x as f64) * (y as f64))
            .sum::<f64>()
    }) as f32
}

/// Pearson correlation coefficient of two equal-length samples.
///
/// Returns 0.0 for fewer than two points or when either sample has zero
/// variance (an empty or degenerate axis is "no correlation", not an error).
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    let n = xs.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = xs.iter().sum::<f64>() / nf;
    let mean_y = ys.iter().sum::<f64>() / nf;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denom = (var_x * var_y).sqrt();
    if denom == 0.0 {
        return 0.0;
    }
    let r = cov / denom;
    if r.is_finite() {
        r
    } else {
        0.0
    }
}
