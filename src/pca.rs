//! Per-electrode dimensionality reduction
//!
//! After the collection pass, each (channel, polarity) group fits a local
//! PCA over its basis-projected waveforms; later passes reduce new spikes
//! through the same projection. Inputs narrower than the requested output
//! dimension degenerate to an identity sub-projection instead of failing.

use nalgebra::{DMatrix, SymmetricEigen};
use tracing::debug;

/// Fixed linear projection `in_dim -> out_dim`, row-major.
#[derive(Debug, Clone)]
pub struct Projection {
    pub in_dim: usize,
    pub out_dim: usize,
    mat: Vec<f32>,
}

impl Projection {
    /// Identity over the first `min(in_dim, out_dim)` coordinates.
    pub fn identity(in_dim: usize, out_dim: usize) -> Self {
        let mut mat = vec![0.0f32; in_dim * out_dim];
        for i in 0..in_dim.min(out_dim) {
            mat[i * out_dim + i] = 1.0;
        }
        Self { in_dim, out_dim, mat }
    }

    pub fn apply(&self, row: &[f32]) -> Vec<f32> {
        debug_assert_eq!(row.len(), self.in_dim);
        let mut out = vec![0.0f32; self.out_dim];
        for (i, &x) in row.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            let src = &self.mat[i * self.out_dim..(i + 1) * self.out_dim];
            for (o, &m) in out.iter_mut().zip(src) {
                *o += x * m;
            }
        }
        out
    }

    pub fn apply_all(&self, rows: &[Vec<f32>]) -> Vec<Vec<f32>> {
        rows.iter().map(|r| self.apply(r)).collect()
    }
}

/// Fit the top `out_dim` principal directions of `rows`.
///
/// The covariance is computed on centered data but, like the projection the
/// rest of the engine consumes, `apply` is a plain dot product with the
/// components. Falls back to the identity sub-projection when the input
/// dimension is not strictly larger than `out_dim`.
pub fn fit_pca(rows: &[Vec<f32>], out_dim: usize) -> Projection {
    let n = rows.len();
    let in_dim = rows.first().map_or(0, |r| r.len());
    if in_dim <= out_dim || n < 2 {
        return Projection::identity(in_dim, out_dim);
    }

    let mut mean = vec![0.0f64; in_dim];
    for row in rows {
        for (m, &v) in mean.iter_mut().zip(row) {
            *m += v as f64;
        }
    }
    for m in mean.iter_mut() {
        *m /= n as f64;
    }

    let mut cov = DMatrix::<f64>::zeros(in_dim, in_dim);
    for row in rows {
        let centered: Vec<f64> = row.iter().zip(&mean).map(|(&v, m)| v as f64 - m).collect();
        for i in 0..in_dim {
            if centered[i] == 0.0 {
                continue;
            }
            for j in i..in_dim {
                cov[(i, j)] += centered[i] * centered[j];
            }
        }
    }
    for i in 0..in_dim {
        for j in 0..i {
            cov[(i, j)] = cov[(j, i)];
        }
    }
    cov /= (n - 1) as f64;

    let eigen = SymmetricEigen::new(cov);
    let mut order: Vec<usize> = (0..in_dim).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total: f64 = eigen.eigenvalues.iter().map(|v| v.max(0.0)).sum();
    let kept: f64 = order.iter().take(out_dim).map(|&k| eigen.eigenvalues[k].max(0.0)).sum();
    if total > 0.0 {
        debug!(
            explained = kept / total,
            dims = out_dim,
            points = n,
            "local PCA fitted"
        );
    }

    let mut mat = vec![0.0f32; in_dim * out_dim];
    for (j, &k) in order.iter().take(out_dim).enumerate() {
        let column = eigen.eigenvectors.column(k);
        for i in 0..in_dim {
            mat[i * out_dim + j] = column[i] as f32;
        }
    }
    Projection { in_dim, out_dim, mat }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fallback_on_small_input() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let proj = fit_pca(&rows, 5);
        assert_eq!(proj.out_dim, 5);
        let reduced = proj.apply(&[1.0, 2.0]);
        assert_eq!(reduced, vec![1.0, 2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_pca_finds_dominant_axis() {
        // Points spread along (1, 1, 0) with tiny jitter elsewhere.
        let rows: Vec<Vec<f32>> = (0..50)
            .map(|i| {
                let t = i as f32 - 25.0;
                vec![t, t, 0.01 * (i % 3) as f32]
            })
            .collect();
        let proj = fit_pca(&rows, 1);
        let a = proj.apply(&[1.0, 1.0, 0.0])[0];
        let b = proj.apply(&[1.0, -1.0, 0.0])[0];
        assert!(a.abs() > 10.0 * b.abs(), "dominant axis not found: {a} vs {b}");
    }

    #[test]
    fn test_projection_deterministic() {
        let rows: Vec<Vec<f32>> = (0..20)
            .map(|i| vec![i as f32, (i * i) as f32 * 0.1, 1.0, 0.5])
            .collect();
        let a = fit_pca(&rows, 2);
        let b = fit_pca(&rows, 2);
        assert_eq!(a.apply(&[1.0, 0.0, 0.0, 0.0]), b.apply(&[1.0, 0.0, 0.0, 0.0]));
    }
}
