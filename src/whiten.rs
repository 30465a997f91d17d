//! Signal preprocessing
//!
//! Optional spatial and temporal whitening applied to every sample block
//! before peak detection, and to raw snippets before template extraction.
//! Both transforms are pure functions of the block.

use crate::basis::{Basis, Mat};
use crate::recording::Block;

/// Right-multiply every time row by the spatial whitening matrix.
pub fn spatial_whiten(block: &mut Block, w: &Mat) {
    let n_e = block.n_channels();
    debug_assert_eq!(w.rows, n_e);
    let mut row_out = vec![0.0f32; n_e];
    for t in 0..block.n_samples() {
        let row = block.row(t);
        for (j, out) in row_out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (k, &x) in row.iter().enumerate() {
                acc += x * w.at(k, j);
            }
            *out = acc;
        }
        let dst = t * n_e;
        block.data_mut()[dst..dst + n_e].copy_from_slice(&row_out);
    }
}

/// Convolve every channel with the temporal whitening kernel, zero-padded
/// borders.
pub fn temporal_whiten(block: &mut Block, kernel: &[f32]) {
    let n_t = block.n_samples();
    let n_e = block.n_channels();
    let half = kernel.len() / 2;
    let mut out = vec![0.0f32; n_t];
    for ch in 0..n_e {
        for (t, o) in out.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (j, &k) in kernel.iter().enumerate() {
                let idx = t as i64 + j as i64 - half as i64;
                if idx >= 0 && (idx as usize) < n_t {
                    acc += k * block.sample(idx as usize, ch);
                }
            }
            *o = acc;
        }
        for (t, &o) in out.iter().enumerate() {
            *block.sample_mut(t, ch) = o;
        }
    }
}

/// Apply whichever whitening transforms the basis carries.
pub fn preprocess(block: &mut Block, basis: &Basis) {
    if let Some(w) = &basis.spatial {
        spatial_whiten(block, w);
    }
    if let Some(kernel) = &basis.temporal {
        temporal_whiten(block, kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spatial_whiten_identity() {
        let mut block = Block::from_data(vec![1.0, 2.0, 3.0, 4.0], 2);
        spatial_whiten(&mut block, &Mat::identity(2));
        assert_eq!(block.data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_spatial_whiten_mixes_channels() {
        let mut block = Block::from_data(vec![1.0, 2.0], 2);
        let w = Mat::from_rows(vec![vec![0.0, 1.0], vec![1.0, 0.0]]);
        spatial_whiten(&mut block, &w);
        assert_eq!(block.data(), &[2.0, 1.0]);
    }

    #[test]
    fn test_temporal_whiten_delta_kernel() {
        let mut block = Block::from_data(vec![1.0, 2.0, 3.0, 4.0], 1);
        temporal_whiten(&mut block, &[0.0, 1.0, 0.0]);
        assert_eq!(block.data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_temporal_whiten_zero_padded_borders() {
        let mut block = Block::from_data(vec![1.0, 1.0, 1.0], 1);
        temporal_whiten(&mut block, &[0.5, 0.0, 0.5]);
        // Border samples only see one in-range tap.
        assert_eq!(block.data(), &[0.5, 1.0, 0.5]);
    }
}
