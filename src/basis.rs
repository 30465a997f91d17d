//! Waveform basis, whitening matrices and noise statistics
//!
//! The engine consumes these as a read-only provider: projection bases per
//! polarity, per-channel detection thresholds and noise scales, optional
//! spatial/temporal whitening and optional matched filters. A simple
//! estimator is included so recordings without a precomputed provider can
//! still be processed.

use crate::error::ClusterError;
use crate::params::Polarity;
use crate::recording::Recording;

/// Dense row-major matrix.
#[derive(Debug, Clone)]
pub struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Mat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0.0; rows * cols] }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    pub fn from_rows(rows: Vec<Vec<f32>>) -> Self {
        let r = rows.len();
        let c = rows.first().map_or(0, |row| row.len());
        let mut data = Vec::with_capacity(r * c);
        for row in rows {
            debug_assert_eq!(row.len(), c);
            data.extend(row);
        }
        Self { rows: r, cols: c, data }
    }

    #[inline]
    pub fn at(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.cols + j]
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// `self (r x k) · other (k x c)`.
    pub fn mul(&self, other: &Mat) -> Mat {
        debug_assert_eq!(self.cols, other.rows);
        let mut out = Mat::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.at(i, k);
                if a == 0.0 {
                    continue;
                }
                let src = other.row(k);
                let dst = &mut out.data[i * other.cols..(i + 1) * other.cols];
                for (d, &b) in dst.iter_mut().zip(src) {
                    *d += a * b;
                }
            }
        }
        out
    }
}

/// Matched-filter waveform and per-channel detection thresholds on the
/// filtered trace.
#[derive(Debug, Clone)]
pub struct MatchedFilter {
    /// Reversed, normalized kernel ready for convolution
    pub waveform: Vec<f32>,
    pub thresholds: Vec<f32>,
}

impl MatchedFilter {
    /// Normalize a raw waveform into a convolution kernel, the same scaling
    /// the detection thresholds were calibrated against.
    pub fn new(mut waveform: Vec<f32>, thresholds: Vec<f32>) -> Self {
        waveform.reverse();
        let scale = waveform.iter().sum::<f32>().abs() * waveform.len() as f32;
        if scale > f32::EPSILON {
            for w in waveform.iter_mut() {
                *w /= scale;
            }
        }
        Self { waveform, thresholds }
    }
}

/// Projection bases, whitening and noise statistics for one recording.
#[derive(Debug, Clone)]
pub struct Basis {
    pub n_t: usize,
    /// Waveform reconstruction basis per polarity (`n_basis x n_t`)
    pub rec_neg: Option<Mat>,
    pub rec_pos: Option<Mat>,
    /// Per-channel detection thresholds
    pub thresholds: Vec<f32>,
    /// Per-channel median absolute deviations
    pub mads: Vec<f32>,
    /// Per-channel standard deviations
    pub stds: Vec<f32>,
    /// Spatial whitening matrix (`n_e x n_e`)
    pub spatial: Option<Mat>,
    /// Temporal whitening kernel
    pub temporal: Option<Vec<f32>>,
    pub matched_neg: Option<MatchedFilter>,
    pub matched_pos: Option<MatchedFilter>,
}

impl Basis {
    /// A pass-through basis: projection is the identity over the waveform
    /// window, no whitening, no matched filter.
    pub fn identity(n_t: usize, thresholds: Vec<f32>, mads: Vec<f32>, stds: Vec<f32>) -> Self {
        Self {
            n_t,
            rec_neg: Some(Mat::identity(n_t)),
            rec_pos: Some(Mat::identity(n_t)),
            thresholds,
            mads,
            stds,
            spatial: None,
            temporal: None,
            matched_neg: None,
            matched_pos: None,
        }
    }

    /// Estimate noise statistics from the head of a recording and build an
    /// identity basis with `spike_thresh x mad` detection thresholds.
    pub fn estimate<R: Recording>(recording: &R, n_t: usize, spike_thresh: f32) -> Self {
        let n_e = recording.nb_channels();
        let span = recording.nb_samples().min(200_000) as usize;
        let block = recording.read_span(0, span);

        let mut thresholds = Vec::with_capacity(n_e);
        let mut mads = Vec::with_capacity(n_e);
        let mut stds = Vec::with_capacity(n_e);
        for ch in 0..n_e {
            let trace = block.channel(ch);
            let m = mad(&trace);
            mads.push(m);
            stds.push(std_dev(&trace));
            thresholds.push(spike_thresh * m);
        }
        Self::identity(n_t, thresholds, mads, stds)
    }

    pub fn rec(&self, polarity: Polarity) -> &Mat {
        match polarity {
            Polarity::Neg => self.rec_neg.as_ref().expect("negative basis not loaded"),
            Polarity::Pos => self.rec_pos.as_ref().expect("positive basis not loaded"),
        }
    }

    /// Basis rows retained by the projection.
    pub fn n_basis(&self, polarity: Polarity) -> usize {
        self.rec(polarity).rows
    }

    pub fn matched(&self, polarity: Polarity) -> Option<&MatchedFilter> {
        match polarity {
            Polarity::Neg => self.matched_neg.as_ref(),
            Polarity::Pos => self.matched_pos.as_ref(),
        }
    }

    /// Detection threshold used by the peak detector on `ch`.
    pub fn detection_threshold(&self, ch: usize, polarity: Polarity, matched: bool) -> f32 {
        if matched {
            if let Some(f) = self.matched(polarity) {
                return f.thresholds[ch];
            }
        }
        self.thresholds[ch]
    }

    pub fn validate(&self, n_channels: usize) -> Result<(), ClusterError> {
        if self.thresholds.len() != n_channels
            || self.mads.len() != n_channels
            || self.stds.len() != n_channels
        {
            return Err(ClusterError::BadBasis {
                reason: format!(
                    "noise statistics cover {} channels, probe has {}",
                    self.thresholds.len(),
                    n_channels
                ),
            });
        }
        for rec in [&self.rec_neg, &self.rec_pos].into_iter().flatten() {
            if rec.cols != self.n_t {
                return Err(ClusterError::BadBasis {
                    reason: format!("basis width {} does not match n_t {}", rec.cols, self.n_t),
                });
            }
        }
        if let Some(w) = &self.spatial {
            if w.rows != n_channels || w.cols != n_channels {
                return Err(ClusterError::BadBasis {
                    reason: "spatial whitening matrix does not match the channel count".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Median of a slice.
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation, scaled to estimate the Gaussian sigma.
pub fn mad(values: &[f32]) -> f32 {
    let center = median(values);
    let deviations: Vec<f32> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations) / 0.6745
}

pub fn std_dev(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
        / (values.len() - 1) as f32;
    var.sqrt()
}
