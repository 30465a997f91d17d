//! Peak detection
//!
//! Finds threshold-crossing extrema per channel inside one preprocessed
//! block, either on the raw traces or on a matched-filtered version. Pure
//! function of the block: all bookkeeping (masks, quotas, histories) belongs
//! to the candidate selector.

use rayon::prelude::*;

use crate::basis::Basis;
use crate::params::{ClusteringParams, PeakSign, Polarity};
use crate::recording::Block;

/// Candidate extrema of one block: parallel arrays of within-block times and
/// the channel each extremum was found on.
#[derive(Debug, Clone, Default)]
pub struct DetectedPeaks {
    pub times: Vec<u32>,
    pub channels: Vec<u32>,
}

impl DetectedPeaks {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Sorted unique detection times across channels.
    pub fn unique_times(&self) -> Vec<u32> {
        let mut times = self.times.clone();
        times.sort_unstable();
        times.dedup();
        times
    }
}

/// Find local maxima of `x` at least `height` tall and `distance` apart.
///
/// Plateaus count once, at their midpoint. When two peaks are closer than
/// `distance`, the taller one wins (ties: the earlier one).
pub fn find_peaks(x: &[f32], height: f32, distance: usize) -> Vec<usize> {
    let mut peaks = Vec::new();
    let n = x.len();
    let mut i = 1;
    while i + 1 < n {
        if x[i] > x[i - 1] {
            // Scan across a possible plateau.
            let mut j = i;
            while j + 1 < n && x[j + 1] == x[i] {
                j += 1;
            }
            if j + 1 < n && x[j + 1] < x[i] {
                let mid = (i + j) / 2;
                if x[mid] >= height {
                    peaks.push(mid);
                }
                i = j + 1;
                continue;
            }
            i = j + 1;
        } else {
            i += 1;
        }
    }

    if distance <= 1 || peaks.len() < 2 {
        return peaks;
    }

    // Tallest-first pruning of close pairs.
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| {
        x[peaks[b]]
            .partial_cmp(&x[peaks[a]])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(peaks[a].cmp(&peaks[b]))
    });
    let mut keep = vec![true; peaks.len()];
    for &a in &order {
        if !keep[a] {
            continue;
        }
        for (b, kb) in keep.iter_mut().enumerate() {
            if b != a && *kb && peaks[a].abs_diff(peaks[b]) < distance {
                *kb = false;
            }
        }
    }
    peaks
        .into_iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(p))
        .collect()
}

/// Convolve one trace with a kernel, zero-padded borders.
fn convolve(x: &[f32], kernel: &[f32]) -> Vec<f32> {
    let n = x.len();
    let half = kernel.len() / 2;
    let mut out = vec![0.0f32; n];
    for (t, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (j, &k) in kernel.iter().enumerate() {
            let idx = t as i64 + j as i64 - half as i64;
            if idx >= 0 && (idx as usize) < n {
                acc += k * x[idx as usize];
            }
        }
        *o = acc;
    }
    out
}

fn scan_channel(trace: &[f32], sign: PeakSign, height: f32, distance: usize) -> Vec<usize> {
    match sign {
        PeakSign::Negative => {
            let flipped: Vec<f32> = trace.iter().map(|&v| -v).collect();
            find_peaks(&flipped, height, distance)
        }
        PeakSign::Positive => find_peaks(trace, height, distance),
        PeakSign::Both => {
            let rectified: Vec<f32> = trace.iter().map(|&v| v.abs()).collect();
            find_peaks(&rectified, height, distance)
        }
    }
}

/// Detect candidate extrema on every channel of a block, cropped to the
/// interior `[border, n_samples - border)`.
pub fn detect_peaks(block: &Block, basis: &Basis, params: &ClusteringParams) -> DetectedPeaks {
    let n_e = block.n_channels();
    let border = params.duration();
    let upper = block.n_samples().saturating_sub(border);

    let per_channel: Vec<Vec<usize>> = (0..n_e)
        .into_par_iter()
        .map(|ch| {
            let trace = block.channel(ch);
            if params.matched_filter {
                let mut found = Vec::new();
                for &polarity in params.sign_peaks.polarities() {
                    if let Some(filter) = basis.matched(polarity) {
                        let filtered = convolve(&trace, &filter.waveform);
                        found.extend(find_peaks(
                            &filtered,
                            filter.thresholds[ch],
                            params.dist_peaks,
                        ));
                    }
                }
                found.sort_unstable();
                found.dedup();
                found
            } else {
                scan_channel(&trace, params.sign_peaks, basis.thresholds[ch], params.dist_peaks)
            }
        })
        .collect();

    let mut peaks = DetectedPeaks::default();
    for (ch, found) in per_channel.into_iter().enumerate() {
        for t in found {
            if t >= border && t < upper {
                peaks.times.push(t as u32);
                peaks.channels.push(ch as u32);
            }
        }
    }
    peaks
}

/// Decide the extremum channel and polarity of one deduplicated detection
/// time by comparing amplitudes across channels.
///
/// Single-channel recordings under the `Both` policy take the polarity of
/// the raw value; a strict zero yields no candidate.
pub fn extremum_at(
    block: &Block,
    t: usize,
    sign: PeakSign,
) -> Option<(usize, Polarity)> {
    let row = block.row(t);
    match sign {
        PeakSign::Negative => Some((argmin(row), Polarity::Neg)),
        PeakSign::Positive => Some((argmax(row), Polarity::Pos)),
        PeakSign::Both => {
            if row.len() == 1 {
                if row[0] < 0.0 {
                    Some((0, Polarity::Neg))
                } else if row[0] > 0.0 {
                    Some((0, Polarity::Pos))
                } else {
                    None
                }
            } else {
                let hi = argmax(row);
                let lo = argmin(row);
                if row[hi].abs() > row[lo].abs() {
                    Some((hi, Polarity::Pos))
                } else {
                    Some((lo, Polarity::Neg))
                }
            }
        }
    }
}

fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

fn argmin(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v < row[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ClusteringParams;

    #[test]
    fn test_find_peaks_basic() {
        let x = [0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0];
        assert_eq!(find_peaks(&x, 0.5, 1), vec![1, 3, 5]);
        assert_eq!(find_peaks(&x, 2.5, 1), vec![5]);
    }

    #[test]
    fn test_find_peaks_plateau_midpoint() {
        let x = [0.0, 2.0, 2.0, 2.0, 0.0];
        assert_eq!(find_peaks(&x, 1.0, 1), vec![2]);
    }

    #[test]
    fn test_find_peaks_distance_keeps_tallest() {
        let x = [0.0, 1.0, 0.5, 3.0, 0.5, 1.0, 0.0];
        assert_eq!(find_peaks(&x, 0.5, 4), vec![3]);
    }

    #[test]
    fn test_detect_crops_borders() {
        let mut params = ClusteringParams::default();
        params.n_t = 5;
        params.dist_peaks = 3;
        params.jitter_range = 0;
        params.alignment = false;
        params.sign_peaks = PeakSign::Positive;

        let n = 40;
        let mut data = vec![0.0f32; n];
        data[1] = 5.0; // inside the border, must be cropped
        data[20] = 5.0;
        let block = Block::from_data(data, 1);
        let basis = Basis::identity(5, vec![1.0], vec![0.2], vec![0.25]);

        let peaks = detect_peaks(&block, &basis, &params);
        assert_eq!(peaks.times, vec![20]);
        assert_eq!(peaks.channels, vec![0]);
    }

    #[test]
    fn test_extremum_polarity() {
        let block = Block::from_data(vec![1.0, -3.0, 2.0], 3);
        let (ch, pol) = extremum_at(&block, 0, PeakSign::Both).unwrap();
        assert_eq!(ch, 1);
        assert_eq!(pol, Polarity::Neg);

        let (ch, pol) = extremum_at(&block, 0, PeakSign::Positive).unwrap();
        assert_eq!(ch, 2);
        assert_eq!(pol, Polarity::Pos);

        let single = Block::from_data(vec![0.0], 1);
        assert!(extremum_at(&single, 0, PeakSign::Both).is_none());
    }
}
