//! Candidate selection
//!
//! Turns raw per-channel detections into accepted spikes: deduplicates
//! detection times, resolves the extremum channel and polarity, then runs
//! the acceptance ladder (dead times, spatio-temporal exclusion, noise
//! rejection, isolation, sub-sample realignment, quotas, smart-search
//! sampling). Accepting a spike claims its exclusion window for the rest of
//! the block; everything else about the block stays untouched.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::basis::{Basis, Mat};
use crate::detect::{extremum_at, DetectedPeaks};
use crate::params::{ClusteringParams, Polarity};
use crate::pca::Projection;
use crate::probe::Probe;
use crate::recording::{Block, DeadTimes};
use crate::savgol::hanning;
use crate::smart::SmartState;
use crate::spline::{smooth, CubicSpline};

/// Accumulator table keyed by (polarity, channel).
#[derive(Debug, Clone)]
pub struct GroupTable<T> {
    per: [Vec<T>; 2],
}

impl<T> GroupTable<T> {
    pub fn new_with(n_channels: usize, mut f: impl FnMut() -> T) -> Self {
        Self {
            per: [
                (0..n_channels).map(|_| f()).collect(),
                (0..n_channels).map(|_| f()).collect(),
            ],
        }
    }

    #[inline]
    pub fn get(&self, polarity: Polarity, ch: usize) -> &T {
        &self.per[polarity.index()][ch]
    }

    #[inline]
    pub fn get_mut(&mut self, polarity: Polarity, ch: usize) -> &mut T {
        &mut self.per[polarity.index()][ch]
    }

    pub fn set(&mut self, polarity: Polarity, ch: usize, value: T) {
        self.per[polarity.index()][ch] = value;
    }

    pub fn n_channels(&self) -> usize {
        self.per[0].len()
    }
}

impl<T: Clone> GroupTable<T> {
    pub fn filled(n_channels: usize, value: T) -> Self {
        Self { per: [vec![value.clone(); n_channels], vec![value; n_channels]] }
    }
}

/// Which pass of the engine is scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// Pass 0: raw amplitudes only, calibrates the smart search
    Calibration,
    /// Pass 1: basis-projected waveforms that will seed the clustering
    Collection,
    /// Passes 2..: PCA-reduced waveforms refining the density estimates
    Refine,
}

/// Per-pass payload of an accepted spike.
#[derive(Debug, Clone)]
pub enum Payload {
    Amplitude(f32),
    Features(Vec<f32>),
}

/// A candidate promoted past the acceptance ladder.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub channel: usize,
    pub polarity: Polarity,
    /// Absolute sample time of the (realigned) peak
    pub time: u64,
    pub payload: Payload,
}

/// Boolean occupancy over (channel, local time); one instance per block.
struct ExclusionMask {
    origin: u32,
    width: usize,
    n_channels: usize,
    bits: Vec<bool>,
}

impl ExclusionMask {
    fn new(n_channels: usize, first: u32, last: u32) -> Self {
        let width = (last - first) as usize + 1;
        Self { origin: first, width, n_channels, bits: vec![false; n_channels * width] }
    }

    fn window(&self, center: u32, safety: usize) -> (usize, usize) {
        let c = (center - self.origin) as usize;
        (c.saturating_sub(safety), (c + safety + 1).min(self.width))
    }

    fn claimed(&self, channels: &[usize], center: u32, safety: usize) -> bool {
        let (lo, hi) = self.window(center, safety);
        channels
            .iter()
            .any(|&ch| self.bits[ch * self.width + lo..ch * self.width + hi].iter().any(|&b| b))
    }

    fn claim(&mut self, channels: &[usize], center: u32, safety: usize) {
        let (lo, hi) = self.window(center, safety);
        for &ch in channels {
            debug_assert!(ch < self.n_channels);
            self.bits[ch * self.width + lo..ch * self.width + hi].fill(true);
        }
    }
}

/// Silent-drop diagnostics of one pass (counted, never raised).
#[derive(Debug, Clone, Copy, Default)]
pub struct DropCounts {
    pub rejected: usize,
    pub noise: usize,
    pub not_isolated: usize,
    pub over_quota: usize,
}

/// Candidate selector for one pass of one worker.
pub struct Selector<'a> {
    pub params: &'a ClusteringParams,
    pub probe: &'a Probe,
    pub basis: &'a Basis,
    pub dead_times: Option<&'a DeadTimes>,
    pub smart: Option<&'a SmartState>,
    pub pcas: Option<&'a GroupTable<Projection>>,
    pub pass: PassKind,
    /// Per-electrode quota for this pass
    pub quota: usize,
    /// Remaining global accept slots for this worker
    pub budget: usize,
    pub counts: GroupTable<usize>,
    pub accepted_total: usize,
    pub drops: DropCounts,
}

impl<'a> Selector<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: &'a ClusteringParams,
        probe: &'a Probe,
        basis: &'a Basis,
        dead_times: Option<&'a DeadTimes>,
        smart: Option<&'a SmartState>,
        pcas: Option<&'a GroupTable<Projection>>,
        pass: PassKind,
        quota: usize,
        budget: usize,
    ) -> Self {
        Self {
            params,
            probe,
            basis,
            dead_times,
            smart,
            pcas,
            pass,
            quota,
            budget,
            counts: GroupTable::filled(probe.n_channels(), 0),
            accepted_total: 0,
            drops: DropCounts::default(),
        }
    }

    pub fn budget_left(&self) -> usize {
        self.budget
    }

    /// Run the acceptance ladder over one preprocessed block.
    ///
    /// `owned` filters which extremum electrodes this worker may accept;
    /// `prior_times` holds the globally aggregated spike times of earlier
    /// passes, used to pre-claim exclusion windows.
    pub fn scan_block(
        &mut self,
        block: &Block,
        block_start: i64,
        peaks: &DetectedPeaks,
        owned: impl Fn(usize) -> bool,
        prior_times: &[Vec<u64>],
        rng: &mut StdRng,
    ) -> Vec<Accepted> {
        let mut accepted = Vec::new();
        if peaks.is_empty() || self.budget == 0 {
            return accepted;
        }

        let mut unique = peaks.unique_times();
        if let (Some(dead), true) = (self.dead_times, self.params.ignore_dead_times) {
            unique.retain(|&t| !dead.contains((block_start + t as i64) as u64));
        }
        if unique.is_empty() {
            return accepted;
        }

        let safety = self.params.safety_time;
        let mut mask =
            ExclusionMask::new(block.n_channels(), unique[0], *unique.last().unwrap());

        // Spikes accepted on previous passes still own their windows.
        if self.pass == PassKind::Refine {
            for (elec, times) in prior_times.iter().enumerate() {
                let own = [elec];
                let claim: &[usize] = if self.params.safety_space {
                    self.probe.neighbors(elec)
                } else {
                    &own
                };
                for &t_abs in times {
                    let local = t_abs as i64 - block_start;
                    if local < 0 || local >= block.n_samples() as i64 {
                        continue;
                    }
                    let local = local as u32;
                    if unique.binary_search(&local).is_ok() {
                        mask.claim(claim, local, safety);
                    }
                }
            }
        }

        let mut visit: Vec<u32> = unique.clone();
        visit.shuffle(rng);

        for &t in &visit {
            if self.budget == 0 {
                break;
            }
            let t_usize = t as usize;
            let Some((elec, polarity)) = extremum_at(block, t_usize, self.params.sign_peaks)
            else {
                continue;
            };

            if self.pass != PassKind::Refine && !owned(elec) {
                continue;
            }
            if *self.counts.get(polarity, elec) >= self.quota {
                self.drops.over_quota += 1;
                continue;
            }

            let neighbors = self.probe.neighbors(elec);
            let own = [elec];
            let claim: &[usize] = if self.params.safety_space {
                neighbors
            } else {
                &own
            };
            if mask.claimed(claim, t, safety) {
                continue;
            }

            let duration = self.params.duration();
            let sub_mat = extract_window(block, t_usize, duration, neighbors);

            if self.params.reject_noise() && self.looks_like_noise(&sub_mat, neighbors) {
                self.drops.noise += 1;
                continue;
            }

            if self.params.isolation
                && self.pass == PassKind::Collection
                && !self.is_isolated(block, peaks, t, elec, polarity)
            {
                self.drops.not_isolated += 1;
                continue;
            }

            let own_col = self.probe.own_pos(elec);
            let sub_mat = if self.params.alignment {
                self.realign(&sub_mat, own_col, polarity, self.basis.mads[elec])
            } else {
                sub_mat
            };

            // The realigned extremum must stay on the detected channel.
            let center = sub_mat.row(self.params.template_shift());
            let center_ok = match polarity {
                Polarity::Neg => arg_extremum(center, false) == own_col,
                Polarity::Pos => arg_extremum(center, true) == own_col,
            };
            if !center_ok {
                continue;
            }

            let ext_amp = center[own_col];
            let payload = match self.pass {
                PassKind::Calibration => Payload::Amplitude(ext_amp),
                PassKind::Collection => {
                    if let Some(smart) = self.smart {
                        let draw = rng.random::<f32>();
                        if !smart.accept(polarity, elec, ext_amp, draw) {
                            self.drops.rejected += 1;
                            continue;
                        }
                    }
                    Payload::Features(self.project(&sub_mat, polarity))
                }
                PassKind::Refine => {
                    let flat = self.project(&sub_mat, polarity);
                    let reduced = match self.pcas {
                        Some(pcas) => pcas.get(polarity, elec).apply(&flat),
                        None => flat,
                    };
                    Payload::Features(reduced)
                }
            };

            self.budget -= 1;
            self.accepted_total += 1;
            *self.counts.get_mut(polarity, elec) += 1;
            mask.claim(claim, t, safety);
            accepted.push(Accepted {
                channel: elec,
                polarity,
                time: (block_start + t as i64) as u64,
                payload,
            });
        }

        accepted
    }

    /// RMS of a short window around the peak, relative to each neighbor's
    /// noise scale: below threshold everywhere means the snippet is noise.
    fn looks_like_noise(&self, sub_mat: &Mat, neighbors: &[usize]) -> bool {
        let center = sub_mat.rows / 2;
        let w = self.params.noise_window;
        let lo = center.saturating_sub(w);
        let hi = (center + w).min(sub_mat.rows);
        let span = 2.0 * w as f32;
        neighbors.iter().enumerate().all(|(col, &ch)| {
            let mut acc = 0.0f32;
            for row in lo..hi {
                let v = sub_mat.at(row, col);
                acc += v * v;
            }
            let value = acc.sqrt() / (self.basis.stds[ch] * span);
            value < self.params.rejection_threshold
        })
    }

    /// No larger extremum within the neighborhood during the safety window.
    fn is_isolated(
        &self,
        block: &Block,
        peaks: &DetectedPeaks,
        t: u32,
        elec: usize,
        polarity: Polarity,
    ) -> bool {
        let own = block.sample(t as usize, elec);
        let neighbors = self.probe.neighbors(elec);
        let safety = self.params.safety_time as i64;
        for (&pt, &pch) in peaks.times.iter().zip(&peaks.channels) {
            if (pt as i64 - t as i64).abs() >= safety {
                continue;
            }
            if neighbors.binary_search(&(pch as usize)).is_err() {
                continue;
            }
            let other = block.sample(pt as usize, pch as usize);
            let larger = match polarity {
                Polarity::Neg => other < own,
                Polarity::Pos => other > own,
            };
            if larger {
                return false;
            }
        }
        true
    }

    /// Sub-sample realignment: locate the true extremum on a smoothed spline
    /// of the detection channel, then resample every neighbor at the shifted
    /// positions. Falls back to the unsmoothed trace when the penalized fit
    /// degenerates.
    fn realign(&self, sub_mat: &Mat, own_col: usize, polarity: Polarity, mad: f32) -> Mat {
        let shift = self.params.template_shift();
        let ts2 = self.params.template_shift_2();
        let n_t = self.params.n_t;
        let m_size = 2 * ts2 + 1;
        debug_assert_eq!(sub_mat.rows, m_size);

        let jitter = self.params.jitter_range as f32;
        let n_grid = (self.params.oversampling_factor * 2.0 * jitter) as usize;

        let rmin = if n_grid >= 2 {
            let y: Vec<f32> = (0..m_size).map(|r| sub_mat.at(r, own_col)).collect();
            let local_factor =
                m_size as f32 * (self.params.smoothing_factor * mad).powi(2);
            let smoothed = smooth(&y, local_factor).unwrap_or(y);
            let spline = CubicSpline::fit(&smoothed);

            let mut best = 0.0f64;
            let mut best_val = match polarity {
                Polarity::Neg => f64::MAX,
                Polarity::Pos => f64::MIN,
            };
            for i in 0..n_grid {
                let offset = -jitter as f64
                    + 2.0 * jitter as f64 * i as f64 / (n_grid - 1) as f64;
                let v = spline.eval(ts2 as f64 + offset);
                let better = match polarity {
                    Polarity::Neg => v < best_val,
                    Polarity::Pos => v > best_val,
                };
                if better {
                    best_val = v;
                    best = offset;
                }
            }
            best
        } else {
            0.0
        };

        let mut out = Mat::zeros(n_t, sub_mat.cols);
        for col in 0..sub_mat.cols {
            let column: Vec<f32> = (0..m_size).map(|r| sub_mat.at(r, col)).collect();
            let spline = CubicSpline::fit(&column);
            for row in 0..n_t {
                let x = ts2 as f64 + rmin + row as f64 - shift as f64;
                out.data[row * sub_mat.cols + col] = spline.eval(x) as f32;
            }
        }
        out
    }

    /// Basis projection of an accepted waveform, flattened row-major.
    fn project(&self, sub_mat: &Mat, polarity: Polarity) -> Vec<f32> {
        let mut sub = sub_mat.clone();
        if self.params.use_hanning {
            let window = hanning(sub.rows);
            for row in 0..sub.rows {
                let w = window[row];
                for v in &mut sub.data[row * sub.cols..(row + 1) * sub.cols] {
                    *v *= w;
                }
            }
        }
        self.basis.rec(polarity).mul(&sub).data
    }
}

/// Waveform window of half-width `half` around `t` over `channels`.
pub fn extract_window(block: &Block, t: usize, half: usize, channels: &[usize]) -> Mat {
    let rows = 2 * half + 1;
    let mut out = Mat::zeros(rows, channels.len());
    for row in 0..rows {
        let src = t + row - half;
        for (col, &ch) in channels.iter().enumerate() {
            out.data[row * channels.len() + col] = block.sample(src, ch);
        }
    }
    out
}

fn arg_extremum(row: &[f32], max: bool) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        let better = if max { v > row[best] } else { v < row[best] };
        if better {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::detect_peaks;
    use crate::params::PeakSign;
    use rand::SeedableRng;

    fn test_params() -> ClusteringParams {
        ClusteringParams {
            n_t: 5,
            dist_peaks: 3,
            safety_time: 2,
            jitter_range: 1,
            alignment: false,
            smart_search: false,
            sign_peaks: PeakSign::Negative,
            ..ClusteringParams::default()
        }
    }

    fn spike_block(n: usize, spikes: &[(usize, f32)]) -> Block {
        let mut data = vec![0.0f32; n];
        for &(t, a) in spikes {
            data[t] = a;
        }
        Block::from_data(data, 1)
    }

    fn run_selector(
        params: &ClusteringParams,
        probe: &Probe,
        basis: &Basis,
        block: &Block,
    ) -> Vec<Accepted> {
        let peaks = detect_peaks(block, basis, params);
        let mut selector = Selector::new(
            params,
            probe,
            basis,
            None,
            None,
            None,
            PassKind::Collection,
            100,
            1000,
        );
        let mut rng = StdRng::seed_from_u64(1);
        selector.scan_block(block, 0, &peaks, |_| true, &[], &mut rng)
    }

    #[test]
    fn test_exclusion_window_blocks_close_spikes() {
        let mut params = test_params();
        params.dist_peaks = 2;
        let probe = Probe::linear(1, 0);
        let basis = Basis::identity(5, vec![1.0], vec![0.2], vec![0.25]);
        // Two spikes two samples apart: whichever is visited first claims
        // the safety window and the other must be dropped.
        let block = spike_block(40, &[(20, -5.0), (22, -4.0)]);
        let accepted = run_selector(&params, &probe, &basis, &block);
        assert_eq!(accepted.len(), 1);
        assert!(accepted[0].time == 20 || accepted[0].time == 22);
        assert_eq!(accepted[0].polarity, Polarity::Neg);
    }

    #[test]
    fn test_far_spikes_both_accepted() {
        let params = test_params();
        let probe = Probe::linear(1, 0);
        let basis = Basis::identity(5, vec![1.0], vec![0.2], vec![0.25]);
        let block = spike_block(60, &[(20, -5.0), (40, -4.0)]);
        let mut accepted = run_selector(&params, &probe, &basis, &block);
        accepted.sort_by_key(|a| a.time);
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].time, 20);
        assert_eq!(accepted[1].time, 40);
    }

    #[test]
    fn test_quota_is_enforced() {
        let params = test_params();
        let probe = Probe::linear(1, 0);
        let basis = Basis::identity(5, vec![1.0], vec![0.2], vec![0.25]);
        let block = spike_block(200, &[(20, -5.0), (60, -5.0), (100, -5.0), (140, -5.0)]);
        let peaks = detect_peaks(&block, &basis, &params);
        let mut selector = Selector::new(
            &params, &probe, &basis, None, None, None, PassKind::Collection, 2, 1000,
        );
        let mut rng = StdRng::seed_from_u64(3);
        let accepted = selector.scan_block(&block, 0, &peaks, |_| true, &[], &mut rng);
        assert_eq!(accepted.len(), 2);
        assert_eq!(selector.drops.over_quota, 2);
    }

    #[test]
    fn test_noise_rejection_drops_flat_snippets() {
        let mut params = test_params();
        params.rejection_threshold = 2.0;
        params.noise_window = 2;
        let probe = Probe::linear(1, 0);
        let basis = Basis::identity(5, vec![1.0], vec![0.2], vec![1.0]);
        // Barely over threshold: RMS stays small relative to std.
        let block = spike_block(40, &[(20, -1.1)]);
        let peaks = detect_peaks(&block, &basis, &params);
        let mut selector = Selector::new(
            &params, &probe, &basis, None, None, None, PassKind::Collection, 100, 1000,
        );
        let mut rng = StdRng::seed_from_u64(5);
        let accepted = selector.scan_block(&block, 0, &peaks, |_| true, &[], &mut rng);
        assert!(accepted.is_empty());
        assert_eq!(selector.drops.noise, 1);
    }

    #[test]
    fn test_isolation_rejects_dominated_candidate() {
        let mut params = test_params();
        params.isolation = true;
        params.safety_time = 6;
        params.dist_peaks = 2;
        params.safety_space = false;
        let probe = Probe::linear(2, 1);
        let basis = Basis::identity(5, vec![1.0, 1.0], vec![0.2, 0.2], vec![0.25, 0.25]);
        let mut data = vec![0.0f32; 80];
        // Channel 0 peak at t=20, dominated by channel 1 at t=23.
        data[20 * 2] = -3.0;
        data[23 * 2 + 1] = -8.0;
        let block = Block::from_data(data, 2);
        let peaks = detect_peaks(&block, &basis, &params);
        let mut selector = Selector::new(
            &params, &probe, &basis, None, None, None, PassKind::Collection, 100, 1000,
        );
        let mut rng = StdRng::seed_from_u64(7);
        let accepted = selector.scan_block(&block, 0, &peaks, |_| true, &[], &mut rng);
        // The dominant spike survives; the dominated one is dropped.
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].channel, 1);
        assert_eq!(selector.drops.not_isolated, 1);
    }

    #[test]
    fn test_ownership_filter() {
        let params = test_params();
        let probe = Probe::linear(2, 0);
        let basis = Basis::identity(5, vec![1.0; 2], vec![0.2; 2], vec![0.25; 2]);
        let mut data = vec![0.0f32; 80];
        data[20 * 2] = -5.0;
        data[40 * 2 + 1] = -5.0;
        let block = Block::from_data(data, 2);
        let peaks = detect_peaks(&block, &basis, &params);
        let mut selector = Selector::new(
            &params, &probe, &basis, None, None, None, PassKind::Collection, 100, 1000,
        );
        let mut rng = StdRng::seed_from_u64(9);
        let accepted = selector.scan_block(&block, 0, &peaks, |e| e == 1, &[], &mut rng);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].channel, 1);
    }
}
