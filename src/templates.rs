//! Template extraction
//!
//! For each surviving cluster: sample member spikes, fetch their raw
//! whitened snippets over the whole probe, reduce to one representative
//! waveform, smooth, sparsify, align and normalize it, then derive the
//! amplitude acceptance interval. Templates judged noise-like or too
//! shifted are emitted with a removal flag; dropping them is deferred to
//! the cleanup step so global indices stay stable while workers write
//! concurrently.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::basis::{median, Basis};
use crate::output::Template;
use crate::params::{ClusteringParams, Extraction, Polarity};
use crate::recording::Recording;
use crate::savgol::blend_smooth;
use crate::whiten::preprocess;

/// Cap on sampled member spikes per cluster.
const MAX_SNIPPETS: usize = 500;

/// Seed of the member-sampling permutation.
const SAMPLING_SEED: u64 = 42;

/// One extracted template plus its deferred-removal flag.
#[derive(Debug, Clone)]
pub struct ExtractedTemplate {
    pub template: Template,
    pub remove: bool,
}

/// Fetch the raw whitened snippet around one spike, channel-major.
fn fetch_snippet<R: Recording>(
    recording: &R,
    basis: &Basis,
    time: u64,
    shift: usize,
    n_t: usize,
) -> Vec<f32> {
    let mut block = recording.read_span(time as i64 - shift as i64, n_t);
    preprocess(&mut block, basis);
    let n_e = block.n_channels();
    let mut out = vec![0.0f32; n_e * n_t];
    for s in 0..n_t {
        for ch in 0..n_e {
            out[ch * n_t + s] = block.sample(s, ch);
        }
    }
    out
}

fn reduce(snippets: &[Vec<f32>], len: usize, extraction: Extraction) -> Vec<f32> {
    match extraction {
        Extraction::Median => (0..len)
            .map(|i| {
                let column: Vec<f32> = snippets.iter().map(|s| s[i]).collect();
                median(&column)
            })
            .collect(),
        Extraction::Mean => {
            let mut out = vec![0.0f32; len];
            for s in snippets {
                for (o, &v) in out.iter_mut().zip(s) {
                    *o += v;
                }
            }
            let inv = 1.0 / snippets.len() as f32;
            out.iter_mut().for_each(|o| *o *= inv);
            out
        }
    }
}

/// Extract one template per surviving cluster of a (channel, polarity)
/// group, in ascending label order.
///
/// `labels` and `spike_times` are index-aligned over the group's accepted
/// spikes.
#[allow(clippy::too_many_arguments)]
pub fn extract_group_templates<R: Recording>(
    recording: &R,
    basis: &Basis,
    params: &ClusteringParams,
    elec: usize,
    polarity: Polarity,
    labels: &[i32],
    spike_times: &[u64],
) -> Vec<ExtractedTemplate> {
    debug_assert_eq!(labels.len(), spike_times.len());
    let n_e = basis.thresholds.len();
    let n_t = params.n_t;
    let shift = params.template_shift();
    let flat_len = n_e * n_t;

    let mut ids: Vec<i32> = labels.iter().cloned().filter(|&l| l >= 0).collect();
    ids.sort_unstable();
    ids.dedup();

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter_map(|(i, &l)| (l == id).then_some(i))
            .collect();
        let mut rng = StdRng::seed_from_u64(SAMPLING_SEED);
        members.shuffle(&mut rng);
        members.truncate(MAX_SNIPPETS);

        let mut snippets: Vec<Vec<f32>> = members
            .iter()
            .map(|&i| fetch_snippet(recording, basis, spike_times[i], shift, n_t))
            .collect();

        let mut component = reduce(&snippets, flat_len, params.extraction);

        if params.use_savgol && params.savgol_window > 3 {
            for ch in 0..n_e {
                let row = &component[ch * n_t..(ch + 1) * n_t];
                let smoothed = blend_smooth(row, params.savgol_window);
                component[ch * n_t..(ch + 1) * n_t].copy_from_slice(&smoothed);
            }
        }

        // Sparsification: channels with too little structure relative to
        // their noise scale are zeroed and excluded from the support.
        let mut deleted = vec![false; n_e];
        if params.compress {
            for ch in 0..n_e {
                let row = &component[ch * n_t..(ch + 1) * n_t];
                let local_std = crate::basis::std_dev(row);
                if basis.stds[ch] > 0.0 && local_std / basis.stds[ch] < params.sparsify {
                    deleted[ch] = true;
                }
            }
            for (ch, &dead) in deleted.iter().enumerate() {
                if dead {
                    component[ch * n_t..(ch + 1) * n_t].fill(0.0);
                }
            }
        }
        let support: Vec<bool> = deleted.iter().map(|&d| !d).collect();

        // Peak position, peak-to-threshold scaling and integer time shift.
        let (peak_ch, peak_s) = match polarity {
            Polarity::Neg => arg_extremum_2d(&component, n_t, false),
            Polarity::Pos => arg_extremum_2d(&component, n_t, true),
        };
        let extreme = component[peak_ch * n_t + peak_s];
        let ratio = match polarity {
            Polarity::Neg => -basis.thresholds[peak_ch] / extreme.min(-f32::EPSILON),
            Polarity::Pos => basis.thresholds[peak_ch] / extreme.max(f32::EPSILON),
        };
        let time_shift = shift as i64 - peak_s as i64;

        let fully_sparse = deleted.iter().all(|&d| d);
        let is_noise = fully_sparse || (1.0 / ratio) < params.noise_thr;
        if is_noise || time_shift.unsigned_abs() as usize > shift / 4 {
            out.push(ExtractedTemplate {
                template: Template {
                    channel: elec,
                    polarity,
                    label: id,
                    waveform: vec![0.0; flat_len],
                    second: None,
                    support,
                    norm: 0.0,
                    second_norm: 0.0,
                    limits: (0.0, 10.0),
                },
                remove: true,
            });
            continue;
        }

        // Per-snippet projected amplitudes, then rescale so their median
        // is exactly 1.
        for snippet in snippets.iter_mut() {
            for (ch, &dead) in deleted.iter().enumerate() {
                if dead {
                    snippet[ch * n_t..(ch + 1) * n_t].fill(0.0);
                }
            }
        }
        let energy: f32 = component.iter().map(|v| v * v).sum();
        let amps: Vec<f32> = snippets
            .iter()
            .map(|s| dot(s, &component) / energy)
            .collect();
        let center = median(&amps);
        for v in component.iter_mut() {
            *v *= center;
        }

        // Dense template with the peak moved onto the canonical center.
        let mut waveform = vec![0.0f32; flat_len];
        for ch in 0..n_e {
            for s in 0..n_t {
                let src = s as i64 - time_shift;
                if src >= 0 && (src as usize) < n_t {
                    waveform[ch * n_t + s] = component[ch * n_t + src as usize];
                }
            }
        }

        let energy: f32 = component.iter().map(|v| v * v).sum();
        let amps: Vec<f32> = snippets
            .iter()
            .map(|s| dot(s, &component) / energy)
            .collect();
        let variation = median(&amps.iter().map(|a| (a - 1.0).abs()).collect::<Vec<_>>());

        let norm =
            (waveform.iter().map(|v| v * v).sum::<f32>() / flat_len as f32).sqrt();

        // Amplitude interval: dispersion-scaled but clipped so the floor
        // never undercuts the detection threshold and the ceiling never
        // exceeds the channel's noise scale.
        let scaled_extreme = component[peak_ch * n_t + peak_s].abs();
        let distance = (scaled_extreme - basis.thresholds[peak_ch]).min(0.0);
        let noise_limit = (distance + basis.mads[peak_ch]).max(0.0);
        let amp_min = 1.0 - (params.dispersion.0 * variation).min(noise_limit);
        let amp_max = 1.0 + (params.dispersion.1 * variation).min(basis.mads[peak_ch]);

        let (second, second_norm) = if params.two_components {
            let mut derivative = vec![0.0f32; flat_len];
            for ch in 0..n_e {
                for s in 0..n_t - 1 {
                    derivative[ch * n_t + s] =
                        waveform[ch * n_t + s + 1] - waveform[ch * n_t + s];
                }
            }
            let d_norm =
                (derivative.iter().map(|v| v * v).sum::<f32>() / flat_len as f32).sqrt();
            (Some(derivative), d_norm)
        } else {
            (None, 0.0)
        };

        out.push(ExtractedTemplate {
            template: Template {
                channel: elec,
                polarity,
                label: id,
                waveform,
                second,
                support,
                norm,
                second_norm,
                limits: (amp_min, amp_max),
            },
            remove: false,
        });
    }
    out
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn arg_extremum_2d(flat: &[f32], n_t: usize, max: bool) -> (usize, usize) {
    let mut best = 0usize;
    for (i, &v) in flat.iter().enumerate() {
        let better = if max { v > flat[best] } else { v < flat[best] };
        if better {
            best = i;
        }
    }
    (best / n_t, best % n_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::MemoryRecording;
    use crate::simulation::biphasic_waveform;

    fn recording_with_spikes(
        n_samples: usize,
        n_t: usize,
        amplitude: f32,
        times: &[u64],
    ) -> MemoryRecording {
        let mut data = vec![0.0f32; n_samples];
        let wave = biphasic_waveform(n_t, amplitude);
        let shift = (n_t - 1) / 2;
        for (i, &t) in times.iter().enumerate() {
            // Mild amplitude spread so the dispersion statistics are
            // non-degenerate.
            let gain = 1.0 + 0.1 * ((i % 3) as f32 - 1.0);
            for (k, &w) in wave.iter().enumerate() {
                data[t as usize - shift + k] += gain * w;
            }
        }
        MemoryRecording::new(data, 1, 20_000.0)
    }

    fn base_params(n_t: usize) -> ClusteringParams {
        ClusteringParams {
            n_t,
            compress: false,
            noise_thr: 0.1,
            ..ClusteringParams::default()
        }
    }

    #[test]
    fn test_median_amplitude_normalized_to_one() {
        let n_t = 21;
        let times: Vec<u64> = (0..40).map(|i| 100 + 60 * i).collect();
        let rec = recording_with_spikes(3000, n_t, -6.0, &times);
        let basis = Basis::identity(n_t, vec![1.5], vec![0.25], vec![0.3]);
        let params = base_params(n_t);
        let labels = vec![0i32; times.len()];

        let extracted = extract_group_templates(
            &rec, &basis, &params, 0, Polarity::Neg, &labels, &times,
        );
        assert_eq!(extracted.len(), 1);
        let t = &extracted[0].template;
        assert!(!extracted[0].remove);

        // Re-project every snippet on the final template: the median
        // amplitude must be 1 within floating tolerance.
        let shift = (n_t - 1) / 2;
        let energy: f32 = t.waveform.iter().map(|v| v * v).sum();
        // The template was shifted to center; project against the unshifted
        // snippet window at the template's own alignment.
        let amps: Vec<f32> = times
            .iter()
            .map(|&time| {
                let snip = fetch_snippet(&rec, &basis, time, shift, n_t);
                dot(&snip, &t.waveform) / energy
            })
            .collect();
        let m = median(&amps);
        assert!((m - 1.0).abs() < 0.05, "median amplitude {m}");
        assert!(t.limits.0 < 1.0 && t.limits.1 > 1.0);
        assert!(t.norm > 0.0);
    }

    #[test]
    fn test_weak_template_marked_for_removal() {
        let n_t = 21;
        let times: Vec<u64> = (0..30).map(|i| 100 + 60 * i).collect();
        // Amplitude barely over threshold with a high noise floor.
        let rec = recording_with_spikes(2500, n_t, -1.0, &times);
        let basis = Basis::identity(n_t, vec![0.9], vec![0.25], vec![0.3]);
        let mut params = base_params(n_t);
        params.noise_thr = 2.0; // requires peaks twice the threshold
        let labels = vec![0i32; times.len()];

        let extracted = extract_group_templates(
            &rec, &basis, &params, 0, Polarity::Neg, &labels, &times,
        );
        assert_eq!(extracted.len(), 1);
        assert!(extracted[0].remove);
    }

    #[test]
    fn test_sparsification_zeroes_flat_channels() {
        let n_t = 21;
        let n_samples = 3000;
        let times: Vec<u64> = (0..40).map(|i| 100 + 60 * i).collect();
        // Two channels: spikes only on channel 0.
        let mut data = vec![0.0f32; n_samples * 2];
        let wave = biphasic_waveform(n_t, -6.0);
        let shift = (n_t - 1) / 2;
        for &t in &times {
            for (k, &w) in wave.iter().enumerate() {
                data[(t as usize - shift + k) * 2] += w;
            }
        }
        let rec = MemoryRecording::new(data, 2, 20_000.0);
        let basis = Basis::identity(n_t, vec![1.5; 2], vec![0.25; 2], vec![0.3; 2]);
        let mut params = base_params(n_t);
        params.compress = true;
        params.sparsify = 0.5;
        let labels = vec![0i32; times.len()];

        let extracted = extract_group_templates(
            &rec, &basis, &params, 0, Polarity::Neg, &labels, &times,
        );
        assert_eq!(extracted.len(), 1);
        let t = &extracted[0].template;
        assert!(t.support[0]);
        assert!(!t.support[1]);
        assert!(t.waveform[n_t..2 * n_t].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_two_components_derivative() {
        let n_t = 21;
        let times: Vec<u64> = (0..40).map(|i| 100 + 60 * i).collect();
        let rec = recording_with_spikes(3000, n_t, -6.0, &times);
        let basis = Basis::identity(n_t, vec![1.5], vec![0.25], vec![0.3]);
        let mut params = base_params(n_t);
        params.two_components = true;
        let labels = vec![0i32; times.len()];

        let extracted = extract_group_templates(
            &rec, &basis, &params, 0, Polarity::Neg, &labels, &times,
        );
        let t = &extracted[0].template;
        let second = t.second.as_ref().unwrap();
        assert_eq!(second.len(), t.waveform.len());
        assert!((second[0] - (t.waveform[1] - t.waveform[0])).abs() < 1e-6);
        assert!(t.second_norm > 0.0);
    }
}
