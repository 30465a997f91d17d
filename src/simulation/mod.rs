//! Synthetic recordings with ground truth
//!
//! Builds multichannel recordings from seeded Gaussian noise plus injected
//! spike waveforms at known times, for integration tests and the `spikesim`
//! binary.

pub mod noise;

pub use noise::white_noise;

use crate::recording::MemoryRecording;

/// A canonical biphasic spike waveform of width `n_t`, extremum at the
/// center sample with value exactly `amplitude` (sign included).
pub fn biphasic_waveform(n_t: usize, amplitude: f32) -> Vec<f32> {
    let center = (n_t - 1) as f32 / 2.0;
    let sigma = n_t as f32 / 10.0;
    let rebound_offset = 2.5 * sigma;
    let mut wave: Vec<f32> = (0..n_t)
        .map(|i| {
            let x = i as f32 - center;
            let main = (-x * x / (2.0 * sigma * sigma)).exp();
            let xr = x - rebound_offset;
            let rebound = (-xr * xr / (2.0 * (2.0 * sigma).powi(2))).exp();
            main - 0.3 * rebound
        })
        .collect();
    // Scale so the center sample carries the requested amplitude.
    let peak = wave[(n_t - 1) / 2];
    for w in wave.iter_mut() {
        *w *= amplitude / peak;
    }
    wave
}

/// One synthetic unit: a fixed waveform firing periodically on one channel.
#[derive(Debug, Clone)]
pub struct SyntheticUnit {
    pub channel: usize,
    /// Signed extremum amplitude of the injected waveform
    pub amplitude: f32,
    /// Inter-spike interval in samples
    pub period: u64,
    /// Offset of the first spike
    pub phase: u64,
}

/// Generate a recording of seeded noise plus the given units.
///
/// Returns the recording and the injected spike times per unit. Spikes are
/// kept clear of the recording borders so every waveform fits.
pub fn generate_recording(
    n_channels: usize,
    n_samples: usize,
    n_t: usize,
    noise_sigma: f32,
    seed: u64,
    units: &[SyntheticUnit],
) -> (MemoryRecording, Vec<Vec<u64>>) {
    let mut data = vec![0.0f32; n_samples * n_channels];
    if noise_sigma > 0.0 {
        for ch in 0..n_channels {
            let channel_noise = white_noise(n_samples, noise_sigma, seed.wrapping_add(ch as u64));
            for (t, &v) in channel_noise.iter().enumerate() {
                data[t * n_channels + ch] = v;
            }
        }
    }

    let shift = (n_t - 1) / 2;
    let mut ground_truth = Vec::with_capacity(units.len());
    for unit in units {
        let wave = biphasic_waveform(n_t, unit.amplitude);
        let mut times = Vec::new();
        let mut t = (n_t as u64).max(unit.phase);
        while t + n_t as u64 + 1 < n_samples as u64 {
            for (k, &w) in wave.iter().enumerate() {
                let sample = (t as usize - shift + k) * n_channels + unit.channel;
                data[sample] += w;
            }
            times.push(t);
            t += unit.period;
        }
        ground_truth.push(times);
    }

    (MemoryRecording::new(data, n_channels, 20_000.0), ground_truth)
}
