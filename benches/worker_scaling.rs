//! Benchmark to measure worker-pool speedup
//!
//! Times the full pass sequence over a synthetic recording with 1, 2 and 4
//! workers.

use std::time::Instant;

use rustyspike::simulation::{generate_recording, SyntheticUnit};
use rustyspike::{cluster_recording, Basis, ClusteringParams, PeakSign, Probe};

const N_T: usize = 31;

fn main() {
    let units: Vec<SyntheticUnit> = (0..8)
        .map(|ch| SyntheticUnit {
            channel: ch,
            amplitude: -5.0 - (ch % 3) as f32,
            period: 700 + 97 * ch as u64,
            phase: 40 * ch as u64,
        })
        .collect();
    let (recording, _) = generate_recording(8, 400_000, N_T, 0.25, 7, &units);

    let params = ClusteringParams {
        n_t: N_T,
        dist_peaks: N_T,
        sign_peaks: PeakSign::Negative,
        smart_search: false,
        chunk_size: 40_000,
        ..ClusteringParams::default()
    };
    let probe = Probe::linear(8, 1);
    let basis = Basis::estimate(&recording, N_T, 6.0);

    for workers in [1usize, 2, 4] {
        let start = Instant::now();
        let output = cluster_recording(&recording, &probe, &basis, None, &params, workers)
            .expect("clustering failed");
        let elapsed = start.elapsed();
        println!(
            "{} worker(s): {:>8.2?}  ({} spikes, {} templates)",
            workers,
            elapsed,
            output.counters.accepted,
            output.templates.len()
        );
    }
}
