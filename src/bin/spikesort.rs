//! Clustering runner
//!
//! Reads a multichannel WAV recording, estimates noise statistics, runs the
//! multi-pass clustering engine and prints the resulting templates.
//!
//! **Usage**:
//! ```bash
//! cargo run --bin spikesort -- input.wav [n_workers]
//! ```

use std::env;

use rustyspike::recording::Recording;
use rustyspike::tracing_init;
use rustyspike::{cluster_recording, Basis, ClusteringParams, Probe, WavRecording};

fn main() {
    tracing_init::init_tracing();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <input.wav> [n_workers]", args[0]);
        eprintln!();
        eprintln!("Clusters spike waveforms of a multichannel WAV recording.");
        std::process::exit(1);
    }

    let input_path = &args[1];
    let n_workers: usize = args.get(2).map_or(1, |v| v.parse().unwrap_or(1));

    println!("Reading recording: {}", input_path);
    let recording = match WavRecording::open(input_path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error reading WAV: {}", e);
            std::process::exit(1);
        }
    };
    println!("  Channels: {}", recording.nb_channels());
    println!(
        "  Duration: {:.2} seconds",
        recording.nb_samples() as f32 / recording.sample_rate()
    );

    let params = ClusteringParams {
        chunk_size: (recording.sample_rate() as usize).max(10_000),
        ..ClusteringParams::default()
    };
    let probe = Probe::linear(recording.nb_channels(), 1);
    let basis = Basis::estimate(&recording, params.n_t, 6.0);

    println!();
    println!("Clustering with {} worker(s)...", n_workers);
    let output = match cluster_recording(&recording, &probe, &basis, None, &params, n_workers) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("Clustering failed: {}", e);
            std::process::exit(1);
        }
    };

    println!();
    println!(
        "Collected {} spikes ({} rejected, {} noise, {} merges, {} templates removed)",
        output.counters.accepted,
        output.counters.rejected,
        output.counters.noise,
        output.counters.mergings,
        output.counters.removed,
    );
    println!();

    if output.templates.is_empty() {
        println!("No templates survived.");
        return;
    }

    println!("  #   Chan  Pol  Label  Support  Norm      Amp range");
    println!("  --  ----  ---  -----  -------  --------  ----------------");
    for (i, t) in output.templates.iter().enumerate() {
        let support = t.support.iter().filter(|&&s| s).count();
        println!(
            "  {:2}  {:4}  {:3?}  {:5}  {:7}  {:8.4}  [{:.3}, {:.3}]",
            i,
            t.channel,
            t.polarity,
            t.label,
            support,
            t.norm,
            t.limits.0,
            t.limits.1,
        );
    }
}
