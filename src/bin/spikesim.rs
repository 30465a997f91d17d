//! Synthetic recording generator
//!
//! Writes a multichannel WAV recording of Gaussian noise plus a few
//! periodically firing synthetic units, for exercising the clustering
//! pipeline end to end.
//!
//! **Usage**:
//! ```bash
//! cargo run --bin spikesim -- output.wav [n_channels] [seconds]
//! ```

use std::env;

use rustyspike::simulation::{generate_recording, SyntheticUnit};
use rustyspike::recording::Recording;
use rustyspike::tracing_init;

const SAMPLE_RATE: u32 = 20_000;
const N_T: usize = 31;

fn main() {
    tracing_init::init_tracing();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args.len() > 4 {
        eprintln!("Usage: {} <output.wav> [n_channels] [seconds]", args[0]);
        eprintln!();
        eprintln!("Generates a synthetic extracellular recording with known units.");
        std::process::exit(1);
    }

    let output_path = &args[1];
    let n_channels: usize = args.get(2).map_or(4, |v| v.parse().unwrap_or(4));
    let seconds: f32 = args.get(3).map_or(10.0, |v| v.parse().unwrap_or(10.0));
    let n_samples = (seconds * SAMPLE_RATE as f32) as usize;

    // One unit per channel, staggered so spikes rarely collide.
    let units: Vec<SyntheticUnit> = (0..n_channels)
        .map(|ch| SyntheticUnit {
            channel: ch,
            amplitude: -4.0 - ch as f32,
            period: 900 + 137 * ch as u64,
            phase: 50 * ch as u64,
        })
        .collect();

    println!("Generating {} channels x {:.1} s at {} Hz...", n_channels, seconds, SAMPLE_RATE);
    let (recording, ground_truth) =
        generate_recording(n_channels, n_samples, N_T, 0.5, 42, &units);

    for (unit, times) in units.iter().zip(&ground_truth) {
        println!(
            "  unit on channel {}: amplitude {:+.1}, {} spikes",
            unit.channel,
            unit.amplitude,
            times.len()
        );
    }

    let spec = hound::WavSpec {
        channels: n_channels as u16,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = match hound::WavWriter::create(output_path, spec) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("Failed to create '{}': {}", output_path, e);
            std::process::exit(1);
        }
    };

    let block = recording.read_span(0, n_samples);
    for t in 0..n_samples {
        for ch in 0..n_channels {
            if let Err(e) = writer.write_sample(block.sample(t, ch)) {
                eprintln!("Failed to write sample: {}", e);
                std::process::exit(1);
            }
        }
    }
    if let Err(e) = writer.finalize() {
        eprintln!("Failed to finalize WAV: {}", e);
        std::process::exit(1);
    }

    println!("Wrote {}", output_path);
}
