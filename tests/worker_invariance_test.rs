//! Worker-count invariance of the distributed pass sequence
//!
//! With the same seed and well-separated spikes, the total number of
//! accepted spikes and the final templates must not depend on how many
//! workers the electrodes and chunks are partitioned over.


use rustyspike::simulation::generate_recording;
use rustyspike::{cluster_recording, Probe};
use test_utils::*;

#[test]
fn test_accepted_count_invariant_to_worker_count() {
    // Two channels, one unit each; the probe keeps them independent.
    let units = [unit(0, -6.0, 901, 60), unit(1, -9.0, 1201, 400)];
    let (recording, truth) = generate_recording(2, 120_000, N_T, 0.2, 71, &units);
    assert!(truth[0].len() > 80 && truth[1].len() > 60);

    let params = base_params();
    let probe = Probe::linear(2, 0);
    let basis = noise_basis(2, 0.2, 6.0);

    let single = cluster_recording(&recording, &probe, &basis, None, &params, 1)
        .expect("single-worker run failed");
    let double = cluster_recording(&recording, &probe, &basis, None, &params, 2)
        .expect("two-worker run failed");
    let quad = cluster_recording(&recording, &probe, &basis, None, &params, 4)
        .expect("four-worker run failed");

    eprintln!(
        "accepted: 1w={} 2w={} 4w={}",
        single.counters.accepted, double.counters.accepted, quad.counters.accepted
    );
    assert_eq!(single.counters.accepted, double.counters.accepted);
    assert_eq!(single.counters.accepted, quad.counters.accepted);

    assert_eq!(single.templates.len(), double.templates.len());
    assert_eq!(single.templates.len(), quad.templates.len());

    // Per-electrode spike sets are identical regardless of partitioning.
    for (a, b) in single.datasets.iter().zip(&double.datasets) {
        assert_eq!(a.channel, b.channel);
        let mut ta = a.times.clone();
        let mut tb = b.times.clone();
        ta.sort_unstable();
        tb.sort_unstable();
        assert_eq!(ta, tb);
    }
}

#[test]
fn test_every_worker_sees_the_same_output() {
    // cluster_recording returns rank 0's copy; the run must still succeed
    // with more workers than electrodes carrying signal.
    let units = [unit(0, -7.0, 701, 80)];
    let (recording, _) = generate_recording(1, 80_000, N_T, 0.2, 83, &units);

    let params = base_params();
    let probe = Probe::linear(1, 0);
    let basis = noise_basis(1, 0.2, 6.0);

    let output = cluster_recording(&recording, &probe, &basis, None, &params, 3)
        .expect("run with idle workers failed");
    assert!(!output.templates.is_empty());
    assert_eq!(output.datasets.len(), 1);
}
