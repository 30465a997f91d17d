//! Multi-pass clustering engine
//!
//! Drives the outer pass sequence over a pool of workers: a calibration
//! pass sampling raw amplitudes (smart search), a collection pass gathering
//! the waveforms that get clustered, then refinement passes sharpening the
//! density estimates, ending in the per-electrode density clustering and
//! template extraction.
//!
//! Partitioning follows the modulo rule: during the calibration and
//! collection passes every worker scans every chunk and keeps only its own
//! electrodes (all electrodes must be seen together per chunk); refinement
//! passes stripe the chunks across workers instead and route collected
//! features back to the owners at the pass boundary. Each pass starts from
//! a chunk permutation reseeded from the pass index, so a fixed worker
//! count reproduces the run exactly.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::basis::Basis;
use crate::comm::{Collective, LocalCluster};
use crate::density::{
    cluster_group, compute_rho, update_rho, ClusterOutcome, DensityState, DistanceStore,
};
use crate::detect::detect_peaks;
use crate::error::ClusterError;
use crate::output::{self, ClusteringOutput, ElectrodeDataset, RunCounters, Template};
use crate::params::{ClusteringParams, Polarity};
use crate::pca::{fit_pca, Projection};
use crate::probe::Probe;
use crate::recording::{DeadTimes, Recording};
use crate::select::{Accepted, GroupTable, PassKind, Payload, Selector};
use crate::smart::{RejectionCurve, SmartState};
use crate::templates::extract_group_templates;
use crate::whiten::preprocess;

/// Cluster a recording into templates, running `n_workers` cooperating
/// workers in-process.
///
/// Every worker independently assembles the same output; the caller
/// receives one copy.
pub fn cluster_recording<R: Recording>(
    recording: &R,
    probe: &Probe,
    basis: &Basis,
    dead_times: Option<&DeadTimes>,
    params: &ClusteringParams,
    n_workers: usize,
) -> Result<ClusteringOutput, ClusterError> {
    basis.validate(probe.n_channels())?;
    if probe.n_channels() != recording.nb_channels() {
        return Err(ClusterError::BadProbe {
            reason: format!(
                "probe has {} channels, recording has {}",
                probe.n_channels(),
                recording.nb_channels()
            ),
        });
    }

    let mut results = LocalCluster::run(n_workers, |comm| {
        Worker { recording, probe, basis, dead_times, params }.run(comm)
    });
    results.swap_remove(0)
}

struct Worker<'a, R: Recording> {
    recording: &'a R,
    probe: &'a Probe,
    basis: &'a Basis,
    dead_times: Option<&'a DeadTimes>,
    params: &'a ClusteringParams,
}

impl<'a, R: Recording> Worker<'a, R> {
    fn run(&self, comm: Collective) -> Result<ClusteringOutput, ClusterError> {
        let params = self.params;
        let n_e = self.probe.n_channels();
        let polarities = params.sign_peaks.polarities();
        let nb_chunks = self.recording.nb_chunks(params.chunk_size);
        let duration = params.duration() as i64;

        let nb_owned = (0..n_e).filter(|&ch| comm.owns(ch)).count();
        let full_quota = params.quota_per_electrode();
        let striped_quota = (full_quota / comm.size()).max(1);
        let striped_budget = ((params.nb_elts_frac * n_e as f32 * full_quota as f32) as usize
            / comm.size())
        .max(1);

        let mut smart = SmartState::new(n_e, params.smart_search);

        // Per-(polarity, channel) accumulators. The collection-pass rows are
        // the points that get clustered; refinement passes only extend the
        // density evidence.
        let mut raw_amps: GroupTable<Vec<f32>> = GroupTable::new_with(n_e, Vec::new);
        let mut chunks_counted: GroupTable<usize> = GroupTable::filled(n_e, 0);
        let mut data_rows: GroupTable<Vec<Vec<f32>>> = GroupTable::new_with(n_e, Vec::new);
        let mut sub_points: GroupTable<Vec<Vec<f32>>> = GroupTable::new_with(n_e, Vec::new);
        let mut times_by_group: GroupTable<Vec<u64>> = GroupTable::new_with(n_e, Vec::new);
        let mut pcas: GroupTable<Projection> =
            GroupTable::new_with(n_e, || Projection::identity(0, params.sub_dim));
        let mut dstates: GroupTable<DensityState> =
            GroupTable::new_with(n_e, DensityState::empty);
        let mut dists: GroupTable<Option<DistanceStore>> = GroupTable::filled(n_e, None);
        let mut outcomes: GroupTable<ClusterOutcome> =
            GroupTable::new_with(n_e, ClusterOutcome::empty);

        // Spike times: local accepts of the current pass, and the global
        // view aggregated at every pass boundary.
        let mut loc_times: Vec<Vec<u64>> = vec![Vec::new(); n_e];
        let mut all_times: Vec<Vec<u64>> = vec![Vec::new(); n_e];

        let mut counters = RunCounters::default();
        let mut pass0_accepted = 0usize;
        let mut local_mergings = 0usize;

        let mut gpass: usize = if params.smart_search { 0 } else { 1 };
        let first_substantive = gpass;

        while gpass <= params.nb_repeats {
            comm.barrier();

            let kind = match gpass {
                0 => PassKind::Calibration,
                1 => PassKind::Collection,
                _ => PassKind::Refine,
            };

            if gpass == 1 && params.smart_search {
                let disabled: u64 = (0..n_e)
                    .filter(|&ch| comm.owns(ch))
                    .flat_map(|ch| polarities.iter().map(move |&p| (p, ch)))
                    .filter(|&(p, ch)| !smart.is_active(p, ch))
                    .count() as u64;
                let total_disabled = comm.sum_u64(disabled);
                if total_disabled > 0 {
                    debug!(groups = total_disabled, "smart search disabled");
                }
            }

            match kind {
                PassKind::Calibration => {
                    info!("searching random spikes to sample amplitudes...")
                }
                PassKind::Collection => {
                    info!(pass = gpass, total = params.nb_repeats, "collecting spikes for the clustering...")
                }
                PassKind::Refine => {
                    info!(pass = gpass, total = params.nb_repeats, "searching random spikes to refine the clustering...")
                }
            }

            // Every worker learns every spike time accepted anywhere during
            // the previous pass.
            for elec in 0..n_e {
                let merged = comm.all_gather_concat(std::mem::take(&mut loc_times[elec]));
                all_times[elec].extend(merged);
            }

            // Owners hand out the projections fitted at the end of the
            // collection pass.
            if gpass == 2 {
                for elec in 0..n_e {
                    for &pol in polarities {
                        let owner = comm.owner_of(elec);
                        let value = comm
                            .owns(elec)
                            .then(|| pcas.get(pol, elec).clone());
                        let projection = comm.broadcast(value, owner);
                        pcas.set(pol, elec, projection);
                    }
                }
            }

            // Chunk order is a pure function of the pass index.
            let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(gpass as u64));
            let mut all_chunks: Vec<usize> = (0..nb_chunks).collect();
            all_chunks.shuffle(&mut rng);

            let (quota, budget, positions): (usize, usize, Vec<usize>) = match kind {
                PassKind::Calibration => {
                    let budget =
                        ((params.nb_elts_frac * nb_owned as f32 * full_quota as f32) as usize)
                            .max(1);
                    (full_quota, budget, (0..nb_chunks).collect())
                }
                PassKind::Collection => {
                    let mut budget =
                        ((params.nb_elts_frac * nb_owned as f32 * full_quota as f32) as usize)
                            .max(1);
                    if params.smart_search && pass0_accepted < budget {
                        debug!(
                            rank = comm.rank(),
                            found = pass0_accepted,
                            requested = budget,
                            "not enough spikes sampled, shrinking the target"
                        );
                        budget = pass0_accepted.max(1);
                    }
                    (full_quota, budget, (0..nb_chunks).collect())
                }
                PassKind::Refine => (
                    striped_quota,
                    striped_budget,
                    (comm.rank()..nb_chunks).step_by(comm.size()).collect(),
                ),
            };

            let mut selector = Selector::new(
                params,
                self.probe,
                self.basis,
                self.dead_times,
                (kind == PassKind::Collection).then_some(&smart),
                (kind == PassKind::Refine).then_some(&pcas),
                kind,
                quota,
                budget,
            );
            let mut tmp_rows: GroupTable<Vec<Vec<f32>>> = GroupTable::new_with(n_e, Vec::new);

            comm.barrier();

            for &position in &positions {
                if selector.budget_left() == 0 {
                    break;
                }
                let gidx = all_chunks[position];
                let is_first = self.recording.is_first_chunk(gidx);
                let is_last = self.recording.is_last_chunk(gidx, params.chunk_size);
                let padding = if is_last {
                    (-duration, 0)
                } else if is_first {
                    (0, duration)
                } else {
                    (-duration, duration)
                };

                let (mut block, block_start) =
                    self.recording.read_chunk(gidx, params.chunk_size, padding)?;
                preprocess(&mut block, self.basis);

                if kind == PassKind::Calibration {
                    for elec in (0..n_e).filter(|&ch| comm.owns(ch)) {
                        for &pol in polarities {
                            if *selector.counts.get(pol, elec) < full_quota {
                                *chunks_counted.get_mut(pol, elec) += 1;
                            }
                        }
                    }
                }

                let peaks = detect_peaks(&block, self.basis, params);
                let accepted = selector.scan_block(
                    &block,
                    block_start,
                    &peaks,
                    |elec| comm.owns(elec),
                    &all_times,
                    &mut rng,
                );

                for Accepted { channel, polarity, time, payload } in accepted {
                    match payload {
                        Payload::Amplitude(amp) => {
                            raw_amps.get_mut(polarity, channel).push(amp);
                        }
                        Payload::Features(row) => {
                            if kind == PassKind::Collection {
                                data_rows.get_mut(polarity, channel).push(row);
                                times_by_group.get_mut(polarity, channel).push(time);
                            } else {
                                tmp_rows.get_mut(polarity, channel).push(row);
                            }
                            loc_times[channel].push(time);
                        }
                    }
                }
            }

            comm.barrier();

            let local_accepted = selector.accepted_total;
            debug!(
                rank = comm.rank(),
                collected = local_accepted,
                rejected = selector.drops.rejected,
                noise = selector.drops.noise,
                "pass finished"
            );
            let total_accepted = comm.sum_u64(local_accepted as u64);
            counters.accepted += local_accepted;
            counters.rejected += selector.drops.rejected;
            counters.noise += selector.drops.noise;
            counters.not_isolated += selector.drops.not_isolated;
            counters.over_quota += selector.drops.over_quota;
            if kind == PassKind::Calibration {
                pass0_accepted = local_accepted;
            }

            if gpass == first_substantive && total_accepted == 0 {
                info!("no waveforms found, aborting");
                return Err(ClusterError::NoSpikesFound);
            }
            if total_accepted == 0 && gpass < params.nb_repeats {
                info!("no more spikes in the recording, stop searching");
                gpass = params.nb_repeats;
            }

            // Refinement features collected anywhere are routed back to the
            // electrode's owner before the density update.
            if kind == PassKind::Refine {
                for elec in 0..n_e {
                    for &pol in polarities {
                        let gathered = comm.gather(
                            std::mem::take(tmp_rows.get_mut(pol, elec)),
                            comm.owner_of(elec),
                        );
                        if let Some(rows) = gathered {
                            tmp_rows.set(pol, elec, rows);
                        }
                    }
                }
            }

            for elec in (0..n_e).filter(|&ch| comm.owns(ch)) {
                for &pol in polarities {
                    match kind {
                        PassKind::Calibration => {
                            let amps = raw_amps.get(pol, elec);
                            let visited = *chunks_counted.get(pol, elec);
                            let ratio = if visited > 0 {
                                nb_chunks as f32 / visited as f32
                            } else {
                                1.0
                            };
                            let bound = match pol {
                                Polarity::Pos => self.basis.detection_threshold(
                                    elec,
                                    pol,
                                    params.matched_filter,
                                ),
                                Polarity::Neg => -self.basis.detection_threshold(
                                    elec,
                                    pol,
                                    params.matched_filter,
                                ),
                            };
                            let curve = RejectionCurve::build(
                                amps,
                                bound,
                                pol,
                                params.nb_ss_bins,
                                ratio,
                            );
                            smart.install(pol, elec, curve);
                        }
                        PassKind::Collection => {
                            let rows = data_rows.get(pol, elec);
                            let in_dim = rows
                                .first()
                                .map(|r| r.len())
                                .unwrap_or(self.basis.n_basis(pol) * self.probe.neighbors(elec).len());
                            let projection = if rows.is_empty() {
                                Projection::identity(in_dim, params.sub_dim)
                            } else {
                                fit_pca(rows, params.sub_dim)
                            };
                            let reduced = projection.apply_all(rows);
                            pcas.set(pol, elec, projection);
                            if !reduced.is_empty() {
                                let dist = DistanceStore::from_points(&reduced);
                                dstates.set(pol, elec, compute_rho(&dist, params.m_ratio));
                                dists.set(pol, elec, Some(dist));
                            }
                            sub_points.set(pol, elec, reduced);
                        }
                        PassKind::Refine => {
                            let fresh = tmp_rows.get(pol, elec);
                            if !fresh.is_empty() {
                                let points = sub_points.get(pol, elec).clone();
                                update_rho(dstates.get_mut(pol, elec), &points, fresh);
                            }
                        }
                    }

                    if gpass == params.nb_repeats {
                        let points = sub_points.get(pol, elec);
                        let outcome = if points.len() > 1 {
                            let dist = dists
                                .get(pol, elec)
                                .as_ref()
                                .expect("distance store missing for clustered group");
                            let state = dstates.get(pol, elec);
                            let outcome = cluster_group(
                                &state.rho,
                                dist,
                                points,
                                params.n_abs_min,
                                params.sensitivity,
                                params.merging_method,
                                params.merging_param,
                            );
                            debug!(
                                rank = comm.rank(),
                                channel = elec,
                                ?pol,
                                clusters = outcome.n_clusters(),
                                merges = outcome.merges,
                                pruned = outcome.pruned,
                                spikes = points.len(),
                                "clustered"
                            );
                            outcome
                        } else {
                            ClusterOutcome::unassigned(points.len())
                        };
                        local_mergings += outcome.merges;
                        outcomes.set(pol, elec, outcome);
                    }
                }
            }

            gpass += 1;
        }

        comm.barrier();

        // Template extraction: each owner writes its clusters at a global
        // offset derived from every worker's cluster count.
        let local_nb_clusters: usize = (0..n_e)
            .filter(|&ch| comm.owns(ch))
            .map(|elec| {
                polarities
                    .iter()
                    .map(|&pol| outcomes.get(pol, elec).n_clusters())
                    .sum::<usize>()
            })
            .sum();
        let cluster_counts = comm.all_gather(local_nb_clusters as u64);
        let node_pad: u64 = cluster_counts[..comm.rank()].iter().sum();
        let total_clusters: u64 = cluster_counts.iter().sum();
        let total_merges = comm.sum_u64(local_mergings as u64);

        info!(clusters = total_clusters, merges = total_merges, "extracting templates");

        let mut local_templates: Vec<(u64, Template)> = Vec::new();
        let mut local_remove: Vec<u64> = Vec::new();
        let mut local_datasets: Vec<ElectrodeDataset> = Vec::new();
        let mut global_idx = node_pad;

        for elec in (0..n_e).filter(|&ch| comm.owns(ch)) {
            let mut dataset = ElectrodeDataset {
                channel: elec,
                times: Vec::new(),
                polarities: Vec::new(),
                labels: Vec::new(),
                features: Vec::new(),
            };
            let mut label_offset = 0i32;

            for &pol in polarities {
                let outcome = outcomes.get(pol, elec);
                let times = times_by_group.get(pol, elec);

                let extracted = extract_group_templates(
                    self.recording,
                    self.basis,
                    params,
                    elec,
                    pol,
                    &outcome.labels,
                    times,
                );
                for ex in extracted {
                    if ex.remove {
                        local_remove.push(global_idx);
                    }
                    local_templates.push((global_idx, ex.template));
                    global_idx += 1;
                }

                dataset.times.extend_from_slice(times);
                dataset.polarities.extend(std::iter::repeat(pol).take(times.len()));
                dataset
                    .labels
                    .extend(outcome.labels.iter().map(|&l| if l >= 0 { l + label_offset } else { -1 }));
                dataset
                    .features
                    .extend(sub_points.get(pol, elec).iter().cloned());

                if let Some(max) = dataset.labels.iter().max() {
                    label_offset = (*max + 1).max(label_offset);
                }
            }
            local_datasets.push(dataset);
        }

        // Everyone assembles the identical final products.
        let mut all_templates = comm.all_gather_concat(local_templates);
        all_templates.sort_by_key(|(idx, _)| *idx);
        let templates: Vec<Template> = all_templates.into_iter().map(|(_, t)| t).collect();
        let remove: Vec<usize> = comm
            .all_gather_concat(local_remove)
            .into_iter()
            .map(|v| v as usize)
            .collect();
        let mut datasets = comm.all_gather_concat(local_datasets);
        datasets.sort_by_key(|d| d.channel);

        counters.accepted = comm.sum_u64(counters.accepted as u64) as usize;
        counters.rejected = comm.sum_u64(counters.rejected as u64) as usize;
        counters.noise = comm.sum_u64(counters.noise as u64) as usize;
        counters.not_isolated = comm.sum_u64(counters.not_isolated as u64) as usize;
        counters.over_quota = comm.sum_u64(counters.over_quota as u64) as usize;
        counters.mergings = total_merges as usize;

        if !remove.is_empty() {
            info!(count = remove.len(), "removing strongly shifted or noisy templates");
        }

        Ok(output::finalize(
            templates,
            remove,
            datasets,
            counters,
            n_e,
            params.n_t,
        ))
    }
}
