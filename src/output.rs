//! Clustering products
//!
//! Everything the downstream matching stage consumes: one template per
//! surviving cluster (dense waveform, channel support, norm, amplitude
//! bounds), per-electrode spike datasets, and the sparse template bank
//! keyed by (flat sample index, template index).

use crate::params::Polarity;

/// Representative waveform of one surviving cluster.
#[derive(Debug, Clone)]
pub struct Template {
    /// Electrode the cluster was found on
    pub channel: usize,
    pub polarity: Polarity,
    /// Cluster label within its (channel, polarity) group
    pub label: i32,
    /// Dense waveform over all channels, channel-major (`n_e * n_t`)
    pub waveform: Vec<f32>,
    /// Temporal-derivative second component, when enabled
    pub second: Option<Vec<f32>>,
    /// Channels kept (not zeroed) by sparsification
    pub support: Vec<bool>,
    pub norm: f32,
    pub second_norm: f32,
    /// Acceptance amplitude interval [min, max]
    pub limits: (f32, f32),
}

/// Sparse COO template bank of shape `(n_e, n_t, 2 * nb_templates)`.
///
/// Column `i` holds template `i`; column `nb_templates + i` holds its second
/// component (all-zero when disabled).
#[derive(Debug, Clone)]
pub struct TemplateBank {
    pub n_e: usize,
    pub n_t: usize,
    pub nb_templates: usize,
    pub x: Vec<u32>,
    pub y: Vec<u32>,
    pub data: Vec<f32>,
}

impl TemplateBank {
    pub fn build(templates: &[Template], n_e: usize, n_t: usize) -> Self {
        let nb = templates.len();
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut data = Vec::new();
        for (idx, template) in templates.iter().enumerate() {
            for (flat, &v) in template.waveform.iter().enumerate() {
                if v != 0.0 {
                    x.push(flat as u32);
                    y.push(idx as u32);
                    data.push(v);
                }
            }
            if let Some(second) = &template.second {
                for (flat, &v) in second.iter().enumerate() {
                    if v != 0.0 {
                        x.push(flat as u32);
                        y.push((nb + idx) as u32);
                        data.push(v);
                    }
                }
            }
        }
        Self { n_e, n_t, nb_templates: nb, x, y, data }
    }

    /// Reassemble one column as a dense waveform.
    pub fn dense_column(&self, idx: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n_e * self.n_t];
        for ((&x, &y), &v) in self.x.iter().zip(&self.y).zip(&self.data) {
            if y as usize == idx {
                out[x as usize] = v;
            }
        }
        out
    }
}

/// Per-electrode clustering dataset: spike times, polarity tags, final
/// labels and the reduced feature rows, all index-aligned.
#[derive(Debug, Clone)]
pub struct ElectrodeDataset {
    pub channel: usize,
    pub times: Vec<u64>,
    pub polarities: Vec<Polarity>,
    pub labels: Vec<i32>,
    pub features: Vec<Vec<f32>>,
}

/// Run-level diagnostics, aggregated across workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunCounters {
    pub accepted: usize,
    pub rejected: usize,
    pub noise: usize,
    pub not_isolated: usize,
    pub over_quota: usize,
    pub mergings: usize,
    pub nb_clusters: usize,
    pub removed: usize,
}

/// Full output of one clustering run, identical on every worker.
#[derive(Debug, Clone)]
pub struct ClusteringOutput {
    pub templates: Vec<Template>,
    pub bank: TemplateBank,
    pub datasets: Vec<ElectrodeDataset>,
    pub counters: RunCounters,
}

/// Apply the deferred remove list and assemble the final products.
///
/// Templates are dropped by their global index (collected during the
/// concurrent write phase), then the bank is rebuilt over the survivors so
/// column numbering stays gapless.
pub fn finalize(
    mut templates: Vec<Template>,
    mut remove: Vec<usize>,
    datasets: Vec<ElectrodeDataset>,
    mut counters: RunCounters,
    n_e: usize,
    n_t: usize,
) -> ClusteringOutput {
    remove.sort_unstable();
    remove.dedup();
    counters.removed = remove.len();
    templates = templates
        .into_iter()
        .enumerate()
        .filter_map(|(i, t)| remove.binary_search(&i).is_err().then_some(t))
        .collect();
    counters.nb_clusters = templates.len();
    let bank = TemplateBank::build(&templates, n_e, n_t);
    ClusteringOutput { templates, bank, datasets, counters }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(channel: usize, fill: &[(usize, f32)], n_e: usize, n_t: usize) -> Template {
        let mut waveform = vec![0.0f32; n_e * n_t];
        for &(i, v) in fill {
            waveform[i] = v;
        }
        Template {
            channel,
            polarity: Polarity::Neg,
            label: 0,
            waveform,
            second: None,
            support: vec![true; n_e],
            norm: 1.0,
            second_norm: 0.0,
            limits: (0.5, 1.5),
        }
    }

    #[test]
    fn test_bank_round_trip() {
        let t0 = template(0, &[(0, 1.0), (5, -2.0)], 2, 4);
        let t1 = template(1, &[(3, 0.5)], 2, 4);
        let bank = TemplateBank::build(&[t0.clone(), t1.clone()], 2, 4);
        assert_eq!(bank.nb_templates, 2);
        assert_eq!(bank.dense_column(0), t0.waveform);
        assert_eq!(bank.dense_column(1), t1.waveform);
    }

    #[test]
    fn test_finalize_applies_remove_list() {
        let templates = vec![
            template(0, &[(0, 1.0)], 1, 4),
            template(0, &[(1, 1.0)], 1, 4),
            template(0, &[(2, 1.0)], 1, 4),
        ];
        let out = finalize(templates, vec![1], Vec::new(), RunCounters::default(), 1, 4);
        assert_eq!(out.templates.len(), 2);
        assert_eq!(out.counters.removed, 1);
        assert_eq!(out.counters.nb_clusters, 2);
        // Columns stay gapless after removal.
        assert_eq!(out.bank.dense_column(0)[0], 1.0);
        assert_eq!(out.bank.dense_column(1)[2], 1.0);
    }
}
