//! Engine configuration
//!
//! All tunable numeric policies of the clustering engine live in
//! [`ClusteringParams`]. String-typed policies (peak sign, extraction method,
//! merging method) parse into enums at startup and fail fast on unknown
//! values; nothing downstream branches on raw strings.

use std::str::FromStr;

use crate::error::ClusterError;

/// Which waveform polarities are searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeakSign {
    Negative,
    Positive,
    Both,
}

/// One concrete polarity of a detected or accepted spike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    Neg = 0,
    Pos = 1,
}

impl Polarity {
    /// Stable index used by per-polarity accumulator tables.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Self {
        match idx {
            0 => Polarity::Neg,
            _ => Polarity::Pos,
        }
    }
}

impl PeakSign {
    /// The polarities scanned under this policy.
    pub fn polarities(self) -> &'static [Polarity] {
        match self {
            PeakSign::Negative => &[Polarity::Neg],
            PeakSign::Positive => &[Polarity::Pos],
            PeakSign::Both => &[Polarity::Neg, Polarity::Pos],
        }
    }
}

impl FromStr for PeakSign {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "negative" => Ok(PeakSign::Negative),
            "positive" => Ok(PeakSign::Positive),
            "both" => Ok(PeakSign::Both),
            other => Err(ClusterError::UnknownPeakSign { value: other.to_string() }),
        }
    }
}

/// How the representative waveform of a cluster is reduced from its snippets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    Median,
    Mean,
}

impl FromStr for Extraction {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "median-raw" | "median" => Ok(Extraction::Median),
            "mean-raw" | "mean" => Ok(Extraction::Mean),
            other => Err(ClusterError::UnknownExtraction { value: other.to_string() }),
        }
    }
}

/// Similarity test used when deciding whether two clusters are duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergingMethod {
    /// Normalized distance between cluster medians along their difference axis
    Distance,
    /// Gaussian Bhattacharyya distance of the two projected distributions
    Bhattacharyya,
}

impl FromStr for MergingMethod {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "distance" => Ok(MergingMethod::Distance),
            "bhattacharyya" => Ok(MergingMethod::Bhattacharyya),
            other => Err(ClusterError::UnknownMergingMethod { value: other.to_string() }),
        }
    }
}

/// Configuration for the multi-pass clustering engine.
#[derive(Debug, Clone)]
pub struct ClusteringParams {
    /// Waveform width in samples (odd, so the peak sits on a center sample)
    pub n_t: usize,
    /// Polarities searched during peak detection
    pub sign_peaks: PeakSign,
    /// Minimum distance between two peaks on the same channel (samples)
    pub dist_peaks: usize,
    /// Half-width of the spatio-temporal exclusion window (samples)
    pub safety_time: usize,
    /// Extend the exclusion window over the whole neighborhood, not just the channel
    pub safety_space: bool,
    /// Sub-sample realignment of accepted waveforms
    pub alignment: bool,
    /// Keep only isolated spikes during the collection pass
    pub isolation: bool,
    /// Oversampling density of the spline grid used for realignment
    pub oversampling_factor: f32,
    /// Extra samples kept on each side of the waveform for realignment
    pub jitter_range: usize,
    /// Spline smoothing scale, multiplied by the channel mad squared
    pub smoothing_factor: f32,
    /// Detect peaks on the matched-filtered signal instead of raw thresholds
    pub matched_filter: bool,
    /// Noise rejection threshold on the local RMS test (0 disables the test)
    pub rejection_threshold: f32,
    /// Half-width of the RMS window used by the noise test (samples)
    pub noise_window: usize,
    /// Amplitude-flattening rejection sampling calibrated on pass 0
    pub smart_search: bool,
    /// Number of bins of the smart-search amplitude histogram
    pub nb_ss_bins: usize,
    /// Per-electrode, per-pass acceptance quota
    pub max_elts_elec: usize,
    /// Fraction of the theoretical electrode total actually collected per pass
    pub nb_elts_frac: f32,
    /// Number of passes after the calibration pass
    pub nb_repeats: usize,
    /// Fraction of neighbors sampled by the density estimate
    pub m_ratio: f32,
    /// Output dimension of the per-electrode PCA
    pub sub_dim: usize,
    /// Sensitivity of cluster center nomination (alpha)
    pub sensitivity: f32,
    /// Minimum number of members for a cluster to survive
    pub n_abs_min: usize,
    /// Cluster similarity test used for merging
    pub merging_method: MergingMethod,
    /// Threshold of the merging test
    pub merging_param: f32,
    /// Template reduction method
    pub extraction: Extraction,
    /// Channels with std/noise below this ratio are zeroed in templates
    pub sparsify: f32,
    /// Enable template channel sparsification
    pub compress: bool,
    /// Templates scaled below this fraction of the threshold are removed
    pub noise_thr: f32,
    /// Multipliers of the amplitude dispersion for the (min, max) bounds
    pub dispersion: (f32, f32),
    /// Taper accepted waveforms with a Hanning window before projection
    pub use_hanning: bool,
    /// Smooth templates with a two-scale Savitzky-Golay blend
    pub use_savgol: bool,
    /// Base window of the Savitzky-Golay smoother (odd)
    pub savgol_window: usize,
    /// Emit a temporal-derivative second component per template
    pub two_components: bool,
    /// Skip candidates falling inside dead-time ranges
    pub ignore_dead_times: bool,
    /// Samples per chunk
    pub chunk_size: usize,
    /// Base seed of the engine
    pub seed: u64,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            n_t: 31,
            sign_peaks: PeakSign::Negative,
            dist_peaks: 31,
            safety_time: 15,
            safety_space: true,
            alignment: true,
            isolation: false,
            oversampling_factor: 5.0,
            jitter_range: 4,
            smoothing_factor: 0.25,
            matched_filter: false,
            rejection_threshold: 0.0,
            noise_window: 5,
            smart_search: true,
            nb_ss_bins: 50,
            max_elts_elec: 1000,
            nb_elts_frac: 0.8,
            nb_repeats: 3,
            m_ratio: 0.01,
            sub_dim: 5,
            sensitivity: 3.0,
            n_abs_min: 20,
            merging_method: MergingMethod::Distance,
            merging_param: 3.0,
            extraction: Extraction::Median,
            sparsify: 1.0,
            compress: true,
            noise_thr: 0.8,
            dispersion: (5.0, 5.0),
            use_hanning: false,
            use_savgol: false,
            savgol_window: 5,
            two_components: false,
            ignore_dead_times: false,
            chunk_size: 60_000,
            seed: 520,
        }
    }
}

impl ClusteringParams {
    /// Distance from the waveform center to its edges.
    pub fn template_shift(&self) -> usize {
        (self.n_t - 1) / 2
    }

    /// Center-to-edge distance of the widened alignment window.
    pub fn template_shift_2(&self) -> usize {
        self.template_shift() + self.jitter_range
    }

    /// Safety border excluded on each side of a block.
    ///
    /// Alignment needs the widened window around every candidate, so the
    /// border grows with the jitter range.
    pub fn duration(&self) -> usize {
        if self.alignment {
            self.template_shift_2()
        } else {
            self.template_shift()
        }
    }

    pub fn reject_noise(&self) -> bool {
        self.rejection_threshold > 0.0
    }

    /// Per-electrode quota for one pass; doubled when both polarities are scanned.
    pub fn quota_per_electrode(&self) -> usize {
        match self.sign_peaks {
            PeakSign::Both => self.max_elts_elec * 2,
            _ => self.max_elts_elec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_sign_parsing() {
        assert_eq!("negative".parse::<PeakSign>().unwrap(), PeakSign::Negative);
        assert_eq!("both".parse::<PeakSign>().unwrap(), PeakSign::Both);
        assert!("upward".parse::<PeakSign>().is_err());
    }

    #[test]
    fn test_extraction_parsing() {
        assert_eq!("median-raw".parse::<Extraction>().unwrap(), Extraction::Median);
        assert_eq!("mean".parse::<Extraction>().unwrap(), Extraction::Mean);
        assert!("mode".parse::<Extraction>().is_err());
    }

    #[test]
    fn test_default_window_geometry() {
        let params = ClusteringParams::default();
        assert_eq!(params.n_t, 2 * params.template_shift() + 1);
        assert!(params.duration() >= params.template_shift());
    }
}
