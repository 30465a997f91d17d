use snafu::Snafu;

/// Errors produced by the clustering engine.
///
/// Configuration variants are fatal at startup; `NoSpikesFound` is the
/// collective abort raised when the first substantive pass collects nothing.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClusterError {
    /// Unrecognized peak sign policy
    #[snafu(display("unexpected peak sign value: {value}"))]
    UnknownPeakSign { value: String },

    /// Unrecognized template extraction method
    #[snafu(display("unexpected extraction method: {value}"))]
    UnknownExtraction { value: String },

    /// Unrecognized cluster merging method
    #[snafu(display("unexpected merging method: {value}"))]
    UnknownMergingMethod { value: String },

    /// No candidate spikes collected during the first substantive pass
    #[snafu(display("no waveforms found, is the recording properly loaded?"))]
    NoSpikesFound,

    /// Chunk index outside the recording
    #[snafu(display("chunk {index} out of range ({nb_chunks} chunks)"))]
    ChunkOutOfRange { index: usize, nb_chunks: usize },

    /// WAV recording could not be opened or decoded
    #[snafu(display("failed to read WAV recording: {source}"))]
    Wav { source: hound::Error },

    /// Probe definition is inconsistent
    #[snafu(display("invalid probe definition: {reason}"))]
    BadProbe { reason: String },

    /// Basis or noise statistics do not match the probe
    #[snafu(display("invalid basis definition: {reason}"))]
    BadBasis { reason: String },
}
