
pub mod basis;
pub mod comm;
pub mod coordinator;
pub mod density;
pub mod detect;
pub mod error;
pub mod output;
pub mod params;
pub mod pca;
pub mod probe;
pub mod recording;
pub mod savgol;
pub mod select;
pub mod simulation;
pub mod smart;
pub mod spline;
pub mod templates;
pub mod tracing_init;
pub mod whiten;

pub use basis::Basis;
pub use coordinator::cluster_recording;
pub use error::ClusterError;
pub use output::{ClusteringOutput, ElectrodeDataset, Template, TemplateBank};
pub use params::{ClusteringParams, Extraction, MergingMethod, PeakSign, Polarity};
pub use probe::Probe;
pub use recording::{DeadTimes, MemoryRecording, Recording, WavRecording};
