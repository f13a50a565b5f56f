//! Cross-sample alignment of LC-MS chromatographic features.
//!
//! Every sample run detects its ions independently; this crate aligns those
//! detections across a whole cohort into one consensus feature per chemical
//! entity, tolerating retention time drift, missing detections and
//! measurement noise. Peak picking, spectral library search and file I/O
//! are external collaborators consumed through the [`gap_fill::PeakDetector`]
//! and [`spectral::SpectralScorer`] boundaries.
pub mod api;
pub mod cancel;
pub mod cluster;
pub mod clustering;
pub mod error;
pub mod feature;
pub mod gap_fill;
pub mod ion;
pub mod pairwise;
pub mod progressive;
pub mod recalibrate;
pub mod sample;
pub mod spectral;
pub mod stats;

pub use api::{AlignmentPipeline, DriverKind, PipelineParams};
pub use cancel::CancellationToken;
pub use cluster::Cluster;
pub use error::AlignmentError;
pub use feature::AlignedFeature;
pub use sample::{Sample, SampleId, SampleSet};
