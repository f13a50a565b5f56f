use thiserror::Error;

use crate::sample::SampleId;

/// An error that might occur while aligning features across samples
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignmentError {
    #[error("Cannot merge features with incompatible charge states {left} and {right}")]
    ChargeConflict { left: i32, right: i32 },
    #[error("Sample {0} occurs on both sides of a merge")]
    DuplicateSample(SampleId),
    #[error("Retention time error estimate {0} is not positive, the retention time axis is degenerate")]
    DegenerateErrorTerm(f64),
    #[error("Cannot align an empty collection of samples")]
    EmptyCohort,
    #[error("The alignment was cancelled")]
    Cancelled,
}
