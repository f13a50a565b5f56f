//! High level APIs for running whole-cohort alignment
use crate::cancel::CancellationToken;
use crate::cluster::Cluster;
use crate::clustering::{realign, upgma};
use crate::error::AlignmentError;
use crate::gap_fill::{GapFiller, PeakDetector};
use crate::ion::Quality;
use crate::pairwise::{MatchPolicy, PairAlignParams, PairAligner};
use crate::progressive::{ProgressiveAligner, RtErrorModel};
use crate::recalibrate::{estimate_error_term, recalibrate};
use crate::sample::SampleSet;
use crate::spectral::{IntensityWeightedCosine, SpectralScorer};

/// Which whole-cohort alignment driver the pipeline runs
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DriverKind {
    /// Grow one feature table sample by sample, best-scoring sample next
    #[default]
    Progressive,
    /// Hierarchical (UPGMA) clustering with bottom-up realignment after
    /// recalibration
    Hierarchical,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineParams {
    pub pair: PairAlignParams,
    pub policy: MatchPolicy,
    pub driver: DriverKind,
    /// Drop features without any MS/MS evidence at the end
    pub require_msms: bool,
    /// Drop features without any isotope envelope at the end
    pub require_isotopes: bool,
    /// On cohorts of at least `large_cohort` samples, drop features seen in
    /// fewer than `min_feature_samples` samples
    pub min_feature_samples: usize,
    pub large_cohort: usize,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            pair: PairAlignParams::default(),
            policy: MatchPolicy::default(),
            driver: DriverKind::default(),
            require_msms: true,
            require_isotopes: true,
            min_feature_samples: 4,
            large_cohort: 50,
        }
    }
}

/// The production alignment sequence: error estimation, repeated
/// whole-cohort alignment, gap filling, retention time recalibration and
/// final quality filtering. The returned [`Cluster`] is the hand-off to the
/// external consensus/export step.
#[derive(Debug, Clone)]
pub struct AlignmentPipeline<S: SpectralScorer + Sync = IntensityWeightedCosine> {
    pub params: PipelineParams,
    aligner: PairAligner<S>,
}

impl Default for AlignmentPipeline<IntensityWeightedCosine> {
    fn default() -> Self {
        Self::new(PipelineParams::default(), IntensityWeightedCosine::default())
    }
}

impl<S: SpectralScorer + Sync> AlignmentPipeline<S> {
    pub fn new(params: PipelineParams, scorer: S) -> Self {
        let aligner = PairAligner::new(params.pair, params.policy, scorer);
        Self { params, aligner }
    }

    pub fn run<D: PeakDetector>(
        &self,
        samples: &mut SampleSet,
        detector: &mut D,
        cancel: &CancellationToken,
    ) -> Result<Cluster, AlignmentError> {
        if samples.is_empty() {
            return Err(AlignmentError::EmptyCohort);
        }
        samples.unify_time_axis();

        let mut error = estimate_error_term(samples)?;
        tracing::info!("initial retention time error term: {error:.2}s");

        tracing::info!("first whole-cohort alignment");
        let mut cluster = self.align_cohort(samples, error, None, cancel)?;
        error = cluster.estimate_error(samples).unwrap_or(error);
        let mut shape_error = cluster.estimate_peak_shape_error(samples).unwrap_or(error);
        tracing::info!(
            "{} features after clustering, error term {error:.2}s",
            cluster.len()
        );

        cancel.check()?;
        tracing::info!("gap filling, strict");
        let strict = GapFiller::new(error, shape_error, Quality::Good, true);
        cluster = strict.fill(cluster, samples, detector, cancel)?;

        tracing::info!("second whole-cohort alignment");
        cluster = self.align_cohort(samples, error, Some(&cluster), cancel)?;

        cancel.check()?;
        tracing::info!("recalibrating retention times");
        recalibrate(samples, &cluster, error);
        error = cluster.estimate_error(samples).unwrap_or(error);

        tracing::info!("post-recalibration alignment, error term {error:.2}s");
        cluster = self.align_cohort(samples, error, Some(&cluster), cancel)?;

        cancel.check()?;
        tracing::info!("gap filling, permissive");
        shape_error = cluster.estimate_peak_shape_error(samples).unwrap_or(shape_error);
        let permissive = GapFiller::new(error, shape_error, Quality::Decent, false);
        cluster = permissive.fill(cluster, samples, detector, cancel)?;

        tracing::info!("final whole-cohort alignment");
        cluster = self.align_cohort(samples, error, Some(&cluster), cancel)?;

        let before = cluster.len();
        if self.params.require_msms {
            cluster = cluster.keep_only_with_msms(samples);
        }
        if self.params.require_isotopes {
            cluster = cluster.keep_only_with_isotopes(samples);
        }
        if samples.len() >= self.params.large_cohort {
            cluster = cluster.keep_only_with_min_samples(samples, self.params.min_feature_samples);
        }
        tracing::info!(
            "kept {} of {before} features after quality filtering",
            cluster.len()
        );
        Ok(cluster)
    }

    /// One whole-cohort alignment round. The hierarchical driver realigns
    /// bottom-up along the previous round's tree when one exists.
    fn align_cohort(
        &self,
        samples: &SampleSet,
        error: f64,
        previous: Option<&Cluster>,
        cancel: &CancellationToken,
    ) -> Result<Cluster, AlignmentError> {
        match self.params.driver {
            DriverKind::Progressive => {
                ProgressiveAligner::new(RtErrorModel::laplace(error)).align(samples, cancel)
            }
            DriverKind::Hierarchical => match previous {
                Some(tree) if !tree.is_leaf() => {
                    realign(&self.aligner, tree, samples, error, cancel)
                }
                _ => upgma(&self.aligner, samples, error, false, cancel),
            },
        }
    }
}
