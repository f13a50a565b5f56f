//! Progressive whole-cohort alignment: grow one feature table sample by
//! sample, always merging the best-scoring remaining sample next.
use std::collections::HashMap;

use mzpeaks::Tolerance;
use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::cluster::Cluster;
use crate::error::AlignmentError;
use crate::feature::AlignedFeature;
use crate::ion::charge_compatible;
use crate::sample::{IonIndex, Sample, SampleId, SampleIdSet, SampleSet};
use crate::stats::erfc;

/// Retention time differences are never trusted below this bound, in seconds
pub const MIN_RETENTION_ERROR: f64 = 3.0;

/// Width of the candidate lookup grid in inverse mass units
const MASS_BIN_SCALE: f64 = 10.0;

/// A distribution model of the retention time error between recalibrated
/// samples
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RtErrorModel {
    Laplace { scale: f64 },
    Gaussian { sigma: f64 },
}

impl RtErrorModel {
    pub fn laplace(scale: f64) -> Self {
        Self::Laplace { scale }
    }

    /// The two-sided survival probability `2·(1 - F(|diff|))` of the error
    /// distribution, the retention time match score
    pub fn survival_score(&self, diff: f64) -> f64 {
        match self {
            Self::Laplace { scale } => (-diff.abs() / scale).exp(),
            Self::Gaussian { sigma } => erfc(diff.abs() / (sigma * std::f64::consts::SQRT_2)),
        }
    }

    /// The largest retention time difference a pair may have and still be
    /// considered at all
    pub fn max_retention_error(&self) -> f64 {
        match self {
            Self::Laplace { scale } => (3.0 * scale).max(MIN_RETENTION_ERROR),
            Self::Gaussian { sigma } => 3.0 * sigma,
        }
    }

    /// The scale parameter, comparable to the error term of the pairwise
    /// aligner
    pub fn scale(&self) -> f64 {
        match self {
            Self::Laplace { scale } => *scale,
            Self::Gaussian { sigma } => *sigma,
        }
    }
}

/// One sample's proposed assignment of its ions to the current feature table
#[derive(Debug)]
struct RoundResult {
    /// Position of the sample in the remaining list
    position: usize,
    /// Per feature, the position of the assigned ion in `ions`, if any
    assignments: Vec<Option<usize>>,
    /// The candidate ion arena indices of the sample, detected then gap-filled
    ions: Vec<IonIndex>,
    score: f64,
}

/// Grows a cohort-wide feature table one sample at a time; each round every
/// remaining sample computes its assignment independently and the
/// best-scoring one is merged.
#[derive(Debug, Clone)]
pub struct ProgressiveAligner {
    pub model: RtErrorModel,
    pub mass_tolerance: Tolerance,
}

impl ProgressiveAligner {
    pub fn new(model: RtErrorModel) -> Self {
        Self {
            model,
            mass_tolerance: Tolerance::PPM(20.0),
        }
    }

    pub fn align(
        &self,
        samples: &SampleSet,
        cancel: &CancellationToken,
    ) -> Result<Cluster, AlignmentError> {
        if samples.is_empty() {
            return Err(AlignmentError::EmptyCohort);
        }
        let mut remaining: Vec<SampleId> = samples.ids().collect();
        // the sample with the most detected ions seeds the table
        remaining.sort_by_key(|id| std::cmp::Reverse(samples.get(*id).detected_len()));
        let seed = remaining.remove(0);
        let mut features: Vec<AlignedFeature> = candidate_ions(samples.get(seed))
            .into_iter()
            .map(|index| AlignedFeature::singleton(samples, seed, index))
            .collect();
        let mut total_score = 0.0f64;

        while !remaining.is_empty() {
            cancel.check()?;
            let bins = bin_features(&features);
            let results: Vec<RoundResult> = remaining
                .par_iter()
                .enumerate()
                .map(|(position, id)| {
                    self.compute_assignment(position, samples.get(*id), &features, &bins)
                })
                .collect();

            let mut best: Option<RoundResult> = None;
            for result in results {
                // ties go to the earliest remaining sample
                best = match best {
                    Some(incumbent) if result.score <= incumbent.score => Some(incumbent),
                    _ => Some(result),
                };
            }
            let winner = best.expect("at least one remaining sample");
            let id = remaining.remove(winner.position);
            tracing::debug!(
                "merging sample {id} with assignment score {:.3}",
                winner.score
            );

            let mut merged = Vec::with_capacity(features.len() + winner.ions.len());
            let mut consumed = vec![false; winner.ions.len()];
            for (feature, assignment) in features.iter().zip(winner.assignments.iter()) {
                match assignment {
                    Some(pos) => {
                        merged.push(feature.merge_ion(id, winner.ions[*pos], samples)?);
                        consumed[*pos] = true;
                    }
                    None => merged.push(feature.clone()),
                }
            }
            for (pos, index) in winner.ions.iter().enumerate() {
                if !consumed[pos] {
                    merged.push(AlignedFeature::singleton(samples, id, *index));
                }
            }
            features = merged;
            total_score += winner.score;
        }

        let merged_samples: SampleIdSet = samples.ids().collect();
        Ok(Cluster::root(features, total_score, merged_samples))
    }

    /// Greedily assign one sample's ions to the feature table, best score
    /// first, each feature and ion used at most once
    fn compute_assignment(
        &self,
        position: usize,
        sample: &Sample,
        features: &[AlignedFeature],
        bins: &HashMap<i64, Vec<usize>>,
    ) -> RoundResult {
        let ions = candidate_ions(sample);
        let mut proposals: Vec<(usize, usize, f64)> = Vec::new();
        let mut candidates: Vec<usize> = Vec::new();
        for (j, index) in ions.iter().enumerate() {
            let ion = sample.ion(*index);
            candidates.clear();
            for bin in mass_bins(ion.mass) {
                if let Some(hits) = bins.get(&bin) {
                    candidates.extend_from_slice(hits);
                }
            }
            candidates.sort_unstable();
            candidates.dedup();
            for &i in candidates.iter() {
                let score = self.score(&features[i], sample, *index);
                if score > 0.0 {
                    proposals.push((i, j, score));
                }
            }
        }
        proposals.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));

        let mut assignments: Vec<Option<usize>> = vec![None; features.len()];
        let mut assigned = vec![false; ions.len()];
        let mut score = 0.0;
        for (i, j, s) in proposals {
            if assignments[i].is_none() && !assigned[j] {
                assignments[i] = Some(j);
                assigned[j] = true;
                score += s;
            }
        }
        RoundResult {
            position,
            assignments,
            ions,
            score,
        }
    }

    fn score(&self, feature: &AlignedFeature, sample: &Sample, index: IonIndex) -> f64 {
        let ion = sample.ion(index);
        if !self.mass_tolerance.test(feature.mass, ion.mass) {
            return 0.0;
        }
        if !charge_compatible(feature.charge_state, ion.charge) {
            return 0.0;
        }
        let diff = feature.rt - sample.recalibrated_rt(ion.rt);
        if diff.abs() > self.model.max_retention_error() {
            return 0.0;
        }
        self.model.survival_score(diff)
    }
}

/// The ions a sample brings to progressive alignment: live detected ions
/// first, then gap-filled ones
fn candidate_ions(sample: &Sample) -> Vec<IonIndex> {
    sample.iter_live().map(|(index, _)| index).collect()
}

fn bin_features(features: &[AlignedFeature]) -> HashMap<i64, Vec<usize>> {
    let mut bins: HashMap<i64, Vec<usize>> = HashMap::new();
    for (i, feature) in features.iter().enumerate() {
        let [lo, hi] = mass_bins(feature.mass);
        bins.entry(lo).or_default().push(i);
        if hi != lo {
            bins.entry(hi).or_default().push(i);
        }
    }
    bins
}

fn mass_bins(mass: f64) -> [i64; 2] {
    let scaled = mass * MASS_BIN_SCALE;
    [scaled.floor() as i64, scaled.ceil() as i64]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion::{Ion, PeakShape, Quality};

    fn shape(apex: f64) -> PeakShape {
        PeakShape::new(apex, apex - 5.0, apex + 5.0, 4.0, Quality::Good)
    }

    fn ion(mass: f64, rt: f64) -> Ion {
        Ion::new(mass, rt, 1, 500.0, shape(rt))
    }

    #[test]
    fn test_survival_scores() {
        let model = RtErrorModel::laplace(2.0);
        assert!((model.survival_score(0.0) - 1.0).abs() < 1e-12);
        assert!(model.survival_score(1.0) > model.survival_score(4.0));

        let gauss = RtErrorModel::Gaussian { sigma: 2.0 };
        assert!((gauss.survival_score(0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_max_retention_error_floor() {
        assert_eq!(RtErrorModel::laplace(0.1).max_retention_error(), MIN_RETENTION_ERROR);
        assert_eq!(RtErrorModel::laplace(10.0).max_retention_error(), 30.0);
    }

    #[test]
    fn test_progressive_cohort() {
        let samples = SampleSet::from_runs(vec![
            (
                "a".into(),
                vec![ion(300.1, 100.0), ion(400.2, 200.0), ion(500.3, 300.0)],
            ),
            ("b".into(), vec![ion(300.1, 101.0), ion(400.2, 201.5)]),
            ("c".into(), vec![ion(300.1, 99.0)]),
        ]);
        let aligner = ProgressiveAligner::new(RtErrorModel::laplace(2.0));
        let cancel = CancellationToken::new();
        let cluster = aligner.align(&samples, &cancel).unwrap();
        assert_eq!(cluster.merged_samples.len(), 3);
        // three compounds, aligned across 3, 2 and 1 samples
        assert_eq!(cluster.len(), 3);
        let mut sizes: Vec<usize> = cluster.features.iter().map(|f| f.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 3]);
        assert!(cluster.score > 0.0);
    }

    #[test]
    fn test_progressive_respects_mass_gate() {
        let samples = SampleSet::from_runs(vec![
            ("a".into(), vec![ion(300.1, 100.0)]),
            ("b".into(), vec![ion(302.1, 100.0)]),
        ]);
        let aligner = ProgressiveAligner::new(RtErrorModel::laplace(2.0));
        let cluster = aligner.align(&samples, &CancellationToken::new()).unwrap();
        assert_eq!(cluster.len(), 2);
    }

    #[test]
    fn test_progressive_cancellation() {
        let samples = SampleSet::from_runs(vec![
            ("a".into(), vec![ion(300.1, 100.0)]),
            ("b".into(), vec![ion(300.1, 100.0)]),
        ]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let aligner = ProgressiveAligner::new(RtErrorModel::laplace(2.0));
        assert_eq!(
            aligner.align(&samples, &cancel).unwrap_err(),
            AlignmentError::Cancelled
        );
    }
}
