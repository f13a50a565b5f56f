//! Pairwise alignment of two clusters: candidate pooling over a mass grid,
//! multiplicative pair scoring, and two interchangeable matching policies.
use std::collections::{HashMap, HashSet};

use mzpeaks::Tolerance;

use crate::cluster::Cluster;
use crate::error::AlignmentError;
use crate::feature::AlignedFeature;
use crate::ion::{charge_compatible, Quality};
use crate::sample::SampleSet;
use crate::spectral::{QueryParams, QuerySpectrum, SpectralScorer};
use crate::stats::NormalDeviation;

pub type ScoreType = f32;

/// Pair scores below this value are dropped from the candidate set
pub const SCORE_EPSILON: ScoreType = 1e-8;

/// Width of the candidate pooling grid in inverse mass units
const MASS_BIN_SCALE: f64 = 20.0;

/// How a computed score matrix is resolved into a matching
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MatchPolicy {
    /// Best-score-first bipartite matching; not globally optimal but
    /// deterministic and order-stable
    #[default]
    GreedyBipartite,
    /// Monotonic dynamic time warping over retention time order; never
    /// produces crossing assignments
    DynamicTimeWarping,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PairAlignParams {
    pub mass_tolerance: Tolerance,
    /// Hard gate on the retention time difference, in multiples of the error term
    pub rt_gate: f64,
    pub query: QueryParams,
}

impl Default for PairAlignParams {
    fn default() -> Self {
        Self {
            mass_tolerance: Tolerance::PPM(20.0),
            rt_gate: 4.0,
            query: QueryParams::default(),
        }
    }
}

/// Aligns two clusters' feature lists into one
#[derive(Debug, Clone)]
pub struct PairAligner<S: SpectralScorer> {
    pub params: PairAlignParams,
    pub policy: MatchPolicy,
    scorer: S,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ScoredPair {
    i: usize,
    j: usize,
    score: ScoreType,
}

impl<S: SpectralScorer> PairAligner<S> {
    pub fn new(params: PairAlignParams, policy: MatchPolicy, scorer: S) -> Self {
        Self {
            params,
            policy,
            scorer,
        }
    }

    /// Align `left` and `right` into a new cluster covering the union of
    /// their samples. Features not selected by the matching carry through
    /// unchanged; the result's score is the sum of all accepted pair scores.
    pub fn align(
        &self,
        left: Cluster,
        right: Cluster,
        samples: &SampleSet,
        error_term: f64,
        use_all: bool,
        keep_intermediates: bool,
    ) -> Result<Cluster, AlignmentError> {
        let cand_left = pool_candidates(&left, &right);
        let cand_right = pool_candidates(&right, &left);

        let queries_left = self.prepare_queries(&left, &cand_left, samples);
        let queries_right = self.prepare_queries(&right, &cand_right, samples);

        let mut pairs = Vec::new();
        for (ci, &i) in cand_left.iter().enumerate() {
            for (cj, &j) in cand_right.iter().enumerate() {
                if let Some(score) = self.score_pair(
                    &left.features[i],
                    &right.features[j],
                    queries_left[ci].as_ref(),
                    queries_right[cj].as_ref(),
                    samples,
                    error_term,
                    use_all,
                ) {
                    pairs.push(ScoredPair { i: ci, j: cj, score });
                }
            }
        }

        let matches = match self.policy {
            MatchPolicy::GreedyBipartite => resolve_greedy(pairs),
            MatchPolicy::DynamicTimeWarping => {
                resolve_dtw(pairs, cand_left.len(), cand_right.len())
            }
        };

        let mut total_score = 0.0f64;
        let mut used_left = vec![false; left.features.len()];
        let mut used_right = vec![false; right.features.len()];
        let mut features = Vec::with_capacity(left.len() + right.len());
        for pair in matches {
            let i = cand_left[pair.i];
            let j = cand_right[pair.j];
            features.push(left.features[i].merge(&right.features[j], samples)?);
            used_left[i] = true;
            used_right[j] = true;
            total_score += pair.score as f64;
        }
        for (k, feature) in left.features.iter().enumerate() {
            if !used_left[k] {
                features.push(feature.clone());
            }
        }
        for (k, feature) in right.features.iter().enumerate() {
            if !used_right[k] {
                features.push(feature.clone());
            }
        }

        Ok(Cluster::merged(
            features,
            total_score,
            left,
            right,
            keep_intermediates,
        ))
    }

    fn prepare_queries(
        &self,
        cluster: &Cluster,
        candidates: &[usize],
        samples: &SampleSet,
    ) -> Vec<Option<QuerySpectrum>> {
        candidates
            .iter()
            .map(|&i| {
                cluster.features[i]
                    .representative_spectrum(samples)
                    .map(|spectrum| QuerySpectrum::prepare(spectrum, &self.params.query))
                    .filter(|q| q.is_usable())
            })
            .collect()
    }

    /// Score one candidate pair, `None` when the pair does not qualify
    #[allow(clippy::too_many_arguments)]
    fn score_pair(
        &self,
        l: &AlignedFeature,
        r: &AlignedFeature,
        lq: Option<&QuerySpectrum>,
        rq: Option<&QuerySpectrum>,
        samples: &SampleSet,
        error_term: f64,
        use_all: bool,
    ) -> Option<ScoreType> {
        if !self.params.mass_tolerance.test(l.mass, r.mass) {
            return None;
        }
        let drt = l.rt - r.rt;
        if drt.abs() >= self.params.rt_gate * error_term {
            return None;
        }
        if !charge_compatible(l.charge_state, r.charge_state) {
            return None;
        }

        let effective = error_term * 0.66;
        let gamma =
            1.0 / (2.0 * (effective * effective + (l.rt_variance + r.rt_variance) / 2.0));
        let rt_sq = drt * drt;

        let mut shape_score = peak_width_ratio_score(l, r, samples);
        shape_score *= intensity_score(l, r);

        let value = match (lq, rq) {
            (Some(a), Some(b)) => {
                let sim = self.scorer.similarity(a, b);
                if sim.score < 0.5 || sim.shared_peaks < 3 {
                    // prefer to not align features with a low cosine; when
                    // either side is independently good quality the pair is
                    // rejected outright rather than down-weighted
                    if a.quality > Quality::Decent || b.quality > Quality::Decent {
                        return None;
                    }
                    shape_score * (-2.0 * gamma * rt_sq).exp() * 0.25
                } else {
                    shape_score
                        * (sim.score as f64 + sim.shared_peaks as f64 / 10.0)
                        * (-gamma * rt_sq).exp()
                }
            }
            _ if use_all => shape_score * (-gamma * rt_sq).exp() * 0.25,
            _ => return None,
        };

        (value >= SCORE_EPSILON as f64).then_some(value as ScoreType)
    }
}

/// Mean peak width ratio over all cross ion pairs, converted to a two-sided
/// error probability under a unit-mean normal model. Ratios below 1 go
/// unpenalized.
fn peak_width_ratio_score(l: &AlignedFeature, r: &AlignedFeature, samples: &SampleSet) -> f64 {
    let left_widths: Vec<f64> = l.iter_ions(samples).map(|(_, ion)| ion.peak_width()).collect();
    let right_widths: Vec<f64> = r.iter_ions(samples).map(|(_, ion)| ion.peak_width()).collect();
    let mut sum = 0.0;
    let mut n = 0usize;
    for &wa in left_widths.iter() {
        for &wb in right_widths.iter() {
            if wa <= 0.0 || wb <= 0.0 {
                continue;
            }
            sum += if wa >= wb { wa / wb } else { wb / wa };
            n += 1;
        }
    }
    if n == 0 {
        return 1.0;
    }
    let mean = sum / n as f64;
    if mean >= 1.0 {
        NormalDeviation::new(1.0, 0.25).error_probability(mean)
    } else {
        1.0
    }
}

/// Penalize large simultaneous height and width mismatches, floored at 0.05
fn intensity_score(l: &AlignedFeature, r: &AlignedFeature) -> f64 {
    if l.peak_height <= 0.0 || r.peak_height <= 0.0 || l.peak_width <= 0.0 || r.peak_width <= 0.0 {
        return 1.0;
    }
    let h = (l.peak_height / r.peak_height).ln().powi(2);
    let w = (l.peak_width / r.peak_width).ln().powi(2);
    (-1.5 * h * w).exp().max(0.05)
}

/// Indices of the features that share a mass grid bin with the other side
fn pool_candidates(cluster: &Cluster, other: &Cluster) -> Vec<usize> {
    let other_bins: HashSet<i64> = other.features.iter().flat_map(|f| mass_bins(f.mass)).collect();
    cluster
        .features
        .iter()
        .enumerate()
        .filter(|(_, f)| mass_bins(f.mass).iter().any(|b| other_bins.contains(b)))
        .map(|(i, _)| i)
        .collect()
}

fn mass_bins(mass: f64) -> [i64; 2] {
    let scaled = mass * MASS_BIN_SCALE;
    [scaled.floor() as i64, scaled.ceil() as i64]
}

/// Best-score-first bipartite matching: triples ordered by score descending,
/// ties by left index then right index; each endpoint used at most once
fn resolve_greedy(mut pairs: Vec<ScoredPair>) -> Vec<ScoredPair> {
    pairs.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.i.cmp(&b.i))
            .then(a.j.cmp(&b.j))
    });
    let mut used_left = HashSet::new();
    let mut used_right = HashSet::new();
    let mut accepted = Vec::new();
    for pair in pairs {
        if used_left.contains(&pair.i) || used_right.contains(&pair.j) {
            continue;
        }
        used_left.insert(pair.i);
        used_right.insert(pair.j);
        accepted.push(pair);
    }
    accepted
}

/// Monotonic dynamic time warping: maximize the summed score over
/// non-crossing pairs of the retention-time-ordered candidate lists, then
/// backtrack from the global maximum, preferring the diagonal on ties
fn resolve_dtw(pairs: Vec<ScoredPair>, nl: usize, nr: usize) -> Vec<ScoredPair> {
    if nl == 0 || nr == 0 || pairs.is_empty() {
        return Vec::new();
    }
    let scores: HashMap<(usize, usize), ScoreType> =
        pairs.into_iter().map(|p| ((p.i, p.j), p.score)).collect();
    let lookup = |i: usize, j: usize| scores.get(&(i, j)).copied().unwrap_or(0.0).max(0.0);

    let width = nr + 1;
    let mut table = vec![0.0f32; (nl + 1) * width];
    for i in 1..=nl {
        for j in 1..=nr {
            let diagonal = table[(i - 1) * width + (j - 1)] + lookup(i - 1, j - 1);
            let gap_left = table[(i - 1) * width + j];
            let gap_right = table[i * width + (j - 1)];
            table[i * width + j] = diagonal.max(gap_left).max(gap_right);
        }
    }

    // the backtrack starts from the first global maximum in row-major order
    let mut best = 0.0f32;
    let (mut i, mut j) = (0usize, 0usize);
    for row in 1..=nl {
        for col in 1..=nr {
            if table[row * width + col] > best {
                best = table[row * width + col];
                i = row;
                j = col;
            }
        }
    }
    if best <= 0.0 {
        return Vec::new();
    }

    let mut accepted = Vec::new();
    while i > 0 && j > 0 {
        let score = lookup(i - 1, j - 1);
        let diagonal = table[(i - 1) * width + (j - 1)] + score;
        if score > 0.0 && table[i * width + j] == diagonal {
            accepted.push(ScoredPair {
                i: i - 1,
                j: j - 1,
                score,
            });
            i -= 1;
            j -= 1;
        } else if table[(i - 1) * width + j] >= table[i * width + (j - 1)] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    accepted.reverse();
    accepted
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion::{Ion, MsSpectrum, PeakShape};
    use crate::sample::SampleId;
    use crate::spectral::IntensityWeightedCosine;
    use mzpeaks::peak::MZPoint;

    fn shape(apex: f64) -> PeakShape {
        PeakShape::new(apex, apex - 5.0, apex + 5.0, 4.0, Quality::Good)
    }

    fn msms(tic: f32) -> MsSpectrum {
        let peaks = (0..8)
            .map(|i| MZPoint::new(100.0 + 15.0 * i as f64, 10.0 + i as f32))
            .collect();
        MsSpectrum::new(peaks, tic, Quality::Good)
    }

    fn aligner() -> PairAligner<IntensityWeightedCosine> {
        PairAligner::new(
            PairAlignParams::default(),
            MatchPolicy::GreedyBipartite,
            IntensityWeightedCosine::default(),
        )
    }

    #[test]
    fn test_two_sample_scenario() {
        let samples = SampleSet::from_runs(vec![
            (
                "a".into(),
                vec![Ion::new(300.10, 120.0, 1, 1000.0, shape(120.0)).with_msms(msms(1000.0))],
            ),
            (
                "b".into(),
                vec![Ion::new(300.102, 122.0, 1, 800.0, shape(122.0)).with_msms(msms(800.0))],
            ),
        ]);
        let left = Cluster::leaf(&samples, samples.get(SampleId(0)), false);
        let right = Cluster::leaf(&samples, samples.get(SampleId(1)), false);
        let merged = aligner()
            .align(left, right, &samples, 5.0, false, true)
            .unwrap();
        assert_eq!(merged.len(), 1);
        let feature = &merged.features[0];
        assert_eq!(feature.len(), 2);
        assert_eq!(feature.charge_state, 1);
        assert_eq!(feature.representative, Some(SampleId(0)));
        assert!(merged.score > 0.0);
        assert!(merged.check_sample_partition());
    }

    #[test]
    fn test_charge_conflict_pairs_never_align() {
        let samples = SampleSet::from_runs(vec![
            (
                "c".into(),
                vec![Ion::new(300.10, 120.0, 2, 1000.0, shape(120.0)).with_msms(msms(1000.0))],
            ),
            (
                "d".into(),
                vec![Ion::new(300.10, 120.0, 1, 800.0, shape(120.0)).with_msms(msms(800.0))],
            ),
        ]);
        let left = Cluster::leaf(&samples, samples.get(SampleId(0)), false);
        let right = Cluster::leaf(&samples, samples.get(SampleId(1)), false);
        let merged = aligner()
            .align(left, right, &samples, 5.0, false, true)
            .unwrap();
        // both features carry through unaligned
        assert_eq!(merged.len(), 2);
        assert!(merged.features.iter().all(|f| f.len() == 1));
        assert_eq!(merged.score, 0.0);
    }

    #[test]
    fn test_mass_gate_blocks_distant_masses() {
        let samples = SampleSet::from_runs(vec![
            (
                "a".into(),
                vec![Ion::new(300.10, 120.0, 1, 1000.0, shape(120.0)).with_msms(msms(1000.0))],
            ),
            (
                "b".into(),
                vec![Ion::new(301.10, 120.0, 1, 800.0, shape(120.0)).with_msms(msms(800.0))],
            ),
        ]);
        let left = Cluster::leaf(&samples, samples.get(SampleId(0)), false);
        let right = Cluster::leaf(&samples, samples.get(SampleId(1)), false);
        let merged = aligner()
            .align(left, right, &samples, 5.0, false, true)
            .unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_greedy_never_reuses_an_endpoint() {
        let pairs = vec![
            ScoredPair { i: 0, j: 0, score: 0.9 },
            ScoredPair { i: 0, j: 1, score: 0.8 },
            ScoredPair { i: 1, j: 0, score: 0.7 },
            ScoredPair { i: 1, j: 1, score: 0.1 },
        ];
        let accepted = resolve_greedy(pairs);
        assert_eq!(accepted.len(), 2);
        let mut lefts: Vec<_> = accepted.iter().map(|p| p.i).collect();
        let mut rights: Vec<_> = accepted.iter().map(|p| p.j).collect();
        lefts.dedup();
        rights.sort_unstable();
        rights.dedup();
        assert_eq!(lefts.len(), 2);
        assert_eq!(rights.len(), 2);
    }

    #[test]
    fn test_greedy_tie_break_is_by_index() {
        let pairs = vec![
            ScoredPair { i: 1, j: 0, score: 0.5 },
            ScoredPair { i: 0, j: 1, score: 0.5 },
        ];
        let accepted = resolve_greedy(pairs);
        assert_eq!(accepted[0].i, 0);
        assert_eq!(accepted[0].j, 1);
    }

    #[test]
    fn test_dtw_never_crosses() {
        // the crossing assignment (0,1)/(1,0) would score higher pairwise,
        // but DTW must stay monotonic
        let pairs = vec![
            ScoredPair { i: 0, j: 1, score: 0.9 },
            ScoredPair { i: 1, j: 0, score: 0.9 },
            ScoredPair { i: 0, j: 0, score: 0.5 },
            ScoredPair { i: 1, j: 1, score: 0.5 },
        ];
        let accepted = resolve_dtw(pairs, 2, 2);
        for a in accepted.iter() {
            for b in accepted.iter() {
                assert!(!(a.i < b.i && a.j > b.j), "crossing pair {a:?} {b:?}");
            }
        }
        assert!(!accepted.is_empty());
    }

    #[test]
    fn test_dtw_takes_the_monotonic_chain() {
        let pairs = vec![
            ScoredPair { i: 0, j: 0, score: 0.6 },
            ScoredPair { i: 1, j: 1, score: 0.7 },
            ScoredPair { i: 2, j: 2, score: 0.8 },
        ];
        let accepted = resolve_dtw(pairs, 3, 3);
        assert_eq!(accepted.len(), 3);
        assert!((accepted.iter().map(|p| p.score).sum::<f32>() - 2.1).abs() < 1e-6);
    }
}
