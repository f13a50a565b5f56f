//! Retention time recalibration between alignment rounds.
//!
//! Every sample gets a smooth monotone mapping from its raw retention time
//! axis onto the cohort consensus axis, fitted from anchor features that
//! aligned confidently across more than one sample.
use itertools::Itertools;
use rayon::prelude::*;

use crate::cluster::Cluster;
use crate::error::AlignmentError;
use crate::ion::Quality;
use crate::sample::{Sample, SampleId, SampleSet};
use crate::stats::{median, trimmed_mean};

/// The smallest number of real anchors needed to fit a recalibration curve
pub const MIN_ANCHORS: usize = 20;

/// Fraction of the anchors contributing to each local regression
const LOESS_BANDWIDTH: f64 = 0.3;

/// A mapping from a sample's raw retention time axis onto the cohort
/// consensus axis
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RtMapping {
    #[default]
    Identity,
    Linear {
        slope: f64,
        intercept: f64,
    },
    /// A monotone piecewise-linear curve through fitted anchor points;
    /// `xs` is strictly increasing
    Interpolated {
        xs: Vec<f64>,
        ys: Vec<f64>,
    },
}

impl RtMapping {
    pub fn apply(&self, rt: f64) -> f64 {
        match self {
            Self::Identity => rt,
            Self::Linear { slope, intercept } => slope * rt + intercept,
            Self::Interpolated { xs, ys } => interpolate(xs, ys, rt),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Identity)
    }
}

/// Piecewise-linear interpolation, extrapolating with the boundary segment
/// slopes outside the anchor range
fn interpolate(xs: &[f64], ys: &[f64], t: f64) -> f64 {
    debug_assert!(xs.len() == ys.len() && xs.len() >= 2);
    let segment = match xs.binary_search_by(|x| x.total_cmp(&t)) {
        Ok(i) => return ys[i],
        Err(0) => 0,
        Err(i) if i >= xs.len() => xs.len() - 2,
        Err(i) => i - 1,
    };
    let (x0, x1) = (xs[segment], xs[segment + 1]);
    let (y0, y1) = (ys[segment], ys[segment + 1]);
    if x1 == x0 {
        return y0;
    }
    y0 + (t - x0) * (y1 - y0) / (x1 - x0)
}

/// Recorded on a sample when recalibration had too few anchors and fell back
/// to the identity mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LowConfidenceAlignment {
    /// How many anchors this sample had
    pub anchors: usize,
    /// The median anchor count across the cohort, for comparison
    pub median_anchors: usize,
}

/// Estimate the initial retention time error term from ion spacing alone.
///
/// Within each sample the ions are sorted by retention time and, from the
/// 5th ion on, the absolute gaps to the 1st through 4th predecessors are
/// collected; the per-sample medians are combined by a global median. A
/// non-positive outcome marks degenerate input and surfaces as an error.
pub fn estimate_error_term(samples: &SampleSet) -> Result<f64, AlignmentError> {
    let mut per_sample = Vec::new();
    for sample in samples.iter() {
        let mut rts: Vec<f64> = sample.iter_detected().map(|(_, ion)| ion.rt).collect();
        if rts.len() < 5 {
            continue;
        }
        rts.sort_unstable_by(|a, b| a.total_cmp(b));
        let mut gaps = Vec::with_capacity((rts.len() - 4) * 4);
        for i in 4..rts.len() {
            for k in 1..=4 {
                gaps.push((rts[i] - rts[i - k]).abs());
            }
        }
        per_sample.push(median(&mut gaps));
    }
    if per_sample.is_empty() {
        return Err(AlignmentError::DegenerateErrorTerm(0.0));
    }
    let error = median(&mut per_sample);
    if error > 0.0 {
        Ok(error)
    } else {
        Err(AlignmentError::DegenerateErrorTerm(error))
    }
}

/// One sample's fitted outcome, applied only after every sub-task joined
struct Fitted {
    id: SampleId,
    mapping: Option<RtMapping>,
    low_confidence: Option<LowConfidenceAlignment>,
}

/// Refit every sample's recalibration function against the current cluster.
///
/// Anchors are `(raw rt, consensus rt)` pairs from features aligned across
/// more than one sample whose ion in this sample has a peak shape better
/// than [`Quality::Decent`]. Samples with fewer than [`MIN_ANCHORS`] real
/// anchors keep the identity mapping and are annotated as low confidence.
pub fn recalibrate(samples: &mut SampleSet, cluster: &Cluster, error_term: f64) {
    let median_anchors = median_anchor_count(samples, cluster);
    let max_rt = samples.iter().map(|s| s.max_rt).fold(0.0, f64::max) + 10.0 * error_term;

    let fitted: Vec<Fitted> = {
        let shared: &SampleSet = samples;
        shared
            .as_slice()
            .par_iter()
            .map(|sample| fit_sample(sample, cluster, median_anchors, max_rt))
            .collect()
    };

    for fit in fitted {
        let sample = samples.get_mut(fit.id);
        if let Some(mapping) = fit.mapping {
            sample.set_recalibration(mapping);
        }
        sample.low_confidence = fit.low_confidence;
    }
}

fn fit_sample(sample: &Sample, cluster: &Cluster, median_anchors: usize, max_rt: f64) -> Fitted {
    let mut anchors: Vec<(f64, f64)> = Vec::new();
    for feature in cluster.features.iter() {
        if feature.len() < 2 {
            continue;
        }
        if let Some(index) = feature.ion_in(sample.id) {
            let ion = sample.ion(index);
            if ion.shape.quality > Quality::Decent {
                anchors.push((ion.rt, feature.rt));
            }
        }
    }
    let real_anchors = anchors.len();
    if real_anchors < MIN_ANCHORS {
        tracing::info!(
            "not enough aligned features to recalibrate {} ({} anchors, cohort median {})",
            sample.name,
            real_anchors,
            median_anchors
        );
        return Fitted {
            id: sample.id,
            mapping: Some(RtMapping::Identity),
            low_confidence: Some(LowConfidenceAlignment {
                anchors: real_anchors,
                median_anchors,
            }),
        };
    }
    // pin the curve down at the axis endpoints
    anchors.push((0.0, 0.0));
    anchors.push((max_rt, max_rt));
    let (xs, ys) = dedup_anchors(anchors);
    let fitted_ys = monotone(loess(&xs, &ys, LOESS_BANDWIDTH));
    tracing::debug!("recalibrated {} from {} anchors", sample.name, real_anchors);
    Fitted {
        id: sample.id,
        mapping: Some(RtMapping::Interpolated { xs, ys: fitted_ys }),
        low_confidence: None,
    }
}

/// The stricter gross-drift variant: a robust linear fit over
/// `(raw peak boundary, consensus peak boundary)` pairs from both segment
/// edges. Samples with fewer than [`MIN_ANCHORS`] pairs are left untouched.
pub fn recalibrate_linear(samples: &mut SampleSet, cluster: &Cluster) {
    // consensus boundaries per multi-sample feature, computed once up front
    let consensus: Vec<Option<(f64, f64)>> = cluster
        .features
        .iter()
        .map(|feature| {
            if feature.len() < 2 {
                return None;
            }
            let mut starts = Vec::with_capacity(feature.len());
            let mut ends = Vec::with_capacity(feature.len());
            for (id, ion) in feature.iter_ions(samples) {
                let owner = samples.get(id);
                starts.push(owner.recalibrated_rt(ion.shape.start));
                ends.push(owner.recalibrated_rt(ion.shape.end));
            }
            Some((trimmed_mean(&mut starts), trimmed_mean(&mut ends)))
        })
        .collect();

    let fitted: Vec<Fitted> = {
        let shared: &SampleSet = samples;
        shared
            .as_slice()
            .par_iter()
            .map(|sample| {
                let mut xs = Vec::new();
                let mut ys = Vec::new();
                for (feature, bounds) in cluster.features.iter().zip(consensus.iter()) {
                    let (Some(index), Some((start, end))) = (feature.ion_in(sample.id), bounds)
                    else {
                        continue;
                    };
                    let shape = sample.ion(index).shape;
                    xs.push(shape.start);
                    ys.push(*start);
                    xs.push(shape.end);
                    ys.push(*end);
                }
                let mapping = if xs.len() >= MIN_ANCHORS {
                    median_linear(&xs, &ys)
                } else {
                    None
                };
                Fitted {
                    id: sample.id,
                    mapping,
                    low_confidence: None,
                }
            })
            .collect()
    };

    for fit in fitted {
        if let Some(mapping) = fit.mapping {
            samples.get_mut(fit.id).set_recalibration(mapping);
        }
    }
}

/// A linear fit robust to outliers: the median of all pairwise slopes and
/// the median of the implied intercepts
fn median_linear(xs: &[f64], ys: &[f64]) -> Option<RtMapping> {
    let mut slopes: Vec<f64> = (0..xs.len())
        .tuple_combinations::<(usize, usize)>()
        .filter(|(i, j)| xs[*j] != xs[*i])
        .map(|(i, j)| (ys[j] - ys[i]) / (xs[j] - xs[i]))
        .collect();
    if slopes.is_empty() {
        return None;
    }
    let slope = median(&mut slopes);
    let mut intercepts: Vec<f64> = xs
        .iter()
        .zip(ys.iter())
        .map(|(x, y)| y - slope * x)
        .collect();
    let intercept = median(&mut intercepts);
    Some(RtMapping::Linear { slope, intercept })
}

fn median_anchor_count(samples: &SampleSet, cluster: &Cluster) -> usize {
    let mut counts = vec![0usize; samples.len()];
    for feature in cluster.features.iter() {
        if feature.len() < 2 {
            continue;
        }
        for id in feature.sample_ids() {
            counts[id.0 as usize] += 1;
        }
    }
    counts.sort_unstable();
    if counts.is_empty() {
        0
    } else {
        counts[counts.len() / 2]
    }
}

/// Sort anchors by raw rt and average duplicates so the xs are strictly
/// increasing
fn dedup_anchors(mut anchors: Vec<(f64, f64)>) -> (Vec<f64>, Vec<f64>) {
    anchors.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    let mut xs: Vec<f64> = Vec::with_capacity(anchors.len());
    let mut ys: Vec<f64> = Vec::with_capacity(anchors.len());
    let mut counts: Vec<usize> = Vec::with_capacity(anchors.len());
    for (x, y) in anchors {
        match xs.last() {
            Some(last) if *last == x => {
                let k = ys.len() - 1;
                let n = counts[k] as f64;
                ys[k] = (ys[k] * n + y) / (n + 1.0);
                counts[k] += 1;
            }
            _ => {
                xs.push(x);
                ys.push(y);
                counts.push(1);
            }
        }
    }
    (xs, ys)
}

/// Tricube-weighted local linear regression at every anchor; `xs` must be
/// sorted ascending
fn loess(xs: &[f64], ys: &[f64], bandwidth: f64) -> Vec<f64> {
    let n = xs.len();
    let k = ((bandwidth * n as f64).ceil() as usize).clamp(2, n);
    let mut fitted = Vec::with_capacity(n);
    for i in 0..n {
        // the window of the k nearest anchors around xs[i]
        let (mut lo, mut hi) = (i, i);
        while hi - lo + 1 < k {
            let extend_left =
                lo > 0 && (hi + 1 >= n || xs[i] - xs[lo - 1] <= xs[hi + 1] - xs[i]);
            if extend_left {
                lo -= 1;
            } else {
                hi += 1;
            }
        }
        let dmax = (xs[i] - xs[lo]).abs().max((xs[hi] - xs[i]).abs());
        let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for j in lo..=hi {
            let d = if dmax > 0.0 {
                (xs[j] - xs[i]).abs() / dmax
            } else {
                0.0
            };
            let w = (1.0 - d.powi(3)).max(0.0).powi(3);
            sw += w;
            swx += w * xs[j];
            swy += w * ys[j];
            swxx += w * xs[j] * xs[j];
            swxy += w * xs[j] * ys[j];
        }
        let denom = sw * swxx - swx * swx;
        let value = if denom.abs() < 1e-12 {
            swy / sw
        } else {
            let slope = (sw * swxy - swx * swy) / denom;
            let intercept = (swy - slope * swx) / sw;
            intercept + slope * xs[i]
        };
        fitted.push(value);
    }
    fitted
}

/// Enforce a non-decreasing sequence by pooling adjacent violators
fn monotone(ys: Vec<f64>) -> Vec<f64> {
    let n = ys.len();
    let mut level: Vec<f64> = Vec::with_capacity(n);
    let mut weight: Vec<usize> = Vec::with_capacity(n);
    for value in ys {
        let mut value = value;
        let mut w = 1usize;
        while let Some(&last) = level.last() {
            if last <= value {
                break;
            }
            let lw = weight.pop().expect("weight follows level");
            level.pop();
            value = (value * w as f64 + last * lw as f64) / (w + lw) as f64;
            w += lw;
        }
        level.push(value);
        weight.push(w);
    }
    let mut out = Vec::with_capacity(n);
    for (value, w) in level.into_iter().zip(weight) {
        out.extend(std::iter::repeat(value).take(w));
    }
    debug_assert_eq!(out.len(), n);
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion::{Ion, PeakShape};
    use crate::sample::SampleId;

    fn shape(apex: f64, quality: Quality) -> PeakShape {
        PeakShape::new(apex, apex - 5.0, apex + 5.0, 4.0, quality)
    }

    #[test]
    fn test_error_term_ignores_the_first_four_ions() {
        let ions = [0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0]
            .iter()
            .map(|rt| Ion::new(300.0 + rt, *rt, 1, 100.0, shape(*rt, Quality::Good)))
            .collect();
        let samples = SampleSet::from_runs(vec![("a".into(), ions)]);
        let error = estimate_error_term(&samples).unwrap();
        assert_eq!(error, 25.0);
    }

    #[test]
    fn test_error_term_degenerate_input() {
        let ions = (0..7)
            .map(|_| Ion::new(300.0, 50.0, 1, 100.0, shape(50.0, Quality::Good)))
            .collect();
        let samples = SampleSet::from_runs(vec![("a".into(), ions)]);
        assert_eq!(
            estimate_error_term(&samples).unwrap_err(),
            AlignmentError::DegenerateErrorTerm(0.0)
        );
    }

    #[test]
    fn test_interpolated_mapping() {
        let mapping = RtMapping::Interpolated {
            xs: vec![0.0, 10.0, 20.0],
            ys: vec![0.0, 12.0, 22.0],
        };
        assert_eq!(mapping.apply(10.0), 12.0);
        assert_eq!(mapping.apply(5.0), 6.0);
        assert_eq!(mapping.apply(15.0), 17.0);
        // extrapolation continues the boundary segment
        assert_eq!(mapping.apply(30.0), 32.0);
    }

    #[test]
    fn test_monotone_pooling() {
        let pooled = monotone(vec![1.0, 3.0, 2.0, 4.0]);
        assert!(pooled.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(pooled[1], pooled[2]);
        assert_eq!(pooled.len(), 4);
    }

    #[test]
    fn test_loess_recovers_a_line() {
        let xs: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let fitted = loess(&xs, &ys, 0.3);
        for (f, y) in fitted.iter().zip(ys.iter()) {
            assert!((f - y).abs() < 1e-6, "{f} vs {y}");
        }
    }

    #[test]
    fn test_median_linear_resists_outliers() {
        let xs: Vec<f64> = (0..25).map(|i| i as f64).collect();
        let mut ys: Vec<f64> = xs.iter().map(|x| 1.5 * x + 2.0).collect();
        ys[10] = 500.0;
        let Some(RtMapping::Linear { slope, intercept }) = median_linear(&xs, &ys) else {
            panic!("expected a linear fit");
        };
        assert!((slope - 1.5).abs() < 0.05, "{slope}");
        assert!((intercept - 2.0).abs() < 0.5, "{intercept}");
    }

    #[test]
    fn test_recalibration_without_enough_anchors_is_identity() {
        let ions: Vec<Ion> = (0..5)
            .map(|i| {
                let rt = 50.0 * i as f64;
                Ion::new(300.0 + i as f64, rt, 1, 100.0, shape(rt, Quality::Good))
            })
            .collect();
        let mut samples = SampleSet::from_runs(vec![
            ("a".into(), ions.clone()),
            ("b".into(), ions),
        ]);
        // a small cluster with a handful of aligned features, below MIN_ANCHORS
        let mut features = Vec::new();
        for index in 0..5 {
            let f = crate::feature::AlignedFeature::singleton(&samples, SampleId(0), index)
                .merge_ion(SampleId(1), index, &samples)
                .unwrap();
            features.push(f);
        }
        let cluster = Cluster::root(features, 1.0, samples.ids().collect());
        recalibrate(&mut samples, &cluster, 5.0);
        for sample in samples.iter() {
            assert!(sample.recalibration.is_identity());
            assert_eq!(sample.recalibrated_rt(123.0), 123.0);
            let note = sample.low_confidence.expect("low confidence annotation");
            assert_eq!(note.anchors, 5);
            assert_eq!(note.median_anchors, 5);
        }
    }

    #[test]
    fn test_linear_recalibration_corrects_gross_drift() {
        // sample b's clock runs 2% fast relative to sample a
        let ions_a: Vec<Ion> = (0..10)
            .map(|i| {
                let rt = 50.0 * i as f64 + 50.0;
                Ion::new(300.0 + i as f64, rt, 1, 100.0, shape(rt, Quality::Good))
            })
            .collect();
        let ions_b: Vec<Ion> = (0..10)
            .map(|i| {
                let rt = 1.02 * (50.0 * i as f64 + 50.0);
                Ion::new(300.0 + i as f64, rt, 1, 100.0, shape(rt, Quality::Good))
            })
            .collect();
        let mut samples =
            SampleSet::from_runs(vec![("a".into(), ions_a), ("b".into(), ions_b)]);
        let mut features = Vec::new();
        for index in 0..10 {
            features.push(
                crate::feature::AlignedFeature::singleton(&samples, SampleId(0), index)
                    .merge_ion(SampleId(1), index, &samples)
                    .unwrap(),
            );
        }
        let cluster = Cluster::root(features, 1.0, samples.ids().collect());
        recalibrate_linear(&mut samples, &cluster);

        let b = samples.get(SampleId(1));
        let RtMapping::Linear { slope, .. } = &b.recalibration else {
            panic!("expected a linear mapping, got {:?}", b.recalibration);
        };
        assert!((slope - 1.01 / 1.02).abs() < 0.01, "{slope}");
        // a drifted raw rt lands near the halfway consensus
        let corrected = b.recalibrated_rt(1.02 * 300.0);
        assert!((corrected - 1.01 * 300.0).abs() < 2.0, "{corrected}");
    }

    #[test]
    fn test_recalibration_fits_with_enough_anchors() {
        // sample b runs 2 seconds late everywhere
        let ions_a: Vec<Ion> = (0..25)
            .map(|i| {
                let rt = 20.0 * i as f64 + 10.0;
                Ion::new(300.0 + i as f64, rt, 1, 100.0, shape(rt, Quality::Good))
            })
            .collect();
        let ions_b: Vec<Ion> = (0..25)
            .map(|i| {
                let rt = 20.0 * i as f64 + 12.0;
                Ion::new(300.0 + i as f64, rt, 1, 100.0, shape(rt, Quality::Good))
            })
            .collect();
        let mut samples =
            SampleSet::from_runs(vec![("a".into(), ions_a), ("b".into(), ions_b)]);
        let mut features = Vec::new();
        for index in 0..25 {
            features.push(
                crate::feature::AlignedFeature::singleton(&samples, SampleId(0), index)
                    .merge_ion(SampleId(1), index, &samples)
                    .unwrap(),
            );
        }
        let cluster = Cluster::root(features, 1.0, samples.ids().collect());
        recalibrate(&mut samples, &cluster, 5.0);

        let b = samples.get(SampleId(1));
        assert!(!b.recalibration.is_identity());
        assert!(b.low_confidence.is_none());
        // a late raw rt maps back toward the consensus axis
        let corrected = b.recalibrated_rt(212.0);
        assert!((corrected - 211.0).abs() < 1.0, "{corrected}");
    }
}
