//! Gap filling: re-detect chromatographic peaks for samples that lack a
//! feature at a location where most other samples aligned one.
use mzpeaks::peak::MZPoint;
use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::cluster::Cluster;
use crate::error::AlignmentError;
use crate::feature::AlignedFeature;
use crate::ion::{Ion, PeakShape, Quality};
use crate::sample::{Sample, SampleId, SampleSet};
use crate::stats::{median, quartiles};

/// An isotope envelope must have at least this many peaks to be trusted
pub const MIN_ISOTOPE_PEAKS: usize = 2;

/// The widening search sub-windows, narrowest first
const WINDOW_DIVISORS: [f64; 3] = [4.0, 2.0, 1.0];

/// One chromatographic segment reported by the peak detector
#[derive(Debug, Clone)]
pub struct TraceSegment {
    pub shape: PeakShape,
    /// Apex intensity of the segment
    pub intensity: f32,
    pub isotopes: Vec<MZPoint>,
}

/// The outcome of re-running peak detection at a target mass
#[derive(Debug, Clone)]
pub struct DetectedTrace {
    /// The measured mass of the extracted trace
    pub mass: f64,
    pub segments: Vec<TraceSegment>,
}

/// The boundary to the external peak picking collaborator.
///
/// Windows are given on the recalibrated (consensus) time axis; candidate
/// segments come back on the sample's raw axis and are validated against the
/// window after recalibration.
pub trait PeakDetector: Sync {
    /// Re-run peak detection over `window` at `target_mass`
    fn detect_peak(
        &self,
        sample: &Sample,
        window: (f64, f64),
        target_mass: f64,
    ) -> Option<DetectedTrace>;

    /// The segments the initial segmentation already produced in `window`;
    /// candidates coinciding with one of these are not re-detections
    fn segments_in_window(&self, sample: &Sample, window: (f64, f64)) -> Vec<PeakShape>;

    /// Called before a pass over `sample`; implementations may page the
    /// sample's raw scans into an in-memory cache here
    fn begin_sample(&mut self, _sample: &Sample) {}

    /// Always called when the pass over `sample` ends, releasing whatever
    /// `begin_sample` acquired
    fn end_sample(&mut self, _sample: &Sample) {}
}

/// Keeps the paired begin/end paging calls balanced even when a pass ends
/// early
struct ScanScope<'d, 's, D: PeakDetector> {
    detector: &'d mut D,
    sample: &'s Sample,
}

impl<'d, 's, D: PeakDetector> ScanScope<'d, 's, D> {
    fn open(detector: &'d mut D, sample: &'s Sample) -> Self {
        detector.begin_sample(sample);
        Self { detector, sample }
    }

    fn detector(&self) -> &D {
        self.detector
    }
}

impl<'d, 's, D: PeakDetector> Drop for ScanScope<'d, 's, D> {
    fn drop(&mut self) {
        self.detector.end_sample(self.sample);
    }
}

/// Searches each sample's chromatogram for features it failed to detect
#[derive(Debug, Clone, Copy)]
pub struct GapFiller {
    /// The cohort retention time error term in seconds
    pub error_term: f64,
    /// The cluster's estimated peak shape error, scaling the width gate
    pub peak_shape_error: f64,
    /// The quality bar a feature's most abundant detected ion must clear for
    /// the feature to be extrapolated from at all
    pub min_source_quality: Quality,
    /// Require candidate segments to pass the same shape bar as regular ions
    pub only_good_shapes: bool,
}

/// A verified candidate, queued until the parallel search over a sample has
/// joined
struct Registration {
    feature_index: usize,
    ion: Ion,
}

impl GapFiller {
    pub fn new(
        error_term: f64,
        peak_shape_error: f64,
        min_source_quality: Quality,
        only_good_shapes: bool,
    ) -> Self {
        Self {
            error_term,
            peak_shape_error,
            min_source_quality,
            only_good_shapes,
        }
    }

    /// Fill gaps in `cluster` against every sample. Candidate search per
    /// sample runs read-only in parallel over the features; registration
    /// mutates the sample and the feature list sequentially afterwards.
    pub fn fill<D: PeakDetector>(
        &self,
        cluster: Cluster,
        samples: &mut SampleSet,
        detector: &mut D,
        cancel: &CancellationToken,
    ) -> Result<Cluster, AlignmentError> {
        let Cluster {
            mut features,
            score,
            left,
            right,
            merged_samples,
        } = cluster;

        let ids: Vec<SampleId> = samples.ids().collect();
        let mut filled = 0usize;
        for id in ids {
            cancel.check()?;

            let registrations: Vec<Registration> = {
                let shared: &SampleSet = samples;
                let sample = shared.get(id);
                let scope = ScanScope::open(detector, sample);
                features
                    .par_iter()
                    .enumerate()
                    .filter_map(|(feature_index, feature)| {
                        self.try_fill(feature, sample, shared, scope.detector())
                            .map(|ion| Registration { feature_index, ion })
                    })
                    .collect()
            };

            for registration in registrations {
                let Registration { feature_index, ion } = registration;
                let feature = &features[feature_index];
                // an earlier, farther gap-filled guess gives way to this one
                let replaced = match feature.ion_in(id) {
                    Some(old_index) => match feature.without_sample(id, samples) {
                        Some(stripped) => {
                            samples.get_mut(id).mark_dead(old_index);
                            stripped
                        }
                        None => continue,
                    },
                    None => feature.clone(),
                };
                let index = samples.get_mut(id).push_gap_filled(ion);
                match replaced.merge_ion(id, index, samples) {
                    Ok(merged) => {
                        features[feature_index] = merged;
                        filled += 1;
                    }
                    Err(e) => {
                        tracing::warn!("discarding gap-filled ion: {e}");
                        samples.get_mut(id).mark_dead(index);
                    }
                }
            }
        }
        tracing::info!("gap filling registered {filled} interpolated ions");

        features.sort_by(|a, b| a.rt.total_cmp(&b.rt));
        Ok(Cluster {
            features,
            score,
            left,
            right,
            merged_samples,
        })
    }

    /// Search one (feature, sample) pair, returning a verified candidate ion
    /// or nothing. Either outcome is terminal; failure is recorded, never an
    /// error.
    fn try_fill<D: PeakDetector>(
        &self,
        feature: &AlignedFeature,
        sample: &Sample,
        samples: &SampleSet,
        detector: &D,
    ) -> Option<Ion> {
        match feature.ion_in(sample.id) {
            // a detected ion is never second-guessed
            Some(index) if !sample.ion(index).gap_filled => return None,
            _ => {}
        }

        let (_, source) = feature.most_abundant_detected(samples)?;
        if source.shape.quality < self.min_source_quality
            || source.isotopes.len() < MIN_ISOTOPE_PEAKS
        {
            return None;
        }

        let mut rts: Vec<f64> = feature
            .iter_ions(samples)
            .map(|(id, ion)| samples.get(id).recalibrated_rt(ion.rt))
            .collect();
        let (q25, q75) = quartiles(&mut rts);
        let mid = median(&mut rts);
        let half = (mid - (q25 - self.error_term)).max((q75 + self.error_term) - mid);

        // a previous guess only gives way to a candidate closer to the window median
        let beat = feature
            .ion_in(sample.id)
            .map(|index| (sample.recalibrated_rt(sample.ion(index).rt) - mid).abs());

        for divisor in WINDOW_DIVISORS {
            let window = (mid - half / divisor, mid + half / divisor);
            if let Some(ion) =
                self.detect_in_window(feature, sample, samples, detector, window, mid, beat)
            {
                return Some(ion);
            }
        }
        tracing::debug!(
            "feature at m/z {:.4} rt {:.1} stays unrepresented in {}",
            feature.mass,
            feature.rt,
            sample.name
        );
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn detect_in_window<D: PeakDetector>(
        &self,
        feature: &AlignedFeature,
        sample: &Sample,
        samples: &SampleSet,
        detector: &D,
        window: (f64, f64),
        mid: f64,
        beat: Option<f64>,
    ) -> Option<Ion> {
        let trace = detector.detect_peak(sample, window, feature.mass)?;
        let known = detector.segments_in_window(sample, window);

        let existing_widths: Vec<f64> = feature
            .iter_ions(samples)
            .filter(|(_, ion)| !ion.gap_filled)
            .map(|(_, ion)| ion.peak_width())
            .collect();

        let mut best: Option<(TraceSegment, f64)> = None;
        for segment in trace.segments {
            let apex = sample.recalibrated_rt(segment.shape.apex);
            if apex < window.0 || apex > window.1 {
                continue;
            }
            if known.iter().any(|k| k.same_segment(&segment.shape))
                || sample
                    .iter_live()
                    .any(|(_, ion)| ion.shape.same_segment(&segment.shape))
            {
                continue;
            }
            if segment.isotopes.len() < MIN_ISOTOPE_PEAKS {
                continue;
            }
            if self.only_good_shapes && segment.shape.quality < Quality::Decent {
                continue;
            }
            if !existing_widths.is_empty() {
                let deviation = existing_widths
                    .iter()
                    .map(|w| (segment.shape.full_width_half_max - w).abs())
                    .sum::<f64>()
                    / existing_widths.len() as f64;
                if deviation > 4.0 * self.peak_shape_error {
                    continue;
                }
            }
            let distance = (apex - mid).abs();
            if beat.map(|b| distance >= b).unwrap_or(false) {
                continue;
            }
            if best.as_ref().map(|(_, d)| distance < *d).unwrap_or(true) {
                best = Some((segment, distance));
            }
        }

        best.map(|(segment, _)| {
            let mut ion = Ion::new(
                trace.mass,
                segment.shape.apex,
                feature.charge_state,
                segment.intensity,
                segment.shape,
            );
            ion.isotopes = segment.isotopes;
            ion
        })
    }
}
