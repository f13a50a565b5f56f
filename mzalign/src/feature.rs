//! The cross-sample aggregate of one chemical entity
use crate::error::AlignmentError;
use crate::ion::{charge_compatible, Ion, MsSpectrum};
use crate::sample::{IonIndex, SampleId, SampleMap, SampleSet};
use crate::stats::{trimmed_mean, variance};

/// One chemical entity observed across one or more samples.
///
/// Instances are immutable: [`AlignedFeature::merge`] returns a new feature
/// and never mutates its operands.
#[derive(Debug, Clone)]
pub struct AlignedFeature {
    /// Which ion represents this entity in each sample. Keys are unique by
    /// construction; a duplicate after a merge is an algorithm bug.
    features: SampleMap<IonIndex>,
    /// Robust average neutral mass in Daltons
    pub mass: f64,
    /// Robust average recalibrated retention time in seconds
    pub rt: f64,
    /// Variance of recalibrated retention times, `0` below 4 constituents
    pub rt_variance: f64,
    /// The common charge state, `0` when unknown everywhere
    pub charge_state: i32,
    /// Robust average apex intensity
    pub peak_height: f64,
    /// Robust average full width at half maximum in seconds
    pub peak_width: f64,
    /// The sample whose MS/MS scan has the highest total ion current
    pub representative: Option<SampleId>,
}

impl AlignedFeature {
    /// Wrap a single `(sample, ion)` pair
    pub fn singleton(samples: &SampleSet, sample_id: SampleId, index: IonIndex) -> Self {
        let sample = samples.get(sample_id);
        let ion = sample.ion(index);
        let mut features = SampleMap::default();
        features.insert(sample_id, index);
        Self {
            features,
            mass: ion.mass,
            rt: sample.recalibrated_rt(ion.rt),
            rt_variance: 0.0,
            charge_state: ion.charge,
            peak_height: ion.intensity as f64,
            peak_width: ion.peak_width(),
            representative: ion.msms.is_some().then_some(sample_id),
        }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn contains_sample(&self, id: SampleId) -> bool {
        self.features.contains_key(&id)
    }

    pub fn ion_in(&self, id: SampleId) -> Option<IonIndex> {
        self.features.get(&id).copied()
    }

    pub fn sample_ids(&self) -> impl Iterator<Item = SampleId> + '_ {
        self.features.keys().copied()
    }

    /// The `(sample, ion index)` entries in ascending sample order, the
    /// deterministic iteration order for all floating point accumulation
    pub fn entries_sorted(&self) -> Vec<(SampleId, IonIndex)> {
        let mut entries: Vec<_> = self.features.iter().map(|(s, i)| (*s, *i)).collect();
        entries.sort_unstable();
        entries
    }

    /// Iterate constituent ions in ascending sample order
    pub fn iter_ions<'a>(
        &self,
        samples: &'a SampleSet,
    ) -> impl Iterator<Item = (SampleId, &'a Ion)> {
        self.entries_sorted()
            .into_iter()
            .map(move |(id, index)| (id, samples.get(id).ion(index)))
    }

    /// The MS/MS total ion current of the representative sample's ion
    pub fn representative_tic(&self, samples: &SampleSet) -> Option<f32> {
        let id = self.representative?;
        let index = self.ion_in(id)?;
        samples.get(id).ion(index).msms_tic()
    }

    /// The representative MS/MS spectrum for downstream spectral scoring
    pub fn representative_spectrum<'a>(&self, samples: &'a SampleSet) -> Option<&'a MsSpectrum> {
        let id = self.representative?;
        let index = self.ion_in(id)?;
        samples.get(id).ion(index).msms.as_ref()
    }

    /// The most abundant detected (non-gap-filled) constituent ion
    pub fn most_abundant_detected<'a>(
        &self,
        samples: &'a SampleSet,
    ) -> Option<(SampleId, &'a Ion)> {
        self.iter_ions(samples)
            .filter(|(_, ion)| !ion.gap_filled)
            .max_by(|(_, a), (_, b)| a.intensity.total_cmp(&b.intensity))
    }

    /// Combine two features covering disjoint sample sets into one.
    ///
    /// Fails with [`AlignmentError::ChargeConflict`] when both sides carry
    /// different non-zero charges, and with [`AlignmentError::DuplicateSample`]
    /// when the sample sets overlap. The latter is an algorithm bug and is
    /// also reported through `debug_assert!`.
    pub fn merge(
        &self,
        other: &AlignedFeature,
        samples: &SampleSet,
    ) -> Result<AlignedFeature, AlignmentError> {
        if !charge_compatible(self.charge_state, other.charge_state) {
            return Err(AlignmentError::ChargeConflict {
                left: self.charge_state,
                right: other.charge_state,
            });
        }
        let mut features = self.features.clone();
        for (id, index) in other.features.iter() {
            if features.insert(*id, *index).is_some() {
                debug_assert!(false, "sample {id} present on both sides of a merge");
                tracing::error!("sample {id} present on both sides of a merge");
                return Err(AlignmentError::DuplicateSample(*id));
            }
        }

        let representative =
            match (self.representative_tic(samples), other.representative_tic(samples)) {
                (_, None) => self.representative.or(other.representative),
                (None, Some(_)) => other.representative,
                // ties favor the existing representative
                (Some(l), Some(r)) => {
                    if r > l {
                        other.representative
                    } else {
                        self.representative
                    }
                }
            };

        Ok(Self::rebuild(
            features,
            samples,
            if self.charge_state != 0 {
                self.charge_state
            } else {
                other.charge_state
            },
            representative,
        ))
    }

    /// Convenience overload of [`AlignedFeature::merge`] adding one new
    /// `(sample, ion)` pair
    pub fn merge_ion(
        &self,
        sample_id: SampleId,
        index: IonIndex,
        samples: &SampleSet,
    ) -> Result<AlignedFeature, AlignmentError> {
        self.merge(&Self::singleton(samples, sample_id, index), samples)
    }

    /// A copy of this feature without `sample_id`'s entry, or `None` when the
    /// feature would become empty. Used when a gap-filled guess is replaced.
    pub fn without_sample(
        &self,
        sample_id: SampleId,
        samples: &SampleSet,
    ) -> Option<AlignedFeature> {
        if !self.contains_sample(sample_id) || self.len() == 1 {
            return None;
        }
        let mut features = self.features.clone();
        features.remove(&sample_id);
        let representative = if self.representative == Some(sample_id) {
            None
        } else {
            self.representative
        };
        Some(Self::rebuild(
            features,
            samples,
            self.charge_state,
            representative,
        ))
    }

    fn rebuild(
        features: SampleMap<IonIndex>,
        samples: &SampleSet,
        charge_state: i32,
        representative: Option<SampleId>,
    ) -> Self {
        let mut entries: Vec<_> = features.iter().map(|(s, i)| (*s, *i)).collect();
        entries.sort_unstable();

        let mut masses = Vec::with_capacity(entries.len());
        let mut rts = Vec::with_capacity(entries.len());
        let mut heights = Vec::with_capacity(entries.len());
        let mut widths = Vec::with_capacity(entries.len());
        for (id, index) in entries.iter() {
            let sample = samples.get(*id);
            let ion = sample.ion(*index);
            masses.push(ion.mass);
            rts.push(sample.recalibrated_rt(ion.rt));
            heights.push(ion.intensity as f64);
            widths.push(ion.peak_width());
        }
        let rt_variance = if rts.len() < 4 { 0.0 } else { variance(&rts) };
        Self {
            features,
            mass: trimmed_mean(&mut masses),
            rt: trimmed_mean(&mut rts),
            rt_variance,
            charge_state,
            peak_height: trimmed_mean(&mut heights),
            peak_width: trimmed_mean(&mut widths),
            representative,
        }
    }

    /// Recompute the consensus values after the owning samples' recalibration
    /// functions changed
    pub fn refreshed(&self, samples: &SampleSet) -> AlignedFeature {
        Self::rebuild(
            self.features.clone(),
            samples,
            self.charge_state,
            self.representative,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion::{PeakShape, Quality};
    use mzpeaks::peak::MZPoint;

    fn shape(apex: f64) -> PeakShape {
        PeakShape::new(apex, apex - 5.0, apex + 5.0, 4.0, Quality::Good)
    }

    fn msms(tic: f32) -> MsSpectrum {
        let peaks = (0..6).map(|i| MZPoint::new(100.0 + i as f64 * 10.0, 10.0)).collect();
        MsSpectrum::new(peaks, tic, Quality::Good)
    }

    fn two_sample_cohort() -> SampleSet {
        SampleSet::from_runs(vec![
            (
                "a".into(),
                vec![Ion::new(300.10, 120.0, 1, 1000.0, shape(120.0)).with_msms(msms(1000.0))],
            ),
            (
                "b".into(),
                vec![Ion::new(300.11, 122.0, 1, 800.0, shape(122.0)).with_msms(msms(800.0))],
            ),
        ])
    }

    #[test]
    fn test_merge_unions_sample_keys() {
        let samples = two_sample_cohort();
        let a = AlignedFeature::singleton(&samples, SampleId(0), 0);
        let b = AlignedFeature::singleton(&samples, SampleId(1), 0);
        let merged = a.merge(&b, &samples).unwrap();
        let mut ids: Vec<_> = merged.sample_ids().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![SampleId(0), SampleId(1)]);
        assert_eq!(merged.charge_state, 1);
        // higher TIC side wins the representative
        assert_eq!(merged.representative, Some(SampleId(0)));
        assert!((merged.mass - 300.105).abs() < 1e-9);
        assert!((merged.rt - 121.0).abs() < 1e-9);
        assert_eq!(merged.rt_variance, 0.0);
    }

    #[test]
    fn test_merge_rejects_charge_conflict() {
        let samples = SampleSet::from_runs(vec![
            ("c".into(), vec![Ion::new(300.1, 120.0, 2, 500.0, shape(120.0))]),
            ("d".into(), vec![Ion::new(300.1, 120.0, 1, 500.0, shape(120.0))]),
        ]);
        let c = AlignedFeature::singleton(&samples, SampleId(0), 0);
        let d = AlignedFeature::singleton(&samples, SampleId(1), 0);
        assert_eq!(
            c.merge(&d, &samples).unwrap_err(),
            AlignmentError::ChargeConflict { left: 2, right: 1 }
        );
    }

    #[test]
    fn test_unknown_charge_is_compatible() {
        let samples = SampleSet::from_runs(vec![
            ("a".into(), vec![Ion::new(300.1, 120.0, 0, 500.0, shape(120.0))]),
            ("b".into(), vec![Ion::new(300.1, 121.0, 2, 500.0, shape(121.0))]),
        ]);
        let a = AlignedFeature::singleton(&samples, SampleId(0), 0);
        let b = AlignedFeature::singleton(&samples, SampleId(1), 0);
        let merged = a.merge(&b, &samples).unwrap();
        assert_eq!(merged.charge_state, 2);
    }

    #[test]
    fn test_rt_variance_needs_four_constituents() {
        let runs: Vec<_> = (0..5)
            .map(|k| {
                (
                    format!("s{k}"),
                    vec![Ion::new(300.1, 120.0 + k as f64, 1, 500.0, shape(120.0 + k as f64))],
                )
            })
            .collect();
        let samples = SampleSet::from_runs(runs);
        let mut feature = AlignedFeature::singleton(&samples, SampleId(0), 0);
        for k in 1..3u32 {
            feature = feature.merge_ion(SampleId(k), 0, &samples).unwrap();
        }
        assert_eq!(feature.rt_variance, 0.0);
        feature = feature.merge_ion(SampleId(3), 0, &samples).unwrap();
        assert!(feature.rt_variance > 0.0);
    }
}
