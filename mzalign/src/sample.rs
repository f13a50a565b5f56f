//! Sample runs and the ion arena they own
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::hash::Hash;

use identity_hash::IdentityHashable;

use crate::ion::Ion;
use crate::recalibrate::{LowConfidenceAlignment, RtMapping};

/// The identity of a sample run within a cohort. Ids are dense, assigned by
/// position in the owning [`SampleSet`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleId(pub u32);

impl Hash for SampleId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(self.0);
    }
}

impl IdentityHashable for SampleId {}

pub type BuildIdentityHasherSampleId = identity_hash::BuildIdentityHasher<SampleId>;

/// A map keyed by [`SampleId`], hashed by identity
pub type SampleMap<V> = HashMap<SampleId, V, BuildIdentityHasherSampleId>;
pub type SampleIdSet = HashSet<SampleId, BuildIdentityHasherSampleId>;

impl Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stable index into a sample's ion arena
pub type IonIndex = usize;

/// One LC-MS run and the ions detected in it.
///
/// Ions live in an arena with stable indices: filtering passes mark entries
/// dead instead of removing them, so [`crate::feature::AlignedFeature`]s can
/// hold indices across passes and pairwise scoring can read the arena in
/// parallel while nothing mutates it.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: SampleId,
    /// The source run identifier, for diagnostics
    pub name: String,
    ions: Vec<Ion>,
    live: Vec<bool>,
    gap_filled: Vec<IonIndex>,
    /// Maps this sample's raw retention time axis onto the cohort consensus axis
    pub recalibration: RtMapping,
    /// End of the usable retention time axis in seconds
    pub max_rt: f64,
    /// Set when the last recalibration had too few anchors to fit a curve
    pub low_confidence: Option<LowConfidenceAlignment>,
}

impl Sample {
    pub fn new(id: SampleId, name: String, ions: Vec<Ion>) -> Self {
        let max_rt = ions.iter().map(|i| i.rt).fold(0.0, f64::max);
        let live = vec![true; ions.len()];
        Self {
            id,
            name,
            ions,
            live,
            gap_filled: Vec::new(),
            recalibration: RtMapping::Identity,
            max_rt,
            low_confidence: None,
        }
    }

    pub fn ion(&self, index: IonIndex) -> &Ion {
        &self.ions[index]
    }

    pub fn is_live(&self, index: IonIndex) -> bool {
        self.live[index]
    }

    pub fn mark_dead(&mut self, index: IonIndex) {
        self.live[index] = false;
    }

    pub fn len(&self) -> usize {
        self.ions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ions.is_empty()
    }

    /// The number of live, detected (non-gap-filled) ions
    pub fn detected_len(&self) -> usize {
        self.iter_detected().count()
    }

    /// Iterate over live detected ions in arena order
    pub fn iter_detected(&self) -> impl Iterator<Item = (IonIndex, &Ion)> {
        self.ions
            .iter()
            .enumerate()
            .filter(|(i, ion)| self.live[*i] && !ion.gap_filled)
    }

    /// Iterate over live gap-filled ions in registration order
    pub fn iter_gap_filled(&self) -> impl Iterator<Item = (IonIndex, &Ion)> + '_ {
        self.gap_filled
            .iter()
            .copied()
            .filter(|i| self.live[*i])
            .map(|i| (i, &self.ions[i]))
    }

    /// Iterate over every live ion, detected first, then gap-filled
    pub fn iter_live(&self) -> impl Iterator<Item = (IonIndex, &Ion)> + '_ {
        self.iter_detected().chain(self.iter_gap_filled())
    }

    /// Register an interpolated ion produced by gap filling, returning its
    /// stable index
    pub fn push_gap_filled(&mut self, mut ion: Ion) -> IonIndex {
        ion.gap_filled = true;
        let index = self.ions.len();
        self.ions.push(ion);
        self.live.push(true);
        self.gap_filled.push(index);
        index
    }

    /// Map a raw retention time onto the cohort consensus axis
    pub fn recalibrated_rt(&self, rt: f64) -> f64 {
        self.recalibration.apply(rt)
    }

    pub fn set_recalibration(&mut self, mapping: RtMapping) {
        self.recalibration = mapping;
    }
}

/// The cohort of samples under alignment, indexable by [`SampleId`]
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    /// Build a cohort from `(run name, detected ions)` pairs, assigning dense ids
    pub fn from_runs(runs: Vec<(String, Vec<Ion>)>) -> Self {
        let samples = runs
            .into_iter()
            .enumerate()
            .map(|(i, (name, ions))| Sample::new(SampleId(i as u32), name, ions))
            .collect();
        Self { samples }
    }

    pub fn get(&self, id: SampleId) -> &Sample {
        &self.samples[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SampleId) -> &mut Sample {
        &mut self.samples[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Sample> {
        self.samples.iter_mut()
    }

    pub fn ids(&self) -> impl Iterator<Item = SampleId> + '_ {
        self.samples.iter().map(|s| s.id)
    }

    /// Extend every sample's time axis to the cohort-wide maximum so that
    /// recalibration anchors share one endpoint
    pub fn unify_time_axis(&mut self) {
        let max_rt = self.samples.iter().map(|s| s.max_rt).fold(0.0, f64::max);
        for sample in self.samples.iter_mut() {
            sample.max_rt = max_rt;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion::PeakShape;

    fn ion(rt: f64) -> Ion {
        Ion::new(300.0, rt, 1, 100.0, PeakShape::new(rt, rt - 5.0, rt + 5.0, 4.0, Default::default()))
    }

    #[test]
    fn test_arena_stability() {
        let mut sample = Sample::new(SampleId(0), "run_a".into(), vec![ion(10.0), ion(20.0), ion(30.0)]);
        sample.mark_dead(1);
        assert_eq!(sample.iter_detected().count(), 2);
        // surviving indices are untouched by the deletion
        assert_eq!(sample.ion(2).rt, 30.0);

        let idx = sample.push_gap_filled(ion(25.0));
        assert_eq!(idx, 3);
        assert!(sample.ion(idx).gap_filled);
        assert_eq!(sample.iter_gap_filled().count(), 1);
        // gap-filled ions do not show up among detected ones
        assert_eq!(sample.iter_detected().count(), 2);
    }

    #[test]
    fn test_unify_time_axis() {
        let mut samples = SampleSet::from_runs(vec![
            ("a".into(), vec![ion(100.0)]),
            ("b".into(), vec![ion(250.0)]),
        ]);
        samples.unify_time_axis();
        assert_eq!(samples.get(SampleId(0)).max_rt, 250.0);
        assert_eq!(samples.get(SampleId(1)).max_rt, 250.0);
    }
}
