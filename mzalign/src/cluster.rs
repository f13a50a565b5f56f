//! The binary alignment tree produced by merging sample clusters
use crate::feature::AlignedFeature;
use crate::ion::Quality;
use crate::progressive::RtErrorModel;
use crate::sample::{IonIndex, Sample, SampleIdSet, SampleSet};
use crate::stats::trimmed_mean;

/// An immutable node of the alignment tree: the features aligned so far over
/// `merged_samples`, the score of the merge that produced it, and its two
/// children (absent for leaves, possibly pruned to header-only stubs).
#[derive(Debug, Clone, Default)]
pub struct Cluster {
    /// All features over `merged_samples`, sorted by consensus retention time
    pub features: Vec<AlignedFeature>,
    /// The alignment score that produced this node, `0` for leaves
    pub score: f64,
    pub left: Option<Box<Cluster>>,
    pub right: Option<Box<Cluster>>,
    /// The set of leaf samples under this node
    pub merged_samples: SampleIdSet,
}

impl Cluster {
    /// Wrap one sample as a leaf: one singleton feature per qualifying ion.
    ///
    /// The default bar is a detected ion with a peak shape of at least
    /// [`Quality::Decent`]; with `use_all_ions` gap-filled and lower-quality
    /// ions take part as well.
    pub fn leaf(samples: &SampleSet, sample: &Sample, use_all_ions: bool) -> Self {
        let mut features: Vec<AlignedFeature> = if use_all_ions {
            sample
                .iter_live()
                .map(|(index, _)| AlignedFeature::singleton(samples, sample.id, index))
                .collect()
        } else {
            sample
                .iter_detected()
                .filter(|(_, ion)| ion.shape.quality >= Quality::Decent)
                .map(|(index, _)| AlignedFeature::singleton(samples, sample.id, index))
                .collect()
        };
        features.sort_by(|a, b| a.rt.total_cmp(&b.rt));
        let mut merged_samples = SampleIdSet::default();
        merged_samples.insert(sample.id);
        Self {
            features,
            score: 0.0,
            left: None,
            right: None,
            merged_samples,
        }
    }

    /// Store the outcome of a pairwise alignment of `left` and `right`.
    ///
    /// The children's sample sets must be disjoint; a violation is an
    /// algorithm bug reported loudly, never repaired. When
    /// `keep_intermediates` is false the children are kept as header-only
    /// stubs to bound memory while retaining the tree shape.
    pub fn merged(
        mut features: Vec<AlignedFeature>,
        score: f64,
        left: Cluster,
        right: Cluster,
        keep_intermediates: bool,
    ) -> Self {
        let mut merged_samples = left.merged_samples.clone();
        for id in right.merged_samples.iter() {
            if !merged_samples.insert(*id) {
                debug_assert!(false, "sample {id} under both children of a merge");
                tracing::error!("sample {id} under both children of a merge");
            }
        }
        features.sort_by(|a, b| a.rt.total_cmp(&b.rt));
        let (left, right) = if keep_intermediates {
            (left, right)
        } else {
            (left.into_stub(), right.into_stub())
        };
        Self {
            features,
            score,
            left: Some(Box::new(left)),
            right: Some(Box::new(right)),
            merged_samples,
        }
    }

    /// A childless root over the whole cohort, as produced by the progressive
    /// aligner
    pub fn root(mut features: Vec<AlignedFeature>, score: f64, merged_samples: SampleIdSet) -> Self {
        features.sort_by(|a, b| a.rt.total_cmp(&b.rt));
        Self {
            features,
            score,
            left: None,
            right: None,
            merged_samples,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Drop this node's feature array, retaining only the tree header
    fn into_stub(mut self) -> Cluster {
        self.features = Vec::new();
        self
    }

    /// The minimum number of supporting samples for a feature to contribute
    /// to error estimation
    fn support_threshold(&self) -> usize {
        let n = self.merged_samples.len() as f64;
        (0.2 * n).min(10.0).max(2.0).floor() as usize
    }

    /// Estimate the retention time error term from well-supported features:
    /// the root of the 25–75% trimmed mean of squared pairwise recalibrated
    /// retention time differences. `None` when no feature is supported well
    /// enough.
    pub fn estimate_error(&self, samples: &SampleSet) -> Option<f64> {
        self.estimate_spread(samples, |sample, ion| sample.recalibrated_rt(ion.rt))
    }

    /// The same estimate over peak widths, scaling the gap filler's width gate
    pub fn estimate_peak_shape_error(&self, samples: &SampleSet) -> Option<f64> {
        self.estimate_spread(samples, |_, ion| ion.peak_width())
    }

    fn estimate_spread(
        &self,
        samples: &SampleSet,
        value: impl Fn(&Sample, &crate::ion::Ion) -> f64,
    ) -> Option<f64> {
        let threshold = self.support_threshold();
        let mut squared = Vec::new();
        for feature in self.features.iter() {
            if feature.len() < threshold {
                continue;
            }
            let values: Vec<f64> = feature
                .entries_sorted()
                .into_iter()
                .map(|(id, index)| {
                    let sample = samples.get(id);
                    value(sample, sample.ion(index))
                })
                .collect();
            for i in 0..values.len() {
                for j in (i + 1)..values.len() {
                    let d = values[i] - values[j];
                    squared.push(d * d);
                }
            }
        }
        if squared.is_empty() {
            None
        } else {
            Some(trimmed_mean(&mut squared).sqrt())
        }
    }

    /// Refit a Laplace retention time error model from the mean absolute
    /// deviation of recalibrated retention times around their consensus
    pub fn estimate_laplace_error(&self, samples: &SampleSet) -> Option<RtErrorModel> {
        let mut total = 0.0;
        let mut n = 0usize;
        for feature in self.features.iter() {
            if feature.len() < 2 {
                continue;
            }
            for (id, index) in feature.entries_sorted() {
                let sample = samples.get(id);
                total += (sample.recalibrated_rt(sample.ion(index).rt) - feature.rt).abs();
                n += 1;
            }
        }
        (n > 0).then(|| RtErrorModel::Laplace {
            scale: total / n as f64,
        })
    }

    /// Keep only features with at least one MS/MS-carrying constituent
    pub fn keep_only_with_msms(self, samples: &mut SampleSet) -> Cluster {
        self.retain(samples, |feature, samples| {
            feature.iter_ions(samples).any(|(_, ion)| ion.msms.is_some())
        })
    }

    /// Keep only features with at least one constituent carrying an isotope
    /// envelope of 2+ peaks
    pub fn keep_only_with_isotopes(self, samples: &mut SampleSet) -> Cluster {
        self.retain(samples, |feature, samples| {
            feature.iter_ions(samples).any(|(_, ion)| ion.isotopes.len() >= 2)
        })
    }

    /// Keep only features supported by at least `threshold` samples
    pub fn keep_only_with_min_samples(self, samples: &mut SampleSet, threshold: usize) -> Cluster {
        self.retain(samples, |feature, _| feature.len() >= threshold)
    }

    /// Filter the feature list and mark every ion no longer referenced by a
    /// surviving feature dead in its owning sample, keeping the cohort's ion
    /// arenas consistent with the filtered feature set. This is the only
    /// place the core revokes sample ions.
    fn retain(
        mut self,
        samples: &mut SampleSet,
        predicate: impl Fn(&AlignedFeature, &SampleSet) -> bool,
    ) -> Cluster {
        let before = self.features.len();
        self.features.retain(|f| predicate(f, samples));
        tracing::debug!(
            "feature filter kept {} of {} features",
            self.features.len(),
            before
        );

        let mut referenced: Vec<Vec<IonIndex>> = vec![Vec::new(); samples.len()];
        for feature in self.features.iter() {
            for (id, index) in feature.entries_sorted() {
                referenced[id.0 as usize].push(index);
            }
        }
        for (sample, referenced) in samples.iter_mut().zip(referenced) {
            let live: Vec<IonIndex> = sample.iter_live().map(|(i, _)| i).collect();
            for index in live {
                if !referenced.contains(&index) {
                    sample.mark_dead(index);
                }
            }
        }
        self
    }

    /// Verify that `merged_samples` is the disjoint union of the children's
    /// sets, recursively. Exercised by tests and debug assertions.
    pub fn check_sample_partition(&self) -> bool {
        match (&self.left, &self.right) {
            (None, None) => true,
            (Some(left), Some(right)) => {
                let disjoint = left.merged_samples.is_disjoint(&right.merged_samples);
                let union_size = left.merged_samples.len() + right.merged_samples.len();
                disjoint
                    && union_size == self.merged_samples.len()
                    && left
                        .merged_samples
                        .iter()
                        .chain(right.merged_samples.iter())
                        .all(|id| self.merged_samples.contains(id))
                    && left.check_sample_partition()
                    && right.check_sample_partition()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ion::{Ion, MsSpectrum, PeakShape};
    use crate::sample::SampleId;
    use mzpeaks::peak::MZPoint;

    fn shape(apex: f64, quality: Quality) -> PeakShape {
        PeakShape::new(apex, apex - 5.0, apex + 5.0, 4.0, quality)
    }

    fn msms() -> MsSpectrum {
        let peaks = (0..6).map(|i| MZPoint::new(100.0 + 10.0 * i as f64, 5.0)).collect();
        MsSpectrum::new(peaks, 100.0, Quality::Good)
    }

    fn cohort() -> SampleSet {
        SampleSet::from_runs(vec![
            (
                "a".into(),
                vec![
                    Ion::new(300.1, 100.0, 1, 900.0, shape(100.0, Quality::Good)).with_msms(msms()),
                    Ion::new(400.2, 200.0, 1, 500.0, shape(200.0, Quality::Bad)),
                ],
            ),
            (
                "b".into(),
                vec![Ion::new(300.1, 101.0, 1, 700.0, shape(101.0, Quality::Good))],
            ),
        ])
    }

    #[test]
    fn test_leaf_applies_quality_bar() {
        let samples = cohort();
        let strict = Cluster::leaf(&samples, samples.get(SampleId(0)), false);
        assert_eq!(strict.len(), 1);
        let all = Cluster::leaf(&samples, samples.get(SampleId(0)), true);
        assert_eq!(all.len(), 2);
        assert!(strict.is_leaf());
        assert_eq!(strict.score, 0.0);
    }

    #[test]
    fn test_leaf_features_sorted_by_rt() {
        let samples = cohort();
        let leaf = Cluster::leaf(&samples, samples.get(SampleId(0)), true);
        assert!(leaf.features.windows(2).all(|w| w[0].rt <= w[1].rt));
    }

    #[test]
    fn test_merged_samples_partition() {
        let samples = cohort();
        let left = Cluster::leaf(&samples, samples.get(SampleId(0)), false);
        let right = Cluster::leaf(&samples, samples.get(SampleId(1)), false);
        let features = left
            .features
            .iter()
            .chain(right.features.iter())
            .cloned()
            .collect();
        let merged = Cluster::merged(features, 1.0, left, right, true);
        assert_eq!(merged.merged_samples.len(), 2);
        assert!(merged.check_sample_partition());
    }

    #[test]
    fn test_stub_pruning_retains_shape() {
        let samples = cohort();
        let left = Cluster::leaf(&samples, samples.get(SampleId(0)), false);
        let right = Cluster::leaf(&samples, samples.get(SampleId(1)), false);
        let features = left.features.clone();
        let merged = Cluster::merged(features, 0.5, left, right, false);
        let stub = merged.left.as_ref().unwrap();
        assert!(stub.is_empty());
        assert_eq!(stub.merged_samples.len(), 1);
    }

    #[test]
    fn test_filter_marks_unreferenced_ions_dead() {
        let mut samples = cohort();
        let leaf = Cluster::leaf(&samples, samples.get(SampleId(0)), true);
        assert_eq!(leaf.len(), 2);
        let filtered = leaf.keep_only_with_msms(&mut samples);
        assert_eq!(filtered.len(), 1);
        // the low quality, MS/MS-free ion was revoked from its sample
        let sample = samples.get(SampleId(0));
        assert!(sample.is_live(0));
        assert!(!sample.is_live(1));
    }

    #[test]
    fn test_support_threshold_bounds() {
        let mut cluster = Cluster::default();
        for k in 0..8 {
            cluster.merged_samples.insert(SampleId(k));
        }
        assert_eq!(cluster.support_threshold(), 2);
        for k in 8..100 {
            cluster.merged_samples.insert(SampleId(k));
        }
        assert_eq!(cluster.support_threshold(), 10);
    }
}
