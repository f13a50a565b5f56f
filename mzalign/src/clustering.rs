//! Generic agglomerative clustering and its instantiation for sample
//! alignment.
//!
//! The driver is parameterized by a three-operation strategy instead of
//! subclassing: build a leaf, tentatively merge two nodes, and score a
//! tentative merge. Candidate merges for a round are evaluated as one
//! parallel batch and joined before any decision is made, so the chosen
//! merge order is independent of thread scheduling.
use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::cluster::Cluster;
use crate::error::AlignmentError;
use crate::pairwise::PairAligner;
use crate::sample::{SampleId, SampleSet};
use crate::spectral::SpectralScorer;

/// The three operations a hierarchical clustering needs
pub trait ClusterMethod<E>: Sync {
    type Node: Send + Sync;

    fn create_leaf(&self, entry: &E) -> Self::Node;

    /// Tentatively merge two nodes. The result is discarded unless this pair
    /// wins the round.
    fn pre_merge(
        &self,
        left: &Self::Node,
        right: &Self::Node,
    ) -> Result<Self::Node, AlignmentError>;

    fn score(&self, merged: &Self::Node, left: &Self::Node, right: &Self::Node) -> f64;
}

/// Standard UPGMA: repeatedly merge the best-scoring pair of active nodes
/// until one remains. Ties are broken by the lowest pair of pool indices;
/// cancellation is checked between rounds.
pub fn agglomerate<E: Sync, M: ClusterMethod<E>>(
    method: &M,
    entries: &[E],
    cancel: &CancellationToken,
) -> Result<M::Node, AlignmentError> {
    if entries.is_empty() {
        return Err(AlignmentError::EmptyCohort);
    }
    let mut nodes: Vec<M::Node> = entries.iter().map(|e| method.create_leaf(e)).collect();

    while nodes.len() > 1 {
        cancel.check()?;

        let pairs: Vec<(usize, usize)> = (0..nodes.len())
            .flat_map(|i| ((i + 1)..nodes.len()).map(move |j| (i, j)))
            .collect();
        let scored: Vec<Result<(f64, usize, usize), AlignmentError>> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let merged = method.pre_merge(&nodes[i], &nodes[j])?;
                Ok((method.score(&merged, &nodes[i], &nodes[j]), i, j))
            })
            .collect();

        let mut best: Option<(f64, usize, usize)> = None;
        for result in scored {
            let (score, i, j) = result?;
            // keep the incumbent on ties; pairs arrive in ascending index
            // order, so the lowest pair wins equal scores
            best = match best {
                Some(incumbent) if score <= incumbent.0 => Some(incumbent),
                _ => Some((score, i, j)),
            };
        }
        let (_, i, j) = best.expect("at least one candidate pair");
        debug_assert!(i < j);

        let merged = method.pre_merge(&nodes[i], &nodes[j])?;
        // removal order preserves the pool ordering for later tie-breaks
        nodes.remove(j);
        nodes.remove(i);
        nodes.push(merged);
    }
    Ok(nodes.pop().expect("one node remains"))
}

/// The alignment instantiation of [`ClusterMethod`]
pub struct FeatureAlignMethod<'a, S: SpectralScorer> {
    pub aligner: &'a PairAligner<S>,
    pub samples: &'a SampleSet,
    pub error_term: f64,
    /// Score features lacking usable MS/MS as well
    pub use_all: bool,
}

impl<'a, S: SpectralScorer + Sync> ClusterMethod<SampleId> for FeatureAlignMethod<'a, S> {
    type Node = Cluster;

    fn create_leaf(&self, entry: &SampleId) -> Cluster {
        Cluster::leaf(self.samples, self.samples.get(*entry), self.use_all)
    }

    fn pre_merge(&self, left: &Cluster, right: &Cluster) -> Result<Cluster, AlignmentError> {
        self.aligner.align(
            left.clone(),
            right.clone(),
            self.samples,
            self.error_term,
            self.use_all,
            false,
        )
    }

    fn score(&self, merged: &Cluster, _left: &Cluster, _right: &Cluster) -> f64 {
        merged.score
    }
}

/// Cluster the whole cohort hierarchically
pub fn upgma<S: SpectralScorer + Sync>(
    aligner: &PairAligner<S>,
    samples: &SampleSet,
    error_term: f64,
    use_all: bool,
    cancel: &CancellationToken,
) -> Result<Cluster, AlignmentError> {
    let method = FeatureAlignMethod {
        aligner,
        samples,
        error_term,
        use_all,
    };
    let entries: Vec<SampleId> = samples.ids().collect();
    agglomerate(&method, &entries, cancel)
}

/// Re-run the pairwise alignment bottom-up, strictly following the tree
/// shape chosen by a previous pass. Used after recalibration has invalidated
/// the scores the original tree was built from; leaves are rebuilt with all
/// ions admitted.
pub fn realign<S: SpectralScorer + Sync>(
    aligner: &PairAligner<S>,
    cluster: &Cluster,
    samples: &SampleSet,
    error_term: f64,
    cancel: &CancellationToken,
) -> Result<Cluster, AlignmentError> {
    cancel.check()?;
    match (&cluster.left, &cluster.right) {
        (Some(left), Some(right)) => {
            let (left, right) = rayon::join(
                || realign(aligner, left, samples, error_term, cancel),
                || realign(aligner, right, samples, error_term, cancel),
            );
            aligner.align(left?, right?, samples, error_term, true, false)
        }
        _ => {
            let id = cluster
                .merged_samples
                .iter()
                .next()
                .ok_or(AlignmentError::EmptyCohort)?;
            Ok(Cluster::leaf(samples, samples.get(*id), true))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A toy method over integers: a merge's score is better the closer the
    /// two pools' means are
    struct NearestMean;

    impl ClusterMethod<f64> for NearestMean {
        type Node = Vec<f64>;

        fn create_leaf(&self, entry: &f64) -> Vec<f64> {
            vec![*entry]
        }

        fn pre_merge(&self, left: &Vec<f64>, right: &Vec<f64>) -> Result<Vec<f64>, AlignmentError> {
            let mut merged = left.clone();
            merged.extend_from_slice(right);
            Ok(merged)
        }

        fn score(&self, _merged: &Vec<f64>, left: &Vec<f64>, right: &Vec<f64>) -> f64 {
            let mean = |v: &Vec<f64>| v.iter().sum::<f64>() / v.len() as f64;
            -(mean(left) - mean(right)).abs()
        }
    }

    #[test]
    fn test_agglomerate_merges_nearest_first() {
        let cancel = CancellationToken::new();
        let merged = agglomerate(&NearestMean, &[0.0, 0.1, 10.0], &cancel).unwrap();
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_agglomerate_empty_cohort() {
        let cancel = CancellationToken::new();
        let entries: [f64; 0] = [];
        assert_eq!(
            agglomerate(&NearestMean, &entries, &cancel).unwrap_err(),
            AlignmentError::EmptyCohort
        );
    }

    #[test]
    fn test_agglomerate_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            agglomerate(&NearestMean, &[1.0, 2.0], &cancel).unwrap_err(),
            AlignmentError::Cancelled
        );
    }
}
