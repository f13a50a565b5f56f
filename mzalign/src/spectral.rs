//! The spectral similarity collaborator boundary.
//!
//! Pairwise scoring only ever sees [`QuerySpectrum`]s, raw MS/MS spectra
//! reduced to their most intense peaks, and a [`SpectralScorer`] that turns
//! two of them into a cosine score and a shared peak count.
use mzpeaks::{peak::MZPoint, Tolerance};

use crate::ion::{MsSpectrum, Quality};

/// The smallest number of surviving peaks for a spectrum to take part in
/// spectral scoring
pub const MIN_QUERY_PEAKS: usize = 5;

/// The outcome of comparing two MS/MS spectra
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SpectralSimilarity {
    /// Normalized cosine score in `[0, 1]`
    pub score: f32,
    /// The number of matched peak pairs contributing to the score
    pub shared_peaks: u32,
}

impl SpectralSimilarity {
    pub fn new(score: f32, shared_peaks: u32) -> Self {
        Self {
            score,
            shared_peaks,
        }
    }
}

/// Parameters for reducing a raw MS/MS spectrum to a comparable query
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryParams {
    /// Keep at most this many of the most intense peaks
    pub max_peaks: usize,
    /// Discard peaks at or below this intensity
    pub noise_floor: f32,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            max_peaks: 60,
            noise_floor: 0.0,
        }
    }
}

/// An MS/MS spectrum prepared for similarity scoring: denoised, truncated to
/// the most intense peaks, sorted by m/z
#[derive(Debug, Clone)]
pub struct QuerySpectrum {
    pub peaks: Vec<MZPoint>,
    pub quality: Quality,
}

impl QuerySpectrum {
    pub fn prepare(spectrum: &MsSpectrum, params: &QueryParams) -> Self {
        let mut peaks: Vec<MZPoint> = spectrum
            .peaks
            .iter()
            .filter(|p| p.intensity > params.noise_floor)
            .cloned()
            .collect();
        peaks.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));
        peaks.truncate(params.max_peaks);
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        Self {
            peaks,
            quality: spectrum.quality,
        }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Whether this spectrum carries enough signal to be compared at all
    pub fn is_usable(&self) -> bool {
        self.quality > Quality::Bad && self.len() >= MIN_QUERY_PEAKS
    }
}

/// The boundary to the spectral similarity collaborator
pub trait SpectralScorer {
    fn similarity(&self, a: &QuerySpectrum, b: &QuerySpectrum) -> SpectralSimilarity;
}

/// Intensity-weighted cosine over peak pairs matched within a mass window.
///
/// Peaks are matched greedily in m/z order, each peak participating at most
/// once; the score is the normalized dot product of matched intensities.
#[derive(Debug, Clone, Copy)]
pub struct IntensityWeightedCosine {
    pub mass_tolerance: Tolerance,
}

impl Default for IntensityWeightedCosine {
    fn default() -> Self {
        Self {
            mass_tolerance: Tolerance::PPM(20.0),
        }
    }
}

impl IntensityWeightedCosine {
    pub fn new(mass_tolerance: Tolerance) -> Self {
        Self { mass_tolerance }
    }
}

impl SpectralScorer for IntensityWeightedCosine {
    fn similarity(&self, a: &QuerySpectrum, b: &QuerySpectrum) -> SpectralSimilarity {
        let norm_a: f64 = a
            .peaks
            .iter()
            .map(|p| (p.intensity as f64).powi(2))
            .sum::<f64>()
            .sqrt();
        let norm_b: f64 = b
            .peaks
            .iter()
            .map(|p| (p.intensity as f64).powi(2))
            .sum::<f64>()
            .sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return SpectralSimilarity::default();
        }

        let mut dot = 0.0f64;
        let mut shared = 0u32;
        let mut j_start = 0usize;
        let mut used = vec![false; b.peaks.len()];
        for pa in a.peaks.iter() {
            // advance past b peaks that can no longer match anything
            while j_start < b.peaks.len()
                && b.peaks[j_start].mz < pa.mz
                && !self.mass_tolerance.test(b.peaks[j_start].mz, pa.mz)
            {
                j_start += 1;
            }
            let mut best: Option<(usize, f64)> = None;
            for (j, pb) in b.peaks.iter().enumerate().skip(j_start) {
                if pb.mz > pa.mz && !self.mass_tolerance.test(pb.mz, pa.mz) {
                    break;
                }
                if used[j] || !self.mass_tolerance.test(pb.mz, pa.mz) {
                    continue;
                }
                let dist = (pb.mz - pa.mz).abs();
                if best.map(|(_, d)| dist < d).unwrap_or(true) {
                    best = Some((j, dist));
                }
            }
            if let Some((j, _)) = best {
                used[j] = true;
                dot += pa.intensity as f64 * b.peaks[j].intensity as f64;
                shared += 1;
            }
        }
        SpectralSimilarity::new((dot / (norm_a * norm_b)) as f32, shared)
    }
}
