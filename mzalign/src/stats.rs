//! Robust summary statistics shared by the scoring and recalibration code
use std::f64::consts::SQRT_2;

/// Mean of the central half of `values` (sorted in place). Falls back to the
/// plain mean below 4 observations, where trimming would discard everything.
pub fn trimmed_mean(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = values.len();
    let slice = if n < 4 {
        &values[..]
    } else {
        &values[n / 4..(3 * n) / 4]
    };
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Median of `values` (sorted in place); the mean of the middle two when the
/// count is even
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// The 25th and 75th percentile of `values` (sorted in place)
pub fn quartiles(values: &mut [f64]) -> (f64, f64) {
    debug_assert!(!values.is_empty());
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let n = values.len();
    (values[n / 4], values[(3 * n) / 4])
}

/// Population variance
pub fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64
}

/// Complementary error function, rational approximation after Numerical
/// Recipes `erfcc`, accurate to ~1.2e-7 everywhere
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let ans = t
        * (-z * z - 1.26551223
            + t * (1.00002368
                + t * (0.37409196
                    + t * (0.09678418
                        + t * (-0.18628806
                            + t * (0.27886807
                                + t * (-1.13520398
                                    + t * (1.48851587
                                        + t * (-0.82215223 + t * 0.17087277)))))))))
            .exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

/// A normal deviation model used to turn a ratio or difference into a
/// two-sided error probability
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NormalDeviation {
    pub mean: f64,
    pub standard_deviation: f64,
}

impl NormalDeviation {
    pub fn new(mean: f64, standard_deviation: f64) -> Self {
        Self {
            mean,
            standard_deviation,
        }
    }

    /// `P(|X - mean| >= |x - mean|)` under `X ~ N(mean, sd)`
    pub fn error_probability(&self, x: f64) -> f64 {
        erfc((x - self.mean).abs() / (self.standard_deviation * SQRT_2))
    }
}
