//! Distribution drift between two populations: PSI and the two-sample KS test.
//!
//! PSI bins are equal-frequency bins of the *expected* sample, so swapping the
//! two inputs changes the result.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Smoothing added to both proportions so empty bins stay finite.
const PSI_EPSILON: f64 = 1e-6;
const MODERATE_PSI: f64 = 0.10;
const SEVERE_PSI: f64 = 0.25;
const KS_SERIES_TERMS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftConfig {
    pub buckets: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self { buckets: 10 }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriftError {
    #[error("insufficient data: {sample} sample is empty")]
    InsufficientData { sample: &'static str },
    #[error("{sample} sample has a non-finite value at index {index}")]
    NonFiniteValue { sample: &'static str, index: usize },
    #[error("bucket count must be positive, got {0}")]
    InvalidBuckets(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    Moderate,
    Severe,
}

impl DriftSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Moderate => "moderate",
            Self::Severe => "severe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub psi: f64,
    pub ks_statistic: f64,
    pub ks_p_value: f64,
    pub severity: DriftSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KsResult {
    pub statistic: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    config: DriftConfig,
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn compute(&self, expected: &[f64], actual: &[f64]) -> Result<DriftReport, DriftError> {
        let psi = population_stability_index(expected, actual, self.config.buckets)?;
        let ks = ks_two_sample(expected, actual)?;
        let (message, severity) = interpret(psi);

        info!(
            component = "drift",
            event = "drift.compute.finish",
            expected_len = expected.len(),
            actual_len = actual.len(),
            buckets = self.config.buckets,
            psi = psi,
            ks_statistic = ks.statistic,
            ks_p_value = ks.p_value,
            severity = severity.as_str()
        );

        Ok(DriftReport {
            psi,
            ks_statistic: ks.statistic,
            ks_p_value: ks.p_value,
            severity,
            message,
        })
    }
}

/// Classifies a PSI value: below 0.10 none, below 0.25 moderate, else severe.
pub fn interpret(psi: f64) -> (String, DriftSeverity) {
    if psi < MODERATE_PSI {
        ("No drift detected (PSI < 0.1).".to_string(), DriftSeverity::None)
    } else if psi < SEVERE_PSI {
        (
            "Moderate drift detected (0.1 <= PSI < 0.25).".to_string(),
            DriftSeverity::Moderate,
        )
    } else {
        (
            "Severe drift detected (PSI >= 0.25).".to_string(),
            DriftSeverity::Severe,
        )
    }
}

pub fn population_stability_index(
    expected: &[f64],
    actual: &[f64],
    buckets: usize,
) -> Result<f64, DriftError> {
    check_samples(expected, actual)?;
    if buckets == 0 {
        return Err(DriftError::InvalidBuckets(buckets));
    }

    let expected = sorted(expected);
    let actual = sorted(actual);
    let edges: Vec<f64> = (0..=buckets)
        .map(|i| percentile(&expected, 100.0 * i as f64 / buckets as f64))
        .collect();

    let expected_share = bin_shares(&expected, &edges);
    let actual_share = bin_shares(&actual, &edges);

    Ok(expected_share
        .iter()
        .zip(&actual_share)
        .map(|(e, a)| (e - a) * ((e + PSI_EPSILON) / (a + PSI_EPSILON)).ln())
        .sum())
}

/// Two-sample KS statistic with the asymptotic (Kolmogorov) two-sided p-value.
pub fn ks_two_sample(a: &[f64], b: &[f64]) -> Result<KsResult, DriftError> {
    check_samples(a, b)?;

    let a = sorted(a);
    let b = sorted(b);
    let (n, m) = (a.len(), b.len());
    let (mut i, mut j) = (0, 0);
    let mut statistic: f64 = 0.0;

    while i < n && j < m {
        let x = a[i].min(b[j]);
        while i < n && a[i] <= x {
            i += 1;
        }
        while j < m && b[j] <= x {
            j += 1;
        }
        statistic = statistic.max((i as f64 / n as f64 - j as f64 / m as f64).abs());
    }

    let effective = (n * m) as f64 / (n + m) as f64;
    let p_value = kolmogorov_survival(effective.sqrt() * statistic);

    Ok(KsResult { statistic, p_value })
}

fn check_samples(expected: &[f64], actual: &[f64]) -> Result<(), DriftError> {
    if expected.is_empty() {
        return Err(DriftError::InsufficientData { sample: "expected" });
    }
    if actual.is_empty() {
        return Err(DriftError::InsufficientData { sample: "actual" });
    }
    for (sample, values) in [("expected", expected), ("actual", actual)] {
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DriftError::NonFiniteValue { sample, index });
        }
    }
    Ok(())
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(f64::total_cmp);
    out
}

/// Linear-interpolation percentile of an ascending, non-empty sample.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let position = (sorted.len() - 1) as f64 * q / 100.0;
    let lower = position.floor() as usize;
    let upper = (lower + 1).min(sorted.len() - 1);
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

// Bins are half-open except the last, which includes its right edge. Values
// outside the edges fall in no bin but still count toward the denominator.
fn bin_shares(sorted: &[f64], edges: &[f64]) -> Vec<f64> {
    let last = edges.len() - 1;
    let cumulative: Vec<usize> = edges
        .iter()
        .enumerate()
        .map(|(idx, edge)| {
            if idx == last {
                sorted.partition_point(|v| v <= edge)
            } else {
                sorted.partition_point(|v| v < edge)
            }
        })
        .collect();

    let total = sorted.len() as f64;
    cumulative
        .windows(2)
        .map(|pair| pair[1].saturating_sub(pair[0]) as f64 / total)
        .collect()
}

/// P(K > lambda) for the Kolmogorov distribution.
fn kolmogorov_survival(lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return 1.0;
    }

    let p = if lambda < 1.18 {
        let scale = (2.0 * PI).sqrt() / lambda;
        let cdf: f64 = (1..=KS_SERIES_TERMS)
            .map(|k| {
                let odd = (2 * k - 1) as f64;
                (-(odd * odd) * PI * PI / (8.0 * lambda * lambda)).exp()
            })
            .sum();
        1.0 - scale * cdf
    } else {
        2.0 * (1..=KS_SERIES_TERMS)
            .map(|j| {
                let sign = if j % 2 == 1 { 1.0 } else { -1.0 };
                let j = j as f64;
                sign * (-2.0 * j * j * lambda * lambda).exp()
            })
            .sum::<f64>()
    };
    p.clamp(0.0, 1.0)
}
