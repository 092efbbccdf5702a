//! Model-facing monitoring: fit metrics, concept drift on residuals, and data
//! drift of temporal demand profiles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::drift::{DriftDetector, DriftError, DriftReport};
use crate::features::{CovariateRow, HourlyFeatureRow};

/// R² may fall at most this much below the reference before the model is flagged.
pub const MAX_R2_DROP: f64 = 0.10;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("length mismatch: {actual} actual values, {predicted} predictions")]
    LengthMismatch { actual: usize, predicted: usize },
    #[error("cannot score an empty sample")]
    Empty,
    #[error(transparent)]
    Drift(#[from] DriftError),
}

/// Predicts hourly trip counts from calendar covariates.
pub trait TripCountModel {
    fn predict(&self, covariates: &CovariateRow) -> f64;
}

impl<F> TripCountModel for F
where
    F: Fn(&CovariateRow) -> f64,
{
    fn predict(&self, covariates: &CovariateRow) -> f64 {
        self(covariates)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub r2: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceComparison {
    pub current: RegressionMetrics,
    pub reference: RegressionMetrics,
    pub r2_drop: f64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    Hour,
    Weekday,
    Month,
    Year,
}

impl Covariate {
    pub const ALL: [Covariate; 4] = [
        Covariate::Hour,
        Covariate::Weekday,
        Covariate::Month,
        Covariate::Year,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Weekday => "weekday",
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    pub fn value(self, row: &CovariateRow) -> i64 {
        match self {
            Self::Hour => i64::from(row.hour),
            Self::Weekday => i64::from(row.weekday),
            Self::Month => i64::from(row.month),
            Self::Year => i64::from(row.year),
        }
    }
}

pub fn regression_metrics(
    actual: &[f64],
    predicted: &[f64],
) -> Result<RegressionMetrics, MonitorError> {
    if actual.len() != predicted.len() {
        return Err(MonitorError::LengthMismatch {
            actual: actual.len(),
            predicted: predicted.len(),
        });
    }
    if actual.is_empty() {
        return Err(MonitorError::Empty);
    }

    let n = actual.len() as f64;
    let mean = actual.iter().sum::<f64>() / n;
    let mut abs_error = 0.0;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (y, y_hat) in actual.iter().zip(predicted) {
        let err = y - y_hat;
        abs_error += err.abs();
        ss_res += err * err;
        ss_tot += (y - mean) * (y - mean);
    }

    // Constant targets score 1 only when predicted exactly.
    let r2 = if ss_tot == 0.0 {
        if ss_res == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    };

    Ok(RegressionMetrics {
        mae: abs_error / n,
        rmse: (ss_res / n).sqrt(),
        r2,
    })
}

pub fn compare_to_reference(
    current: RegressionMetrics,
    reference: RegressionMetrics,
) -> ReferenceComparison {
    let r2_drop = reference.r2 - current.r2;
    let degraded = r2_drop > MAX_R2_DROP;
    if degraded {
        warn!(
            component = "monitor",
            event = "monitor.reference.degraded",
            current_r2 = current.r2,
            reference_r2 = reference.r2,
            r2_drop = r2_drop
        );
    }
    ReferenceComparison {
        current,
        reference,
        r2_drop,
        degraded,
    }
}

/// Observed minus predicted trip count, one value per row.
pub fn residuals<M: TripCountModel + ?Sized>(rows: &[HourlyFeatureRow], model: &M) -> Vec<f64> {
    rows.iter()
        .map(|row| row.trip_count as f64 - model.predict(&row.covariates()))
        .collect()
}

pub fn residual_drift<M: TripCountModel + ?Sized>(
    detector: &DriftDetector,
    model: &M,
    period1: &[HourlyFeatureRow],
    period2: &[HourlyFeatureRow],
) -> Result<DriftReport, MonitorError> {
    let report = detector.compute(&residuals(period1, model), &residuals(period2, model))?;
    info!(
        component = "monitor",
        event = "monitor.residual_drift.finish",
        period1_rows = period1.len(),
        period2_rows = period2.len(),
        psi = report.psi,
        severity = report.severity.as_str()
    );
    Ok(report)
}

/// Each row replaced by its period's mean trip count for the row's covariate value.
pub fn covariate_profile(rows: &[HourlyFeatureRow], covariate: Covariate) -> Vec<f64> {
    let mut groups: HashMap<i64, (f64, u64)> = HashMap::new();
    for row in rows {
        let entry = groups.entry(covariate.value(&row.covariates())).or_default();
        entry.0 += row.trip_count as f64;
        entry.1 += 1;
    }

    rows.iter()
        .map(|row| {
            let (sum, count) = groups[&covariate.value(&row.covariates())];
            sum / count as f64
        })
        .collect()
}

/// Drift of the demand profile over `covariate` between two periods.
///
/// Profiles are aligned by position and truncated to the shorter period.
pub fn covariate_profile_drift(
    detector: &DriftDetector,
    period1: &[HourlyFeatureRow],
    period2: &[HourlyFeatureRow],
    covariate: Covariate,
) -> Result<DriftReport, MonitorError> {
    let mut first = covariate_profile(period1, covariate);
    let mut second = covariate_profile(period2, covariate);
    let len = first.len().min(second.len());
    first.truncate(len);
    second.truncate(len);

    let report = detector.compute(&first, &second)?;
    info!(
        component = "monitor",
        event = "monitor.covariate_drift.finish",
        covariate = covariate.as_str(),
        aligned_rows = len,
        psi = report.psi,
        severity = report.severity.as_str()
    );
    Ok(report)
}
