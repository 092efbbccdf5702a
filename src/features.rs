//! Hourly aggregation of cleaned trips and the feature-table contract.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::schema::{MappingIncompleteError, Role, RoleMapping, SchemaError};
use crate::table::{parse_number, parse_timestamp, TripTable};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const METRIC_COLUMNS: [&str; 7] = [
    "trip_count",
    "total_distance",
    "total_fare",
    "total_amount",
    "total_passengers",
    "total_duration",
    "pct_credit_card",
];

pub const COVARIATE_COLUMNS: [&str; 4] = ["hour", "weekday", "month", "year"];

const REQUIRED_ROLES: [Role; 6] = [
    Role::PickupTime,
    Role::DropoffTime,
    Role::Distance,
    Role::Fare,
    Role::Total,
    Role::PassengerCount,
];

const CREDIT: &str = "credit";

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(transparent)]
    MappingIncomplete(#[from] MappingIncompleteError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("year {0} is in both the train and the test split")]
    OverlappingSplit(i32),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureDType {
    Timestamp,
    I64,
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

/// Calendar covariates of one hour bucket. Weekday counts from Monday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CovariateRow {
    pub hour: u32,
    pub weekday: u32,
    pub month: u32,
    pub year: i32,
}

impl CovariateRow {
    pub fn from_bucket(bucket: NaiveDateTime) -> Self {
        Self {
            hour: bucket.hour(),
            weekday: bucket.weekday().num_days_from_monday(),
            month: bucket.month(),
            year: bucket.year(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyFeatureRow {
    pub hour_bucket: NaiveDateTime,
    pub trip_count: u64,
    pub total_distance: f64,
    pub total_fare: f64,
    pub total_amount: f64,
    pub total_passengers: f64,
    /// Sum of trip durations in minutes.
    pub total_duration: f64,
    pub pct_credit_card: f64,
    pub hour: u32,
    pub weekday: u32,
    pub month: u32,
    pub year: i32,
}

impl HourlyFeatureRow {
    pub fn covariates(&self) -> CovariateRow {
        CovariateRow {
            hour: self.hour,
            weekday: self.weekday,
            month: self.month,
            year: self.year,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AggregationReport {
    pub input_rows: u64,
    pub aggregated_rows: u64,
    /// Rows dropped because a pickup or dropoff timestamp did not parse.
    pub excluded_rows: u64,
    pub hour_buckets: u64,
}

#[derive(Debug, Default)]
struct HourAccumulator {
    trip_count: u64,
    total_distance: f64,
    total_fare: f64,
    total_amount: f64,
    total_passengers: f64,
    total_duration: f64,
    credit_trips: u64,
}

impl HourAccumulator {
    fn finish(self, bucket: NaiveDateTime) -> HourlyFeatureRow {
        let covariates = CovariateRow::from_bucket(bucket);
        HourlyFeatureRow {
            hour_bucket: bucket,
            trip_count: self.trip_count,
            total_distance: self.total_distance,
            total_fare: self.total_fare,
            total_amount: self.total_amount,
            total_passengers: self.total_passengers,
            total_duration: self.total_duration,
            pct_credit_card: self.credit_trips as f64 / self.trip_count as f64,
            hour: covariates.hour,
            weekday: covariates.weekday,
            month: covariates.month,
            year: covariates.year,
        }
    }
}

/// Buckets rows by pickup hour. Output is ascending by bucket.
///
/// An unresolved payment-type role counts every trip as non-credit.
pub fn aggregate(
    table: &TripTable,
    mapping: &RoleMapping,
) -> Result<(Vec<HourlyFeatureRow>, AggregationReport), FeatureError> {
    mapping.require("aggregate", &REQUIRED_ROLES)?;

    let column = |role: Role| -> Result<usize, SchemaError> {
        table
            .locate(mapping, role)?
            .ok_or_else(|| SchemaError::MissingColumn {
                role,
                column: String::new(),
            })
    };
    let pickup = column(Role::PickupTime)?;
    let dropoff = column(Role::DropoffTime)?;
    let distance = column(Role::Distance)?;
    let fare = column(Role::Fare)?;
    let total = column(Role::Total)?;
    let passengers = column(Role::PassengerCount)?;
    let payment = table.locate(mapping, Role::PaymentType)?;

    let mut buckets: BTreeMap<NaiveDateTime, HourAccumulator> = BTreeMap::new();
    let mut report = AggregationReport {
        input_rows: table.len() as u64,
        ..AggregationReport::default()
    };

    for row in table.rows() {
        let (Some(picked_up), Some(dropped_off)) =
            (parse_timestamp(&row[pickup]), parse_timestamp(&row[dropoff]))
        else {
            report.excluded_rows += 1;
            continue;
        };

        let acc = buckets.entry(floor_to_hour(picked_up)).or_default();
        acc.trip_count += 1;
        acc.total_distance += sum_cell(&row[distance]);
        acc.total_fare += sum_cell(&row[fare]);
        acc.total_amount += sum_cell(&row[total]);
        acc.total_passengers += sum_cell(&row[passengers]);
        acc.total_duration += (dropped_off - picked_up).num_milliseconds() as f64 / 60_000.0;
        if payment.is_some_and(|idx| row[idx].to_lowercase() == CREDIT) {
            acc.credit_trips += 1;
        }
        report.aggregated_rows += 1;
    }

    let rows: Vec<HourlyFeatureRow> = buckets
        .into_iter()
        .map(|(bucket, acc)| acc.finish(bucket))
        .collect();
    report.hour_buckets = rows.len() as u64;

    if report.excluded_rows > 0 {
        warn!(
            component = "features",
            event = "features.aggregate.excluded_rows",
            excluded_rows = report.excluded_rows,
            input_rows = report.input_rows
        );
    }
    info!(
        component = "features",
        event = "features.aggregate.finish",
        input_rows = report.input_rows,
        aggregated_rows = report.aggregated_rows,
        excluded_rows = report.excluded_rows,
        hour_buckets = report.hour_buckets,
        payment_type_resolved = payment.is_some()
    );

    Ok((rows, report))
}

pub fn build_feature_schema() -> FeatureSchema {
    let mut columns = vec![FeatureColumn {
        name: "hour_bucket".to_string(),
        dtype: FeatureDType::Timestamp,
    }];
    for name in METRIC_COLUMNS {
        let dtype = if name == "trip_count" {
            FeatureDType::I64
        } else {
            FeatureDType::F64
        };
        columns.push(FeatureColumn {
            name: name.to_string(),
            dtype,
        });
    }
    for name in COVARIATE_COLUMNS {
        columns.push(FeatureColumn {
            name: name.to_string(),
            dtype: FeatureDType::I64,
        });
    }

    let fingerprint = feature_schema_fingerprint(FEATURE_SCHEMA_VERSION, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = FEATURE_SCHEMA_VERSION,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Splits rows by calendar year into (train, test). Rows in neither set are dropped.
pub fn split_by_years(
    rows: &[HourlyFeatureRow],
    train_years: &[i32],
    test_years: &[i32],
) -> Result<(Vec<HourlyFeatureRow>, Vec<HourlyFeatureRow>), FeatureError> {
    let train: BTreeSet<i32> = train_years.iter().copied().collect();
    let test: BTreeSet<i32> = test_years.iter().copied().collect();
    if let Some(year) = train.intersection(&test).next() {
        return Err(FeatureError::OverlappingSplit(*year));
    }

    let pick = |years: &BTreeSet<i32>| -> Vec<HourlyFeatureRow> {
        rows.iter()
            .filter(|row| years.contains(&row.year))
            .cloned()
            .collect()
    };
    Ok((pick(&train), pick(&test)))
}

/// Covariates for every hour of `date`, used to forecast a full day.
pub fn daily_covariate_grid(date: NaiveDate) -> Vec<CovariateRow> {
    (0..24)
        .filter_map(|hour| date.and_hms_opt(hour, 0, 0))
        .map(CovariateRow::from_bucket)
        .collect()
}

pub fn write_features_csv<W: Write>(
    rows: &[HourlyFeatureRow],
    writer: W,
) -> Result<(), FeatureError> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn floor_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts - Duration::minutes(i64::from(ts.minute()))
        - Duration::seconds(i64::from(ts.second()))
        - Duration::nanoseconds(i64::from(ts.nanosecond()))
}

// Missing cells do not contribute to sums.
fn sum_cell(raw: &str) -> f64 {
    parse_number(raw).unwrap_or(0.0)
}

fn feature_schema_fingerprint(version: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(match column.dtype {
            FeatureDType::Timestamp => ":timestamp;",
            FeatureDType::I64 => ":i64;",
            FeatureDType::F64 => ":f64;",
        });
    }
    hex::encode(hasher.finalize())
}
