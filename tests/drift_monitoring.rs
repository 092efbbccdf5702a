use std::collections::HashMap;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use tripwatch::{
    aggregate, assert_schema_compatible, build_feature_schema, compare_to_reference,
    covariate_profile_drift, daily_covariate_grid, regression_metrics, residual_drift, residuals,
    split_by_years, Covariate, CovariateRow, DriftConfig, DriftDetector, DriftSeverity,
    HourlyFeatureRow, Role, RoleMapping, TripTable, FEATURE_SCHEMA_VERSION,
};

const COLUMNS: [&str; 7] = [
    "pickup_datetime",
    "dropoff_datetime",
    "trip_distance",
    "fare_amount",
    "total_amount",
    "passenger_count",
    "payment_type",
];

fn mapping() -> RoleMapping {
    [
        Role::PickupTime,
        Role::DropoffTime,
        Role::Distance,
        Role::Fare,
        Role::Total,
        Role::PassengerCount,
        Role::PaymentType,
    ]
    .into_iter()
    .zip(COLUMNS)
    .fold(RoleMapping::default(), |mapping, (role, column)| {
        mapping.with(role, column)
    })
}

fn base_demand(hour: u32) -> u64 {
    1 + u64::from(hour / 4)
}

/// One week of trips starting at `start`; `demand` gives trips per hour of day.
fn week_of_trips(start: NaiveDate, demand: impl Fn(u32) -> u64) -> Vec<Vec<String>> {
    let fmt = "%Y-%m-%d %H:%M:%S";
    let midnight: NaiveDateTime = start.and_hms_opt(0, 0, 0).unwrap();
    let mut rows = Vec::new();
    for hour_offset in 0..(7 * 24) {
        let hour_start = midnight + Duration::hours(hour_offset);
        let hour = (hour_offset % 24) as u32;
        for trip in 0..demand(hour) {
            let pickup = hour_start + Duration::minutes(trip as i64);
            let dropoff = pickup + Duration::minutes(12);
            rows.push(vec![
                pickup.format(fmt).to_string(),
                dropoff.format(fmt).to_string(),
                "2.5".to_string(),
                "11".to_string(),
                "13.5".to_string(),
                "1".to_string(),
                if trip % 2 == 0 { "Credit" } else { "Cash" }.to_string(),
            ]);
        }
    }
    rows
}

fn two_periods() -> (Vec<HourlyFeatureRow>, Vec<HourlyFeatureRow>) {
    let mut rows = week_of_trips(NaiveDate::from_ymd_opt(2014, 6, 2).unwrap(), base_demand);
    rows.extend(week_of_trips(
        NaiveDate::from_ymd_opt(2015, 6, 1).unwrap(),
        |hour| 2 * base_demand((hour + 12) % 24),
    ));
    let table = TripTable::new(COLUMNS.iter().map(|c| c.to_string()).collect(), rows).unwrap();

    let (features, report) = aggregate(&table, &mapping()).expect("aggregation succeeds");
    assert_eq!(report.excluded_rows, 0);
    assert_eq!(features.len(), 2 * 7 * 24);

    split_by_years(&features, &[2014], &[2015]).expect("years do not overlap")
}

fn hourly_mean_model(train: &[HourlyFeatureRow]) -> impl Fn(&CovariateRow) -> f64 {
    let mut sums: HashMap<u32, (f64, f64)> = HashMap::new();
    for row in train {
        let entry = sums.entry(row.hour).or_default();
        entry.0 += row.trip_count as f64;
        entry.1 += 1.0;
    }
    move |covariates: &CovariateRow| {
        sums.get(&covariates.hour)
            .map(|(sum, count)| sum / count)
            .unwrap_or(0.0)
    }
}

#[test]
fn feature_schema_contract_is_stable() {
    let schema = build_feature_schema();
    assert_schema_compatible(FEATURE_SCHEMA_VERSION, &schema.fingerprint, &build_feature_schema())
        .expect("same build is compatible");

    let names: Vec<&str> = schema.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(&names[names.len() - 4..], ["hour", "weekday", "month", "year"]);
}

#[test]
fn model_fit_degrades_on_the_shifted_period() {
    let (train, test) = two_periods();
    assert_eq!(train.len(), 168);
    assert_eq!(test.len(), 168);
    let model = hourly_mean_model(&train);

    let train_actual: Vec<f64> = train.iter().map(|r| r.trip_count as f64).collect();
    let train_pred: Vec<f64> = train.iter().map(|r| model(&r.covariates())).collect();
    let reference = regression_metrics(&train_actual, &train_pred).unwrap();
    assert_eq!(reference.r2, 1.0);
    assert_eq!(reference.mae, 0.0);

    let test_actual: Vec<f64> = test.iter().map(|r| r.trip_count as f64).collect();
    let test_pred: Vec<f64> = test.iter().map(|r| model(&r.covariates())).collect();
    let current = regression_metrics(&test_actual, &test_pred).unwrap();

    let comparison = compare_to_reference(current, reference);
    assert!(comparison.degraded);
    assert!(comparison.r2_drop > 0.10);

    let forecast: Vec<f64> = daily_covariate_grid(NaiveDate::from_ymd_opt(2016, 1, 4).unwrap())
        .iter()
        .map(|cov| model(cov))
        .collect();
    assert_eq!(forecast.len(), 24);
    assert_eq!(forecast[0], 1.0);
    assert_eq!(forecast[23], 6.0);
}

#[test]
fn residual_drift_flags_concept_shift() {
    let (train, test) = two_periods();
    let model = hourly_mean_model(&train);
    let detector = DriftDetector::new(DriftConfig { buckets: 10 });

    assert!(residuals(&train, &model).iter().all(|r| *r == 0.0));

    let stable = residual_drift(&detector, &model, &train, &train).unwrap();
    assert_eq!(stable.severity, DriftSeverity::None);

    let shifted = residual_drift(&detector, &model, &train, &test).unwrap();
    assert_eq!(shifted.severity, DriftSeverity::Severe);
    assert!(shifted.ks_p_value < 0.01);
}

#[test]
fn demand_profiles_drift_between_years() {
    let (train, test) = two_periods();
    let detector = DriftDetector::default();

    let by_hour = covariate_profile_drift(&detector, &train, &test, Covariate::Hour).unwrap();
    assert_eq!(by_hour.severity, DriftSeverity::Severe);

    let by_weekday = covariate_profile_drift(&detector, &train, &test, Covariate::Weekday).unwrap();
    assert_eq!(by_weekday.severity, DriftSeverity::Severe);
    assert_eq!(by_weekday.ks_statistic, 1.0);

    let same = covariate_profile_drift(&detector, &test, &test, Covariate::Month).unwrap();
    assert_eq!(same.severity, DriftSeverity::None);
    assert_eq!(same.psi, 0.0);
}
