use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tripwatch::{
    combined_features, open_mapping_store, process_batch, run_batches, CleaningError,
    FixedResolver, MappingSource, OverrideStore, PipelineConfig, PipelineError, RemovalReason,
    Role, SkipResolver, TripTable,
};

const YELLOW_2015: &str = "\
VendorID,tpep_pickup_datetime,tpep_dropoff_datetime,passenger_count,trip_distance,pickup_longitude,pickup_latitude,RateCodeID,dropoff_longitude,dropoff_latitude,payment_type,fare_amount,tip_amount,total_amount
2,2015-06-01 08:05:00,2015-06-01 08:20:00,1,2.0,-73.98,40.75,1,-73.95,40.77,Credit,10,2,12.8
1,2015-06-01 08:30:00,2015-06-01 08:45:00,2,3.0,-73.99,40.73,1,-73.97,40.76,Cash,13,0,13.8
1,2015-06-01 09:10:00,2015-06-01 09:25:00,1,10.0,-73.99,40.73,1,-73.97,40.76,Cash,20,0,-5
2,2015-06-01 09:40:00,2015-06-01 09:46:00,1,3.0,0,40.0,1,-73.97,40.76,Credit,15,3,20
";

const YELLOW_2009: &str = "\
vendor_name,Trip_Pickup_DateTime,Trip_Dropoff_DateTime,Passenger_Count,Trip_Distance,Start_Lon,Start_Lat,End_Lon,End_Lat,Payment_Type,Fare_Amt,Tip_Amt,Total_Amt
VTS,2009-01-04 02:52:00,2009-01-04 03:02:00,1,2.63,-73.99,40.72,-73.99,40.70,CASH,8.9,0,9.4
CMT,2009-01-04 02:10:00,2009-01-04 02:40:00,2,60.0,-73.99,40.72,-73.99,40.70,Credit,40,5,45
";

fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("fixture should be written");
    path
}

fn sqlite_config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        override_store: Some(dir.join("overrides.sqlite")),
        ..PipelineConfig::default()
    }
}

#[test]
fn every_file_is_processed_and_failures_stay_isolated() {
    let dir = TempDir::new().expect("temp dir");
    let paths = vec![
        write_csv(dir.path(), "yellow_2015_06.csv", YELLOW_2015),
        write_csv(
            dir.path(),
            "partial.csv",
            "pickup_datetime,fare_amount\n2015-06-01 08:05:00,10\n",
        ),
        write_csv(dir.path(), "yellow_2009_01.csv", YELLOW_2009),
        dir.path().join("missing.csv"),
    ];
    let config = sqlite_config(dir.path());
    let mut store = open_mapping_store(&config).expect("store opens");

    let runs = run_batches(&paths, &mut store, &mut SkipResolver, &config);

    assert_eq!(runs.len(), 4);
    let names: Vec<&str> = runs.iter().map(|run| run.name.as_str()).collect();
    assert_eq!(names, ["yellow_2015_06", "partial", "yellow_2009_01", "missing"]);

    let june = runs[0].outcome.as_ref().expect("2015 batch succeeds");
    assert!(june.unresolved.is_empty());
    assert_eq!(june.cleaning.original_rows, 4);
    assert_eq!(june.cleaning.cleaned_rows, 3);
    assert_eq!(june.cleaning.rows_removed, 1);
    assert_eq!(
        june.cleaning.removed_by_reason.get(&RemovalReason::NonPositiveTotal),
        Some(&1)
    );
    assert_eq!(june.features.len(), 2);
    assert_eq!(june.features[0].trip_count, 2);
    assert_eq!(june.features[0].total_distance, 5.0);
    assert_eq!(june.features[0].pct_credit_card, 0.5);
    assert_eq!(june.features[1].trip_count, 1);

    match &runs[1].outcome {
        Err(PipelineError::Cleaning(CleaningError::MappingIncomplete(err))) => {
            assert!(err.missing.contains(&Role::DropoffTime));
            assert!(err.missing.contains(&Role::Total));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // 60 miles in 30 minutes is removed as implausible.
    let january = runs[2].outcome.as_ref().expect("2009 batch succeeds");
    assert_eq!(january.mapping.get(Role::PickupLon), Some("Start_Lon"));
    assert_eq!(january.cleaning.cleaned_rows, 1);
    assert_eq!(
        january.cleaning.removed_by_reason.get(&RemovalReason::ImplausibleSpeed),
        Some(&1)
    );

    assert!(matches!(runs[3].outcome, Err(PipelineError::Table(_))));

    let combined = combined_features(&runs);
    assert_eq!(combined.len(), 3);
    assert!(combined
        .windows(2)
        .all(|pair| pair[0].hour_bucket < pair[1].hour_bucket));
    assert_eq!(combined[0].year, 2009);

    assert_eq!(store.overrides().entries().expect("entries load").len(), 2);
}

#[test]
fn persisted_mappings_are_reused_by_a_later_run() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_csv(dir.path(), "yellow_2015_06.csv", YELLOW_2015);
    let config = sqlite_config(dir.path());

    {
        let mut store = open_mapping_store(&config).expect("store opens");
        let runs = run_batches(&[path.clone()], &mut store, &mut SkipResolver, &config);
        let first = runs[0].outcome.as_ref().expect("batch succeeds");
        assert_eq!(first.mapping_source, MappingSource::Inferred);
    }

    let mut store = open_mapping_store(&config).expect("store reopens");
    let table = TripTable::from_csv_path(&path).expect("csv loads");
    let again = process_batch("again", &table, &mut store, &mut SkipResolver, &config)
        .expect("batch succeeds");
    assert_eq!(again.mapping_source, MappingSource::OverrideStore);
}

#[test]
fn operator_choices_land_in_the_json_store() {
    let dir = TempDir::new().expect("temp dir");
    let body = "\
pickup_datetime,dropoff_datetime,trip_distance,fare_amount,amount_due,passenger_count,payment_type,pickup_longitude,pickup_latitude,dropoff_longitude,dropoff_latitude
2015-06-01 08:05:00,2015-06-01 08:20:00,2.0,10,12,1,Credit,-73.98,40.75,-73.95,40.77
";
    let path = write_csv(dir.path(), "renamed_total.csv", body);
    let store_path = dir.path().join("mapping_overrides.json");
    let config = PipelineConfig {
        override_store: Some(store_path.clone()),
        ..PipelineConfig::default()
    };
    let table = TripTable::from_csv_path(&path).expect("csv loads");

    let mut store = open_mapping_store(&config).expect("store opens");
    let mut skip = SkipResolver;
    let err = process_batch("first", &table, &mut store, &mut skip, &config)
        .expect_err("total is not inferable");
    assert!(matches!(err, PipelineError::Cleaning(_)));
    assert!(!store_path.exists());

    let mut store = open_mapping_store(&config).expect("store opens");
    let mut operator = FixedResolver::new().with(Role::Total, "amount_due");
    let outcome = process_batch("second", &table, &mut store, &mut operator, &config)
        .expect("operator fills the gap");
    assert!(outcome.unresolved.is_empty());
    assert_eq!(outcome.features[0].total_amount, 12.0);

    let raw = fs::read_to_string(&store_path).expect("store file written");
    let json: serde_json::Value = serde_json::from_str(&raw).expect("store is json");
    let record = &json[outcome.fingerprint.as_str()];
    assert_eq!(record["total_col"], "amount_due");
    assert_eq!(record["pickup_col"], "pickup_datetime");
    assert_eq!(record["pickup_long_col"], "pickup_longitude");

    let mut store = open_mapping_store(&config).expect("store reopens");
    let replay = process_batch("third", &table, &mut store, &mut skip, &config)
        .expect("stored override applies");
    assert_eq!(replay.mapping_source, MappingSource::OverrideStore);
    assert_eq!(replay.mapping.get(Role::Total), Some("amount_due"));
}
