//! Tripwatch core crate.
//!
//! Current implemented scope:
//! - schema fingerprints and role mapping with persisted operator overrides
//! - rule-based trip cleaning with per-row removal reasons
//! - hourly feature aggregation with calendar covariates
//! - PSI / KS drift detection and model monitoring helpers

mod cleaning;
mod drift;
mod features;
mod mapping;
mod monitor;
mod observability;
mod pipeline;
mod schema;
mod table;

pub use cleaning::{
    clean, required_roles, CleaningConfig, CleaningError, CleaningOutcome, CleaningReport,
    DerivedTrip, RemovalReason, TripValues,
};
pub use drift::{
    interpret, ks_two_sample, population_stability_index, DriftConfig, DriftDetector, DriftError,
    DriftReport, DriftSeverity, KsResult,
};
pub use features::{
    aggregate, assert_schema_compatible, build_feature_schema, daily_covariate_grid,
    split_by_years, write_features_csv, AggregationReport, CovariateRow, FeatureColumn,
    FeatureDType, FeatureError, FeatureSchema, HourlyFeatureRow, COVARIATE_COLUMNS,
    FEATURE_SCHEMA_VERSION, METRIC_COLUMNS,
};
pub use mapping::{
    infer_mapping, infer_role, ColumnCandidate, FixedResolver, InMemoryOverrideStore,
    JsonFileOverrideStore, MapperConfig, MappingError, MappingResolution, MappingSource,
    MappingStore, OverrideStore, OverrideStoreError, ResolutionRequest, Resolver, SchemaMapper,
    SkipResolver, SqliteOverrideStore,
};
pub use monitor::{
    compare_to_reference, covariate_profile, covariate_profile_drift, regression_metrics,
    residual_drift, residuals, Covariate, MonitorError, ReferenceComparison, RegressionMetrics,
    TripCountModel, MAX_R2_DROP,
};
pub use observability::{
    init_logging, log_app_start, log_batch_loaded, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    combined_features, interactive_from_env, open_mapping_store, open_override_store,
    pipeline_config_from_env, process_batch, run_batches, BatchOutcome, BatchRun, PipelineConfig, PipelineError,
};
pub use schema::{
    schema_fingerprint, ColumnSet, MappingIncompleteError, Role, RoleMapping, RoleMappingRecord,
    SchemaError, SchemaFingerprint, ROLE_COUNT,
};
pub use table::{parse_number, parse_timestamp, TableError, TripTable};
