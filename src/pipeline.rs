//! Batch driver: map, clean and aggregate each source extract in isolation.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::cleaning::{clean, CleaningConfig, CleaningError, CleaningReport};
use crate::drift::DriftConfig;
use crate::features::{aggregate, AggregationReport, FeatureError, HourlyFeatureRow};
use crate::mapping::{
    InMemoryOverrideStore, JsonFileOverrideStore, MapperConfig, MappingError, MappingSource,
    MappingStore, OverrideStore, OverrideStoreError, Resolver, SchemaMapper, SqliteOverrideStore,
};
use crate::observability::{env_bool, log_batch_loaded};
use crate::schema::{Role, RoleMapping, SchemaFingerprint};
use crate::table::{TableError, TripTable};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub cleaning: CleaningConfig,
    pub drift: DriftConfig,
    pub mapper: MapperConfig,
    /// `.json` selects the JSON file store, any other path SQLite. `None` keeps
    /// overrides in memory.
    pub override_store: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Cleaning(#[from] CleaningError),
    #[error(transparent)]
    Features(#[from] FeatureError),
    #[error(transparent)]
    Store(#[from] OverrideStoreError),
}

/// Per-file summary: how the schema was mapped and what cleaning and aggregation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub name: String,
    pub fingerprint: SchemaFingerprint,
    pub mapping: RoleMapping,
    pub mapping_source: MappingSource,
    pub unresolved: Vec<Role>,
    pub cleaning: CleaningReport,
    pub aggregation: AggregationReport,
    pub features: Vec<HourlyFeatureRow>,
}

#[derive(Debug)]
pub struct BatchRun {
    pub name: String,
    pub outcome: Result<BatchOutcome, PipelineError>,
}

impl BatchRun {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(max_speed) =
        env_parse::<f64>("TRIPWATCH_MAX_SPEED").filter(|v| v.is_finite() && *v > 0.0)
    {
        config.cleaning.max_speed = max_speed;
    }

    if let Some(remove) = env_bool("TRIPWATCH_REMOVE_ZERO_COORDS") {
        config.cleaning.remove_zero_coords = remove;
    }

    if let Some(buckets) = env_parse::<usize>("TRIPWATCH_PSI_BUCKETS").filter(|v| *v > 0) {
        config.drift.buckets = buckets;
    }

    if let Ok(raw) = env::var("TRIPWATCH_OVERRIDE_STORE") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            config.override_store = Some(PathBuf::from(trimmed));
        }
    }

    config
}

/// Whether unresolved roles should be put to an operator (`TRIPWATCH_INTERACTIVE`).
pub fn interactive_from_env() -> bool {
    env_bool("TRIPWATCH_INTERACTIVE").unwrap_or(false)
}

pub fn open_override_store(
    path: Option<&Path>,
) -> Result<Box<dyn OverrideStore>, OverrideStoreError> {
    let Some(path) = path else {
        return Ok(Box::new(InMemoryOverrideStore::new()));
    };

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(Box::new(JsonFileOverrideStore::new(path)))
    } else {
        Ok(Box::new(SqliteOverrideStore::open(path)?))
    }
}

pub fn open_mapping_store(config: &PipelineConfig) -> Result<MappingStore, OverrideStoreError> {
    let store = open_override_store(config.override_store.as_deref())?;
    Ok(MappingStore::from_boxed(store))
}

/// Runs one extract through mapping, cleaning and aggregation.
///
/// Any error aborts this batch only; the store keeps what earlier batches wrote.
pub fn process_batch(
    name: &str,
    table: &TripTable,
    store: &mut MappingStore,
    resolver: &mut dyn Resolver,
    config: &PipelineConfig,
) -> Result<BatchOutcome, PipelineError> {
    let mapper = SchemaMapper::new(config.mapper);
    let resolution = mapper.resolve_with(store, &table.column_set(), table.sample_row(), resolver)?;

    let cleaned = clean(table, &resolution.mapping, &config.cleaning)?;
    let kept = cleaned.kept_table(table);
    let (features, aggregation) = aggregate(&kept, &resolution.mapping)?;

    info!(
        component = "pipeline",
        event = "pipeline.batch.finish",
        batch = name,
        fingerprint = %resolution.fingerprint,
        mapping_source = ?resolution.source,
        unresolved_roles = resolution.unresolved.len(),
        original_rows = cleaned.report.original_rows,
        cleaned_rows = cleaned.report.cleaned_rows,
        rows_removed = cleaned.report.rows_removed,
        excluded_rows = aggregation.excluded_rows,
        hour_buckets = aggregation.hour_buckets
    );

    Ok(BatchOutcome {
        name: name.to_string(),
        fingerprint: resolution.fingerprint,
        mapping: resolution.mapping,
        mapping_source: resolution.source,
        unresolved: resolution.unresolved.into_iter().collect(),
        cleaning: cleaned.report,
        aggregation,
        features,
    })
}

/// Loads and processes every CSV path in order. A failing file is recorded and skipped.
pub fn run_batches(
    paths: &[PathBuf],
    store: &mut MappingStore,
    resolver: &mut dyn Resolver,
    config: &PipelineConfig,
) -> Vec<BatchRun> {
    let mut runs = Vec::with_capacity(paths.len());
    for path in paths {
        let name = batch_name(path);
        let outcome = TripTable::from_csv_path(path)
            .map_err(PipelineError::from)
            .and_then(|table| {
                log_batch_loaded(&name, path, table.len(), table.columns().len());
                process_batch(&name, &table, store, resolver, config)
            });

        if let Err(err) = &outcome {
            error!(
                component = "pipeline",
                event = "pipeline.batch.error",
                batch = %name,
                path = %path.display(),
                error = %err
            );
        }
        runs.push(BatchRun { name, outcome });
    }

    let failed = runs.iter().filter(|run| !run.is_ok()).count();
    info!(
        component = "pipeline",
        event = "pipeline.run.finish",
        batches = runs.len(),
        failed
    );
    runs
}

/// Feature rows of every successful batch, ascending by hour bucket.
pub fn combined_features(runs: &[BatchRun]) -> Vec<HourlyFeatureRow> {
    let mut rows: Vec<HourlyFeatureRow> = runs
        .iter()
        .filter_map(|run| run.outcome.as_ref().ok())
        .flat_map(|outcome| outcome.features.iter().cloned())
        .collect();
    rows.sort_by_key(|row| row.hour_bucket);
    rows
}

fn batch_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|raw| raw.trim().parse().ok())
}
