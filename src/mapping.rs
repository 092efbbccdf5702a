//! Schema-adaptive role mapping.
//!
//! Resolution order for a column set:
//! 1. persisted override store (operator-confirmed mappings)
//! 2. in-memory cache of mappings resolved earlier in this run
//! 3. substring heuristics over lower-cased column names
//! 4. an optional [`Resolver`] for roles the heuristics could not fill
//!
//! The override store is written only after a resolution finished without
//! error, and every write goes through [`OverrideStore::update`], which is a
//! single read-merge-write critical section.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::schema::{ColumnSet, Role, RoleMapping, SchemaError, SchemaFingerprint};

static JSON_STORE_LOCK: Mutex<()> = Mutex::new(());
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum OverrideStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("override record encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("override store error: {0}")]
    Store(#[from] OverrideStoreError),
}

/// Persisted fingerprint to mapping records.
pub trait OverrideStore: Send {
    fn load(
        &self,
        fingerprint: &SchemaFingerprint,
    ) -> Result<Option<RoleMapping>, OverrideStoreError>;

    /// Reads the current entry, applies `apply` and writes the result back
    /// without letting another writer interleave.
    fn update(
        &mut self,
        fingerprint: &SchemaFingerprint,
        apply: &mut dyn FnMut(Option<RoleMapping>) -> RoleMapping,
    ) -> Result<RoleMapping, OverrideStoreError>;

    fn entries(&self) -> Result<BTreeMap<SchemaFingerprint, RoleMapping>, OverrideStoreError>;

    fn upsert(
        &mut self,
        fingerprint: &SchemaFingerprint,
        mapping: &RoleMapping,
    ) -> Result<(), OverrideStoreError> {
        self.update(fingerprint, &mut |_: Option<RoleMapping>| mapping.clone())
            .map(|_| ())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryOverrideStore {
    entries: BTreeMap<SchemaFingerprint, RoleMapping>,
}

impl InMemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, fingerprint: SchemaFingerprint, mapping: RoleMapping) -> Self {
        self.entries.insert(fingerprint, mapping);
        self
    }
}

impl OverrideStore for InMemoryOverrideStore {
    fn load(
        &self,
        fingerprint: &SchemaFingerprint,
    ) -> Result<Option<RoleMapping>, OverrideStoreError> {
        Ok(self.entries.get(fingerprint).cloned())
    }

    fn update(
        &mut self,
        fingerprint: &SchemaFingerprint,
        apply: &mut dyn FnMut(Option<RoleMapping>) -> RoleMapping,
    ) -> Result<RoleMapping, OverrideStoreError> {
        let merged = apply(self.entries.get(fingerprint).cloned());
        self.entries.insert(fingerprint.clone(), merged.clone());
        Ok(merged)
    }

    fn entries(&self) -> Result<BTreeMap<SchemaFingerprint, RoleMapping>, OverrideStoreError> {
        Ok(self.entries.clone())
    }
}

/// SQLite-backed store; safe to share between processes.
pub struct SqliteOverrideStore {
    conn: Connection,
}

impl SqliteOverrideStore {
    pub fn open(path: &Path) -> Result<Self, OverrideStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, OverrideStoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, OverrideStoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mapping_overrides (
                fingerprint TEXT PRIMARY KEY,
                mapping_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }
}

impl OverrideStore for SqliteOverrideStore {
    fn load(
        &self,
        fingerprint: &SchemaFingerprint,
    ) -> Result<Option<RoleMapping>, OverrideStoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT mapping_json FROM mapping_overrides WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str::<RoleMapping>(&json))
            .transpose()
            .map_err(Into::into)
    }

    fn update(
        &mut self,
        fingerprint: &SchemaFingerprint,
        apply: &mut dyn FnMut(Option<RoleMapping>) -> RoleMapping,
    ) -> Result<RoleMapping, OverrideStoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT mapping_json FROM mapping_overrides WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .map(|json| serde_json::from_str::<RoleMapping>(&json))
            .transpose()?;

        let merged = apply(current);
        tx.execute(
            "
            INSERT INTO mapping_overrides (fingerprint, mapping_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(fingerprint) DO UPDATE SET
                mapping_json = excluded.mapping_json,
                updated_at = excluded.updated_at
            ",
            params![
                fingerprint.as_str(),
                serde_json::to_string(&merged)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(merged)
    }

    fn entries(&self) -> Result<BTreeMap<SchemaFingerprint, RoleMapping>, OverrideStoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT fingerprint, mapping_json FROM mapping_overrides")?;
        let mut rows = stmt.query([])?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let fingerprint: String = row.get(0)?;
            let json: String = row.get(1)?;
            out.insert(
                SchemaFingerprint::from(fingerprint),
                serde_json::from_str(&json)?,
            );
        }
        Ok(out)
    }
}

/// JSON document of `{fingerprint: record}` entries on disk.
#[derive(Debug, Clone)]
pub struct JsonFileOverrideStore {
    path: PathBuf,
}

impl JsonFileOverrideStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<SchemaFingerprint, RoleMapping>, OverrideStoreError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_all(
        &self,
        entries: &BTreeMap<SchemaFingerprint, RoleMapping>,
    ) -> Result<(), OverrideStoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

impl OverrideStore for JsonFileOverrideStore {
    fn load(
        &self,
        fingerprint: &SchemaFingerprint,
    ) -> Result<Option<RoleMapping>, OverrideStoreError> {
        Ok(self.read_all()?.remove(fingerprint))
    }

    fn update(
        &mut self,
        fingerprint: &SchemaFingerprint,
        apply: &mut dyn FnMut(Option<RoleMapping>) -> RoleMapping,
    ) -> Result<RoleMapping, OverrideStoreError> {
        let _guard = JSON_STORE_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries = self.read_all()?;
        let merged = apply(entries.get(fingerprint).cloned());
        entries.insert(fingerprint.clone(), merged.clone());
        self.write_all(&entries)?;
        Ok(merged)
    }

    fn entries(&self) -> Result<BTreeMap<SchemaFingerprint, RoleMapping>, OverrideStoreError> {
        self.read_all()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid store path: {}", path.display()),
            )
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingSource {
    OverrideStore,
    Cache,
    Inferred,
}

/// Owns the run-local cache and the handle to the persisted overrides.
pub struct MappingStore {
    cache: HashMap<SchemaFingerprint, RoleMapping>,
    overrides: Box<dyn OverrideStore>,
}

impl MappingStore {
    pub fn new(overrides: impl OverrideStore + 'static) -> Self {
        Self::from_boxed(Box::new(overrides))
    }

    pub fn from_boxed(overrides: Box<dyn OverrideStore>) -> Self {
        Self {
            cache: HashMap::new(),
            overrides,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(InMemoryOverrideStore::new())
    }

    pub fn cached(&self, fingerprint: &SchemaFingerprint) -> Option<&RoleMapping> {
        self.cache.get(fingerprint)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn overrides(&self) -> &dyn OverrideStore {
        self.overrides.as_ref()
    }

    /// Override entries win over cached ones; a hit refreshes the cache.
    pub fn lookup(
        &mut self,
        fingerprint: &SchemaFingerprint,
    ) -> Result<Option<(RoleMapping, MappingSource)>, OverrideStoreError> {
        if let Some(mapping) = self.overrides.load(fingerprint)? {
            self.cache.insert(fingerprint.clone(), mapping.clone());
            return Ok(Some((mapping, MappingSource::OverrideStore)));
        }
        Ok(self
            .cache
            .get(fingerprint)
            .cloned()
            .map(|mapping| (mapping, MappingSource::Cache)))
    }

    pub fn cache_mapping(&mut self, fingerprint: SchemaFingerprint, mapping: RoleMapping) {
        self.cache.insert(fingerprint, mapping);
    }

    /// Writes `mapping` unless another writer already stored one; returns the stored entry.
    pub fn persist(
        &mut self,
        fingerprint: &SchemaFingerprint,
        mapping: &RoleMapping,
    ) -> Result<RoleMapping, OverrideStoreError> {
        let stored = self
            .overrides
            .update(fingerprint, &mut |current: Option<RoleMapping>| {
                current.unwrap_or_else(|| mapping.clone())
            })?;
        self.cache.insert(fingerprint.clone(), stored.clone());
        Ok(stored)
    }

    /// Records an operator-confirmed column for one role.
    ///
    /// The persisted entry is merged with whatever is already stored (or
    /// cached) for the fingerprint, so earlier confirmations survive.
    pub fn confirm_override(
        &mut self,
        fingerprint: &SchemaFingerprint,
        role: Role,
        column: &str,
    ) -> Result<RoleMapping, OverrideStoreError> {
        self.confirm_overrides(fingerprint, &[(role, column.to_string())])
    }

    /// Records several confirmed roles in one store write.
    pub fn confirm_overrides(
        &mut self,
        fingerprint: &SchemaFingerprint,
        confirmed: &[(Role, String)],
    ) -> Result<RoleMapping, OverrideStoreError> {
        let cached = self.cache.get(fingerprint).cloned();
        let merged = self
            .overrides
            .update(fingerprint, &mut |current: Option<RoleMapping>| {
                let mut base = current.or_else(|| cached.clone()).unwrap_or_default();
                for (role, column) in confirmed {
                    base.set(*role, column.clone());
                }
                base
            })?;
        self.cache.insert(fingerprint.clone(), merged.clone());

        for (role, column) in confirmed {
            info!(
                component = "mapping",
                event = "mapping.override.confirmed",
                fingerprint = %fingerprint,
                role = %role,
                column = column.as_str()
            );
        }
        Ok(merged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnCandidate<'a> {
    pub index: usize,
    pub name: &'a str,
    pub sample: Option<&'a str>,
}

/// One role the heuristics left open, with every column as a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionRequest<'a> {
    pub fingerprint: &'a SchemaFingerprint,
    pub role: Role,
    pub candidates: Vec<ColumnCandidate<'a>>,
}

/// Supplies a column index for an unresolved role, or `None` to skip it.
pub trait Resolver {
    fn choose(&mut self, request: &ResolutionRequest<'_>) -> Option<usize>;
}

impl<F> Resolver for F
where
    F: FnMut(&ResolutionRequest<'_>) -> Option<usize>,
{
    fn choose(&mut self, request: &ResolutionRequest<'_>) -> Option<usize> {
        self(request)
    }
}

/// Batch policy: unresolved roles stay unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipResolver;

impl Resolver for SkipResolver {
    fn choose(&mut self, _request: &ResolutionRequest<'_>) -> Option<usize> {
        None
    }
}

/// Answers from a fixed role to column-name table.
#[derive(Debug, Clone, Default)]
pub struct FixedResolver {
    choices: HashMap<Role, String>,
}

impl FixedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, role: Role, column: impl Into<String>) -> Self {
        self.choices.insert(role, column.into());
        self
    }
}

impl Resolver for FixedResolver {
    fn choose(&mut self, request: &ResolutionRequest<'_>) -> Option<usize> {
        let wanted = self.choices.get(&request.role)?;
        request
            .candidates
            .iter()
            .find(|candidate| candidate.name == wanted)
            .map(|candidate| candidate.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperConfig {
    /// Persist heuristic mappings that resolved every role.
    pub persist_inferred: bool,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            persist_inferred: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingResolution {
    pub fingerprint: SchemaFingerprint,
    pub mapping: RoleMapping,
    pub unresolved: BTreeSet<Role>,
    pub source: MappingSource,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaMapper {
    config: MapperConfig,
}

impl SchemaMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> MapperConfig {
        self.config
    }

    /// Non-interactive resolution: roles the heuristics miss stay unresolved.
    pub fn resolve(
        &self,
        store: &mut MappingStore,
        columns: &ColumnSet,
        sample_row: Option<&[String]>,
    ) -> Result<MappingResolution, MappingError> {
        self.resolve_with(store, columns, sample_row, &mut SkipResolver)
    }

    pub fn resolve_with(
        &self,
        store: &mut MappingStore,
        columns: &ColumnSet,
        sample_row: Option<&[String]>,
        resolver: &mut dyn Resolver,
    ) -> Result<MappingResolution, MappingError> {
        if columns.is_empty() {
            return Err(SchemaError::EmptyColumnSet.into());
        }

        let fingerprint = columns.fingerprint();
        if let Some((mapping, source)) = store.lookup(&fingerprint)? {
            debug!(
                component = "mapping",
                event = "mapping.resolve.cache_hit",
                fingerprint = %fingerprint,
                source = ?source
            );
            return Ok(MappingResolution {
                unresolved: mapping.unresolved(),
                fingerprint,
                mapping,
                source,
            });
        }

        let mut mapping = infer_mapping(columns);
        let mut confirmed = Vec::new();
        for role in mapping.unresolved() {
            let request = ResolutionRequest {
                fingerprint: &fingerprint,
                role,
                candidates: candidates(columns, sample_row),
            };
            match resolver.choose(&request) {
                Some(index) if index < columns.len() => {
                    let column = columns.names()[index].clone();
                    mapping.set(role, column.clone());
                    confirmed.push((role, column));
                }
                Some(index) => warn!(
                    component = "mapping",
                    event = "mapping.resolve.invalid_choice",
                    fingerprint = %fingerprint,
                    role = %role,
                    index,
                    column_count = columns.len()
                ),
                None => {}
            }
        }

        let unresolved = mapping.unresolved();
        for role in &unresolved {
            warn!(
                component = "mapping",
                event = "mapping.resolve.unresolved_role",
                fingerprint = %fingerprint,
                role = %role
            );
        }

        store.cache_mapping(fingerprint.clone(), mapping.clone());
        if !confirmed.is_empty() {
            mapping = store.confirm_overrides(&fingerprint, &confirmed)?;
        } else if unresolved.is_empty() && self.config.persist_inferred {
            mapping = store.persist(&fingerprint, &mapping)?;
        }

        info!(
            component = "mapping",
            event = "mapping.resolve.inferred",
            fingerprint = %fingerprint,
            column_count = columns.len(),
            resolved_roles = mapping.resolved().count(),
            unresolved_roles = unresolved.len(),
            confirmed_roles = confirmed.len()
        );

        Ok(MappingResolution {
            unresolved: mapping.unresolved(),
            fingerprint,
            mapping,
            source: MappingSource::Inferred,
        })
    }
}

fn candidates<'a>(
    columns: &'a ColumnSet,
    sample_row: Option<&'a [String]>,
) -> Vec<ColumnCandidate<'a>> {
    columns
        .names()
        .iter()
        .enumerate()
        .map(|(index, name)| ColumnCandidate {
            index,
            name: name.as_str(),
            sample: sample_row
                .and_then(|row| row.get(index))
                .map(String::as_str),
        })
        .collect()
}

/// Runs the name heuristics over every column; the first column matching a role keeps it.
pub fn infer_mapping(columns: &ColumnSet) -> RoleMapping {
    let mut mapping = RoleMapping::default();
    for name in columns.names() {
        if let Some(role) = infer_role(name) {
            if !mapping.is_resolved(role) {
                mapping.set(role, name.clone());
            }
        }
    }
    mapping
}

/// Classifies one column name. Roles are tested in a fixed priority order and
/// a column is claimed by the first role whose pattern matches.
pub fn infer_role(column: &str) -> Option<Role> {
    let name = column.to_lowercase();
    let has = |needle: &str| name.contains(needle);

    if (has("pickup") && has("datetime")) || (has("start") && has("time")) {
        Some(Role::PickupTime)
    } else if (has("dropoff") && has("datetime")) || (has("end") && has("time")) {
        Some(Role::DropoffTime)
    } else if has("distance") {
        Some(Role::Distance)
    } else if has("fare") {
        Some(Role::Fare)
    } else if has("total") {
        Some(Role::Total)
    } else if has("passenger") {
        Some(Role::PassengerCount)
    } else if has("payment_type") {
        Some(Role::PaymentType)
    } else if has("pickup_long") || has("start_lon") {
        Some(Role::PickupLon)
    } else if has("pickup_lat") || has("start_lat") {
        Some(Role::PickupLat)
    } else if has("dropoff_long") || has("end_lon") {
        Some(Role::DropoffLon)
    } else if has("dropoff_lat") || has("end_lat") {
        Some(Role::DropoffLat)
    } else {
        None
    }
}
