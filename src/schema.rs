//! Column sets, schema fingerprints and the fixed role vocabulary.
//!
//! A source extract is described by its [`ColumnSet`]. Two extracts whose
//! column sets are set-equal share a [`SchemaFingerprint`], which is the key
//! for the mapping cache and the override store.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ROLE_COUNT: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    PickupTime,
    DropoffTime,
    Distance,
    Fare,
    Total,
    PassengerCount,
    PaymentType,
    PickupLon,
    PickupLat,
    DropoffLon,
    DropoffLat,
}

impl Role {
    pub const ALL: [Role; ROLE_COUNT] = [
        Role::PickupTime,
        Role::DropoffTime,
        Role::Distance,
        Role::Fare,
        Role::Total,
        Role::PassengerCount,
        Role::PaymentType,
        Role::PickupLon,
        Role::PickupLat,
        Role::DropoffLon,
        Role::DropoffLat,
    ];

    /// Field name used by the persisted override record.
    pub fn key(self) -> &'static str {
        match self {
            Self::PickupTime => "pickup_col",
            Self::DropoffTime => "dropoff_col",
            Self::Distance => "distance_col",
            Self::Fare => "fare_col",
            Self::Total => "total_col",
            Self::PassengerCount => "passenger_col",
            Self::PaymentType => "payment_type_col",
            Self::PickupLon => "pickup_long_col",
            Self::PickupLat => "pickup_lat_col",
            Self::DropoffLon => "dropoff_long_col",
            Self::DropoffLat => "dropoff_lat_col",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PickupTime => "pickup-time",
            Self::DropoffTime => "dropoff-time",
            Self::Distance => "distance",
            Self::Fare => "fare",
            Self::Total => "total",
            Self::PassengerCount => "passenger-count",
            Self::PaymentType => "payment-type",
            Self::PickupLon => "pickup-lon",
            Self::PickupLat => "pickup-lat",
            Self::DropoffLon => "dropoff-lon",
            Self::DropoffLat => "dropoff-lat",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unordered set of column names read from one source extract.
///
/// Insertion order is kept so operators can refer to columns by index, but
/// equality and fingerprinting ignore it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnSet {
    names: Vec<String>,
}

impl ColumnSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|candidate| candidate == name)
    }

    pub fn sorted(&self) -> Vec<&str> {
        let mut sorted: Vec<&str> = self.names.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        schema_fingerprint(self)
    }
}

impl PartialEq for ColumnSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted() == other.sorted()
    }
}

impl Eq for ColumnSet {}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaFingerprint(String);

impl SchemaFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SchemaFingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SchemaFingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 over the lexicographically sorted names joined by `,`.
pub fn schema_fingerprint(columns: &ColumnSet) -> SchemaFingerprint {
    let joined = columns.sorted().join(",");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    SchemaFingerprint(hex::encode(hasher.finalize()))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("column set is empty")]
    EmptyColumnSet,
    #[error("column '{column}' mapped to {role} is not present in the batch")]
    MissingColumn { role: Role, column: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("mapping incomplete for {operation}: unresolved roles [{}]", join_roles(.missing))]
pub struct MappingIncompleteError {
    pub operation: &'static str,
    pub missing: Vec<Role>,
}

fn join_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|role| role.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Role to column assignment for one schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RoleMappingRecord", into = "RoleMappingRecord")]
pub struct RoleMapping {
    columns: [Option<String>; ROLE_COUNT],
}

impl RoleMapping {
    pub fn get(&self, role: Role) -> Option<&str> {
        self.columns[role.index()].as_deref()
    }

    pub fn set(&mut self, role: Role, column: impl Into<String>) {
        self.columns[role.index()] = Some(column.into());
    }

    pub fn clear(&mut self, role: Role) {
        self.columns[role.index()] = None;
    }

    pub fn with(mut self, role: Role, column: impl Into<String>) -> Self {
        self.set(role, column);
        self
    }

    pub fn is_resolved(&self, role: Role) -> bool {
        self.columns[role.index()].is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.columns.iter().all(Option::is_some)
    }

    pub fn unresolved(&self) -> BTreeSet<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| !self.is_resolved(*role))
            .collect()
    }

    pub fn resolved(&self) -> impl Iterator<Item = (Role, &str)> + '_ {
        Role::ALL
            .into_iter()
            .filter_map(|role| self.get(role).map(|column| (role, column)))
    }

    /// Fails with the subset of `roles` that is still unresolved.
    pub fn require(
        &self,
        operation: &'static str,
        roles: &[Role],
    ) -> Result<(), MappingIncompleteError> {
        let missing: Vec<Role> = roles
            .iter()
            .copied()
            .filter(|role| !self.is_resolved(*role))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MappingIncompleteError { operation, missing })
        }
    }
}

/// Persisted shape of a [`RoleMapping`]: up to eleven named string fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMappingRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropoff_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fare_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passenger_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_type_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_long_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_lat_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropoff_long_col: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropoff_lat_col: Option<String>,
}

impl From<RoleMappingRecord> for RoleMapping {
    fn from(record: RoleMappingRecord) -> Self {
        Self {
            columns: [
                record.pickup_col,
                record.dropoff_col,
                record.distance_col,
                record.fare_col,
                record.total_col,
                record.passenger_col,
                record.payment_type_col,
                record.pickup_long_col,
                record.pickup_lat_col,
                record.dropoff_long_col,
                record.dropoff_lat_col,
            ],
        }
    }
}

impl From<RoleMapping> for RoleMappingRecord {
    fn from(mapping: RoleMapping) -> Self {
        let [
            pickup_col,
            dropoff_col,
            distance_col,
            fare_col,
            total_col,
            passenger_col,
            payment_type_col,
            pickup_long_col,
            pickup_lat_col,
            dropoff_long_col,
            dropoff_lat_col,
        ] = mapping.columns;
        Self {
            pickup_col,
            dropoff_col,
            distance_col,
            fare_col,
            total_col,
            passenger_col,
            payment_type_col,
            pickup_long_col,
            pickup_lat_col,
            dropoff_long_col,
            dropoff_lat_col,
        }
    }
}
