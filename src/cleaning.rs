//! Rule-based trip cleaning.
//!
//! Every rule is a predicate over the parsed values of one row. All rules are
//! evaluated for every row and a row matching any of them is removed once,
//! carrying the full set of matching reasons. Missing or malformed numeric
//! cells are NaN, so every comparison involving them is false.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::schema::{MappingIncompleteError, Role, RoleMapping, SchemaError};
use crate::table::{parse_number, parse_timestamp, TripTable};

const BASE_ROLES: [Role; 5] = [
    Role::PickupTime,
    Role::DropoffTime,
    Role::Distance,
    Role::Fare,
    Role::Total,
];

const COORDINATE_ROLES: [Role; 4] = [
    Role::PickupLon,
    Role::PickupLat,
    Role::DropoffLon,
    Role::DropoffLat,
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CleaningConfig {
    /// Upper bound on distance per hour of trip duration.
    pub max_speed: f64,
    pub remove_zero_coords: bool,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            max_speed: 100.0,
            remove_zero_coords: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum CleaningError {
    #[error(transparent)]
    MappingIncomplete(#[from] MappingIncompleteError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    NonPositiveTotal,
    ZeroDurationAndDistance,
    ZeroCoordinates,
    ImplausibleSpeed,
    NegativeDistance,
}

impl RemovalReason {
    pub const ALL: [RemovalReason; 5] = [
        RemovalReason::NonPositiveTotal,
        RemovalReason::ZeroDurationAndDistance,
        RemovalReason::ZeroCoordinates,
        RemovalReason::ImplausibleSpeed,
        RemovalReason::NegativeDistance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NonPositiveTotal => "non_positive_total",
            Self::ZeroDurationAndDistance => "zero_duration_and_distance",
            Self::ZeroCoordinates => "zero_coordinates",
            Self::ImplausibleSpeed => "implausible_speed",
            Self::NegativeDistance => "negative_distance",
        }
    }

    pub fn matches(self, trip: &TripValues, cfg: &CleaningConfig) -> bool {
        match self {
            Self::NonPositiveTotal => trip.total <= 0.0,
            Self::ZeroDurationAndDistance => trip.duration_minutes <= 0.0 && trip.distance <= 0.0,
            Self::ZeroCoordinates => {
                cfg.remove_zero_coords
                    && (trip.pickup_lon == 0.0 || trip.pickup_lat == 0.0)
                    && (trip.distance <= 0.0 || trip.fare <= 0.0)
            }
            Self::ImplausibleSpeed => {
                trip.duration_minutes <= 0.0 || trip.fare <= 0.0 || trip.speed > cfg.max_speed
            }
            Self::NegativeDistance => trip.distance < 0.0,
        }
    }
}

/// Parsed per-row values the rules look at. Missing values are NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripValues {
    pub duration_minutes: f64,
    pub speed: f64,
    pub distance: f64,
    pub fare: f64,
    pub total: f64,
    pub pickup_lon: f64,
    pub pickup_lat: f64,
}

/// Columns derived for each input row; the source row itself is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedTrip {
    pub duration_minutes: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CleaningReport {
    pub original_rows: u64,
    pub cleaned_rows: u64,
    pub rows_removed: u64,
    pub removed_by_reason: BTreeMap<RemovalReason, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleaningOutcome {
    /// Row indices that passed every rule, ascending.
    pub kept: Vec<usize>,
    /// Row indices matching at least one rule, ascending and unique.
    pub removed: Vec<usize>,
    pub reasons: BTreeMap<usize, BTreeSet<RemovalReason>>,
    /// One entry per input row, in input order.
    pub derived: Vec<DerivedTrip>,
    pub report: CleaningReport,
}

impl CleaningOutcome {
    pub fn kept_table(&self, table: &TripTable) -> TripTable {
        table.select_rows(&self.kept)
    }

    pub fn removed_table(&self, table: &TripTable) -> TripTable {
        table.select_rows(&self.removed)
    }

    pub fn reasons_for(&self, row: usize) -> Option<&BTreeSet<RemovalReason>> {
        self.reasons.get(&row)
    }
}

struct RuleColumns {
    pickup: usize,
    dropoff: usize,
    distance: usize,
    fare: usize,
    total: usize,
    pickup_lon: Option<usize>,
    pickup_lat: Option<usize>,
}

pub fn required_roles(cfg: &CleaningConfig) -> Vec<Role> {
    let mut roles = BASE_ROLES.to_vec();
    if cfg.remove_zero_coords {
        roles.extend(COORDINATE_ROLES);
    }
    roles
}

pub fn clean(
    table: &TripTable,
    mapping: &RoleMapping,
    cfg: &CleaningConfig,
) -> Result<CleaningOutcome, CleaningError> {
    mapping.require("clean", &required_roles(cfg))?;
    let columns = rule_columns(table, mapping, cfg)?;

    let mut kept = Vec::new();
    let mut removed = Vec::new();
    let mut reasons = BTreeMap::new();
    let mut derived = Vec::with_capacity(table.len());
    let mut removed_by_reason: BTreeMap<RemovalReason, u64> = BTreeMap::new();

    for (idx, row) in table.rows().enumerate() {
        let trip = trip_values(row, &columns);
        derived.push(DerivedTrip {
            duration_minutes: trip.duration_minutes,
            speed: trip.speed,
        });

        let matched: BTreeSet<RemovalReason> = RemovalReason::ALL
            .into_iter()
            .filter(|reason| reason.matches(&trip, cfg))
            .collect();

        if matched.is_empty() {
            kept.push(idx);
        } else {
            for reason in &matched {
                *removed_by_reason.entry(*reason).or_default() += 1;
            }
            removed.push(idx);
            reasons.insert(idx, matched);
        }
    }

    let report = CleaningReport {
        original_rows: table.len() as u64,
        cleaned_rows: kept.len() as u64,
        rows_removed: removed.len() as u64,
        removed_by_reason,
    };

    info!(
        component = "cleaning",
        event = "cleaning.finish",
        original_rows = report.original_rows,
        cleaned_rows = report.cleaned_rows,
        rows_removed = report.rows_removed,
        removed_by_reason = ?report.removed_by_reason,
        max_speed = cfg.max_speed,
        remove_zero_coords = cfg.remove_zero_coords
    );

    Ok(CleaningOutcome {
        kept,
        removed,
        reasons,
        derived,
        report,
    })
}

fn rule_columns(
    table: &TripTable,
    mapping: &RoleMapping,
    cfg: &CleaningConfig,
) -> Result<RuleColumns, SchemaError> {
    let required = |role: Role| -> Result<usize, SchemaError> {
        table.locate(mapping, role)?.ok_or_else(|| SchemaError::MissingColumn {
            role,
            column: String::new(),
        })
    };

    // Coordinates are only read when the zero-coordinate rule is on. The
    // dropoff pair is required then but no rule reads it.
    let (pickup_lon, pickup_lat) = if cfg.remove_zero_coords {
        table.locate(mapping, Role::DropoffLon)?;
        table.locate(mapping, Role::DropoffLat)?;
        (
            table.locate(mapping, Role::PickupLon)?,
            table.locate(mapping, Role::PickupLat)?,
        )
    } else {
        (None, None)
    };

    Ok(RuleColumns {
        pickup: required(Role::PickupTime)?,
        dropoff: required(Role::DropoffTime)?,
        distance: required(Role::Distance)?,
        fare: required(Role::Fare)?,
        total: required(Role::Total)?,
        pickup_lon,
        pickup_lat,
    })
}

fn trip_values(row: &[String], columns: &RuleColumns) -> TripValues {
    let number = |idx: usize| parse_number(&row[idx]).unwrap_or(f64::NAN);
    let optional = |idx: Option<usize>| idx.map(number).unwrap_or(f64::NAN);

    let duration_minutes = match (
        parse_timestamp(&row[columns.pickup]),
        parse_timestamp(&row[columns.dropoff]),
    ) {
        (Some(pickup), Some(dropoff)) => {
            (dropoff - pickup).num_milliseconds() as f64 / 60_000.0
        }
        _ => f64::NAN,
    };
    let distance = number(columns.distance);

    TripValues {
        duration_minutes,
        speed: distance / (duration_minutes / 60.0),
        distance,
        fare: number(columns.fare),
        total: number(columns.total),
        pickup_lon: optional(columns.pickup_lon),
        pickup_lat: optional(columns.pickup_lat),
    }
}
