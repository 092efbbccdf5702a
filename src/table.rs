//! In-memory batch of raw trip rows as delivered by a source reader.

use std::fs;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;
use tracing::debug;

use crate::schema::{ColumnSet, Role, RoleMapping, SchemaError};

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
}

/// Rows of string cells under a header. Row identity is the row index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TripTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TableError> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(TableError::RaggedRow {
                    row: idx,
                    found: row.len(),
                    expected: columns.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        debug!(
            component = "table",
            event = "table.csv.loaded",
            column_count = columns.len(),
            row_count = rows.len()
        );

        Self::new(columns, rows)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, TableError> {
        let file = fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_set(&self) -> ColumnSet {
        ColumnSet::new(self.columns.iter().cloned())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, idx: usize) -> Option<&[String]> {
        self.rows.get(idx).map(Vec::as_slice)
    }

    pub fn rows(&self) -> impl Iterator<Item = &[String]> + '_ {
        self.rows.iter().map(Vec::as_slice)
    }

    /// First row, used to show operators example values per column.
    pub fn sample_row(&self) -> Option<&[String]> {
        self.row(0)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Position of the column mapped to `role`; `None` when the role is unresolved.
    pub fn locate(&self, mapping: &RoleMapping, role: Role) -> Result<Option<usize>, SchemaError> {
        let Some(column) = mapping.get(role) else {
            return Ok(None);
        };
        self.column_index(column)
            .map(Some)
            .ok_or_else(|| SchemaError::MissingColumn {
                role,
                column: column.to_string(),
            })
    }

    /// Copy of the rows at `ids`, in the given order.
    pub fn select_rows(&self, ids: &[usize]) -> TripTable {
        TripTable {
            columns: self.columns.clone(),
            rows: ids
                .iter()
                .filter_map(|idx| self.rows.get(*idx).cloned())
                .collect(),
        }
    }
}

impl From<&TripTable> for ColumnSet {
    fn from(table: &TripTable) -> Self {
        table.column_set()
    }
}

/// Parses a numeric cell. Blank or malformed cells are missing.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|value| !value.is_nan())
}

/// Parses a timestamp cell into naive wall-clock time.
///
/// RFC 3339 values with an offset are converted to UTC first.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    for format in TIMESTAMP_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(parsed);
        }
    }

    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|parsed| parsed.naive_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    #[test]
    fn reads_csv_with_trimmed_cells() {
        let body =
            "pickup_datetime, fare_amount\n2015-06-01 08:15:00 , 12.5\n2015-06-01 09:00:00,3\n";
        let table = TripTable::from_csv_reader(body.as_bytes()).expect("csv parses");

        assert_eq!(table.columns(), ["pickup_datetime", "fare_amount"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.row(0).unwrap()[0], "2015-06-01 08:15:00");
        assert_eq!(table.sample_row().unwrap()[1], "12.5");
        assert_eq!(
            ColumnSet::from(&table),
            ColumnSet::new(["fare_amount", "pickup_datetime"])
        );
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = TripTable::new(
            vec!["a".to_string(), "b".to_string()],
            vec![vec!["1".to_string()]],
        )
        .expect_err("ragged row");
        assert!(matches!(
            err,
            TableError::RaggedRow {
                row: 0,
                found: 1,
                expected: 2
            }
        ));
    }

    #[test]
    fn locate_reports_mapped_column_absent_from_batch() {
        let table = TripTable::new(vec!["fare".to_string()], Vec::new()).unwrap();
        let mapping = RoleMapping::default()
            .with(Role::Fare, "fare")
            .with(Role::Total, "total_amount");

        assert_eq!(table.locate(&mapping, Role::Fare).unwrap(), Some(0));
        assert_eq!(table.locate(&mapping, Role::Distance).unwrap(), None);
        assert_eq!(
            table.locate(&mapping, Role::Total).unwrap_err(),
            SchemaError::MissingColumn {
                role: Role::Total,
                column: "total_amount".to_string()
            }
        );
    }

    #[test]
    fn parses_numbers_and_treats_blank_as_missing() {
        assert_eq!(parse_number(" 3.25 "), Some(3.25));
        assert_eq!(parse_number("-1"), Some(-1.0));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number("NaN"), None);
    }

    #[test]
    fn parses_common_timestamp_layouts() {
        let expected = NaiveDate::from_ymd_opt(2015, 6, 1)
            .unwrap()
            .and_hms_opt(8, 15, 30)
            .unwrap();

        assert_eq!(parse_timestamp("2015-06-01 08:15:30"), Some(expected));
        assert_eq!(parse_timestamp("2015-06-01T08:15:30"), Some(expected));
        assert_eq!(parse_timestamp("2015-06-01T10:15:30+02:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2015-06-01 08:15:30.500").map(|ts| ts.nanosecond()),
            Some(500_000_000)
        );
        assert_eq!(parse_timestamp("not a time"), None);
        assert_eq!(parse_timestamp(""), None);
    }
}
