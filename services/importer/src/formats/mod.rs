//! Import formats
//!
//! A format owns its header contract and turns one raw row into a typed row.
//! It also says which government and department a row belongs to and how the
//! row's parent project is keyed; the orchestrator does the rest.

pub mod eqprs;
pub mod irm;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::header::{HeaderLayout, HeaderSpec};
use crate::rows::RawRow;
use crate::scope::Sphere;
use crate::store::ImportKind;

/// Problems confined to one row. The row is skipped and reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("\"{column}\" is required")]
    Missing { column: &'static str },

    #[error("\"{column}\" is not a number: \"{value}\"")]
    InvalidNumber { column: &'static str, value: String },

    #[error("\"{column}\" is not a date: \"{value}\"")]
    InvalidDate { column: &'static str, value: String },
}

/// Names of the entities a row refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRefs {
    pub government: String,
    /// Department, or a public entity reporting in its place
    pub department: String,
    /// Category group (the sector column), when the row names one
    pub category: Option<String>,
}

pub trait SnapshotFormat: Send + Sync {
    type Row: Serialize + Send + Sync;

    fn kind(&self) -> ImportKind;

    fn header_spec(&self) -> &HeaderSpec;

    fn parse_row(&self, raw: &RawRow, layout: &HeaderLayout) -> Result<Self::Row, RowError>;

    /// Government, department and category names; `national_government`
    /// names the single government of the national sphere.
    fn entity_refs(
        &self,
        row: &Self::Row,
        sphere: Sphere,
        national_government: &str,
    ) -> Result<EntityRefs, RowError>;

    /// External id of the row's parent project.
    fn parent_key(&self, row: &Self::Row, department_id: Uuid) -> String;

    fn display_name(&self, row: &Self::Row) -> String;
}

// =============================================================================
// Cell access
// =============================================================================

/// Named access to the fixed columns of a validated row.
pub(crate) struct Fields<'a> {
    raw: &'a RawRow,
    spec: &'a HeaderSpec,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(raw: &'a RawRow, spec: &'a HeaderSpec) -> Self {
        Self { raw, spec }
    }

    pub(crate) fn text(&self, column: &'static str) -> Option<String> {
        self.spec
            .position(column)
            .and_then(|idx| self.raw.text(idx))
            .map(str::to_string)
    }

    pub(crate) fn required(&self, column: &'static str) -> Result<String, RowError> {
        self.text(column).ok_or(RowError::Missing { column })
    }

    pub(crate) fn number(&self, column: &'static str) -> Result<Option<f64>, RowError> {
        self.text(column)
            .map(|value| parse_number(&value).ok_or(RowError::InvalidNumber { column, value }))
            .transpose()
    }

    pub(crate) fn date(&self, column: &'static str) -> Result<Option<NaiveDate>, RowError> {
        self.text(column)
            .map(|value| parse_date(&value).ok_or(RowError::InvalidDate { column, value }))
            .transpose()
    }
}

/// Amounts as exported: `1 234 567.89`, `1,234,567.89`, `R 1200`.
pub fn parse_number(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .trim_start_matches(['R', 'r'])
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// ISO dates, `dd/mm/yyyy`, datetimes, or spreadsheet serial numbers.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%d/%m/%Y") {
        return Some(date);
    }
    // Excel serial day, epoch 1899-12-30
    let serial: f64 = value.parse().ok()?;
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_signed(Duration::days(serial.trunc() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_formats() {
        assert_eq!(parse_number("1 234 567.89"), Some(1_234_567.89));
        assert_eq!(parse_number("1,200"), Some(1200.0));
        assert_eq!(parse_number("R 1200"), Some(1200.0));
        assert_eq!(parse_number("-5"), Some(-5.0));
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn test_parse_date_formats() {
        let d = NaiveDate::from_ymd_opt(2023, 7, 1).unwrap();
        assert_eq!(parse_date("2023-07-01"), Some(d));
        assert_eq!(parse_date("2023-07-01 00:00:00"), Some(d));
        assert_eq!(parse_date("01/07/2023"), Some(d));
        assert_eq!(parse_date("45108"), Some(d));
        assert_eq!(parse_date("next year"), None);
    }
}
