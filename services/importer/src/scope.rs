//! Import scopes: sphere, financial year and reporting period
//!
//! A scope is the partition key of an import. Entity lookups are done within
//! it and a re-import of a scope replaces whatever the previous import of the
//! same scope left behind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {what} \"{value}\"")]
pub struct ScopeParseError {
    what: &'static str,
    value: String,
}

impl ScopeParseError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sphere {
    National,
    Provincial,
}

impl Sphere {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sphere::National => "national",
            Sphere::Provincial => "provincial",
        }
    }
}

impl fmt::Display for Sphere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sphere {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "national" => Ok(Sphere::National),
            "provincial" => Ok(Sphere::Provincial),
            _ => Err(ScopeParseError::new("sphere", s)),
        }
    }
}

/// South African financial year, April to March, written `2023-24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FinancialYear {
    start: i32,
}

impl FinancialYear {
    pub const fn new(start: i32) -> Self {
        Self { start }
    }

    pub fn start_year(&self) -> i32 {
        self.start
    }

    pub fn slug(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FinancialYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.start, (self.start + 1).rem_euclid(100))
    }
}

impl FromStr for FinancialYear {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ScopeParseError::new("financial year", s);
        let (start, end) = s.trim().split_once('-').ok_or_else(err)?;
        let start: i32 = start.parse().map_err(|_| err())?;
        let end: i32 = end.parse().map_err(|_| err())?;

        let expected_end = if end >= 100 { start + 1 } else { (start + 1).rem_euclid(100) };
        if !(1990..=2100).contains(&start) || end != expected_end {
            return Err(err());
        }
        Ok(Self { start })
    }
}

impl Serialize for FinancialYear {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FinancialYear {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reporting period within a financial year. Quarters sort before the
/// annual report of the same year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Period {
    Quarter(u8),
    Annual,
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Period::Quarter(q) => write!(f, "Q{q}"),
            Period::Annual => f.write_str("annual"),
        }
    }
}

impl FromStr for Period {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "annual" {
            return Ok(Period::Annual);
        }
        let digits = lower.strip_prefix('q').unwrap_or(&lower);
        match digits.parse::<u8>() {
            Ok(q @ 1..=4) => Ok(Period::Quarter(q)),
            _ => Err(ScopeParseError::new("period", s)),
        }
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The partition a snapshot batch belongs to.
///
/// Field order matters: the derived ordering sorts by financial year, then
/// period, which is how "latest" is decided. Sphere only breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImportScope {
    pub financial_year: FinancialYear,
    pub period: Period,
    pub sphere: Sphere,
}

impl ImportScope {
    pub fn new(sphere: Sphere, financial_year: FinancialYear, period: Period) -> Self {
        Self {
            financial_year,
            period,
            sphere,
        }
    }
}

impl fmt::Display for ImportScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.sphere, self.financial_year, self.period)
    }
}
