//! Header contract validation
//!
//! Every import format declares an exact, ordered list of leading columns.
//! Formats with a variable number of party columns (IRM) additionally name a
//! marker header that every column after the fixed prefix must carry.
//!
//! The first mismatch aborts validation. We never try to report all of them:
//! a shifted column usually makes everything after it wrong too.

use thiserror::Error;

/// Fatal problems with the header row of an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputFormatError {
    #[error("column {column}: expected header \"{expected}\", found \"{found}\"")]
    HeaderMismatch {
        /// 1-indexed column position
        column: usize,
        expected: String,
        found: String,
    },

    #[error("column {column}: expected header \"{expected}\", but the header row ends at column {last}")]
    MissingColumn {
        column: usize,
        expected: String,
        last: usize,
    },

    #[error("column {column}: unexpected extra column \"{found}\"")]
    UnexpectedColumn { column: usize, found: String },

    #[error("file has no header row")]
    NoHeaderRow,
}

/// Expected header layout for one import format version.
#[derive(Debug, Clone)]
pub struct HeaderSpec {
    fixed: &'static [&'static str],
    repeated_marker: Option<&'static str>,
}

impl HeaderSpec {
    pub const fn new(fixed: &'static [&'static str], repeated_marker: Option<&'static str>) -> Self {
        Self {
            fixed,
            repeated_marker,
        }
    }

    pub fn fixed(&self) -> &'static [&'static str] {
        self.fixed
    }

    pub fn repeated_marker(&self) -> Option<&'static str> {
        self.repeated_marker
    }

    /// Position of a fixed column, by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fixed.iter().position(|h| *h == name)
    }
}

/// Column layout of a file whose header passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLayout {
    pub fixed_len: usize,
    /// 0-indexed positions of the repeated columns, left to right
    pub repeated: Vec<usize>,
}

impl HeaderLayout {
    pub fn width(&self) -> usize {
        self.fixed_len + self.repeated.len()
    }
}

/// Check `actual` against `spec`, returning the column layout on success.
pub fn validate_headers(actual: &[String], spec: &HeaderSpec) -> Result<HeaderLayout, InputFormatError> {
    if actual.is_empty() {
        return Err(InputFormatError::NoHeaderRow);
    }

    let fixed = spec.fixed();
    let mut repeated = Vec::new();

    for (idx, found) in actual.iter().enumerate() {
        let found = found.trim();

        if let Some(expected) = fixed.get(idx) {
            if found != expected.trim() {
                return Err(InputFormatError::HeaderMismatch {
                    column: idx + 1,
                    expected: expected.to_string(),
                    found: found.to_string(),
                });
            }
            continue;
        }

        match spec.repeated_marker() {
            Some(marker) if found == marker => repeated.push(idx),
            Some(marker) => {
                return Err(InputFormatError::HeaderMismatch {
                    column: idx + 1,
                    expected: marker.to_string(),
                    found: found.to_string(),
                })
            }
            None => {
                return Err(InputFormatError::UnexpectedColumn {
                    column: idx + 1,
                    found: found.to_string(),
                })
            }
        }
    }

    if actual.len() < fixed.len() {
        return Err(InputFormatError::MissingColumn {
            column: actual.len() + 1,
            expected: fixed[actual.len()].to_string(),
            last: actual.len(),
        });
    }

    Ok(HeaderLayout {
        fixed_len: fixed.len(),
        repeated,
    })
}
