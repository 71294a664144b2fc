//! Collapsing of repeated party columns
//!
//! IRM exports carry one "Project Contractor" column per party involved in a
//! project. Each cell is prefixed with the party's role, e.g.
//! `Main Contractor: Acme Civils`. We fold those cells into one value per
//! role, keeping the order in which the columns appear in the file.

use crate::rows::RawRow;

/// Closed, ordered set of role labels plus the catch-all bucket.
#[derive(Debug, Clone)]
pub struct CategorySet {
    labels: &'static [&'static str],
    catch_all: usize,
}

/// Roles recognised in IRM party columns, in priority order.
pub const IMPLEMENTORS: &[&str] = &[
    "Program Implementing Agent",
    "Principal Agent",
    "Main Contractor",
    "Other parties",
];

pub const IRM_PARTIES: CategorySet = CategorySet::new(IMPLEMENTORS, 3);

impl CategorySet {
    /// `catch_all` indexes into `labels`; the catch-all label is also a valid prefix.
    pub const fn new(labels: &'static [&'static str], catch_all: usize) -> Self {
        Self { labels, catch_all }
    }

    pub fn labels(&self) -> &'static [&'static str] {
        self.labels
    }

    pub fn catch_all(&self) -> &'static str {
        self.labels[self.catch_all]
    }

    /// Classify one cell: the category index and the value to store.
    pub fn classify<'a>(&self, cell: &'a str) -> (usize, &'a str) {
        let trimmed = cell.trim();
        for (idx, label) in self.labels.iter().enumerate() {
            if let Some(rest) = strip_label(trimmed, label) {
                return (idx, rest.trim());
            }
        }
        (self.catch_all, cell)
    }
}

/// `"<label>:"` prefix match, ASCII case-insensitive.
fn strip_label<'a>(value: &'a str, label: &str) -> Option<&'a str> {
    let head = value.get(..label.len())?;
    if !head.eq_ignore_ascii_case(label) {
        return None;
    }
    value[label.len()..].strip_prefix(':')
}

/// Values of every category for one row, in category order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryValues {
    labels: &'static [&'static str],
    values: Vec<Vec<String>>,
}

impl CategoryValues {
    fn empty(set: &CategorySet) -> Self {
        Self {
            labels: set.labels,
            values: vec![Vec::new(); set.labels.len()],
        }
    }

    pub fn values(&self, label: &str) -> &[String] {
        self.labels
            .iter()
            .position(|l| *l == label)
            .map(|idx| self.values[idx].as_slice())
            .unwrap_or(&[])
    }

    /// Newline-joined values of a category; empty when none were found.
    pub fn joined(&self, label: &str) -> String {
        self.values(label).join("\n")
    }

    /// `(label, joined)` pairs in category order.
    pub fn iter_joined(&self) -> impl Iterator<Item = (&'static str, String)> + '_ {
        self.labels
            .iter()
            .zip(&self.values)
            .map(|(label, values)| (*label, values.join("\n")))
    }
}

/// Fold the cells at `repeated` into per-category values.
pub fn collapse_repeated(row: &RawRow, repeated: &[usize], set: &CategorySet) -> CategoryValues {
    let mut out = CategoryValues::empty(set);

    for &idx in repeated {
        let Some(cell) = row.cell(idx) else {
            continue;
        };
        if cell.trim().is_empty() {
            continue;
        }
        let (category, value) = set.classify(cell);
        out.values[category].push(value.to_string());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[Option<&str>]) -> RawRow {
        RawRow::new(2, cells.iter().map(|c| c.map(str::to_string)).collect())
    }

    // -------------------------------------------------------------------------
    // CLASSIFICATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_known_prefix_is_stripped() {
        let r = row(&[Some("42"), Some("Main Contractor: X")]);
        let out = collapse_repeated(&r, &[1], &IRM_PARTIES);
        assert_eq!(out.joined("Main Contractor"), "X");
        assert_eq!(out.joined("Other parties"), "");
    }

    #[test]
    fn test_unknown_prefix_goes_to_other_parties_unmodified() {
        // Project Contractor columns with one known and one unknown label
        let r = row(&[Some("42"), Some("Main Contractor: X"), Some("Weird Label: Y")]);
        let out = collapse_repeated(&r, &[1, 2], &IRM_PARTIES);
        assert_eq!(out.joined("Main Contractor"), "X");
        assert_eq!(out.joined("Other parties"), "Weird Label: Y");
    }

    #[test]
    fn test_prefix_match_is_case_insensitive() {
        let r = row(&[Some("  principal agent:  Dept of Public Works ")]);
        let out = collapse_repeated(&r, &[0], &IRM_PARTIES);
        assert_eq!(out.joined("Principal Agent"), "Dept of Public Works");
    }

    #[test]
    fn test_explicit_other_parties_prefix_is_stripped() {
        let r = row(&[Some("Other parties: Community Trust")]);
        let out = collapse_repeated(&r, &[0], &IRM_PARTIES);
        assert_eq!(out.joined("Other parties"), "Community Trust");
    }

    #[test]
    fn test_label_without_colon_is_not_a_match() {
        let r = row(&[Some("Main Contractor Acme")]);
        let out = collapse_repeated(&r, &[0], &IRM_PARTIES);
        assert_eq!(out.joined("Main Contractor"), "");
        assert_eq!(out.joined("Other parties"), "Main Contractor Acme");
    }

    #[test]
    fn test_empty_value_after_colon_is_kept() {
        let r = row(&[Some("Main Contractor:"), Some("Main Contractor: B")]);
        let out = collapse_repeated(&r, &[0, 1], &IRM_PARTIES);
        assert_eq!(out.values("Main Contractor"), &["".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_non_ascii_cell_shorter_than_label() {
        let r = row(&[Some("Écoles")]);
        let out = collapse_repeated(&r, &[0], &IRM_PARTIES);
        assert_eq!(out.joined("Other parties"), "Écoles");
    }

    // -------------------------------------------------------------------------
    // ORDERING
    // -------------------------------------------------------------------------

    #[test]
    fn test_same_category_values_keep_column_order() {
        let r = row(&[
            Some("Main Contractor: B"),
            Some("Principal Agent: P"),
            Some("Main Contractor: A"),
            Some("Main Contractor: C"),
        ]);
        let out = collapse_repeated(&r, &[0, 1, 2, 3], &IRM_PARTIES);
        assert_eq!(out.joined("Main Contractor"), "B\nA\nC");
        assert_eq!(out.joined("Principal Agent"), "P");
    }

    #[test]
    fn test_interleaving_other_categories_does_not_change_a_category() {
        let a = row(&[
            Some("Main Contractor: A"),
            Some("Principal Agent: P"),
            Some("Main Contractor: B"),
        ]);
        let b = row(&[
            Some("Principal Agent: P"),
            Some("Main Contractor: A"),
            Some("Main Contractor: B"),
        ]);
        let out_a = collapse_repeated(&a, &[0, 1, 2], &IRM_PARTIES);
        let out_b = collapse_repeated(&b, &[0, 1, 2], &IRM_PARTIES);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn test_blank_and_missing_cells_are_skipped() {
        let r = row(&[None, Some("   "), Some("Main Contractor: A")]);
        let out = collapse_repeated(&r, &[0, 1, 2, 7], &IRM_PARTIES);
        assert_eq!(out.joined("Main Contractor"), "A");
        assert_eq!(out.joined("Other parties"), "");
    }

    #[test]
    fn test_iter_joined_follows_category_order() {
        let r = row(&[Some("Main Contractor: A"), Some("Program Implementing Agent: I")]);
        let out = collapse_repeated(&r, &[0, 1], &IRM_PARTIES);
        let labels: Vec<_> = out.iter_joined().map(|(l, _)| l).collect();
        assert_eq!(labels, IMPLEMENTORS);
    }
}
