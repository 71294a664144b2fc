//! Reading uploaded sheets into raw rows
//!
//! Workbooks (xlsx/xls/ods) are read with calamine, first sheet only. CSV files
//! go through the csv crate; non-UTF-8 exports (Excel on Windows) are decoded
//! as Windows-1252. Every cell is coerced to text here and re-typed later by
//! the format that owns the column.

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use std::path::Path;

/// One data row, positionally aligned to the header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 1-indexed line in the source sheet (header is line 1)
    pub line: usize,
    pub cells: Vec<Option<String>>,
}

impl RawRow {
    pub fn new(line: usize, cells: Vec<Option<String>>) -> Self {
        Self { line, cells }
    }

    /// Cell text at `idx`, `None` when absent or null.
    pub fn cell(&self, idx: usize) -> Option<&str> {
        self.cells.get(idx).and_then(|c| c.as_deref())
    }

    /// Trimmed cell text, `None` when absent or blank.
    pub fn text(&self, idx: usize) -> Option<&str> {
        self.cell(idx).map(str::trim).filter(|s| !s.is_empty())
    }

    /// True when every cell is null or blank.
    pub fn is_empty(&self) -> bool {
        self.cells
            .iter()
            .all(|c| c.as_deref().map_or(true, |s| s.trim().is_empty()))
    }
}

/// Drop fully-empty rows, keeping the order of the rest.
pub fn filter_empty_rows(rows: &[RawRow]) -> Vec<&RawRow> {
    rows.iter().filter(|r| !r.is_empty()).collect()
}

/// Header plus data rows of one sheet.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl Sheet {
    /// Build a sheet from text rows; the first row is the header.
    pub fn from_rows(mut rows: Vec<Vec<Option<String>>>) -> Self {
        if rows.is_empty() {
            return Self::default();
        }
        let header_row = rows.remove(0);
        let mut headers: Vec<String> = header_row.into_iter().map(Option::unwrap_or_default).collect();

        // Formatting can stretch a sheet's used range past the real header
        while headers.last().is_some_and(|h| h.trim().is_empty()) {
            headers.pop();
        }

        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(idx, cells)| RawRow::new(idx + 2, cells))
            .collect();

        Self { headers, rows }
    }
}

/// Detect if file is a workbook based on its extension
pub fn is_workbook(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("xlsx" | "xlsm" | "xls" | "xlsb" | "ods")
    )
}

/// Read the first sheet of a workbook or a CSV file.
pub fn read_sheet(path: &Path) -> Result<Sheet> {
    if is_workbook(path) {
        read_workbook(path)
    } else {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read upload {}", path.display()))?;
        read_csv(&bytes)
    }
}

fn read_workbook(path: &Path) -> Result<Sheet> {
    let mut workbook = open_workbook_auto(path).context("Failed to open workbook")?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .context("Workbook has no sheets")?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read sheet")?;

    let (height, width) = range.get_size();
    tracing::debug!(sheet = %sheet_name, height, width, "Read workbook sheet");

    // calamine ranges start at the first used cell; pad from column A so
    // positions line up with the header contract
    let offset = range.start().map_or(0, |(_, col)| col as usize);

    let rows = range
        .rows()
        .map(|row| {
            let mut cells = vec![None; offset];
            cells.extend(row.iter().map(cell_text));
            cells
        })
        .collect();

    Ok(Sheet::from_rows(rows))
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => Some(s.clone()),
        Data::Float(f) => Some(f.to_string()),
        Data::Int(i) => Some(i.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(dt) => Some(
            dt.as_datetime()
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| dt.as_f64().to_string()),
        ),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(s.clone()),
        Data::Error(e) => Some(format!("{e:?}")),
    }
}

/// Decode and read CSV bytes.
pub fn read_csv(bytes: &[u8]) -> Result<Sheet> {
    let text = decode_text(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("CSV parse error on line {}", idx + 1))?;
        rows.push(
            record
                .iter()
                .map(|v| if v.is_empty() { None } else { Some(v.to_string()) })
                .collect(),
        );
    }

    Ok(Sheet::from_rows(rows))
}

/// UTF-8 (BOM stripped) or Windows-1252 as a fallback.
fn decode_text(bytes: &[u8]) -> String {
    let (text, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
    if !had_errors {
        return text.into_owned();
    }
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(line: usize, cells: &[Option<&str>]) -> RawRow {
        RawRow::new(line, cells.iter().map(|c| c.map(str::to_string)).collect())
    }

    // -------------------------------------------------------------------------
    // EMPTY ROW FILTER
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_rows_are_dropped_in_order() {
        let rows = vec![
            r(2, &[Some("a"), None]),
            r(3, &[None, None]),
            r(4, &[Some("  "), Some("")]),
            r(5, &[None, Some("b")]),
        ];
        let kept = filter_empty_rows(&rows);
        assert_eq!(kept.iter().map(|r| r.line).collect::<Vec<_>>(), vec![2, 5]);
    }

    #[test]
    fn test_row_with_value_only_in_last_column_is_kept() {
        let mut cells = vec![None; 40];
        cells[39] = Some("Main Contractor: X".to_string());
        let rows = vec![RawRow::new(2, cells)];
        assert_eq!(filter_empty_rows(&rows).len(), 1);
    }

    #[test]
    fn test_all_null_row_among_wide_columns() {
        let wide = |fill: Option<&str>| RawRow::new(2, vec![fill.map(str::to_string); 36 + 5]);
        let rows = vec![wide(Some("x")), wide(None), wide(Some("y"))];
        assert_eq!(filter_empty_rows(&rows).len(), rows.len() - 1);
    }

    #[test]
    fn test_inserting_empty_rows_changes_nothing() {
        let base = vec![r(2, &[Some("a")]), r(3, &[Some("b")])];
        let padded = vec![
            r(2, &[None]),
            base[0].clone(),
            r(3, &[Some(" ")]),
            r(4, &[]),
            base[1].clone(),
            r(5, &[None]),
        ];
        let a: Vec<_> = filter_empty_rows(&base).into_iter().cloned().collect();
        let b: Vec<_> = filter_empty_rows(&padded).into_iter().cloned().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_filter_does_not_mutate_source() {
        let rows = vec![r(2, &[None]), r(3, &[Some("a")])];
        let _ = filter_empty_rows(&rows);
        assert_eq!(rows.len(), 2);
    }

    // -------------------------------------------------------------------------
    // CSV READING
    // -------------------------------------------------------------------------

    #[test]
    fn test_read_csv_header_and_line_numbers() {
        let sheet = read_csv(b"A,B\n1,\n,\n3,4\n").unwrap();
        assert_eq!(sheet.headers, vec!["A", "B"]);
        assert_eq!(sheet.rows.len(), 3);
        assert_eq!(sheet.rows[0].line, 2);
        assert_eq!(sheet.rows[0].cell(1), None);
        assert!(sheet.rows[1].is_empty());
        assert_eq!(sheet.rows[2].cell(1), Some("4"));
    }

    #[test]
    fn test_read_csv_strips_bom() {
        let sheet = read_csv("\u{feff}Project ID,Name\n1,x\n".as_bytes()).unwrap();
        assert_eq!(sheet.headers[0], "Project ID");
    }

    #[test]
    fn test_read_csv_windows_1252_fallback() {
        // 0x96 is an en dash in cp1252 and invalid as UTF-8
        let bytes = b"Name\nPhase\x962\n";
        let sheet = read_csv(bytes).unwrap();
        assert_eq!(sheet.rows[0].cell(0), Some("Phase\u{2013}2"));
    }

    #[test]
    fn test_trailing_blank_headers_are_ignored() {
        let sheet = read_csv(b"A,B,,\n1,2,,\n").unwrap();
        assert_eq!(sheet.headers, vec!["A", "B"]);
    }

    #[test]
    fn test_text_trims_and_skips_blank() {
        let row = r(2, &[Some("  Health "), Some("   ")]);
        assert_eq!(row.text(0), Some("Health"));
        assert_eq!(row.text(1), None);
        assert_eq!(row.text(5), None);
    }

    #[test]
    fn test_is_workbook_by_extension() {
        assert!(is_workbook(Path::new("irm.XLSX")));
        assert!(is_workbook(Path::new("eqprs.xls")));
        assert!(!is_workbook(Path::new("irm.csv")));
        assert!(!is_workbook(Path::new("upload")));
    }
}
