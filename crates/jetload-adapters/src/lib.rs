//! Report source contracts and the export-to-table transforms: parsing the
//! delimited export, header normalization, key filtering, enrichment and the
//! date / decimal coercions applied before a load.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use jetload_core::{
    unique_identifiers, Cell, ColumnPosition, ColumnType, ColumnTypes, ColumnValue, DateMask, Table,
    DATA_SOURCE_COLUMN, EXTRACTED_AT_COLUMN, INSTANCE_COLUMN,
};
use jetload_storage::{FetchError, FetchedExport, SourceSession};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jetload-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Anything that can hand back the raw export of a report.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch_export(&self, report_id: &str) -> Result<FetchedExport, AdapterError>;
}

#[async_trait]
impl ReportSource for SourceSession {
    async fn fetch_export(&self, report_id: &str) -> Result<FetchedExport, AdapterError> {
        Ok(self.fetch_report(report_id).await?)
    }
}

/// Replays exports saved on disk as `<root>/<report_id>.csv`.
#[derive(Debug, Clone)]
pub struct DirectoryReportSource {
    root: PathBuf,
}

impl DirectoryReportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, report_id: &str) -> PathBuf {
        self.root.join(format!("{report_id}.csv"))
    }
}

#[async_trait]
impl ReportSource for DirectoryReportSource {
    async fn fetch_export(&self, report_id: &str) -> Result<FetchedExport, AdapterError> {
        let path = self.path_for(report_id);
        let body = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading saved export {}", path.display()))?;
        Ok(FetchedExport {
            report_id: report_id.to_string(),
            url: path.display().to_string(),
            fetched_at: Utc::now(),
            body,
        })
    }
}

/// Delimiters of the printable export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportFormat {
    pub row_delimiter: String,
    pub column_delimiter: String,
    /// Removed from every cell after splitting.
    pub strip: String,
    pub skip_leading_lines: usize,
    /// Rows dropped from the end after splitting (the export footer).
    pub drop_trailing_rows: usize,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self {
            row_delimiter: "\"\n\"".to_string(),
            column_delimiter: "\",\"".to_string(),
            strip: "\"".to_string(),
            skip_leading_lines: 0,
            drop_trailing_rows: 1,
        }
    }
}

/// Split `text` into rows on `row_delimiter` and each row into cells on
/// `column_delimiter`.
pub fn split_2d(text: &str, row_delimiter: &str, column_delimiter: &str) -> Table {
    if text.is_empty() {
        return Table::default();
    }
    let split = |s: &str, delimiter: &str| -> Vec<String> {
        if delimiter.is_empty() {
            vec![s.to_string()]
        } else {
            s.split(delimiter).map(str::to_string).collect()
        }
    };
    Table::from_text(
        split(text, row_delimiter)
            .into_iter()
            .map(|row| split(&row, column_delimiter)),
    )
}

/// Turn raw export text into a table of text cells.
///
/// Line endings are normalized to `\n` and runs of blank lines collapse into
/// one, so the footer block starts on its own row instead of sticking to the
/// last data row.
pub fn parse_export(text: &str, format: &ExportFormat) -> Table {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text).replace("\r\n", "\n");
    let lines: Vec<&str> = text
        .split('\n')
        .skip(format.skip_leading_lines)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let body = lines.join("\n");

    let table = split_2d(&body, &format.row_delimiter, &format.column_delimiter)
        .remove_string(&format.strip)
        .drop_trailing(format.drop_trailing_rows);
    debug!(rows = table.rows().len(), width = table.width(), "parsed export");
    table
}

/// Replace the header with sanitized, unique identifiers.
pub fn normalize_header(table: &Table) -> Table {
    if table.is_empty() {
        return Table::default();
    }
    table.with_header(unique_identifiers(&table.header_names()))
}

/// Drop rows whose key cell is blank or contains a space; export footer lines
/// ("Generated By: ...", the copyright notice) land in the key column.
pub fn drop_invalid_keys(table: &Table, key_index: usize) -> Table {
    table.filter_rows(key_index, "", false).filter_rows(key_index, " ", false)
}

/// Append the data-source, instance and extraction-time columns.
pub fn enrich(table: &Table, report_id: &str, instance_label: &str, extracted_at: NaiveDateTime) -> Table {
    table
        .with_column(DATA_SOURCE_COLUMN, ColumnValue::Constant(Cell::text(report_id)), ColumnPosition::End)
        .with_column(INSTANCE_COLUMN, ColumnValue::Constant(Cell::text(instance_label)), ColumnPosition::End)
        .with_column(EXTRACTED_AT_COLUMN, ColumnValue::Constant(Cell::DateTime(extracted_at)), ColumnPosition::End)
}

/// Everything between the raw export and coercion: parse, normalize the
/// header, drop footer rows and enrich.
pub fn prepare_export(export: &FetchedExport, format: &ExportFormat, instance_label: &str) -> Table {
    let table = normalize_header(&parse_export(&export.body, format));
    let table = drop_invalid_keys(&table, 0);
    enrich(&table, &export.report_id, instance_label, export.fetched_at.naive_utc())
}

#[derive(Debug, Error, PartialEq)]
pub enum CoercionError {
    #[error("cell is not text")]
    NotText,
    #[error("{value:?} does not match date mask {mask:?}")]
    Date { value: String, mask: String },
    #[error("{value:?} is not a decimal")]
    Decimal { value: String },
}

/// Parse a text cell with a strftime-style mask. Masks with a time part yield
/// [`Cell::DateTime`], date-only masks yield [`Cell::Date`].
pub fn parse_date(cell: &Cell, mask: &str) -> Result<Cell, CoercionError> {
    let value = cell.as_text().ok_or(CoercionError::NotText)?.trim();
    if let Ok(datetime) = NaiveDateTime::parse_from_str(value, mask) {
        return Ok(Cell::DateTime(datetime));
    }
    NaiveDate::parse_from_str(value, mask)
        .map(Cell::Date)
        .map_err(|_| CoercionError::Date {
            value: value.to_string(),
            mask: mask.to_string(),
        })
}

/// Parse a text cell as a decimal amount. Accepts thousands separators and a
/// leading currency code or `$`; empty text becomes [`Cell::Null`].
pub fn parse_decimal(cell: &Cell) -> Result<Cell, CoercionError> {
    let raw = cell.as_text().ok_or(CoercionError::NotText)?.trim();
    if raw.is_empty() {
        return Ok(Cell::Null);
    }
    let amount = match raw.split_once(' ') {
        Some((code, rest)) if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) => rest.trim(),
        _ => raw,
    };
    let cleaned: String = amount.chars().filter(|c| *c != ',' && *c != '$').collect();
    cleaned
        .parse::<Decimal>()
        .map(Cell::Decimal)
        .map_err(|_| CoercionError::Decimal { value: raw.to_string() })
}

/// A coerced table plus the number of cells left as text because they failed
/// to parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Coercion {
    pub table: Table,
    pub failed_cells: usize,
}

fn coerce_column<F>(table: &Table, index: usize, column: &str, parse: F) -> Coercion
where
    F: Fn(&Cell) -> Result<Cell, CoercionError>,
{
    let mut failed_cells = 0;
    let mut first_error = None;
    let table = table.map_column(index, |cell| match parse(cell) {
        Ok(parsed) => parsed,
        Err(err) => {
            failed_cells += 1;
            first_error.get_or_insert(err);
            cell.clone()
        }
    });
    if let Some(err) = first_error {
        warn!(column, failed_cells, error = %err, "cells kept as text");
    }
    Coercion { table, failed_cells }
}

/// Convert the masked columns from text to dates. Masks naming a column the
/// header does not have are skipped; cells that fail to parse stay as they
/// were.
pub fn coerce_dates(table: &Table, masks: &[DateMask]) -> Coercion {
    let mut out = Coercion {
        table: table.clone(),
        failed_cells: 0,
    };
    for mask in masks {
        let Some(index) = out.table.column_index(&mask.column) else {
            debug!(column = %mask.column, "date mask names no column in this block");
            continue;
        };
        let step = coerce_column(&out.table, index, &mask.column, |cell| match cell {
            Cell::Text(_) => parse_date(cell, &mask.format),
            other => Ok(other.clone()),
        });
        out.table = step.table;
        out.failed_cells += step.failed_cells;
    }
    out
}

/// Convert every column typed `NUMERIC` from text to decimals.
pub fn coerce_decimals(table: &Table, column_types: &ColumnTypes) -> Coercion {
    let mut out = Coercion {
        table: table.clone(),
        failed_cells: 0,
    };
    for (name, column_type) in column_types.iter() {
        if column_type != ColumnType::Numeric {
            continue;
        }
        let Some(index) = out.table.column_index(name) else {
            continue;
        };
        let step = coerce_column(&out.table, index, name, |cell| match cell {
            Cell::Text(_) => parse_decimal(cell),
            other => Ok(other.clone()),
        });
        out.table = step.table;
        out.failed_cells += step.failed_cells;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn splits_quoted_export_rows_and_columns() {
        let text = "\"Opportunity ID\",\"Stage\"\n\"006A\",\"Won\"\n\"006B\",\"Lost\"\n\"Footer\"";
        let table = parse_export(text, &ExportFormat::default());
        assert_eq!(
            table,
            Table::from_text([["Opportunity ID", "Stage"], ["006A", "Won"], ["006B", "Lost"]])
        );
    }

    #[test]
    fn blank_lines_before_the_footer_do_not_merge_rows() {
        let text = "\"ID\",\"CLOSE\"\r\n\"006A\",\"5/6/2016\"\r\n\r\n\r\n\"Opportunity Report\"\r\n\"BlackBerry\"\r\n";
        let table = parse_export(text, &ExportFormat::default());
        assert_eq!(table.rows()[1], vec![Cell::text("006A"), Cell::text("5/6/2016")]);
        assert_eq!(table.rows()[2], vec![Cell::text("Opportunity Report")]);
        assert_eq!(table.rows().len(), 3);
    }

    #[test]
    fn leading_lines_and_bom_are_skipped() {
        let format = ExportFormat {
            skip_leading_lines: 1,
            drop_trailing_rows: 0,
            ..ExportFormat::default()
        };
        let table = parse_export("\u{feff}preamble\n\"A\",\"B\"\n\"1\",\"2\"", &format);
        assert_eq!(table, Table::from_text([["A", "B"], ["1", "2"]]));
    }

    #[test]
    fn empty_export_is_an_empty_table() {
        assert!(parse_export("", &ExportFormat::default()).is_empty());
        assert!(normalize_header(&Table::default()).is_empty());
    }

    #[test]
    fn header_is_sanitized_and_deduplicated() {
        let table = Table::from_text([["Close Date", "Close-Date", "Amount (converted)"], ["1", "2", "3"]]);
        let normalized = normalize_header(&table);
        assert_eq!(normalized.header_names(), vec!["CLOSE_DATE", "CLOSE_DATE1", "AMOUNT_CONVERTED_"]);
        assert_eq!(normalized.data_rows(), table.data_rows());
    }

    #[test]
    fn footer_rows_are_dropped_by_key() {
        let table = Table::from_text([
            vec!["ID", "NAME"],
            vec!["006A", "Acme"],
            vec![""],
            vec!["Generated By: Jane Doe 6/1/2016"],
        ]);
        assert_eq!(drop_invalid_keys(&table, 0), Table::from_text([["ID", "NAME"], ["006A", "Acme"]]));
    }

    #[test]
    fn enrichment_appends_three_columns() {
        let stamp = at(2016, 6, 1).and_hms_opt(10, 0, 0).unwrap();
        let table = enrich(&Table::from_text([["ID"], ["006A"]]), "00OF0000006hM3t", "BB", stamp);
        assert_eq!(
            table.header_names(),
            vec!["ID", DATA_SOURCE_COLUMN, INSTANCE_COLUMN, EXTRACTED_AT_COLUMN]
        );
        assert_eq!(
            table.rows()[1],
            vec![
                Cell::text("006A"),
                Cell::text("00OF0000006hM3t"),
                Cell::text("BB"),
                Cell::DateTime(stamp)
            ]
        );
    }

    #[test]
    fn enrichment_lines_up_with_the_header_on_short_rows() {
        let stamp = at(2016, 6, 1).and_hms_opt(10, 0, 0).unwrap();
        let short = Table::from_text([vec!["ID", "NAME", "CLOSE_DATE"], vec!["006A"]]);
        let table = enrich(&short, "00O1", "BB", stamp);
        assert_eq!(
            table.rows()[1],
            vec![
                Cell::text("006A"),
                Cell::text(""),
                Cell::text(""),
                Cell::text("00O1"),
                Cell::text("BB"),
                Cell::DateTime(stamp)
            ]
        );
    }

    #[test]
    fn prepare_uses_fetch_time_as_extraction_time() {
        let export = FetchedExport {
            report_id: "00O1".to_string(),
            url: "https://na1.salesforce.com/00O1?export=1".to_string(),
            fetched_at: Utc.with_ymd_and_hms(2016, 6, 1, 10, 0, 0).unwrap(),
            body: "\"Opportunity ID\"\n\"006A\"\n\"Opportunity Report\"\n\"Acme\"".to_string(),
        };
        let table = prepare_export(&export, &ExportFormat::default(), "");
        assert_eq!(table.data_rows().len(), 1);
        assert_eq!(table.rows()[1][3], Cell::DateTime(at(2016, 6, 1).and_hms_opt(10, 0, 0).unwrap()));
    }

    #[test]
    fn date_masks_without_padding_parse() {
        assert_eq!(parse_date(&Cell::text("5/6/2016"), "%m/%d/%Y"), Ok(Cell::Date(at(2016, 5, 6))));
        assert_eq!(
            parse_date(&Cell::text("2016-05-06 08:30:00"), "%Y-%m-%d %H:%M:%S"),
            Ok(Cell::DateTime(at(2016, 5, 6).and_hms_opt(8, 30, 0).unwrap()))
        );
        assert!(matches!(parse_date(&Cell::text("soon"), "%m/%d/%Y"), Err(CoercionError::Date { .. })));
        assert_eq!(parse_date(&Cell::Null, "%m/%d/%Y"), Err(CoercionError::NotText));
    }

    #[test]
    fn failed_dates_stay_as_text() {
        let table = Table::from_text([["ID", "CLOSE_DATE"], ["1", "5/6/2016"], ["2", ""], ["3", "TBD"]]);
        let coerced = coerce_dates(&table, &[DateMask::new("CLOSE_DATE", "%m/%d/%Y")]);
        assert_eq!(coerced.failed_cells, 2);
        assert_eq!(coerced.table.rows()[1][1], Cell::Date(at(2016, 5, 6)));
        assert_eq!(coerced.table.rows()[2][1], Cell::text(""));
        assert_eq!(coerced.table.rows()[3][1], Cell::text("TBD"));
        assert_eq!(coerced.table.header()[1], Cell::text("CLOSE_DATE"));
    }

    #[test]
    fn masks_for_absent_columns_are_ignored() {
        let table = Table::from_text([["ID"], ["1"]]);
        let coerced = coerce_dates(&table, &[DateMask::new("CREATED_DATE", "%m/%d/%Y")]);
        assert_eq!(coerced.table, table);
        assert_eq!(coerced.failed_cells, 0);
    }

    #[test]
    fn decimals_accept_currency_and_separators() {
        assert_eq!(parse_decimal(&Cell::text("USD 1,200.50")), Ok(Cell::Decimal("1200.50".parse().unwrap())));
        assert_eq!(parse_decimal(&Cell::text("$3,000")), Ok(Cell::Decimal(Decimal::from(3000))));
        assert_eq!(parse_decimal(&Cell::text("-12.5")), Ok(Cell::Decimal("-12.5".parse().unwrap())));
        assert_eq!(parse_decimal(&Cell::text(" ")), Ok(Cell::Null));
        assert!(matches!(parse_decimal(&Cell::text("n/a")), Err(CoercionError::Decimal { .. })));
    }

    #[test]
    fn only_numeric_columns_become_decimals() {
        let types: ColumnTypes = serde_yaml::from_str("ID: VARCHAR(20)\nAMOUNT: NUMERIC\n").unwrap();
        let table = Table::from_text([["ID", "AMOUNT"], ["10", "USD 5"]]);
        let coerced = coerce_decimals(&table, &types);
        assert_eq!(coerced.table.rows()[1], vec![Cell::text("10"), Cell::Decimal(Decimal::from(5))]);
        assert_eq!(coerced.failed_cells, 0);
    }

    #[test]
    fn export_format_reads_partial_yaml() {
        let format: ExportFormat = serde_yaml::from_str("drop_trailing_rows: 0\n").unwrap();
        assert_eq!(format.drop_trailing_rows, 0);
        assert_eq!(format.column_delimiter, "\",\"");
    }

    #[tokio::test]
    async fn directory_source_replays_saved_exports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("00O1.csv"), "\"ID\"\n\"006A\"").unwrap();
        let source = DirectoryReportSource::new(dir.path());

        let export = source.fetch_export("00O1").await.unwrap();
        assert_eq!(export.report_id, "00O1");
        assert_eq!(export.body, "\"ID\"\n\"006A\"");
        let err = source.fetch_export("missing").await.unwrap_err();
        assert!(matches!(&err, AdapterError::Anyhow(_)));
        assert!(err.to_string().contains("reading saved export"));
    }
}
