//! One report into one warehouse table.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use jetload_adapters::{coerce_dates, coerce_decimals, prepare_export, ExportFormat, ReportSource};
use jetload_core::{ColumnType, ColumnTypes, DateMask, Table, WriteMode};
use jetload_storage::ExportArchive;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::warehouse::{ColumnDef, Warehouse};

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub source_id: String,
    pub target_table: String,
    pub report_id: String,
    pub instance_label: String,
    pub column_types: ColumnTypes,
    pub date_masks: Vec<DateMask>,
    pub write_mode: WriteMode,
    pub format: ExportFormat,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub source_id: String,
    pub report_id: String,
    pub target_table: String,
    pub write_mode: WriteMode,
    pub rows_inserted: u64,
    pub failed_cells: usize,
    pub replaced_existing: bool,
    pub archived_to: Option<String>,
    pub elapsed: Duration,
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Report: {} - Inserted {} rows into {} successfully! Time: {}",
            self.report_id,
            self.rows_inserted,
            self.target_table,
            format_elapsed(self.elapsed)
        )
    }
}

/// `h:mm:ss`, hours unpadded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Column definitions for a block: the typed columns in type-map order, then
/// header columns the map does not name, as `TEXT`.
pub fn table_columns(header: &[String], column_types: &ColumnTypes) -> Vec<ColumnDef> {
    let mut columns: Vec<ColumnDef> = column_types
        .iter()
        .map(|(name, column_type)| ColumnDef::new(name, column_type))
        .collect();
    columns.extend(
        header
            .iter()
            .filter(|name| column_types.get(name).is_none())
            .map(|name| ColumnDef::new(name.as_str(), ColumnType::Text)),
    );
    columns
}

/// Definitions for the block's own columns, in header order.
fn insert_columns(header: &[String], column_types: &ColumnTypes) -> Vec<ColumnDef> {
    header
        .iter()
        .map(|name| ColumnDef::new(name.as_str(), column_types.get(name).unwrap_or(ColumnType::Text)))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct SourceLoader {
    archive: Option<ExportArchive>,
}

impl SourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(mut self, archive: Option<ExportArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub async fn load(
        &self,
        request: &LoadRequest,
        source: &dyn ReportSource,
        warehouse: &dyn Warehouse,
    ) -> Result<LoadSummary> {
        let span = info_span!(
            "source_load",
            source_id = %request.source_id,
            report_id = %request.report_id,
            table = %request.target_table
        );
        self.load_inner(request, source, warehouse).instrument(span).await
    }

    async fn load_inner(
        &self,
        request: &LoadRequest,
        source: &dyn ReportSource,
        warehouse: &dyn Warehouse,
    ) -> Result<LoadSummary> {
        let started = Instant::now();
        let export = source
            .fetch_export(&request.report_id)
            .await
            .with_context(|| format!("fetching report {}", request.report_id))?;

        let archived_to = match &self.archive {
            Some(archive) => {
                let archived = archive.archive(&request.source_id, &export).await?;
                Some(archived.absolute_path.display().to_string())
            }
            None => None,
        };

        let table = prepare_export(&export, &request.format, &request.instance_label);
        let dates = coerce_dates(&table, &request.date_masks);
        let decimals = coerce_decimals(&dates.table, &request.column_types);
        let failed_cells = dates.failed_cells + decimals.failed_cells;
        let table: Table = decimals.table;
        if failed_cells > 0 {
            warn!(failed_cells, "some cells could not be coerced");
        }

        let header = table.header_names();
        if header.is_empty() {
            anyhow::bail!("report {} returned no header row", request.report_id);
        }

        let replaced_existing = match request.write_mode {
            WriteMode::Replace => {
                let existed = warehouse
                    .drop_table(&request.target_table)
                    .await
                    .with_context(|| format!("dropping {}", request.target_table))?;
                warehouse
                    .create_table(&request.target_table, &table_columns(&header, &request.column_types), false)
                    .await
                    .with_context(|| format!("creating {}", request.target_table))?;
                existed
            }
            WriteMode::Append => {
                warehouse
                    .create_table(&request.target_table, &table_columns(&header, &request.column_types), true)
                    .await
                    .with_context(|| format!("creating {}", request.target_table))?;
                false
            }
        };

        let rows_inserted = warehouse
            .insert_rows(
                &request.target_table,
                &insert_columns(&header, &request.column_types),
                table.data_rows(),
            )
            .await
            .with_context(|| format!("inserting into {}", request.target_table))?;

        let summary = LoadSummary {
            source_id: request.source_id.clone(),
            report_id: request.report_id.clone(),
            target_table: request.target_table.clone(),
            write_mode: request.write_mode,
            rows_inserted,
            failed_cells,
            replaced_existing,
            archived_to,
            elapsed: started.elapsed(),
        };
        info!("{summary}");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryReportSource, MemoryWarehouse};
    use chrono::NaiveDate;
    use jetload_core::Cell;

    const EXPORT: &str = "\"Opportunity ID\",\"Close Date\",\"Amount (converted)\"\n\
\"006A\",\"5/6/2016\",\"USD 1,200.50\"\n\
\"006B\",\"not a date\",\"\"\n\
\"\",\"\",\"\"\n\
\"Generated By: Jane Doe\"\n\
\"Acme\"";

    fn request(table: &str, report_id: &str, write_mode: WriteMode) -> LoadRequest {
        LoadRequest {
            source_id: "bb".to_string(),
            target_table: table.to_string(),
            report_id: report_id.to_string(),
            instance_label: "BlackBerry".to_string(),
            column_types: serde_yaml::from_str(
                "OPPORTUNITY_ID: VARCHAR(100)\nCLOSE_DATE: DATE\nAMOUNT_CONVERTED_: NUMERIC\nPY_EXTRACTED_DATE_VALUE: DATE\n",
            )
            .unwrap(),
            date_masks: vec![DateMask::new("CLOSE_DATE", "%m/%d/%Y")],
            write_mode,
            format: ExportFormat::default(),
        }
    }

    #[test]
    fn status_line_reads_like_the_batch_log() {
        let summary = LoadSummary {
            source_id: "bb".to_string(),
            report_id: "00OF0000006hM3t".to_string(),
            target_table: "BB_OPPORTUNITIES".to_string(),
            write_mode: WriteMode::Replace,
            rows_inserted: 1250,
            failed_cells: 0,
            replaced_existing: true,
            archived_to: None,
            elapsed: Duration::from_secs(3725),
        };
        assert_eq!(
            summary.to_string(),
            "Report: 00OF0000006hM3t - Inserted 1250 rows into BB_OPPORTUNITIES successfully! Time: 1:02:05"
        );
    }

    #[test]
    fn untyped_header_columns_become_text() {
        let types: ColumnTypes = serde_yaml::from_str("ID: VARCHAR(10)\nGONE: DATE\n").unwrap();
        let header = vec!["ID".to_string(), "EXTRA".to_string()];
        assert_eq!(
            table_columns(&header, &types),
            vec![
                ColumnDef::new("ID", ColumnType::Varchar(10)),
                ColumnDef::new("GONE", ColumnType::Date),
                ColumnDef::new("EXTRA", ColumnType::Text),
            ]
        );
    }

    #[tokio::test]
    async fn replace_load_parses_coerces_and_inserts() {
        let source = MemoryReportSource::default().with_export("00O1", EXPORT);
        let warehouse = MemoryWarehouse::default();

        let summary = SourceLoader::new()
            .load(&request("BB_OPPORTUNITIES", "00O1", WriteMode::Replace), &source, &warehouse)
            .await
            .unwrap();

        assert_eq!(summary.rows_inserted, 2);
        assert_eq!(summary.failed_cells, 1);
        assert!(!summary.replaced_existing);

        let columns = warehouse.columns("BB_OPPORTUNITIES").unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "OPPORTUNITY_ID",
                "CLOSE_DATE",
                "AMOUNT_CONVERTED_",
                "PY_EXTRACTED_DATE_VALUE",
                "PY_DATA_SOURCE",
                "PY_INSTANCE"
            ]
        );

        let rows = warehouse.rows("BB_OPPORTUNITIES").unwrap();
        assert_eq!(rows[0][0], Cell::text("006A"));
        assert_eq!(rows[0][1], Cell::Date(NaiveDate::from_ymd_opt(2016, 5, 6).unwrap()));
        assert_eq!(rows[0][2], Cell::Decimal("1200.50".parse().unwrap()));
        assert_eq!(rows[1][1], Cell::text("not a date"));
        assert_eq!(rows[1][2], Cell::Null);
        assert_eq!(rows[0][4], Cell::text("00O1"));
        assert_eq!(rows[0][5], Cell::text("BlackBerry"));
    }

    #[tokio::test]
    async fn replace_drops_previous_rows_and_append_keeps_them() {
        let source = MemoryReportSource::default()
            .with_export("00O1", EXPORT)
            .with_export("00O2", EXPORT);
        let warehouse = MemoryWarehouse::default();
        let loader = SourceLoader::new();

        loader
            .load(&request("IS_MARKETING", "00O1", WriteMode::Replace), &source, &warehouse)
            .await
            .unwrap();
        let again = loader
            .load(&request("IS_MARKETING", "00O1", WriteMode::Replace), &source, &warehouse)
            .await
            .unwrap();
        assert!(again.replaced_existing);
        assert_eq!(warehouse.rows("IS_MARKETING").unwrap().len(), 2);

        let appended = loader
            .load(&request("IS_MARKETING", "00O2", WriteMode::Append), &source, &warehouse)
            .await
            .unwrap();
        assert!(!appended.replaced_existing);
        assert_eq!(warehouse.rows("IS_MARKETING").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn fetch_failures_propagate() {
        let warehouse = MemoryWarehouse::default();
        let err = SourceLoader::new()
            .load(
                &request("BB_OPPORTUNITIES", "missing", WriteMode::Replace),
                &MemoryReportSource::default(),
                &warehouse,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("fetching report missing"));
        assert!(warehouse.columns("BB_OPPORTUNITIES").is_none());
    }

    #[tokio::test]
    async fn raw_exports_are_archived_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemoryReportSource::default().with_export("00O1", EXPORT);
        let warehouse = MemoryWarehouse::default();
        let loader = SourceLoader::new().with_archive(Some(ExportArchive::new(dir.path())));

        let summary = loader
            .load(&request("BB_OPPORTUNITIES", "00O1", WriteMode::Replace), &source, &warehouse)
            .await
            .unwrap();
        let path = summary.archived_to.unwrap();
        assert!(path.contains("20160601"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), EXPORT);
    }
}
