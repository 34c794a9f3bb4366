//! In-memory stand-ins for the warehouse and the report source.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use jetload_adapters::{AdapterError, ReportSource};
use jetload_core::Row;
use jetload_storage::FetchedExport;

use crate::warehouse::{ColumnDef, Warehouse, WarehouseError};

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, (Vec<ColumnDef>, Vec<Row>)>,
    statements: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn columns(&self, table: &str) -> Option<Vec<ColumnDef>> {
        let state = self.state.lock().unwrap();
        state.tables.get(table).map(|(columns, _)| columns.clone())
    }

    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        let state = self.state.lock().unwrap();
        state.tables.get(table).map(|(_, rows)| rows.clone())
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().unwrap().tables.contains_key(table))
    }

    async fn drop_table(&self, table: &str) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().unwrap().tables.remove(table).is_some())
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
        if_not_exists: bool,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(table) {
            if if_not_exists {
                return Ok(());
            }
            return Err(WarehouseError::Sql(sqlx::Error::Protocol(format!(
                "relation {table} already exists"
            ))));
        }
        state.tables.insert(table.to_string(), (columns.to_vec(), Vec::new()));
        Ok(())
    }

    async fn insert_rows(&self, table: &str, columns: &[ColumnDef], rows: &[Row]) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().unwrap();
        let Some((existing, stored)) = state.tables.get_mut(table) else {
            return Err(WarehouseError::Sql(sqlx::Error::Protocol(format!(
                "relation {table} does not exist"
            ))));
        };
        // Store rows in table column order, matching by name.
        for row in rows {
            let ordered = existing
                .iter()
                .map(|column| {
                    columns
                        .iter()
                        .position(|c| c.name == column.name)
                        .map(|index| jetload_core::cell_at(row, index).clone())
                        .unwrap_or(jetload_core::Cell::Null)
                })
                .collect();
            stored.push(ordered);
        }
        Ok(rows.len() as u64)
    }

    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        self.state.lock().unwrap().statements.push(sql.to_string());
        Ok(0)
    }
}

/// Serves canned export bodies by report id.
#[derive(Debug, Default)]
pub struct MemoryReportSource {
    exports: HashMap<String, String>,
}

impl MemoryReportSource {
    pub fn with_export(mut self, report_id: &str, body: &str) -> Self {
        self.exports.insert(report_id.to_string(), body.to_string());
        self
    }
}

#[async_trait]
impl ReportSource for MemoryReportSource {
    async fn fetch_export(&self, report_id: &str) -> Result<FetchedExport, AdapterError> {
        let body = self
            .exports
            .get(report_id)
            .ok_or_else(|| AdapterError::Message(format!("no export for {report_id}")))?;
        Ok(FetchedExport {
            report_id: report_id.to_string(),
            url: format!("memory://{report_id}"),
            fetched_at: Utc.with_ymd_and_hms(2016, 6, 1, 10, 0, 0).unwrap(),
            body: body.clone(),
        })
    }
}
