//! Appending differently shaped instance tables into one history table
//! through static per-source column mappings.

use jetload_core::{ColumnTypes, MappingEntry};
use thiserror::Error;
use tracing::info;

use crate::warehouse::{check_identifier, ColumnDef, Warehouse, WarehouseError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping has {actual} columns, history table has {expected}")]
    Length { expected: usize, actual: usize },
    #[error("mapping column {position} is {actual:?}, history table expects {expected:?}")]
    Mismatch {
        position: usize,
        expected: String,
        actual: String,
    },
}

/// `SELECT <source> AS <target>, NULL AS <target>, ... FROM <table>`.
pub fn projection_sql(source_table: &str, mapping: &[MappingEntry]) -> String {
    let projection = mapping
        .iter()
        .map(|entry| match &entry.source {
            Some(source) => format!("{source} AS {}", entry.target),
            None => format!("NULL AS {}", entry.target),
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {projection} FROM {source_table}")
}

/// `INSERT INTO <target> (<canonical columns>) (<projection>)`.
pub fn union_sql(target_table: &str, source_table: &str, mapping: &[MappingEntry]) -> String {
    let targets = mapping
        .iter()
        .map(|entry| entry.target.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {target_table} ({targets}) ({})",
        projection_sql(source_table, mapping)
    )
}

/// Append every row of `source_table` into `target_table`.
pub async fn union_into(
    warehouse: &dyn Warehouse,
    target_table: &str,
    source_table: &str,
    mapping: &[MappingEntry],
) -> Result<u64, WarehouseError> {
    check_identifier(target_table)?;
    check_identifier(source_table)?;
    for entry in mapping {
        check_identifier(&entry.target)?;
        if let Some(source) = &entry.source {
            check_identifier(source)?;
        }
    }
    let inserted = warehouse
        .execute(&union_sql(target_table, source_table, mapping))
        .await?;
    info!(target_table, source_table, inserted, "appended instance table");
    Ok(inserted)
}

/// Parse `TARGET<delimiter>SOURCE` lines. An empty or missing source maps to
/// NULL; blank lines are skipped.
pub fn parse_mapping_table(text: &str, delimiter: char) -> Vec<MappingEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(delimiter) {
            Some((target, source)) => MappingEntry::new(target.trim(), Some(source.trim())),
            None => MappingEntry::new(line, None),
        })
        .collect()
}

/// The mapping must name exactly the canonical columns, in order.
pub fn validate_mapping(mapping: &[MappingEntry], canonical: &[&str]) -> Result<(), MappingError> {
    if mapping.len() != canonical.len() {
        return Err(MappingError::Length {
            expected: canonical.len(),
            actual: mapping.len(),
        });
    }
    for (position, (entry, expected)) in mapping.iter().zip(canonical).enumerate() {
        if entry.target != *expected {
            return Err(MappingError::Mismatch {
                position,
                expected: expected.to_string(),
                actual: entry.target.clone(),
            });
        }
    }
    Ok(())
}

/// Create the history table from its column map unless it already exists.
pub async fn ensure_history_table(
    warehouse: &dyn Warehouse,
    table: &str,
    columns: &ColumnTypes,
) -> Result<bool, WarehouseError> {
    let existed = warehouse.table_exists(table).await?;
    if !existed {
        let defs: Vec<ColumnDef> = columns
            .iter()
            .map(|(name, column_type)| ColumnDef::new(name, column_type))
            .collect();
        warehouse.create_table(table, &defs, true).await?;
        info!(table, columns = defs.len(), "created history table");
    }
    Ok(!existed)
}
