//! Warehouse seam: the handful of statements a load or union needs, behind a
//! trait, with the Postgres implementation over `sqlx`.

use async_trait::async_trait;
use jetload_core::{cell_at, Cell, ColumnType, Row};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::query_builder::Separated;
use sqlx::QueryBuilder;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_INSERT_BATCH: usize = 500;

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error("invalid SQL identifier {0:?}")]
    Identifier(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError>;

    /// Drop `table` if present; returns whether it existed.
    async fn drop_table(&self, table: &str) -> Result<bool, WarehouseError>;

    async fn create_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
        if_not_exists: bool,
    ) -> Result<(), WarehouseError>;

    /// Insert `rows` into the listed columns. Row cells are positional against
    /// `columns`; missing trailing cells are written as empty text.
    async fn insert_rows(&self, table: &str, columns: &[ColumnDef], rows: &[Row]) -> Result<u64, WarehouseError>;

    /// Run a statement and return the affected row count.
    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError>;
}

/// Accept plain (optionally schema-qualified) identifiers only; names are
/// spliced into SQL text.
pub fn check_identifier(name: &str) -> Result<&str, WarehouseError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(name)
    } else {
        Err(WarehouseError::Identifier(name.to_string()))
    }
}

pub fn create_table_sql(table: &str, columns: &[ColumnDef], if_not_exists: bool) -> Result<String, WarehouseError> {
    let table = check_identifier(table)?;
    let columns = columns
        .iter()
        .map(|column| Ok(format!("{} {}", check_identifier(&column.name)?, column.column_type.sql())))
        .collect::<Result<Vec<_>, WarehouseError>>()?;
    let guard = if if_not_exists { "IF NOT EXISTS " } else { "" };
    Ok(format!("CREATE TABLE {guard}{table} ({})", columns.join(", ")))
}

/// Rows per INSERT statement for a table `width` columns wide.
pub fn rows_per_statement(batch: usize, width: usize) -> usize {
    batch.max(1).min((MAX_BIND_PARAMS / width.max(1)).max(1))
}

/// How one cell is bound into an INSERT.
#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    Text(Option<String>),
    Date(chrono::NaiveDate),
    DateTime(chrono::NaiveDateTime),
    Decimal(rust_decimal::Decimal),
    /// Text (or NULL) the server converts with `::TYPE`; blank text is NULL.
    Cast(Option<String>, ColumnType),
}

fn bind_value(cell: &Cell, column_type: ColumnType) -> BindValue {
    if column_type.is_textual() {
        return BindValue::Text(match cell {
            Cell::Null => None,
            other => Some(other.to_string()),
        });
    }
    match cell {
        Cell::Date(date) => BindValue::Date(*date),
        Cell::DateTime(datetime) => BindValue::DateTime(*datetime),
        Cell::Decimal(decimal) => BindValue::Decimal(*decimal),
        Cell::Null => BindValue::Cast(None, column_type),
        Cell::Text(text) => BindValue::Cast(
            Some(text.trim()).filter(|t| !t.is_empty()).map(str::to_string),
            column_type,
        ),
    }
}

fn push_cell(values: &mut Separated<'_, 'static, Postgres, &'static str>, cell: &Cell, column_type: ColumnType) {
    match bind_value(cell, column_type) {
        BindValue::Text(value) => {
            values.push_bind(value);
        }
        BindValue::Date(date) => {
            values.push_bind(date);
        }
        BindValue::DateTime(datetime) => {
            values.push_bind(datetime);
        }
        BindValue::Decimal(decimal) => {
            values.push_bind(decimal);
        }
        BindValue::Cast(value, column_type) => {
            values.push_bind(value);
            values.push_unseparated(format!("::{}", column_type.sql()));
        }
    }
}

fn insert_prefix(table: &str, columns: &[ColumnDef]) -> Result<String, WarehouseError> {
    let names = columns
        .iter()
        .map(|column| check_identifier(&column.name))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    Ok(format!("INSERT INTO {} ({names}) ", check_identifier(table)?))
}

/// One multi-row INSERT for `chunk`, cells positional against `columns`.
fn build_insert(prefix: &str, columns: &[ColumnDef], chunk: &[Row]) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::<Postgres>::new(prefix);
    builder.push_values(chunk, |mut values, row| {
        for (index, column) in columns.iter().enumerate() {
            push_cell(&mut values, cell_at(row, index), column.column_type);
        }
    });
    builder
}

pub struct PgWarehouse {
    pool: PgPool,
    insert_batch: usize,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new().max_connections(1).connect(database_url).await?;
        Ok(Self {
            pool,
            insert_batch: DEFAULT_INSERT_BATCH,
        })
    }

    pub fn with_insert_batch(mut self, insert_batch: usize) -> Self {
        self.insert_batch = insert_batch.max(1);
        self
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn table_exists(&self, table: &str) -> Result<bool, WarehouseError> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(check_identifier(table)?)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn drop_table(&self, table: &str) -> Result<bool, WarehouseError> {
        let existed = self.table_exists(table).await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", check_identifier(table)?))
            .execute(&self.pool)
            .await?;
        debug!(table, existed, "dropped table");
        Ok(existed)
    }

    async fn create_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
        if_not_exists: bool,
    ) -> Result<(), WarehouseError> {
        let sql = create_table_sql(table, columns, if_not_exists)?;
        sqlx::query(&sql).execute(&self.pool).await?;
        debug!(table, columns = columns.len(), "created table");
        Ok(())
    }

    async fn insert_rows(&self, table: &str, columns: &[ColumnDef], rows: &[Row]) -> Result<u64, WarehouseError> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }
        let prefix = insert_prefix(table, columns)?;

        let mut inserted = 0;
        for chunk in rows.chunks(rows_per_statement(self.insert_batch, columns.len())) {
            let mut builder = build_insert(&prefix, columns, chunk);
            inserted += builder.build().execute(&self.pool).await?.rows_affected();
        }
        info!(table, inserted, "inserted rows");
        Ok(inserted)
    }

    async fn execute(&self, sql: &str) -> Result<u64, WarehouseError> {
        Ok(sqlx::query(sql).execute(&self.pool).await?.rows_affected())
    }
}
