//! Core data model for jetload: tabular blocks, identifiers and the static
//! per-source configuration types (column types, date masks, mapping tables).

use std::fmt;
use std::str::FromStr;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

pub mod ident;
pub mod table;

pub use ident::{sanitize, sanitize_legacy, unique_identifier, unique_identifiers, MAX_IDENTIFIER_LEN};
pub use table::{cell_at, Cell, ColumnPosition, ColumnValue, Row, Table};

pub const CRATE_NAME: &str = "jetload-core";

/// Metadata columns appended to every extracted report.
pub const DATA_SOURCE_COLUMN: &str = "PY_DATA_SOURCE";
pub const INSTANCE_COLUMN: &str = "PY_INSTANCE";
pub const EXTRACTED_AT_COLUMN: &str = "PY_EXTRACTED_DATE_VALUE";

/// How a load treats an existing destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Drop the table (if any) and recreate it from the extracted block.
    #[default]
    Replace,
    /// Insert into the table, creating it first only when missing.
    Append,
}

/// Warehouse column type for a created table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Varchar(u32),
    Text,
    Date,
    Timestamp,
    Numeric,
}

impl ColumnType {
    pub fn sql(&self) -> String {
        match self {
            ColumnType::Varchar(len) => format!("VARCHAR({len})"),
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Timestamp => "TIMESTAMP".to_string(),
            ColumnType::Numeric => "NUMERIC".to_string(),
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, ColumnType::Varchar(_) | ColumnType::Text)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

impl FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if let Some(len) = upper
            .strip_prefix("VARCHAR(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return len
                .trim()
                .parse()
                .map(ColumnType::Varchar)
                .map_err(|_| format!("invalid VARCHAR length in {s:?}"));
        }
        match upper.as_str() {
            "VARCHAR" | "TEXT" => Ok(ColumnType::Text),
            "DATE" => Ok(ColumnType::Date),
            "TIMESTAMP" | "DATETIME" => Ok(ColumnType::Timestamp),
            "NUMERIC" | "DECIMAL" => Ok(ColumnType::Numeric),
            _ => Err(format!("unknown column type {s:?}")),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.sql()
    }
}

/// Ordered column-name to type map.
///
/// Deserializes from a YAML mapping and keeps the document order, which is the
/// column order of tables created from it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ColumnTypes(Vec<(String, ColumnType)>);

impl ColumnTypes {
    pub fn new(entries: Vec<(String, ColumnType)>) -> Self {
        Self(entries)
    }

    pub fn get(&self, column: &str) -> Option<ColumnType> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, column_type)| *column_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.0.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for ColumnTypes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = ColumnTypes;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of column name to column type")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, column_type)) = map.next_entry::<String, ColumnType>()? {
                    entries.push((name, column_type));
                }
                Ok(ColumnTypes(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

/// Column that needs string-to-date coercion, with its strptime-style mask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateMask {
    pub column: String,
    pub format: String,
}

impl DateMask {
    pub fn new(column: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            format: format.into(),
        }
    }
}

/// One canonical column and the source column that feeds it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub target: String,
    pub source: Option<String>,
}

impl MappingEntry {
    pub fn new(target: impl Into<String>, source: Option<&str>) -> Self {
        Self {
            target: target.into(),
            source: source.filter(|s| !s.trim().is_empty()).map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_types_parse_sql_spellings() {
        assert_eq!("VARCHAR(100)".parse::<ColumnType>(), Ok(ColumnType::Varchar(100)));
        assert_eq!("varchar( 20 )".parse::<ColumnType>(), Ok(ColumnType::Varchar(20)));
        assert_eq!("date".parse::<ColumnType>(), Ok(ColumnType::Date));
        assert_eq!("DECIMAL".parse::<ColumnType>(), Ok(ColumnType::Numeric));
        assert!("BLOB".parse::<ColumnType>().is_err());
        assert!("VARCHAR(x)".parse::<ColumnType>().is_err());
    }

    #[test]
    fn column_types_keep_yaml_order() {
        let yaml = "OPPORTUNITY_ID: VARCHAR(100)\nCLOSE_DATE: DATE\nAMOUNT: NUMERIC\n";
        let types: ColumnTypes = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(types.names(), vec!["OPPORTUNITY_ID", "CLOSE_DATE", "AMOUNT"]);
        assert_eq!(types.get("CLOSE_DATE"), Some(ColumnType::Date));
        assert_eq!(types.get("MISSING"), None);
    }

    #[test]
    fn blank_mapping_source_means_null() {
        assert_eq!(MappingEntry::new("TYPE", Some("  ")).source, None);
        assert_eq!(MappingEntry::new("STAGE", Some("ATHOC_STAGE")).source.as_deref(), Some("ATHOC_STAGE"));
    }

    #[test]
    fn write_mode_reads_snake_case() {
        let mode: WriteMode = serde_yaml::from_str("append").unwrap();
        assert_eq!(mode, WriteMode::Append);
    }
}
