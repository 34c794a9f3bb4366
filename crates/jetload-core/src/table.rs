//! Row-major tabular blocks with a header row.
//!
//! Every transform borrows the input and returns a new [`Table`]. Rows may be
//! shorter than the header; reads past the end of a row see an empty text cell.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;

static EMPTY_CELL: Cell = Cell::Text(String::new());

/// A single value in a tabular block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Cell {
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Decimal(Decimal),
    Null,
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Null, or text that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Text(value) => value.trim().is_empty(),
            Cell::Null => true,
            _ => false,
        }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Cell::Text(String::new())
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Text(value) => f.write_str(value),
            Cell::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            Cell::DateTime(value) => write!(f, "{}", value.format("%Y-%m-%d %H:%M:%S")),
            Cell::Decimal(value) => write!(f, "{value}"),
            Cell::Null => Ok(()),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<NaiveDate> for Cell {
    fn from(value: NaiveDate) -> Self {
        Cell::Date(value)
    }
}

impl From<NaiveDateTime> for Cell {
    fn from(value: NaiveDateTime) -> Self {
        Cell::DateTime(value)
    }
}

impl From<Decimal> for Cell {
    fn from(value: Decimal) -> Self {
        Cell::Decimal(value)
    }
}

pub type Row = Vec<Cell>;

/// Read `row[index]`, or an empty text cell when the row is too short.
pub fn cell_at(row: &[Cell], index: usize) -> &Cell {
    row.get(index).unwrap_or(&EMPTY_CELL)
}

/// Value source for a column added with [`Table::with_column`].
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// The same value on every data row.
    Constant(Cell),
    /// One value per data row, in data-row order. Missing entries are empty.
    PerRow(Vec<Cell>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnPosition {
    Start,
    End,
}

/// Ordered rows; row 0 is the header.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    rows: Vec<Row>,
}

impl Table {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Build a table of text cells.
    pub fn from_text<R, S>(rows: impl IntoIterator<Item = R>) -> Self
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|s| Cell::Text(s.into())).collect())
                .collect(),
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn header(&self) -> &[Cell] {
        self.rows.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn header_names(&self) -> Vec<String> {
        self.header().iter().map(ToString::to_string).collect()
    }

    pub fn data_rows(&self) -> &[Row] {
        self.rows.get(1..).unwrap_or(&[])
    }

    pub fn width(&self) -> usize {
        self.header().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of `name` in the header row.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header()
            .iter()
            .position(|cell| cell.as_text() == Some(name))
    }

    /// Values at `index` for every row, header included; short rows yield
    /// `default`.
    pub fn column(&self, index: usize, default: &Cell) -> Vec<Cell> {
        self.rows
            .iter()
            .map(|row| row.get(index).unwrap_or(default).clone())
            .collect()
    }

    /// Replace the header row, keeping data rows untouched.
    pub fn with_header<S: Into<String>>(&self, names: impl IntoIterator<Item = S>) -> Table {
        let header: Row = names.into_iter().map(|s| Cell::Text(s.into())).collect();
        let mut rows = Vec::with_capacity(self.rows.len().max(1));
        rows.push(header);
        rows.extend(self.data_rows().iter().cloned());
        Table { rows }
    }

    /// Add a column named `name` at either end; the header and every data row
    /// grow in lockstep. Appending pads short rows with empty cells first so
    /// the new cell lands under its header.
    pub fn with_column(&self, name: &str, value: ColumnValue, position: ColumnPosition) -> Table {
        let width = self.width();
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let cell = if i == 0 {
                    Cell::text(name)
                } else {
                    match &value {
                        ColumnValue::Constant(cell) => cell.clone(),
                        ColumnValue::PerRow(values) => values.get(i - 1).cloned().unwrap_or_default(),
                    }
                };
                let mut out = Vec::with_capacity(row.len().max(width) + 1);
                match position {
                    ColumnPosition::Start => {
                        out.push(cell);
                        out.extend(row.iter().cloned());
                    }
                    ColumnPosition::End => {
                        out.extend(row.iter().cloned());
                        if out.len() < width {
                            out.resize(width, Cell::default());
                        }
                        out.push(cell);
                    }
                }
                out
            })
            .collect();
        Table { rows }
    }

    /// Keep the header plus the data rows whose cell at `index` matches
    /// `needle` (or, with `include == false`, does not match).
    ///
    /// A cell matches when it contains `needle`; an empty `needle` matches
    /// blank cells.
    pub fn filter_rows(&self, index: usize, needle: &str, include: bool) -> Table {
        let mut rows = Vec::with_capacity(self.rows.len());
        rows.extend(self.rows.first().cloned());
        rows.extend(
            self.data_rows()
                .iter()
                .filter(|row| {
                    let cell = cell_at(row, index);
                    let matches = if needle.is_empty() {
                        cell.is_blank()
                    } else {
                        cell.to_string().contains(needle)
                    };
                    matches == include
                })
                .cloned(),
        );
        Table { rows }
    }

    /// Apply `f` to the cell at `index` of every data row. Rows too short to
    /// have that cell are left alone.
    pub fn map_column<F>(&self, index: usize, mut f: F) -> Table
    where
        F: FnMut(&Cell) -> Cell,
    {
        let mut rows = Vec::with_capacity(self.rows.len());
        rows.extend(self.rows.first().cloned());
        for row in self.data_rows() {
            let mut row = row.clone();
            if let Some(cell) = row.get_mut(index) {
                *cell = f(cell);
            }
            rows.push(row);
        }
        Table { rows }
    }

    /// Remove every occurrence of `needle` from text cells. Each row is cut
    /// to the header width.
    pub fn remove_string(&self, needle: &str) -> Table {
        let width = self.width();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .take(width)
                    .map(|cell| match cell {
                        Cell::Text(value) if !needle.is_empty() => Cell::Text(value.replace(needle, "")),
                        other => other.clone(),
                    })
                    .collect()
            })
            .collect();
        Table { rows }
    }

    /// Drop up to `count` rows from the end, never the header.
    pub fn drop_trailing(&self, count: usize) -> Table {
        let keep = self.rows.len().saturating_sub(count).max(self.rows.len().min(1));
        Table {
            rows: self.rows[..keep].to_vec(),
        }
    }
}
