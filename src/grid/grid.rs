//! The Haystack grid: an ordered sequence of rows over a shared column set,
//! with grid-level and per-column metadata.

use indexmap::IndexMap;

use super::scalar::Scalar;

/// One grid row: column name to scalar value.
pub type Row = IndexMap<String, Scalar>;

/// Grid-level or column-level metadata.
pub type Meta = IndexMap<String, Scalar>;

const NULL: Scalar = Scalar::Null;

/// A tabular grid. All rows share the grid's column set; a value missing
/// from a row reads as [`Scalar::Null`], not as an absent key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Grid {
    metadata: Meta,
    columns: IndexMap<String, Meta>,
    rows: Vec<Row>,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grid-level metadata.
    pub fn metadata(&self) -> &Meta {
        &self.metadata
    }

    /// Look up one metadata value.
    pub fn meta(&self, key: &str) -> Option<&Scalar> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_meta(&mut self, key: impl Into<String>, value: Scalar) {
        self.metadata.insert(key.into(), value);
    }

    /// Declare a column (idempotent; keeps existing metadata).
    pub fn add_column(&mut self, name: impl Into<String>) {
        self.columns.entry(name.into()).or_default();
    }

    /// Declare a column with metadata.
    pub fn add_column_with_meta(&mut self, name: impl Into<String>, meta: Meta) {
        self.columns.insert(name.into(), meta);
    }

    /// Column names, in declaration order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Metadata for one column.
    pub fn column_meta(&self, name: &str) -> Option<&Meta> {
        self.columns.get(name)
    }

    /// Append a row. Any column the row names that the grid has not yet
    /// declared is added, preserving the shared-column-set invariant.
    pub fn push_row(&mut self, row: Row) {
        for name in row.keys() {
            self.add_column(name.clone());
        }
        self.rows.push(row);
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    /// The value of `column` in row `index`; `Null` when the cell is
    /// missing (but the row exists).
    pub fn cell(&self, index: usize, column: &str) -> Option<&Scalar> {
        self.rows.get(index).map(|row| row.get(column).unwrap_or(&NULL))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// In-band protocol error carried in the grid metadata, if present:
    /// `(dis, traceback)`.
    pub fn error(&self) -> Option<(String, Option<String>)> {
        self.metadata.get("err")?;
        let dis = match self.metadata.get("dis") {
            Some(Scalar::Str(s)) => s.clone(),
            _ => "Unknown Error".to_string(),
        };
        let traceback = match self.metadata.get("errTrace") {
            Some(Scalar::Str(s)) => Some(s.clone()),
            _ => None,
        };
        Some((dis, traceback))
    }
}
