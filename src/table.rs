//! Column-major table the bulk evaluation path reads and writes.
//!
//! Rows carry an index column alongside the data so bulk results can be
//! re-labelled with the input's row identity when the evaluator preserves row
//! count. CSV input and output use this type directly.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use thiserror::Error;

use crate::codec::Record;
use crate::value::Value;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("row has {got} cells, table has {expected} columns")]
    RowWidth { got: usize, expected: usize },

    #[error("column \"{name}\" has {got} rows, table has {expected}")]
    ColumnLength {
        name: String,
        got: usize,
        expected: usize,
    },

    #[error("index has {got} entries, table has {expected} rows")]
    IndexLength { got: usize, expected: usize },

    #[error("duplicate column \"{0}\"")]
    DuplicateColumn(String),

    #[error("ragged input: {0}")]
    Ragged(String),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rectangular batch of records.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    data: Vec<Vec<Value>>,
    index: Vec<Value>,
}

impl Table {
    /// Empty table with the given column names.
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        let data = columns.iter().map(|_| Vec::new()).collect();
        Self {
            columns,
            data,
            index: Vec::new(),
        }
    }

    /// Build from column-major data. Every column must have the same length;
    /// the index defaults to `0..n_rows`.
    ///
    /// # Errors
    ///
    /// Returns an error on ragged columns or a name/data count mismatch.
    pub fn from_columns(columns: Vec<String>, data: Vec<Vec<Value>>) -> Result<Self, TableError> {
        if columns.len() != data.len() {
            return Err(TableError::Ragged(format!(
                "{} column names for {} data columns",
                columns.len(),
                data.len()
            )));
        }
        let n_rows = data.first().map_or(0, Vec::len);
        for (name, column) in columns.iter().zip(&data) {
            if column.len() != n_rows {
                return Err(TableError::ColumnLength {
                    name: name.clone(),
                    got: column.len(),
                    expected: n_rows,
                });
            }
        }
        let index = default_index(n_rows);
        Ok(Self {
            columns,
            data,
            index,
        })
    }

    /// Build from row-major data.
    ///
    /// # Errors
    ///
    /// Returns an error when any row width disagrees with the column count.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self, TableError> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n_rows() == 0
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn data(&self) -> &[Vec<Value>] {
        &self.data
    }

    #[must_use]
    pub fn index(&self) -> &[Value] {
        &self.index
    }

    /// Cells of one named column.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        let at = self.columns.iter().position(|c| c == name)?;
        Some(&self.data[at])
    }

    /// Append one row; the index extends with the next row number.
    ///
    /// # Errors
    ///
    /// Returns an error when the row width disagrees with the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                got: row.len(),
                expected: self.columns.len(),
            });
        }
        let row_number = self.n_rows();
        for (column, cell) in self.data.iter_mut().zip(row) {
            column.push(cell);
        }
        self.index.push(Value::Int(row_number as i64));
        Ok(())
    }

    /// Append a full column on the right.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate name or a length mismatch.
    pub fn push_column(&mut self, name: &str, values: Vec<Value>) -> Result<(), TableError> {
        if self.columns.iter().any(|c| c == name) {
            return Err(TableError::DuplicateColumn(name.to_string()));
        }
        if !self.columns.is_empty() && values.len() != self.n_rows() {
            return Err(TableError::ColumnLength {
                name: name.to_string(),
                got: values.len(),
                expected: self.n_rows(),
            });
        }
        if self.columns.is_empty() {
            self.index = default_index(values.len());
        }
        self.columns.push(name.to_string());
        self.data.push(values);
        Ok(())
    }

    /// Replace the row index.
    ///
    /// # Errors
    ///
    /// Returns an error when the length disagrees with the row count.
    pub fn set_index(&mut self, index: Vec<Value>) -> Result<(), TableError> {
        if index.len() != self.n_rows() {
            return Err(TableError::IndexLength {
                got: index.len(),
                expected: self.n_rows(),
            });
        }
        self.index = index;
        Ok(())
    }

    /// One row as a record, keyed by column name.
    #[must_use]
    pub fn record(&self, row: usize) -> Option<Record> {
        if row >= self.n_rows() {
            return None;
        }
        let mut record = BTreeMap::new();
        for (name, column) in self.columns.iter().zip(&self.data) {
            record.insert(name.clone(), column[row].clone());
        }
        Some(record)
    }

    /// Copy with the NaN-as-missing rule applied to every cell.
    #[must_use]
    pub fn canonicalized(&self, nan_as_missing: bool) -> Self {
        if !nan_as_missing {
            return self.clone();
        }
        let data = self
            .data
            .iter()
            .map(|column| {
                column
                    .iter()
                    .map(|cell| cell.clone().canonicalize(true))
                    .collect()
            })
            .collect();
        Self {
            columns: self.columns.clone(),
            data,
            index: self.index.clone(),
        }
    }

    /// Read a headed CSV stream, parsing each cell by shape.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed CSV or ragged rows.
    pub fn read_csv<R: Read>(reader: R, delimiter: u8) -> Result<Self, TableError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(reader);
        let columns: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(ToString::to_string)
            .collect();
        let mut table = Self::new(columns);
        for row in csv_reader.records() {
            let row = row?;
            table.push_row(row.iter().map(Value::parse_csv).collect())?;
        }
        Ok(table)
    }

    /// Write as headed CSV. The index is not written; missing cells render as
    /// empty text.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying writer fails.
    pub fn write_csv<W: Write>(&self, writer: W, delimiter: u8) -> Result<(), TableError> {
        let mut csv_writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_writer(writer);
        csv_writer.write_record(&self.columns)?;
        for row in 0..self.n_rows() {
            let cells: Vec<String> = self
                .data
                .iter()
                .map(|column| column[row].to_string())
                .collect();
            csv_writer.write_record(&cells)?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

fn default_index(n_rows: usize) -> Vec<Value> {
    (0..n_rows).map(|i| Value::Int(i as i64)).collect()
}
