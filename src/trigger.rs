// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trigger data: the row-oriented export driving one alert's evaluation.

use std::io;
use std::path::Path;

use crate::errors::AlertError;

/// One trigger record: an ordered mapping of column name to string value.
///
/// Rows are immutable once read from the export. Column order is preserved because appended
/// attachments are collected in column order later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, String)>,
}

impl Row {
    /// Returns a new row from ordered column/value pairs.
    pub fn new(columns: Vec<(String, String)>) -> Self {
        Self { columns }
    }

    /// Returns the value of a column, or `None` when the column is absent.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the value of a column, treating an absent column as empty.
    pub fn value(&self, column: &str) -> &str {
        self.get(column).unwrap_or("")
    }

    /// Iterates over all `(column, value)` pairs in source order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Returns a copy of this row reduced to the given columns, preserving source order.
    pub fn project(&self, keep: &[&str]) -> Row {
        Row {
            columns: self
                .columns
                .iter()
                .filter(|(name, _)| keep.contains(&name.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Canonical identity of this row: its `(column, value)` pairs in sorted order. Two rows with
    /// equal identity are duplicates.
    pub fn identity(&self) -> Vec<(String, String)> {
        let mut pairs = self.columns.clone();
        pairs.sort();
        pairs
    }
}

/// The full trigger data set for one alert: the header row plus all records.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    headers: Vec<String>,
    rows: Vec<Row>,
}

impl RowSet {
    /// Reads trigger data from a CSV export file.
    pub fn from_path(path: &Path) -> Result<Self, AlertError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Reads trigger data from any CSV source.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, AlertError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|header| header.to_string())
            .collect();

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            let columns = headers
                .iter()
                .zip(record.iter())
                .map(|(header, value)| (header.clone(), value.to_string()))
                .collect();
            rows.push(Row::new(columns));
        }

        Ok(Self { headers, rows })
    }

    /// Returns the column names of the export, in source order.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Returns all records.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Returns the number of records (excluding the header).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when the export carried no records.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
