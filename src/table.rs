//! Space separated ASCII tables with a commented header line (`# col1 col2 ...`).
//!
//! Rows go through `csv` with a space delimiter, quoting cells that contain spaces.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{Error, Result};

/// A table of string cells with named columns.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AsciiTable {
    /// Column names.
    pub columns: Vec<String>,
    /// Cells, row by row.
    pub rows: Vec<Vec<String>>,
}

impl AsciiTable {
    /// An empty table with the given column names.
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row with one cell per column.
    pub fn push_row(&mut self, row: Vec<String>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the column called `name`.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Keep only the named columns, in the given order.
    pub fn select(&self, names: &[&str]) -> Option<Self> {
        let idx: Vec<usize> = names.iter().map(|n| self.column(n)).collect::<Option<_>>()?;
        Some(Self {
            columns: names.iter().map(|n| n.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|r| idx.iter().map(|i| r[*i].clone()).collect())
                .collect(),
        })
    }

    /// Render the table. Cells containing a space or a quote are quoted, so file names
    /// with spaces survive a round trip.
    pub fn to_text(&self) -> Result<String> {
        let header = format!("# {}\n", self.columns.join(" "));
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .quote_style(csv::QuoteStyle::Necessary)
            .from_writer(header.into_bytes());
        for row in &self.rows {
            writer.write_record(row).map_err(io::Error::from)?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
    }

    /// Write the table to `path`, replacing any existing file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_text()?)?;
        Ok(())
    }

    /// Parse the text of a table read from `path`. `path` only appears in errors.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let header = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| l.trim_start().strip_prefix('#'))
            .ok_or_else(|| Error::catalog(path, "missing commented header line"))?;
        let columns: Vec<String> = header.split_whitespace().map(String::from).collect();

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b' ')
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_reader(text.as_bytes());
        let rows = reader
            .records()
            .enumerate()
            .map(|(i, record)| {
                let record = record.map_err(|e| Error::catalog(path, e.to_string()))?;
                if record.len() != columns.len() {
                    return Err(Error::catalog(
                        path,
                        format!("row {} has {} cells, expected {}", i + 1, record.len(), columns.len()),
                    ));
                }
                Ok(record.iter().map(String::from).collect())
            })
            .collect::<Result<_>>()?;

        Ok(Self { columns, rows })
    }

    /// Read and parse the table at `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::parse(&fs::read_to_string(path)?, path)
    }

    /// Typed accessor for a numeric cell.
    pub fn f64_at(&self, row: usize, column: usize, path: &Path) -> Result<f64> {
        self.rows[row][column].parse().map_err(|_| {
            Error::catalog(
                path,
                format!("row {}: `{}` is not a number", row + 1, self.rows[row][column]),
            )
        })
    }
}
