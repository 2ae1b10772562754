// src/report.rs

//! Tabular run reports and their CSV export.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// One report row with columns kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    columns: Vec<(String, Value)>,
}

impl ReportRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column, replacing the value in place if it already exists.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.columns.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        let pos = self.columns.iter().position(|(name, _)| name == column)?;
        Some(self.columns.remove(pos).1)
    }

    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some((name, _)) = self.columns.iter_mut().find(|(name, _)| name == from) {
            *name = to.to_string();
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }
}

/// Rows of all runs of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub rows: Vec<ReportRow>,
}

impl Report {
    pub fn new(rows: Vec<ReportRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of all row columns, in first-seen order.
    pub fn columns(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for row in &self.rows {
            for column in row.columns() {
                if !out.iter().any(|c| c == column) {
                    out.push(column.to_string());
                }
            }
        }
        out
    }

    pub fn rename_column(&mut self, from: &str, to: &str) {
        for row in &mut self.rows {
            row.rename(from, to);
        }
    }

    pub fn drop_column(&mut self, column: &str) {
        for row in &mut self.rows {
            row.remove(column);
        }
    }

    pub fn to_csv(&self) -> String {
        let columns = self.columns();
        let mut out = String::new();
        let header: Vec<String> = columns.iter().map(|c| csv_field(c)).collect();
        let _ = writeln!(out, "{}", header.join(","));
        for row in &self.rows {
            let fields: Vec<String> = columns
                .iter()
                .map(|c| row.get(c).map(cell_text).unwrap_or_default())
                .map(|s| csv_field(&s))
                .collect();
            let _ = writeln!(out, "{}", fields.join(","));
        }
        out
    }

    pub fn export(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_csv())?;
        Ok(())
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}
