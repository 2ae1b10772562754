// src/session/postprocess.rs

//! Postprocesses applied to a single run's report row (POSTPROCESS stage)
//! or to the aggregated session report.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use serde_json::Value;

use crate::report::{Report, ReportRow};
use crate::session::artifact::Artifact;

pub trait RunPostprocess: Send + Sync {
    fn name(&self) -> &str;

    /// Update the run's report row; returned artifacts are stored under the
    /// POSTPROCESS stage.
    fn apply(&self, row: &mut ReportRow, artifacts: &[Artifact]) -> anyhow::Result<Vec<Artifact>>;
}

pub trait SessionPostprocess: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, report: &mut Report) -> anyhow::Result<()>;
}

/// Adds `column = numerator / denominator` computed from two metrics.
#[derive(Debug, Clone)]
pub struct RatioPostprocess {
    name: String,
    numerator: String,
    denominator: String,
    column: String,
}

impl RatioPostprocess {
    pub fn new(name: &str, numerator: &str, denominator: &str, column: &str) -> Self {
        Self {
            name: name.to_string(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
            column: column.to_string(),
        }
    }
}

fn metric(row: &ReportRow, column: &str) -> anyhow::Result<f64> {
    let value = row
        .get(column)
        .ok_or_else(|| anyhow!("report has no column '{column}'"))?;
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("column '{column}' is not finite")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("column '{column}' is not numeric")),
        other => Err(anyhow!("column '{column}' is not numeric: {other}")),
    }
}

impl RunPostprocess for RatioPostprocess {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, row: &mut ReportRow, _artifacts: &[Artifact]) -> anyhow::Result<Vec<Artifact>> {
        let numerator = metric(row, &self.numerator)?;
        let denominator = metric(row, &self.denominator)?;
        if denominator == 0.0 {
            return Err(anyhow!(
                "{}: division by zero ('{}' is 0)",
                self.name,
                self.denominator
            ));
        }
        row.set(self.column.clone(), numerator / denominator);
        Ok(Vec::new())
    }
}

/// Renames report columns (`old -> new`).
#[derive(Debug, Clone)]
pub struct RenameColumns {
    name: String,
    columns: BTreeMap<String, String>,
}

impl RenameColumns {
    pub fn new(name: &str, columns: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            columns,
        }
    }
}

impl SessionPostprocess for RenameColumns {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, report: &mut Report) -> anyhow::Result<()> {
        for (from, to) in &self.columns {
            report.rename_column(from, to);
        }
        Ok(())
    }
}

/// Drops report columns.
#[derive(Debug, Clone)]
pub struct FilterColumns {
    name: String,
    drop: Vec<String>,
}

impl FilterColumns {
    pub fn new(name: &str, drop: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            drop,
        }
    }
}

impl SessionPostprocess for FilterColumns {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, report: &mut Report) -> anyhow::Result<()> {
        for column in &self.drop {
            report.drop_column(column);
        }
        Ok(())
    }
}
