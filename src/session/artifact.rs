// src/session/artifact.rs

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Metrics reported by a target, keyed by column name.
pub type Metrics = BTreeMap<String, serde_json::Value>;

/// Where an artifact's content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactData {
    /// Content kept in memory until exported.
    Text(String),
    /// A file on disk.
    File(PathBuf),
}

/// A named output of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub data: ArtifactData,
}

impl Artifact {
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: ArtifactData::Text(content.into()),
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data: ArtifactData::File(path.into()),
        }
    }

    /// Path on disk, if the artifact has been materialized.
    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            ArtifactData::File(path) => Some(path),
            ArtifactData::Text(_) => None,
        }
    }

    pub fn is_exported(&self) -> bool {
        self.path().is_some()
    }

    /// Write in-memory content to `dir/<name>` and switch to the file.
    ///
    /// File artifacts are left where they are.
    pub fn export(&mut self, dir: &Path) -> io::Result<PathBuf> {
        match &self.data {
            ArtifactData::File(path) => Ok(path.clone()),
            ArtifactData::Text(content) => {
                fs::create_dir_all(dir)?;
                let dest = dir.join(&self.name);
                fs::write(&dest, content)?;
                self.data = ArtifactData::File(dest.clone());
                Ok(dest)
            }
        }
    }
}
