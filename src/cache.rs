// src/cache.rs

//! Dependency cache shared by installation tasks and runs.
//!
//! Values are stored under a composite [`CacheKey`] (`name` + [`Flags`]) so
//! that parametrized variants of the same artifact (e.g. debug vs. release
//! install dirs) coexist. A second, unflagged view keeps the value most
//! recently written for each name.
//!
//! On disk the cache is a flat INI file:
//!
//! ```ini
//! [default]
//! riscv_gcc.install_dir = /home/me/deps/riscv_gcc
//!
//! [dbg,vext]
//! spike.exe = /home/me/deps/spike_dbg_vext/spike
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::errors::{McuflowError, Result};
use crate::setup::params::Flags;

const DEFAULT_SECTION: &str = "default";

/// Structural cache key: a value name plus the flags of the variant that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub name: String,
    pub flags: Flags,
}

impl CacheKey {
    pub fn new(name: impl Into<String>, flags: Flags) -> Self {
        Self {
            name: name.into(),
            flags,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskCache {
    entries: BTreeMap<CacheKey, String>,
    latest: BTreeMap<String, String>,
}

impl TaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a value for `(name, flags)` and make it the latest for `name`.
    pub fn set(&mut self, name: &str, flags: &Flags, value: impl Into<String>) {
        let value = value.into();
        self.latest.insert(name.to_string(), value.clone());
        self.entries.insert(CacheKey::new(name, flags.clone()), value);
    }

    pub fn get(&self, name: &str, flags: &Flags) -> Option<&str> {
        self.entries
            .get(&CacheKey::new(name, flags.clone()))
            .map(String::as_str)
    }

    /// Latest value written for `name`, regardless of flags.
    pub fn latest(&self, name: &str) -> Option<&str> {
        self.latest.get(name).map(String::as_str)
    }

    /// Whether `name` currently has a non-empty latest value.
    pub fn is_set(&self, name: &str) -> bool {
        self.latest(name).is_some_and(|v| !v.is_empty())
    }

    /// Drop the `(name, flags)` entry and the latest value for `name`.
    pub fn remove(&mut self, name: &str, flags: &Flags) {
        self.entries.remove(&CacheKey::new(name, flags.clone()));
        self.latest.remove(name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &str)> {
        self.entries.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Find the value for `name` whose flags best fit the requested ones.
    ///
    /// An entry carrying a flag that was not requested is incompatible.
    /// Among the compatible ones, the entry sharing the most flags wins; a
    /// tie between the two best candidates is an error.
    pub fn find_best_match(&self, name: &str, flags: &Flags) -> Result<Option<&str>> {
        let mut best: Option<(usize, &CacheKey, &str)> = None;
        let mut tied: Option<&CacheKey> = None;

        for (key, value) in self.entries.iter().filter(|(k, _)| k.name == name) {
            if key.flags.iter().any(|f| !flags.contains(f)) {
                continue;
            }
            let score = key.flags.len();
            match best {
                Some((best_score, _, _)) if score < best_score => {}
                Some((best_score, _, _)) if score == best_score => tied = Some(key),
                _ => {
                    best = Some((score, key, value.as_str()));
                    tied = None;
                }
            }
        }

        match (best, tied) {
            (Some((_, winner, _)), Some(other)) => Err(McuflowError::AmbiguousProvider {
                key: name.to_string(),
                first: format!("[{}]", winner.flags),
                second: format!("[{}]", other.flags),
            }),
            (Some((_, _, value)), None) => Ok(Some(value)),
            (None, _) => Ok(None),
        }
    }

    /// Serialize to the INI text format.
    pub fn to_ini(&self) -> String {
        let mut sections: BTreeMap<String, Vec<(&str, &str)>> = BTreeMap::new();
        for (key, value) in &self.entries {
            let section = if key.flags.is_empty() {
                DEFAULT_SECTION.to_string()
            } else {
                key.flags.to_string()
            };
            sections
                .entry(section)
                .or_default()
                .push((key.name.as_str(), value.as_str()));
        }

        let mut out = String::new();
        // default section goes first so that flagged values win the latest view on reload
        let default = sections.remove(DEFAULT_SECTION);
        let ordered = default
            .map(|entries| (DEFAULT_SECTION.to_string(), entries))
            .into_iter()
            .chain(sections);
        for (section, entries) in ordered {
            let _ = writeln!(out, "[{section}]");
            for (name, value) in entries {
                let _ = writeln!(out, "{name} = {value}");
            }
            out.push('\n');
        }
        out
    }

    /// Parse the INI text format.
    pub fn from_ini(text: &str) -> Result<Self> {
        let mut cache = TaskCache::new();
        let mut flags: Option<Flags> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let section = section.trim();
                flags = Some(if section == DEFAULT_SECTION {
                    Flags::new()
                } else {
                    section
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .collect()
                });
                continue;
            }
            let Some(current) = flags.as_ref() else {
                return Err(McuflowError::Config(format!(
                    "cache line {} is outside of any section",
                    lineno + 1
                )));
            };
            let Some((name, value)) = line.split_once('=') else {
                return Err(McuflowError::Config(format!(
                    "cache line {} is not a `key = value` pair",
                    lineno + 1
                )));
            };
            cache.set(name.trim(), current, value.trim());
        }

        Ok(cache)
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_ini())?;
        debug!(path = %path.display(), entries = self.len(), "wrote dependency cache");
        Ok(())
    }

    /// Load the cache, treating a missing file as empty.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(TaskCache::new());
        }
        let text = fs::read_to_string(path)?;
        let cache = TaskCache::from_ini(&text)?;
        debug!(path = %path.display(), entries = cache.len(), "loaded dependency cache");
        Ok(cache)
    }
}
