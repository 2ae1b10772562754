// src/setup/registry.rs

//! Explicit registry of installation tasks.

use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::{McuflowError, Result};
use crate::setup::task::Task;

/// Holds task descriptors by unique name.
///
/// Constructed once and handed to [`TaskGraph`](super::graph::TaskGraph) and
/// the installer, so independent registries can coexist (e.g. in tests).
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<String, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task; names must be unique.
    pub fn register(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(task.name()) {
            return Err(McuflowError::DuplicateTask(task.name().to_string()));
        }
        debug!(
            task = %task.name(),
            category = %task.category(),
            provides = ?task.provides(),
            needs = ?task.needs(),
            "registered task"
        );
        self.tasks.insert(task.name().to_string(), task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
