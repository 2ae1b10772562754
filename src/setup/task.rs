// src/setup/task.rs

//! Immutable task descriptors and the fluent builder that creates them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use crate::cache::TaskCache;
use crate::errors::{McuflowError, Result};
use crate::setup::params::{expand_template, Flags, ParamAxes, ParamValue, Params};

/// Informational classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    #[default]
    Misc,
    Framework,
    Backend,
    Target,
    Frontend,
    Toolchain,
    Feature,
    Opt,
    Platform,
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskCategory::Misc => "misc",
            TaskCategory::Framework => "framework",
            TaskCategory::Backend => "backend",
            TaskCategory::Target => "target",
            TaskCategory::Frontend => "frontend",
            TaskCategory::Toolchain => "toolchain",
            TaskCategory::Feature => "feature",
            TaskCategory::Opt => "opt",
            TaskCategory::Platform => "platform",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "misc" => Ok(TaskCategory::Misc),
            "framework" => Ok(TaskCategory::Framework),
            "backend" => Ok(TaskCategory::Backend),
            "target" => Ok(TaskCategory::Target),
            "frontend" => Ok(TaskCategory::Frontend),
            "toolchain" => Ok(TaskCategory::Toolchain),
            "feature" => Ok(TaskCategory::Feature),
            "opt" => Ok(TaskCategory::Opt),
            "platform" => Ok(TaskCategory::Platform),
            other => Err(format!("invalid task category: {other}")),
        }
    }
}

/// What a task body reports after running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Outputs were (re)produced; dependents must rebuild.
    Changed,
    /// Nothing changed; skip the output check and downstream invalidation.
    Unchanged,
}

/// Read-only view of the environment handed to validators and bodies.
#[derive(Debug, Clone, Default)]
pub struct TaskEnv {
    pub home: PathBuf,
    pub deps_dir: PathBuf,
    /// Enabled component and feature names.
    pub enabled: BTreeSet<String>,
    pub vars: BTreeMap<String, String>,
}

impl TaskEnv {
    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.contains(name)
    }
}

/// Everything a task body gets for one variant invocation.
pub struct TaskCall<'a> {
    pub task: &'a str,
    pub env: &'a TaskEnv,
    pub params: &'a Params,
    pub flags: &'a Flags,
    pub rebuild: bool,
    pub verbose: bool,
    pub threads: usize,
    pub cache: &'a mut TaskCache,
}

impl TaskCall<'_> {
    /// Write a provided value, expanding `{param}` placeholders and keying
    /// it by this variant's flags.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let name = expand_template(key, self.params);
        self.cache.set(&name, self.flags, value);
    }

    /// Latest value of an input key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.cache.latest(&expand_template(key, self.params))
    }

    /// Directory under `deps/install` for this task variant.
    pub fn install_dir(&self, base: &str) -> PathBuf {
        let mut name = base.to_string();
        for flag in self.flags.iter() {
            name.push('_');
            name.push_str(flag);
        }
        self.env.deps_dir.join("install").join(name)
    }
}

pub type TaskBody = Arc<dyn Fn(&mut TaskCall<'_>) -> anyhow::Result<TaskOutcome> + Send + Sync>;
pub type TaskValidator = Arc<dyn Fn(&TaskEnv, &Params) -> bool + Send + Sync>;

/// Immutable description of an installation task.
#[derive(Clone)]
pub struct Task {
    name: String,
    provides: Vec<String>,
    needs: Vec<String>,
    optional: Vec<String>,
    params: ParamAxes,
    validate: Option<TaskValidator>,
    category: TaskCategory,
    body: TaskBody,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("provides", &self.provides)
            .field("needs", &self.needs)
            .field("optional", &self.optional)
            .field("params", &self.params)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provides(&self) -> &[String] {
        &self.provides
    }

    pub fn needs(&self) -> &[String] {
        &self.needs
    }

    pub fn optional(&self) -> &[String] {
        &self.optional
    }

    /// Needed and optional keys; all of them must have a provider.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.needs
            .iter()
            .chain(self.optional.iter())
            .map(String::as_str)
    }

    pub fn params(&self) -> &ParamAxes {
        &self.params
    }

    pub fn category(&self) -> TaskCategory {
        self.category
    }

    pub fn is_valid(&self, env: &TaskEnv, params: &Params) -> bool {
        match &self.validate {
            Some(pred) => pred(env, params),
            None => true,
        }
    }

    pub(crate) fn call(&self, call: &mut TaskCall<'_>) -> anyhow::Result<TaskOutcome> {
        (self.body)(call)
    }
}

/// Fluent builder for [`Task`].
///
/// ```ignore
/// let task = TaskBuilder::new("install_spike")
///     .needs(["riscv_gcc.install_dir"])
///     .provides(["spike.exe"])
///     .param("dbg", [false, true])
///     .category(TaskCategory::Target)
///     .body(|call| { call.set("spike.exe", "/opt/spike"); Ok(TaskOutcome::Changed) })
///     .build()?;
/// ```
pub struct TaskBuilder {
    name: String,
    provides: Vec<String>,
    needs: Vec<String>,
    optional: Vec<String>,
    params: ParamAxes,
    validate: Option<TaskValidator>,
    category: TaskCategory,
    body: Option<TaskBody>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provides: Vec::new(),
            needs: Vec::new(),
            optional: Vec::new(),
            params: ParamAxes::new(),
            validate: None,
            category: TaskCategory::default(),
            body: None,
        }
    }

    pub fn needs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Ordering-only dependency: registers the edge, no presence check.
    pub fn optional<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn provides<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn param<I, V>(mut self, flag: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        self.params
            .insert(flag.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn validate<F>(mut self, pred: F) -> Self
    where
        F: Fn(&TaskEnv, &Params) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(pred));
        self
    }

    pub fn category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    pub fn body<F>(mut self, body: F) -> Self
    where
        F: Fn(&mut TaskCall<'_>) -> anyhow::Result<TaskOutcome> + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(body));
        self
    }

    pub fn build(self) -> Result<Task> {
        if self.name.trim().is_empty() {
            return Err(McuflowError::Config("task name must not be empty".into()));
        }
        let Some(body) = self.body else {
            return Err(McuflowError::Config(format!(
                "task '{}' has no body",
                self.name
            )));
        };
        if let Some((axis, _)) = self.params.iter().find(|(_, values)| values.is_empty()) {
            return Err(McuflowError::Config(format!(
                "task '{}' declares param '{}' without values",
                self.name, axis
            )));
        }

        Ok(Task {
            name: self.name,
            provides: self.provides,
            needs: self.needs,
            optional: self.optional,
            params: self.params,
            validate: self.validate,
            category: self.category,
            body,
        })
    }
}
