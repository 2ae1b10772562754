#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use mcuflow::config::{
    ComponentSpec, Environment, FeatureSpec, PostprocessSpec, RawEnvironment, TaskSpec,
};
use mcuflow::setup::{ParamValue, TaskCategory};
use mcuflow::types::ExecutorKind;

/// Builder for `Environment` to simplify test setup.
pub struct EnvironmentBuilder {
    env: RawEnvironment,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self {
            env: RawEnvironment::default(),
        }
    }

    pub fn with_task(mut self, name: &str, task: TaskSpec) -> Self {
        self.env.task.insert(name.to_string(), task);
        self
    }

    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.env.vars.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_enabled(mut self, name: &str) -> Self {
        self.env.enabled.components.push(name.to_string());
        self
    }

    pub fn with_backend(mut self, name: &str, cmd: &str) -> Self {
        self.env.backend.insert(name.to_string(), component(cmd));
        self
    }

    pub fn with_target(mut self, name: &str, cmd: &str) -> Self {
        self.env.target.insert(name.to_string(), component(cmd));
        self
    }

    pub fn with_feature(mut self, name: &str, entries: &[(&str, &str)]) -> Self {
        let config = entries
            .iter()
            .map(|(k, v)| (k.to_string(), ParamValue::from(*v)))
            .collect();
        self.env.feature.insert(name.to_string(), FeatureSpec { config });
        self
    }

    pub fn with_postprocess(mut self, name: &str, spec: PostprocessSpec) -> Self {
        self.env.postprocess.insert(name.to_string(), spec);
        self
    }

    pub fn with_executor(mut self, executor: ExecutorKind) -> Self {
        self.env.session.executor = executor;
        self
    }

    pub fn with_workers(mut self, num_workers: usize, batch_size: usize) -> Self {
        self.env.session.num_workers = num_workers;
        self.env.session.batch_size = batch_size;
        self
    }

    pub fn with_cleanup(mut self, keep: usize) -> Self {
        self.env.defaults.cleanup_auto = true;
        self.env.defaults.cleanup_keep = keep;
        self
    }

    pub fn raw(self) -> RawEnvironment {
        self.env
    }

    /// Validate and anchor the environment at `home`.
    pub fn build(self, home: &Path) -> Environment {
        Environment::try_from(self.env)
            .expect("Failed to build valid environment from builder")
            .with_home(home)
    }
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn component(cmd: &str) -> ComponentSpec {
    ComponentSpec {
        cmd: cmd.to_string(),
        framework: None,
        env: BTreeMap::new(),
    }
}

/// Builder for `TaskSpec`.
pub struct TaskSpecBuilder {
    task: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            task: TaskSpec {
                cmd: cmd.to_string(),
                provides: vec![],
                needs: vec![],
                optional: vec![],
                params: BTreeMap::new(),
                category: TaskCategory::Misc,
                enabled_if: vec![],
                exclude: BTreeMap::new(),
            },
        }
    }

    pub fn provides(mut self, key: &str) -> Self {
        self.task.provides.push(key.to_string());
        self
    }

    pub fn needs(mut self, key: &str) -> Self {
        self.task.needs.push(key.to_string());
        self
    }

    pub fn optional(mut self, key: &str) -> Self {
        self.task.optional.push(key.to_string());
        self
    }

    pub fn param(mut self, axis: &str, values: Vec<ParamValue>) -> Self {
        self.task.params.insert(axis.to_string(), values);
        self
    }

    pub fn category(mut self, category: TaskCategory) -> Self {
        self.task.category = category;
        self
    }

    pub fn enabled_if(mut self, name: &str) -> Self {
        self.task.enabled_if.push(name.to_string());
        self
    }

    pub fn exclude(mut self, axis: &str, value: ParamValue) -> Self {
        self.task.exclude.insert(axis.to_string(), value);
        self
    }

    pub fn build(self) -> TaskSpec {
        self.task
    }
}
