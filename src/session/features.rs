// src/session/features.rs

//! Features as an ordered pipeline of pure config transformations.
//!
//! Each step maps a config to a new config; a run's effective config is the
//! fold of its feature list, in list order, over the user-supplied config.
//! Later steps see (and may override) what earlier steps produced.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::model::FeatureSpec;

/// Run configuration (`"mlif.debug" -> "1"`).
pub type Config = BTreeMap<String, String>;

type StepFn = Arc<dyn Fn(&Config) -> Config + Send + Sync>;

/// A named, pure config transformation.
#[derive(Clone)]
pub struct FeatureStep {
    name: String,
    apply: StepFn,
}

impl fmt::Debug for FeatureStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureStep").field("name", &self.name).finish()
    }
}

impl FeatureStep {
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&Config) -> Config + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            apply: Arc::new(apply),
        }
    }

    /// Step setting the entries of a `[feature.<name>]` section.
    pub fn from_spec(name: &str, spec: &FeatureSpec) -> Self {
        let entries: Vec<(String, String)> = spec
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        Self::new(name, move |config| {
            let mut next = config.clone();
            next.extend(entries.iter().cloned());
            next
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, config: &Config) -> Config {
        (self.apply)(config)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigPipeline {
    steps: Vec<FeatureStep>,
}

impl ConfigPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: FeatureStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn push(&mut self, step: FeatureStep) {
        self.steps.push(step);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(FeatureStep::name)
    }

    pub fn run(&self, base: &Config) -> Config {
        self.steps
            .iter()
            .fold(base.clone(), |config, step| step.apply(&config))
    }
}
