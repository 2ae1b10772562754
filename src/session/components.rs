// src/session/components.rs

//! Collaborators invoked by run stages, and the registry that resolves
//! them by name.
//!
//! Stages only talk to these traits. The production implementations are
//! command-backed (see [`command`](super::command)); tests plug in fakes.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::model::{Environment, PostprocessSpec};
use crate::errors::{McuflowError, Result};
use crate::session::artifact::{Artifact, Metrics};
use crate::session::command::CommandComponent;
use crate::session::features::{Config, FeatureStep};
use crate::session::postprocess::{
    FilterColumns, RatioPostprocess, RenameColumns, RunPostprocess, SessionPostprocess,
};

/// Turns a model reference into model artifacts (LOAD).
pub trait Frontend: Send + Sync {
    fn name(&self) -> &str;

    fn generate_models(&self, model: &str, config: &Config, out_dir: &Path)
        -> anyhow::Result<Vec<Artifact>>;
}

/// Generates code from model artifacts (BUILD).
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Framework the backend belongs to (e.g. `tvm`, `tflm`).
    fn framework(&self) -> &str;

    fn generate_code(
        &self,
        inputs: &[Artifact],
        config: &Config,
        out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>>;
}

/// Compiles generated code into an executable (COMPILE).
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    fn compile(&self, inputs: &[Artifact], config: &Config, out_dir: &Path)
        -> anyhow::Result<Vec<Artifact>>;
}

/// Runs the executable and measures it (RUN).
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    fn generate_metrics(
        &self,
        inputs: &[Artifact],
        config: &Config,
        out_dir: &Path,
    ) -> anyhow::Result<(Metrics, Vec<Artifact>)>;
}

/// Name-indexed collaborators, features and postprocesses.
///
/// Run initializers only carry names; realizing them looks the
/// implementations up here.
#[derive(Default, Clone)]
pub struct ComponentRegistry {
    frontends: BTreeMap<String, Arc<dyn Frontend>>,
    backends: BTreeMap<String, Arc<dyn Backend>>,
    platforms: BTreeMap<String, Arc<dyn Platform>>,
    targets: BTreeMap<String, Arc<dyn Target>>,
    features: BTreeMap<String, FeatureStep>,
    run_postprocesses: BTreeMap<String, Arc<dyn RunPostprocess>>,
    session_postprocesses: BTreeMap<String, Arc<dyn SessionPostprocess>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command-backed components, features and postprocesses declared in
    /// the environment file.
    pub fn from_environment(env: &Environment) -> Self {
        let mut registry = Self::new();
        for (name, spec) in &env.frontend {
            registry.add_frontend(Arc::new(CommandComponent::new(name, spec, &env.home)));
        }
        for (name, spec) in &env.backend {
            registry.add_backend(Arc::new(CommandComponent::new(name, spec, &env.home)));
        }
        for (name, spec) in &env.platform {
            registry.add_platform(Arc::new(CommandComponent::new(name, spec, &env.home)));
        }
        for (name, spec) in &env.target {
            registry.add_target(Arc::new(CommandComponent::new(name, spec, &env.home)));
        }
        for (name, spec) in &env.feature {
            registry.add_feature(FeatureStep::from_spec(name, spec));
        }
        for (name, spec) in &env.postprocess {
            match spec {
                PostprocessSpec::Ratio {
                    numerator,
                    denominator,
                    column,
                } => registry.add_run_postprocess(Arc::new(RatioPostprocess::new(
                    name,
                    numerator,
                    denominator,
                    column,
                ))),
                PostprocessSpec::Rename { columns } => registry
                    .add_session_postprocess(Arc::new(RenameColumns::new(name, columns.clone()))),
                PostprocessSpec::Filter { drop } => registry
                    .add_session_postprocess(Arc::new(FilterColumns::new(name, drop.clone()))),
            }
        }
        registry
    }

    pub fn add_frontend(&mut self, frontend: Arc<dyn Frontend>) {
        self.frontends.insert(frontend.name().to_string(), frontend);
    }

    pub fn add_backend(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn add_platform(&mut self, platform: Arc<dyn Platform>) {
        self.platforms.insert(platform.name().to_string(), platform);
    }

    pub fn add_target(&mut self, target: Arc<dyn Target>) {
        self.targets.insert(target.name().to_string(), target);
    }

    pub fn add_feature(&mut self, feature: FeatureStep) {
        self.features.insert(feature.name().to_string(), feature);
    }

    pub fn add_run_postprocess(&mut self, postprocess: Arc<dyn RunPostprocess>) {
        self.run_postprocesses
            .insert(postprocess.name().to_string(), postprocess);
    }

    pub fn add_session_postprocess(&mut self, postprocess: Arc<dyn SessionPostprocess>) {
        self.session_postprocesses
            .insert(postprocess.name().to_string(), postprocess);
    }

    pub fn frontend(&self, name: &str) -> Result<Arc<dyn Frontend>> {
        lookup(&self.frontends, "frontend", name)
    }

    pub fn backend(&self, name: &str) -> Result<Arc<dyn Backend>> {
        lookup(&self.backends, "backend", name)
    }

    pub fn platform(&self, name: &str) -> Result<Arc<dyn Platform>> {
        lookup(&self.platforms, "platform", name)
    }

    pub fn target(&self, name: &str) -> Result<Arc<dyn Target>> {
        lookup(&self.targets, "target", name)
    }

    pub fn feature(&self, name: &str) -> Result<FeatureStep> {
        self.features
            .get(name)
            .cloned()
            .ok_or_else(|| McuflowError::Config(format!("unknown feature '{name}'")))
    }

    pub fn run_postprocess(&self, name: &str) -> Option<Arc<dyn RunPostprocess>> {
        self.run_postprocesses.get(name).cloned()
    }

    pub fn session_postprocess(&self, name: &str) -> Option<Arc<dyn SessionPostprocess>> {
        self.session_postprocesses.get(name).cloned()
    }

    /// Whether `name` is a known run or session postprocess.
    pub fn has_postprocess(&self, name: &str) -> bool {
        self.run_postprocesses.contains_key(name) || self.session_postprocesses.contains_key(name)
    }
}

fn lookup<T: ?Sized>(map: &BTreeMap<String, Arc<T>>, kind: &str, name: &str) -> Result<Arc<T>> {
    map.get(name)
        .cloned()
        .ok_or_else(|| McuflowError::Config(format!("unknown {kind} '{name}'")))
}
