// src/session/initializer.rs

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{McuflowError, Result};
use crate::session::components::ComponentRegistry;
use crate::session::features::{Config, ConfigPipeline};
use crate::session::run::Run;

/// Serializable description of a run.
///
/// Collaborators are referenced by name and only resolved by
/// [`realize`](RunInitializer::realize), so initializers can cross process
/// boundaries where live components can not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInitializer {
    /// Assigned by the session; `None` until then.
    #[serde(default)]
    pub idx: Option<usize>,
    pub model: String,
    #[serde(default)]
    pub frontend: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    /// Applied to `config` in this order.
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub postprocesses: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl RunInitializer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Build the run, resolving every name through `components`.
    ///
    /// Session-level postprocess names are skipped here; the session
    /// applies those to the aggregated report.
    pub fn realize(
        &self,
        components: &ComponentRegistry,
        idx: usize,
        dir: impl Into<PathBuf>,
    ) -> Result<Run> {
        let mut pipeline = ConfigPipeline::new();
        for feature in &self.features {
            pipeline.push(components.feature(feature)?);
        }
        let effective = pipeline.run(&self.config);

        let frontend = self
            .frontend
            .as_deref()
            .map(|n| components.frontend(n))
            .transpose()?;
        let backend = self
            .backend
            .as_deref()
            .map(|n| components.backend(n))
            .transpose()?;
        let platform = self
            .platform
            .as_deref()
            .map(|n| components.platform(n))
            .transpose()?;
        let target = self
            .target
            .as_deref()
            .map(|n| components.target(n))
            .transpose()?;
        let mut postprocesses = Vec::new();
        for name in &self.postprocesses {
            match components.run_postprocess(name) {
                Some(postprocess) => postprocesses.push(postprocess),
                None if components.has_postprocess(name) => {}
                None => {
                    return Err(McuflowError::Config(format!(
                        "unknown postprocess '{name}'"
                    )))
                }
            }
        }

        let mut run = Run::new(idx, self.model.clone(), dir).with_config(
            self.features.clone(),
            self.config.clone(),
            effective,
        );
        if let Some(comment) = &self.comment {
            run = run.with_comment(comment.clone());
        }
        run.set_components(frontend, backend, platform, target, postprocesses);
        Ok(run)
    }
}
