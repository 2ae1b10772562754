// src/session/run.rs

//! A single pipeline instance and its stage state machine.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::errors::{McuflowError, Result};
use crate::report::{Report, ReportRow};
use crate::session::artifact::{Artifact, ArtifactData, Metrics};
use crate::session::components::{Backend, Frontend, Platform, Target};
use crate::session::features::Config;
use crate::session::initializer::RunInitializer;
use crate::session::postprocess::RunPostprocess;
use crate::session::stage::RunStage;

/// Outcome of processing one run, as reported back to the scheduler.
///
/// Serializable so process-pool workers can send it over a pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub idx: usize,
    pub stage: RunStage,
    pub failing: bool,
    pub failed_stage: Option<RunStage>,
    pub reason: Option<String>,
    pub report: ReportRow,
}

/// One model/frontend/backend/platform/target/config combination.
#[derive(Clone)]
pub struct Run {
    idx: usize,
    session_idx: Option<usize>,
    dir: PathBuf,
    model: String,
    frontend: Option<Arc<dyn Frontend>>,
    backend: Option<Arc<dyn Backend>>,
    platform: Option<Arc<dyn Platform>>,
    target: Option<Arc<dyn Target>>,
    postprocesses: Vec<Arc<dyn RunPostprocess>>,
    features: Vec<String>,
    /// User-supplied config, before features were applied.
    base_config: Config,
    /// Effective config seen by the collaborators.
    config: Config,
    comment: Option<String>,
    stage: RunStage,
    artifacts_per_stage: BTreeMap<RunStage, Vec<Artifact>>,
    active: bool,
    failing: bool,
    failed_stage: Option<RunStage>,
    reason: Option<String>,
    metrics: Metrics,
    report: Option<ReportRow>,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("idx", &self.idx)
            .field("model", &self.model)
            .field("frontend", &self.frontend_name())
            .field("backend", &self.backend_name())
            .field("platform", &self.platform_name())
            .field("target", &self.target_name())
            .field("features", &self.features)
            .field("stage", &self.stage)
            .field("failing", &self.failing)
            .finish_non_exhaustive()
    }
}

impl Run {
    pub fn new(idx: usize, model: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            idx,
            session_idx: None,
            dir: dir.into(),
            model: model.into(),
            frontend: None,
            backend: None,
            platform: None,
            target: None,
            postprocesses: Vec::new(),
            features: Vec::new(),
            base_config: Config::new(),
            config: Config::new(),
            comment: None,
            stage: RunStage::Nop,
            artifacts_per_stage: BTreeMap::new(),
            active: false,
            failing: false,
            failed_stage: None,
            reason: None,
            metrics: Metrics::new(),
            report: None,
        }
    }

    pub fn with_frontend(mut self, frontend: Arc<dyn Frontend>) -> Self {
        self.frontend = Some(frontend);
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_target(mut self, target: Arc<dyn Target>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_postprocess(mut self, postprocess: Arc<dyn RunPostprocess>) -> Self {
        self.postprocesses.push(postprocess);
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set the feature list, the user config and the config they produce.
    pub fn with_config(mut self, features: Vec<String>, base: Config, effective: Config) -> Self {
        self.features = features;
        self.base_config = base;
        self.config = effective;
        self
    }

    pub(crate) fn set_session(&mut self, session_idx: usize) {
        self.session_idx = Some(session_idx);
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_failing(&self) -> bool {
        self.failing
    }

    pub fn failed_stage(&self) -> Option<RunStage> {
        self.failed_stage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn artifacts(&self, stage: RunStage) -> &[Artifact] {
        self.artifacts_per_stage
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn frontend_name(&self) -> Option<&str> {
        self.frontend.as_ref().map(|f| f.name())
    }

    pub fn backend_name(&self) -> Option<&str> {
        self.backend.as_ref().map(|b| b.name())
    }

    pub fn framework_name(&self) -> Option<&str> {
        self.backend.as_ref().map(|b| b.framework())
    }

    pub fn platform_name(&self) -> Option<&str> {
        self.platform.as_ref().map(|p| p.name())
    }

    pub fn target_name(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.name())
    }

    /// Whether this run has anything to do in `stage`.
    pub fn has_stage(&self, stage: RunStage) -> bool {
        match stage {
            RunStage::Nop => true,
            RunStage::Load => self.frontend.is_some(),
            RunStage::Build => self.backend.is_some(),
            RunStage::Compile => self.platform.is_some(),
            RunStage::Run => self.target.is_some(),
            RunStage::Postprocess => !self.postprocesses.is_empty(),
            RunStage::Done => false,
        }
    }

    /// Next stage after the current one that this run actually has.
    pub fn next_stage(&self) -> Option<RunStage> {
        let mut stage = self.stage.next()?;
        while stage != RunStage::Done {
            if self.has_stage(stage) {
                return Some(stage);
            }
            stage = stage.next()?;
        }
        None
    }

    /// Nearest lower stage this run has; `Nop` if there is none.
    fn prerequisite(&self, stage: RunStage) -> RunStage {
        RunStage::WORK
            .iter()
            .rev()
            .copied()
            .find(|s| *s < stage && self.has_stage(*s))
            .unwrap_or(RunStage::Nop)
    }

    pub fn load(&mut self) -> Result<()> {
        self.transition(RunStage::Load)
    }

    pub fn build(&mut self) -> Result<()> {
        self.transition(RunStage::Build)
    }

    pub fn compile(&mut self) -> Result<()> {
        self.transition(RunStage::Compile)
    }

    pub fn run(&mut self) -> Result<()> {
        self.transition(RunStage::Run)
    }

    pub fn postprocess(&mut self) -> Result<()> {
        self.transition(RunStage::Postprocess)
    }

    fn transition(&mut self, stage: RunStage) -> Result<()> {
        if self.active {
            return Err(McuflowError::RunBusy(self.idx));
        }
        if !self.has_stage(stage) {
            return Err(McuflowError::Config(format!(
                "run {} has nothing configured for stage {stage}",
                self.idx
            )));
        }
        let required = self.prerequisite(stage);
        if self.stage < required {
            return Err(McuflowError::StageOrder {
                run: self.idx,
                stage,
                current: self.stage,
            });
        }

        self.active = true;
        let result = self.execute_stage(stage, required);
        self.active = false;

        let artifacts = result.map_err(|source| McuflowError::Stage { stage, source })?;
        debug!(run = self.idx, stage = %stage, artifacts = artifacts.len(), "stage complete");
        self.artifacts_per_stage.insert(stage, artifacts);
        self.stage = self.stage.max(stage);
        Ok(())
    }

    fn execute_stage(
        &mut self,
        stage: RunStage,
        required: RunStage,
    ) -> anyhow::Result<Vec<Artifact>> {
        let inputs = self.export_stage(required)?;
        let out_dir = self.stage_dir(stage);

        match stage {
            RunStage::Load => match &self.frontend {
                Some(frontend) => frontend.generate_models(&self.model, &self.config, &out_dir),
                None => Ok(Vec::new()),
            },
            RunStage::Build => match &self.backend {
                Some(backend) => backend.generate_code(&inputs, &self.config, &out_dir),
                None => Ok(Vec::new()),
            },
            RunStage::Compile => match &self.platform {
                Some(platform) => platform.compile(&inputs, &self.config, &out_dir),
                None => Ok(Vec::new()),
            },
            RunStage::Run => match &self.target {
                Some(target) => {
                    let (metrics, artifacts) =
                        target.generate_metrics(&inputs, &self.config, &out_dir)?;
                    self.metrics = metrics;
                    Ok(artifacts)
                }
                None => Ok(Vec::new()),
            },
            RunStage::Postprocess => {
                let mut row = self.base_report_row();
                let mut produced = Vec::new();
                let all: Vec<Artifact> =
                    self.artifacts_per_stage.values().flatten().cloned().collect();
                for postprocess in &self.postprocesses {
                    produced.extend(postprocess.apply(&mut row, &all)?);
                }
                self.report = Some(row);
                Ok(produced)
            }
            RunStage::Nop | RunStage::Done => Ok(Vec::new()),
        }
    }

    fn stage_dir(&self, stage: RunStage) -> PathBuf {
        self.dir.join(stage.as_str().to_lowercase())
    }

    /// Materialize the artifacts of `stage` under the run directory.
    fn export_stage(&mut self, stage: RunStage) -> std::io::Result<Vec<Artifact>> {
        let dir = self.stage_dir(stage);
        let Some(artifacts) = self.artifacts_per_stage.get_mut(&stage) else {
            return Ok(Vec::new());
        };
        for artifact in artifacts.iter_mut() {
            artifact.export(&dir)?;
        }
        Ok(artifacts.clone())
    }

    /// Advance through every stage this run has, up to `until`.
    ///
    /// Calling with `until <= stage` does nothing. On error the run is
    /// marked failing and the error is returned.
    pub fn process(&mut self, until: RunStage, export: bool) -> Result<()> {
        let until = until.effective();
        for stage in RunStage::WORK {
            if stage > until {
                break;
            }
            if stage <= self.stage || !self.has_stage(stage) {
                continue;
            }
            info!(run = self.idx, stage = %stage, "processing stage");
            if let Err(err) = self.transition(stage) {
                self.mark_failed(stage, &err);
                return Err(err);
            }
        }

        if export {
            self.export()?;
        }
        Ok(())
    }

    fn mark_failed(&mut self, stage: RunStage, err: &McuflowError) {
        error!(run = self.idx, stage = %stage, error = %err, "run failed at stage");
        self.failing = true;
        self.failed_stage = Some(stage);
        self.reason = Some(err.to_string());
    }

    /// Flag the run as failed without a stage error (e.g. a crashed worker).
    pub fn mark_failing(&mut self, stage: RunStage, reason: impl Into<String>) {
        self.failing = true;
        self.failed_stage.get_or_insert(stage);
        self.reason.get_or_insert_with(|| reason.into());
    }

    fn base_report_row(&self) -> ReportRow {
        let mut row = ReportRow::new();
        row.set("Session", self.session_idx.map(Value::from).unwrap_or(Value::Null));
        row.set("Run", self.idx);
        row.set("Model", self.model.clone());
        row.set("Frontend", opt(self.frontend_name()));
        row.set("Framework", opt(self.framework_name()));
        row.set("Backend", opt(self.backend_name()));
        row.set("Platform", opt(self.platform_name()));
        row.set("Target", opt(self.target_name()));
        row.set("Features", format!("[{}]", self.features.join(", ")));
        let config: Vec<String> = self.config.iter().map(|(k, v)| format!("{k}={v}")).collect();
        row.set("Config", format!("{{{}}}", config.join(", ")));
        let postprocesses: Vec<&str> = self.postprocesses.iter().map(|p| p.name()).collect();
        row.set("Postprocesses", format!("[{}]", postprocesses.join(", ")));
        row.set("Comment", self.comment.clone().unwrap_or_default());
        if self.metrics.is_empty() {
            row.set("Incomplete", true);
        }
        for (name, value) in &self.metrics {
            row.set(name.clone(), value.clone());
        }
        row
    }

    /// The run's report row, including postprocess results and failure state.
    pub fn get_report(&self) -> ReportRow {
        let mut row = self.report.clone().unwrap_or_else(|| self.base_report_row());
        row.set("Failing", self.failing);
        if let Some(reason) = &self.reason {
            row.set("Reason", reason.clone());
        }
        row
    }

    pub fn result(&self) -> RunResult {
        RunResult {
            idx: self.idx,
            stage: self.stage,
            failing: self.failing,
            failed_stage: self.failed_stage,
            reason: self.reason.clone(),
            report: self.get_report(),
        }
    }

    /// Take over state computed elsewhere (a process-pool worker).
    pub fn apply_result(&mut self, result: &RunResult) {
        self.stage = self.stage.max(result.stage);
        self.failing = result.failing;
        self.failed_stage = result.failed_stage;
        self.reason = result.reason.clone();
        self.report = Some(result.report.clone());
    }

    /// Write `run.txt`, `report.csv` and all artifacts into the run dir.
    pub fn export(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let stages: Vec<RunStage> = self.artifacts_per_stage.keys().copied().collect();
        for stage in stages {
            self.export_stage(stage)?;
        }

        let mut summary = String::new();
        let _ = writeln!(summary, "{self:#?}");
        for (stage, artifacts) in &self.artifacts_per_stage {
            let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
            let _ = writeln!(summary, "{stage}: {}", names.join(", "));
        }
        fs::write(self.dir.join("run.txt"), summary)?;
        Report::new(vec![self.get_report()]).export(&self.dir.join("report.csv"))?;
        Ok(())
    }

    /// Deep copy with a fresh index and directory.
    ///
    /// Artifacts already exported into this run's directory are copied to
    /// the same relative location under `dir`, so the copy does not share
    /// files with its source.
    pub fn copy(&self, idx: usize, dir: impl Into<PathBuf>) -> Result<Run> {
        let mut copy = self.clone();
        copy.idx = idx;
        copy.dir = dir.into();
        copy.active = false;
        copy.report = None;

        for artifacts in copy.artifacts_per_stage.values_mut() {
            for artifact in artifacts.iter_mut() {
                let Some(rel) = artifact
                    .path()
                    .and_then(|path| path.strip_prefix(&self.dir).ok())
                    .map(Path::to_path_buf)
                else {
                    continue;
                };
                let dest = copy.dir.join(&rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(self.dir.join(&rel), &dest)?;
                artifact.data = ArtifactData::File(dest);
            }
        }
        Ok(copy)
    }

    /// Plain-data description that realizes back into an equivalent run.
    pub fn to_initializer(&self) -> RunInitializer {
        RunInitializer {
            idx: Some(self.idx),
            model: self.model.clone(),
            frontend: self.frontend_name().map(str::to_string),
            backend: self.backend_name().map(str::to_string),
            platform: self.platform_name().map(str::to_string),
            target: self.target_name().map(str::to_string),
            features: self.features.clone(),
            config: self.base_config.clone(),
            postprocesses: self.postprocesses.iter().map(|p| p.name().to_string()).collect(),
            comment: self.comment.clone(),
        }
    }

    /// Replace the collaborators referenced by name (used on realize).
    pub(crate) fn set_components(
        &mut self,
        frontend: Option<Arc<dyn Frontend>>,
        backend: Option<Arc<dyn Backend>>,
        platform: Option<Arc<dyn Platform>>,
        target: Option<Arc<dyn Target>>,
        postprocesses: Vec<Arc<dyn RunPostprocess>>,
    ) {
        self.frontend = frontend;
        self.backend = backend;
        self.platform = platform;
        self.target = target;
        self.postprocesses = postprocesses;
    }
}

fn opt(name: Option<&str>) -> Value {
    name.map(Value::from).unwrap_or(Value::Null)
}
