// src/session/scheduler.rs

//! Drives the runs of a session through their stages.
//!
//! Runs are processed in batches. A batch is handed to one worker, and at
//! most `num_workers` batches are in flight at a time.
//!
//! - Thread pool: each batch runs on a blocking tokio thread against the
//!   shared `Arc<Mutex<Run>>` handles.
//! - Process pool: each batch is serialized as [`RunInitializer`]s and sent
//!   to a `mcuflow worker` child over stdin; [`RunResult`]s come back on
//!   stdout and are applied to the parent's runs.
//!
//! With `per_stage`, every stage is a barrier: all runs finish stage N
//! before any run starts stage N+1. A failing run never takes other runs
//! down with it; it simply stops advancing.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, TryLockError};

use anyhow::{anyhow, Context};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{McuflowError, Result};
use crate::progress::{progress_bar, reset_progress};
use crate::report::Report;
use crate::session::components::ComponentRegistry;
use crate::session::initializer::RunInitializer;
use crate::session::postprocess::SessionPostprocess;
use crate::session::run::{Run, RunResult};
use crate::session::stage::RunStage;
use crate::types::ExecutorKind;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub until: RunStage,
    pub per_stage: bool,
    pub executor: ExecutorKind,
    pub num_workers: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub progress: bool,
    /// Realize deferred run initializers on the workers.
    pub use_init_stage: bool,
    /// Write run directories (`run.txt`, `report.csv`, artifacts) when done.
    pub export: bool,
    /// Binary spawned by the process pool; defaults to the current exe.
    pub worker_exe: Option<PathBuf>,
    /// Passed to workers as `--home`.
    pub home: PathBuf,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            until: RunStage::Done,
            per_stage: false,
            executor: ExecutorKind::ThreadPool,
            num_workers: 1,
            batch_size: 1,
            shuffle: false,
            progress: false,
            use_init_stage: false,
            export: false,
            worker_exe: None,
            home: PathBuf::from("."),
        }
    }
}

/// Request sent to a process-pool worker on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub session_idx: usize,
    pub runs: Vec<RunInitializer>,
}

/// Outcome counts of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduleSummary {
    pub total: usize,
    pub failed: usize,
    /// Indices of failed runs, keyed by the stage they failed in.
    pub stage_failures: BTreeMap<RunStage, Vec<usize>>,
}

impl ScheduleSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn message(&self) -> String {
        if self.failed == 0 {
            "All runs completed successfully".to_string()
        } else if self.failed == self.total {
            "All runs have failed".to_string()
        } else {
            format!(
                "{} out of {} runs completed successfully",
                self.total - self.failed,
                self.total
            )
        }
    }

    pub fn stage_lines(&self) -> Vec<String> {
        self.stage_failures
            .iter()
            .map(|(stage, runs)| {
                let idxs: Vec<String> = runs.iter().map(|r| r.to_string()).collect();
                format!("{} failed at stage {stage}: runs {}", runs.len(), idxs.join(", "))
            })
            .collect()
    }

    pub fn log(&self) {
        if self.is_success() {
            info!(total = self.total, "{}", self.message());
        } else {
            warn!(total = self.total, failed = self.failed, "{}", self.message());
            for line in self.stage_lines() {
                warn!("{line}");
            }
        }
    }
}

type RunHandle = (usize, Arc<Mutex<Run>>);

pub struct SessionScheduler {
    runs: Vec<Arc<Mutex<Run>>>,
    pending: Vec<RunInitializer>,
    session_dir: PathBuf,
    session_idx: usize,
    components: Arc<ComponentRegistry>,
    options: SchedulerOptions,
    barriers: usize,
    used_stages: BTreeSet<RunStage>,
    stage_failures: BTreeMap<RunStage, Vec<usize>>,
}

impl SessionScheduler {
    /// `runs_dir` is the session's `runs/` directory; deferred initializers
    /// are realized into `runs_dir/<idx>`.
    pub fn new(
        runs: Vec<Arc<Mutex<Run>>>,
        pending: Vec<RunInitializer>,
        runs_dir: PathBuf,
        session_idx: usize,
        components: Arc<ComponentRegistry>,
        options: SchedulerOptions,
    ) -> Self {
        let session_dir = runs_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| runs_dir.clone());
        Self {
            runs,
            pending,
            session_dir,
            session_idx,
            components,
            options,
            barriers: 0,
            used_stages: BTreeSet::new(),
            stage_failures: BTreeMap::new(),
        }
    }

    pub fn runs(&self) -> &[Arc<Mutex<Run>>] {
        &self.runs
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    /// Number of barriers crossed by the last `process` call.
    ///
    /// In per-stage mode the init stage counts as one barrier.
    pub fn num_barriers(&self) -> usize {
        self.barriers
    }

    /// Stages at least one run went through, bounded by `until`.
    pub fn used_stages(&self) -> &BTreeSet<RunStage> {
        &self.used_stages
    }

    pub fn stage_failures(&self) -> &BTreeMap<RunStage, Vec<usize>> {
        &self.stage_failures
    }

    fn validate(&self) -> Result<()> {
        let o = &self.options;
        if o.num_workers == 0 {
            return Err(McuflowError::Config("num_workers must be at least 1".into()));
        }
        if o.batch_size == 0 {
            return Err(McuflowError::Config("batch_size must be at least 1".into()));
        }
        if o.executor == ExecutorKind::ProcessPool && o.per_stage {
            return Err(McuflowError::Config(
                "per_stage processing is not supported with the process pool".into(),
            ));
        }
        if o.executor == ExecutorKind::ProcessPool && o.use_init_stage {
            return Err(McuflowError::Config(
                "the init stage is not supported with the process pool".into(),
            ));
        }
        Ok(())
    }

    /// Process all runs up to `options.until`.
    ///
    /// Errors are only returned for scheduler misconfiguration; run
    /// failures are recorded on the runs themselves.
    pub async fn process(&mut self) -> Result<()> {
        self.validate()?;
        self.barriers = 0;
        self.stage_failures.clear();

        let cpus = num_cpus::get();
        if self.options.num_workers > 2 * cpus {
            warn!(
                workers = self.options.num_workers,
                cpus, "number of workers is more than twice the number of CPUs"
            );
        }

        if !self.pending.is_empty() {
            self.init_stage().await?;
            if self.options.per_stage {
                self.barriers += 1;
            }
        }

        let until = self.options.until.effective();
        self.used_stages = self.collect_used_stages(until);
        info!(
            runs = self.runs.len(),
            executor = %self.options.executor,
            workers = self.options.num_workers,
            batch_size = self.options.batch_size,
            per_stage = self.options.per_stage,
            until = %self.options.until,
            "processing runs"
        );

        match self.options.executor {
            ExecutorKind::ThreadPool if self.options.per_stage => {
                let stages: Vec<RunStage> = self.used_stages.iter().copied().collect();
                let bar = progress_bar(0, "", self.options.progress);
                for stage in stages {
                    self.run_thread_batches(stage, Some(stage), false, &bar)
                        .await?;
                    self.barriers += 1;
                    debug!(stage = %stage, "stage barrier reached");
                }
                bar.finish_and_clear();
                if self.options.export {
                    self.export_all();
                }
            }
            ExecutorKind::ThreadPool => {
                let bar = progress_bar(0, "", self.options.progress);
                let export = self.options.export;
                self.run_thread_batches(until, None, export, &bar).await?;
                self.barriers += 1;
                bar.finish_and_clear();
            }
            ExecutorKind::ProcessPool => {
                self.run_process_batches(until).await?;
                self.barriers += 1;
            }
        }

        self.collect_failures();
        Ok(())
    }

    fn export_all(&self) {
        for run in &self.runs {
            let mut guard = run.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(e) = guard.export() {
                warn!(run = guard.idx(), error = %e, "could not export run");
            }
        }
    }

    fn collect_used_stages(&self, until: RunStage) -> BTreeSet<RunStage> {
        let mut used = BTreeSet::new();
        for run in &self.runs {
            let guard = run.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            for stage in RunStage::WORK {
                if stage <= until && guard.has_stage(stage) {
                    used.insert(stage);
                }
            }
        }
        used
    }

    fn collect_failures(&mut self) {
        for run in &self.runs {
            let guard = run.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.is_failing() {
                let stage = guard.failed_stage().unwrap_or(RunStage::Nop);
                self.stage_failures.entry(stage).or_default().push(guard.idx());
            }
        }
        for idxs in self.stage_failures.values_mut() {
            idxs.sort_unstable();
        }
    }

    /// Run handles in processing order.
    fn ordered_runs(&self) -> Vec<RunHandle> {
        let mut order: Vec<RunHandle> = self
            .runs
            .iter()
            .map(|run| {
                let idx = run
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .idx();
                (idx, run.clone())
            })
            .collect();
        if self.options.shuffle {
            order.sort_by_cached_key(|_| Uuid::new_v4());
        } else {
            order.sort_by_key(|(idx, _)| *idx);
        }
        order
    }

    /// Realize deferred initializers on the worker threads.
    ///
    /// A run whose initializer can not be realized is kept as a failing
    /// placeholder so it still shows up in the report.
    async fn init_stage(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        info!(runs = pending.len(), "realizing run initializers");
        let runs_dir = self.session_dir.join("runs");
        let semaphore = Arc::new(Semaphore::new(self.options.num_workers));
        let mut handles = Vec::new();

        for chunk in pending.chunks(self.options.batch_size) {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| McuflowError::Other(e.into()))?;
            let chunk = chunk.to_vec();
            let components = self.components.clone();
            let runs_dir = runs_dir.clone();
            let session_idx = self.session_idx;
            let fallback = chunk.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                chunk
                    .iter()
                    .map(|init| realize_or_fail(init, &components, &runs_dir, session_idx))
                    .collect::<Vec<Run>>()
            });
            handles.push((fallback, handle));
        }

        for (chunk, handle) in handles {
            let realized = match handle.await {
                Ok(runs) => runs,
                Err(e) => {
                    error!(error = %e, "init worker crashed");
                    chunk
                        .iter()
                        .map(|init| {
                            let idx = init.idx.unwrap_or_default();
                            let mut run =
                                Run::new(idx, init.model.clone(), runs_dir.join(idx.to_string()));
                            run.set_session(self.session_idx);
                            run.mark_failing(RunStage::Nop, format!("init worker crashed: {e}"));
                            run
                        })
                        .collect()
                }
            };
            self.runs
                .extend(realized.into_iter().map(|run| Arc::new(Mutex::new(run))));
        }
        Ok(())
    }

    async fn run_thread_batches(
        &mut self,
        until: RunStage,
        stage: Option<RunStage>,
        export: bool,
        bar: &ProgressBar,
    ) -> Result<()> {
        let order: Vec<RunHandle> = self
            .ordered_runs()
            .into_iter()
            .filter(|(idx, run)| match stage {
                Some(stage) => match run.try_lock() {
                    Ok(guard) if guard.is_failing() => {
                        warn!(run = idx, stage = %stage, "run is failing; not submitting it");
                        false
                    }
                    Ok(guard) => guard.has_stage(stage),
                    Err(_) => true,
                },
                None => true,
            })
            .collect();

        let label = stage.map(|s| s.to_string()).unwrap_or_else(|| "runs".into());
        reset_progress(bar, order.len() as u64, label);

        let semaphore = Arc::new(Semaphore::new(self.options.num_workers));
        let mut handles = Vec::new();

        for batch in order.chunks(self.options.batch_size) {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| McuflowError::Other(e.into()))?;
            let batch = batch.to_vec();
            let fallback = batch.clone();
            let bar = bar.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                process_batch(&batch, until, export, &bar);
            });
            handles.push((fallback, handle));
        }

        for (batch, handle) in handles {
            if let Err(e) = handle.await {
                error!(error = %e, runs = batch.len(), "worker crashed; failing its batch");
                fail_batch(&batch, stage, &format!("worker crashed: {e}"));
            }
        }
        Ok(())
    }

    async fn run_process_batches(&mut self, until: RunStage) -> Result<()> {
        let exe = match &self.options.worker_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()?,
        };

        let order = self.ordered_runs();
        let bar = progress_bar(order.len() as u64, "runs", self.options.progress);
        let semaphore = Arc::new(Semaphore::new(self.options.num_workers));
        let mut handles = Vec::new();

        for batch in order.chunks(self.options.batch_size) {
            let mut runs = Vec::with_capacity(batch.len());
            for (idx, run) in batch {
                match run.try_lock() {
                    Ok(guard) if guard.is_failing() => {}
                    Ok(guard) => runs.push(guard.to_initializer()),
                    Err(_) => warn!(run = idx, "run is busy; not sending it to a worker"),
                }
            }
            if runs.is_empty() {
                bar.inc(batch.len() as u64);
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| McuflowError::Other(e.into()))?;
            let request = WorkerRequest {
                session_idx: self.session_idx,
                runs,
            };
            let exe = exe.clone();
            let home = self.options.home.clone();
            let session_dir = self.session_dir.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                spawn_worker(&exe, &home, &session_dir, until, &request).await
            });
            handles.push((batch.to_vec(), handle));
        }

        for (batch, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow!("worker task panicked: {e}")),
            };
            match outcome {
                Ok(results) => {
                    let by_idx: BTreeMap<usize, &RunResult> =
                        results.iter().map(|r| (r.idx, r)).collect();
                    for (idx, run) in &batch {
                        let mut guard =
                            run.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                        match by_idx.get(idx) {
                            Some(result) => guard.apply_result(result),
                            None if guard.is_failing() => {}
                            None => {
                                let stage = guard.next_stage().unwrap_or(RunStage::Nop);
                                guard.mark_failing(stage, "worker returned no result for this run");
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %format!("{e:#}"), runs = batch.len(), "worker process failed");
                    fail_batch(&batch, None, &format!("worker process failed: {e:#}"));
                }
            }
            bar.inc(batch.len() as u64);
        }
        bar.finish_and_clear();
        Ok(())
    }

    pub fn summary(&self) -> ScheduleSummary {
        let failed = self.stage_failures.values().map(Vec::len).sum();
        ScheduleSummary {
            total: self.runs.len(),
            failed,
            stage_failures: self.stage_failures.clone(),
        }
    }

    /// Apply session-level postprocesses to the aggregated report.
    ///
    /// Each postprocess runs at most once. One that fails leaves the report
    /// as it was before it ran.
    pub fn postprocess(
        &self,
        report: &mut Report,
        postprocesses: &[Arc<dyn SessionPostprocess>],
    ) {
        let mut seen = BTreeSet::new();
        for postprocess in postprocesses {
            if !seen.insert(postprocess.name().to_string()) {
                continue;
            }
            let mut candidate = report.clone();
            match postprocess.apply(&mut candidate) {
                Ok(()) => {
                    debug!(postprocess = postprocess.name(), "session postprocess applied");
                    *report = candidate;
                }
                Err(e) => warn!(
                    postprocess = postprocess.name(),
                    error = %format!("{e:#}"),
                    "session postprocess failed"
                ),
            }
        }
    }
}

fn process_batch(batch: &[RunHandle], until: RunStage, export: bool, bar: &ProgressBar) {
    for (idx, run) in batch {
        let mut guard = match run.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                error!(run = idx, "{}", McuflowError::RunBusy(*idx));
                bar.inc(1);
                continue;
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut guard = poisoned.into_inner();
                let stage = guard.next_stage().unwrap_or(RunStage::Nop);
                guard.mark_failing(stage, "run state was poisoned by a crashed worker");
                bar.inc(1);
                continue;
            }
        };
        if guard.is_failing() {
            bar.inc(1);
            continue;
        }
        if let Err(e) = guard.process(until, export) {
            debug!(run = idx, error = %e, "run stopped");
            if export {
                if let Err(e) = guard.export() {
                    warn!(run = idx, error = %e, "could not export failed run");
                }
            }
        }
        bar.inc(1);
    }
}

fn fail_batch(batch: &[RunHandle], stage: Option<RunStage>, reason: &str) {
    for (_, run) in batch {
        let mut guard = run.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_failing() {
            continue;
        }
        let stage = stage
            .or_else(|| guard.next_stage())
            .unwrap_or(RunStage::Nop);
        guard.mark_failing(stage, reason);
    }
}

fn realize_or_fail(
    init: &RunInitializer,
    components: &ComponentRegistry,
    runs_dir: &Path,
    session_idx: usize,
) -> Run {
    let idx = init.idx.unwrap_or_default();
    let dir = runs_dir.join(idx.to_string());
    match init.realize(components, idx, dir.clone()) {
        Ok(mut run) => {
            run.set_session(session_idx);
            run
        }
        Err(e) => {
            error!(run = idx, error = %e, "could not initialize run");
            let mut run = Run::new(idx, init.model.clone(), dir);
            run.set_session(session_idx);
            run.mark_failing(RunStage::Nop, e.to_string());
            run
        }
    }
}

/// Body of `mcuflow worker`: realize and process the requested runs.
pub fn serve_worker(
    request: &WorkerRequest,
    components: &ComponentRegistry,
    session_dir: &Path,
    until: RunStage,
) -> Vec<RunResult> {
    let runs_dir = session_dir.join("runs");
    request
        .runs
        .iter()
        .map(|init| {
            let mut run = realize_or_fail(init, components, &runs_dir, request.session_idx);
            if !run.is_failing() {
                if let Err(e) = run.process(until, true) {
                    debug!(run = run.idx(), error = %e, "run stopped");
                    if let Err(e) = run.export() {
                        warn!(run = run.idx(), error = %e, "could not export failed run");
                    }
                }
            }
            run.result()
        })
        .collect()
}

async fn spawn_worker(
    exe: &Path,
    home: &Path,
    session_dir: &Path,
    until: RunStage,
    request: &WorkerRequest,
) -> anyhow::Result<Vec<RunResult>> {
    let payload = serde_json::to_vec(request).context("serializing worker request")?;

    let mut child = Command::new(exe)
        .arg("--home")
        .arg(home)
        .arg("worker")
        .arg("--session-dir")
        .arg(session_dir)
        .arg("--until")
        .arg(until.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning worker {}", exe.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&payload)
            .await
            .context("writing worker request")?;
    }

    let output = child
        .wait_with_output()
        .await
        .context("waiting for worker process")?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        debug!("worker: {}", line);
    }
    if !output.status.success() {
        return Err(anyhow!(
            "worker exited with status {}",
            output.status.code().unwrap_or(-1)
        ));
    }

    serde_json::from_slice(&output.stdout).context("parsing worker results")
}
