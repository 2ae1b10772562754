// src/session/session.rs

//! A session: an ordered collection of runs sharing one workspace.
//!
//! Layout of a session directory:
//!
//! ```text
//! <temp>/sessions/<idx>/
//!     .lock          held while the session is open
//!     session.toml   status and timestamps
//!     report.csv
//!     runs/<run idx>/...
//!     runs/latest -> <most recently created run>
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::lock::FileLock;
use crate::errors::{McuflowError, Result};
use crate::report::Report;
use crate::session::components::ComponentRegistry;
use crate::session::initializer::RunInitializer;
use crate::session::postprocess::SessionPostprocess;
use crate::session::run::Run;
use crate::session::scheduler::{ScheduleSummary, SchedulerOptions, SessionScheduler};
use crate::types::SessionStatus;

pub const SESSION_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
pub const SESSION_META_FILE: &str = "session.toml";

/// Persisted session metadata (`session.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub idx: usize,
    pub label: String,
    pub status: SessionStatus,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub runs: usize,
}

/// What `process_runs` hands back to the caller.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub report: Report,
    pub summary: ScheduleSummary,
}

pub struct Session {
    idx: usize,
    label: String,
    dir: PathBuf,
    results_dir: PathBuf,
    status: SessionStatus,
    opened_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    runs: Vec<Arc<Mutex<Run>>>,
    /// Runs realized lazily by the scheduler's init stage.
    initializers: Vec<RunInitializer>,
    next_run_idx: usize,
    lock: Option<FileLock>,
}

impl Session {
    pub fn new(
        idx: usize,
        label: impl Into<String>,
        dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            idx,
            label: label.into(),
            dir: dir.into(),
            results_dir: results_dir.into(),
            status: SessionStatus::Created,
            opened_at: None,
            closed_at: None,
            runs: Vec::new(),
            initializers: Vec::new(),
            next_run_idx: 0,
            lock: None,
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.dir.join("runs")
    }

    pub fn run_dir(&self, idx: usize) -> PathBuf {
        self.runs_dir().join(idx.to_string())
    }

    pub fn runs(&self) -> &[Arc<Mutex<Run>>] {
        &self.runs
    }

    pub fn initializers(&self) -> &[RunInitializer] {
        &self.initializers
    }

    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            idx: self.idx,
            label: self.label.clone(),
            status: self.status,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            runs: self.runs.len() + self.initializers.len(),
        }
    }

    /// Take the session lock and pick up runs already on disk.
    pub fn open(&mut self) -> Result<()> {
        fs::create_dir_all(self.runs_dir())?;
        let mut lock = FileLock::new(self.dir.join(".lock"), SESSION_LOCK_TIMEOUT);
        lock.acquire()?;
        self.lock = Some(lock);
        self.status = SessionStatus::Open;
        self.opened_at = Some(Utc::now());
        let existing = self.enumerate_runs()?;
        self.write_meta()?;
        info!(session = self.idx, dir = %self.dir.display(), existing_runs = existing.len(), "session opened");
        Ok(())
    }

    /// Record the final status and release the lock.
    pub fn close(&mut self) -> Result<()> {
        self.finish(SessionStatus::Closed)
    }

    /// Like [`close`](Self::close), but records the session as errored.
    pub fn close_with_error(&mut self) -> Result<()> {
        self.finish(SessionStatus::Error)
    }

    fn finish(&mut self, status: SessionStatus) -> Result<()> {
        if !matches!(self.status, SessionStatus::Open) {
            return Ok(());
        }
        self.status = status;
        self.closed_at = Some(Utc::now());
        self.write_meta()?;
        if let Some(mut lock) = self.lock.take() {
            lock.release()?;
        }
        info!(session = self.idx, status = %self.status, "session closed");
        Ok(())
    }

    /// Close and delete the whole session directory.
    pub fn discard(mut self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        info!(session = self.idx, "session discarded");
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let text = toml::to_string(&self.meta()).map_err(|e| McuflowError::Other(e.into()))?;
        fs::write(self.dir.join(SESSION_META_FILE), text)?;
        Ok(())
    }

    /// Scan `runs/` for numbered run directories and continue numbering
    /// after the highest one.
    pub fn enumerate_runs(&mut self) -> Result<Vec<usize>> {
        let mut found: Vec<usize> = Vec::new();
        match fs::read_dir(self.runs_dir()) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    if let Ok(idx) = entry.file_name().to_string_lossy().parse::<usize>() {
                        found.push(idx);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        found.sort_unstable();
        if let Some(max) = found.last() {
            self.next_run_idx = self.next_run_idx.max(max + 1);
        }
        Ok(found)
    }

    /// Reserve the next run index.
    pub fn request_run_idx(&mut self) -> usize {
        let idx = self.next_run_idx;
        self.next_run_idx += 1;
        idx
    }

    /// Realize an initializer into a new run of this session.
    pub fn create_run(
        &mut self,
        init: &RunInitializer,
        components: &ComponentRegistry,
    ) -> Result<Arc<Mutex<Run>>> {
        let idx = self.request_run_idx();
        let run = init.realize(components, idx, self.run_dir(idx))?;
        self.add_run(run)
    }

    /// Deep-copy `run` into this session under a fresh index.
    pub fn copy_run(&mut self, run: &Run) -> Result<Arc<Mutex<Run>>> {
        let idx = self.request_run_idx();
        let copy = run.copy(idx, self.run_dir(idx))?;
        self.add_run(copy)
    }

    /// Adopt a run built elsewhere; the `latest` link moves to it.
    pub fn add_run(&mut self, mut run: Run) -> Result<Arc<Mutex<Run>>> {
        run.set_session(self.idx);
        self.next_run_idx = self.next_run_idx.max(run.idx() + 1);
        fs::create_dir_all(run.dir())?;
        self.update_latest_link(run.idx())?;
        debug!(session = self.idx, run = run.idx(), "run added");
        let run = Arc::new(Mutex::new(run));
        self.runs.push(run.clone());
        Ok(run)
    }

    /// Defer realization of a run to the scheduler's init stage.
    pub fn add_initializer(&mut self, mut init: RunInitializer) -> Result<usize> {
        let idx = self.request_run_idx();
        init.idx = Some(idx);
        fs::create_dir_all(self.run_dir(idx))?;
        self.update_latest_link(idx)?;
        self.initializers.push(init);
        Ok(idx)
    }

    fn update_latest_link(&self, idx: usize) -> Result<()> {
        let link = self.runs_dir().join("latest");
        match fs::symlink_metadata(&link) {
            Ok(_) => fs::remove_file(&link)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(idx.to_string(), &link)?;
        #[cfg(not(unix))]
        fs::write(&link, idx.to_string())?;
        Ok(())
    }

    /// Report rows of all runs, ordered by run index.
    pub fn get_reports(&self) -> Report {
        let mut rows: Vec<(usize, crate::report::ReportRow)> = self
            .runs
            .iter()
            .map(|run| {
                let guard = run.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                (guard.idx(), guard.get_report())
            })
            .collect();
        rows.sort_by_key(|(idx, _)| *idx);
        Report::new(rows.into_iter().map(|(_, row)| row).collect())
    }

    /// Schedule all runs, postprocess and export the session report.
    ///
    /// The report lands in the session dir and in
    /// `<results>/<session idx>.csv`.
    pub async fn process_runs(
        &mut self,
        options: SchedulerOptions,
        components: Arc<ComponentRegistry>,
        postprocesses: Vec<Arc<dyn SessionPostprocess>>,
    ) -> Result<SessionOutcome> {
        let mut scheduler = SessionScheduler::new(
            self.runs.clone(),
            std::mem::take(&mut self.initializers),
            self.runs_dir(),
            self.idx,
            components,
            options,
        );
        let processed = scheduler.process().await;
        self.runs = scheduler.runs().to_vec();
        processed?;

        let summary = scheduler.summary();
        summary.log();

        let mut report = self.get_reports();
        scheduler.postprocess(&mut report, &postprocesses);

        report.export(&self.dir.join("report.csv"))?;
        let results_path = self.results_dir.join(format!("{}.csv", self.idx));
        if let Err(e) = report.export(&results_path) {
            warn!(path = %results_path.display(), error = %e, "could not write results copy");
        }

        Ok(SessionOutcome { report, summary })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(session = self.idx, error = %e, "failed to close session");
        }
    }
}
