// src/setup/installer.rs

//! Drives tasks in installation order.

use tracing::{info, warn};

use crate::cache::TaskCache;
use crate::errors::{McuflowError, Result};
use crate::progress::progress_bar;
use crate::setup::executor::{plan_variants, InvokeOptions, TaskExecutor, TaskReport};
use crate::setup::graph::TaskGraph;
use crate::setup::registry::TaskRegistry;
use crate::setup::task::TaskEnv;

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub invoke: InvokeOptions,
    pub progress: bool,
    /// Record task failures and continue with the remaining tasks.
    pub keep_going: bool,
}

#[derive(Debug, Default)]
pub struct InstallSummary {
    pub reports: Vec<TaskReport>,
    /// `(task, error message)` for tasks that failed under `keep_going`.
    pub failed: Vec<(String, String)>,
}

impl InstallSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the resolved graph and the change tracking of install passes.
pub struct Installer<'r> {
    registry: &'r TaskRegistry,
    graph: TaskGraph,
    executor: TaskExecutor,
}

impl<'r> Installer<'r> {
    /// Resolve the graph; fails on unresolved keys or cycles.
    pub fn new(registry: &'r TaskRegistry) -> Result<Self> {
        let graph = TaskGraph::build(registry)?;
        Ok(Self {
            registry,
            graph,
            executor: TaskExecutor::new(),
        })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Invoke every task in installation order.
    pub fn install_all(
        &mut self,
        env: &TaskEnv,
        cache: &mut TaskCache,
        opts: &InstallOptions,
    ) -> Result<InstallSummary> {
        self.executor.reset_changes();

        let order: Vec<String> = self.graph.install_order().to_vec();
        let total: usize = order
            .iter()
            .filter_map(|name| self.registry.get(name))
            .map(|task| plan_variants(task, env).len())
            .sum();
        let bar = progress_bar(total as u64, "installing", opts.progress);

        info!(tasks = order.len(), variants = total, "starting installation");

        let mut summary = InstallSummary::default();
        for name in &order {
            let task = self
                .registry
                .get(name)
                .ok_or_else(|| McuflowError::TaskNotFound(name.clone()))?;
            bar.set_message(name.clone());

            match self.executor.invoke(task, env, cache, &opts.invoke, &bar) {
                Ok(report) => summary.reports.push(report),
                Err(err) if opts.keep_going => {
                    warn!(task = %name, error = %err, "task failed, continuing");
                    let missing: Vec<&String> = task
                        .provides()
                        .iter()
                        .filter(|key| !cache.is_set(key))
                        .collect();
                    if !missing.is_empty() {
                        warn!(task = %name, ?missing, "provided keys left unset");
                    }
                    summary.failed.push((name.clone(), err.to_string()));
                }
                Err(err) => {
                    bar.abandon();
                    return Err(err);
                }
            }
        }
        bar.finish_and_clear();

        info!(
            installed = summary.reports.len(),
            failed = summary.failed.len(),
            changed = self.executor.changed().len(),
            "installation finished"
        );
        Ok(summary)
    }

    /// Invoke one task, assuming its dependencies are already installed.
    pub fn invoke_single(
        &mut self,
        name: &str,
        env: &TaskEnv,
        cache: &mut TaskCache,
        opts: &InstallOptions,
    ) -> Result<TaskReport> {
        let task = self
            .registry
            .get(name)
            .ok_or_else(|| McuflowError::TaskNotFound(name.to_string()))?;
        self.executor.reset_changes();
        let bar = progress_bar(plan_variants(task, env).len() as u64, name, opts.progress);
        let report = self.executor.invoke(task, env, cache, &opts.invoke, &bar)?;
        bar.finish_and_clear();
        Ok(report)
    }
}
