// src/setup/executor.rs

//! Interprets [`Task`] descriptors: variant expansion, validation, input
//! and output contracts, and change propagation.

use std::collections::BTreeSet;

use indicatif::ProgressBar;
use tracing::{debug, info};

use crate::cache::TaskCache;
use crate::errors::{McuflowError, Result};
use crate::setup::params::{expand_template, get_combs, is_template, Flags, Params};
use crate::setup::task::{Task, TaskCall, TaskEnv, TaskOutcome};

/// Per-invocation switches shared by every task of an install pass.
#[derive(Debug, Clone, Copy)]
pub struct InvokeOptions {
    pub rebuild: bool,
    pub verbose: bool,
    pub threads: usize,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            rebuild: false,
            verbose: false,
            threads: 1,
        }
    }
}

/// Summary of one task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: String,
    /// Variants whose body was called.
    pub variants: usize,
    /// Variants that reported `Changed`.
    pub changed: usize,
    /// Whether any variant ran with `rebuild = true`.
    pub rebuilt: bool,
}

/// Executes tasks and owns the changed-set of the current install pass.
#[derive(Debug, Default)]
pub struct TaskExecutor {
    changed: BTreeSet<String>,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all changes; called at the start of every top-level install.
    pub fn reset_changes(&mut self) {
        self.changed.clear();
    }

    pub fn changed(&self) -> &BTreeSet<String> {
        &self.changed
    }

    pub fn is_changed(&self, key: &str) -> bool {
        self.changed.contains(key)
    }

    /// Run every applicable variant of `task`.
    ///
    /// Body errors come back as [`McuflowError::TaskFailed`]; contract
    /// violations as [`McuflowError::MissingInput`] or
    /// [`McuflowError::MissingOutput`].
    pub fn invoke(
        &mut self,
        task: &Task,
        env: &TaskEnv,
        cache: &mut TaskCache,
        opts: &InvokeOptions,
        progress: &ProgressBar,
    ) -> Result<TaskReport> {
        let name = task.name();

        for key in task.needs().iter().filter(|k| !is_template(k)) {
            ensure_input(name, key, cache)?;
        }

        let variants = plan_variants(task, env);
        let mut report = TaskReport {
            task: name.to_string(),
            variants: 0,
            changed: 0,
            rebuilt: false,
        };

        for params in variants {
            let flags = Flags::from_params(&params);

            for key in task.needs().iter().filter(|k| is_template(k)) {
                ensure_input(name, &expand_template(key, &params), cache)?;
            }

            // optional keys count too; they only skip the presence check
            let upstream_changed = task.dependencies().any(|k| {
                self.changed.contains(k) || self.changed.contains(&expand_template(k, &params))
            });
            let rebuild = opts.rebuild || upstream_changed;
            if upstream_changed && !opts.rebuild {
                debug!(task = %name, "dependency changed, forcing rebuild");
            }

            // stale values must not survive a failed body
            let outputs: Vec<String> = task
                .provides()
                .iter()
                .map(|k| expand_template(k, &params))
                .collect();
            for key in &outputs {
                cache.remove(key, &flags);
            }

            info!(task = %name, ?params, rebuild, "running task");
            let outcome = {
                let mut call = TaskCall {
                    task: name,
                    env,
                    params: &params,
                    flags: &flags,
                    rebuild,
                    verbose: opts.verbose,
                    threads: opts.threads,
                    cache: &mut *cache,
                };
                task.call(&mut call)
                    .map_err(|source| McuflowError::TaskFailed {
                        task: name.to_string(),
                        source,
                    })?
            };

            report.variants += 1;
            report.rebuilt |= rebuild;

            if outcome == TaskOutcome::Changed {
                for key in &outputs {
                    if !cache.is_set(key) {
                        return Err(McuflowError::MissingOutput {
                            task: name.to_string(),
                            key: key.clone(),
                        });
                    }
                }
                self.changed.extend(task.provides().iter().cloned());
                self.changed.extend(outputs);
                report.changed += 1;
            } else {
                debug!(task = %name, ?params, "task reported no changes");
            }

            progress.inc(1);
        }

        Ok(report)
    }
}

/// Variants of `task` that should run in the current environment.
///
/// A task without param axes runs once with empty params, unless its
/// validator rejects the environment. Rejected combinations are logged.
pub fn plan_variants(task: &Task, env: &TaskEnv) -> Vec<Params> {
    let combs = get_combs(task.params());

    if combs.is_empty() {
        let empty = Params::new();
        if task.is_valid(env, &empty) {
            return vec![empty];
        }
        info!(task = %task.name(), "task skipped by validator");
        return Vec::new();
    }

    combs
        .into_iter()
        .filter(|params| {
            let ok = task.is_valid(env, params);
            if !ok {
                debug!(task = %task.name(), ?params, "skipping invalid parameter combination");
            }
            ok
        })
        .collect()
}

fn ensure_input(task: &str, key: &str, cache: &TaskCache) -> Result<()> {
    if cache.is_set(key) {
        Ok(())
    } else {
        Err(McuflowError::MissingInput {
            task: task.to_string(),
            key: key.to_string(),
        })
    }
}
