// src/setup/shell.rs

//! Installation tasks backed by shell commands from `[task.<name>]`.
//!
//! The command runs via `sh -c` in the environment home and talks back to
//! mcuflow through its stdout:
//!
//! - `mcuflow:set <key>=<value>` stores a provided value (`<key>` may use
//!   `{param}` placeholders);
//! - `mcuflow:unchanged` reports that nothing was (re)built.
//!
//! Inputs are passed as environment variables (`MCUFLOW_PARAM_<NAME>`,
//! `MCUFLOW_NEED_<KEY>`, `MCUFLOW_REBUILD`, ...).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{bail, Context};
use regex::Regex;
use tracing::{debug, info};

use crate::config::model::{Environment, TaskSpec};
use crate::errors::{McuflowError, Result};
use crate::setup::params::{expand_template, ParamValue};
use crate::setup::registry::TaskRegistry;
use crate::setup::task::{Task, TaskBuilder, TaskCall, TaskOutcome};

/// Register one shell task per `[task.<name>]` section.
pub fn registry_from_environment(env: &Environment) -> Result<TaskRegistry> {
    let protocol = Arc::new(StdoutProtocol::new()?);
    let mut registry = TaskRegistry::new();
    for (name, spec) in env.task.iter() {
        registry.register(shell_task(name, spec, &env.home, protocol.clone())?)?;
    }
    Ok(registry)
}

fn shell_task(
    name: &str,
    spec: &TaskSpec,
    cwd: &Path,
    protocol: Arc<StdoutProtocol>,
) -> Result<Task> {
    let mut builder = TaskBuilder::new(name)
        .provides(spec.provides.iter().cloned())
        .needs(spec.needs.iter().cloned())
        .optional(spec.optional.iter().cloned())
        .category(spec.category);

    for (axis, values) in spec.params.iter() {
        builder = builder.param(axis.clone(), values.iter().cloned());
    }

    let enabled_if = spec.enabled_if.clone();
    let exclude = spec.exclude.clone();
    if !enabled_if.is_empty() || !exclude.is_empty() {
        builder = builder.validate(move |env, params| {
            if !enabled_if.iter().all(|name| env.is_enabled(name)) {
                return false;
            }
            exclude.is_empty() || !exclude.iter().all(|(k, v)| params.get(k) == Some(v))
        });
    }

    let cmd = spec.cmd.clone();
    let cwd: PathBuf = cwd.to_path_buf();
    let inputs: Vec<String> = spec.needs.iter().chain(spec.optional.iter()).cloned().collect();
    builder
        .body(move |call| run_shell_body(&cmd, &cwd, &inputs, &protocol, call))
        .build()
}

fn run_shell_body(
    cmd: &str,
    cwd: &Path,
    inputs: &[String],
    protocol: &StdoutProtocol,
    call: &mut TaskCall<'_>,
) -> anyhow::Result<TaskOutcome> {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .current_dir(cwd)
        .env("MCUFLOW_TASK", call.task)
        .env("MCUFLOW_HOME", &call.env.home)
        .env("MCUFLOW_DEPS_DIR", &call.env.deps_dir)
        .env("MCUFLOW_REBUILD", if call.rebuild { "1" } else { "0" })
        .env("MCUFLOW_VERBOSE", if call.verbose { "1" } else { "0" })
        .env("MCUFLOW_THREADS", call.threads.to_string())
        .env("MCUFLOW_FLAGS", call.flags.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (name, value) in call.params.iter() {
        command.env(format!("MCUFLOW_PARAM_{}", env_suffix(name)), param_env_value(value));
    }
    for key in inputs {
        if let Some(value) = call.get(key) {
            let key = expand_template(key, call.params);
            command.env(format!("MCUFLOW_NEED_{}", env_suffix(&key)), value);
        }
    }

    let output = command
        .output()
        .with_context(|| format!("spawning process for task '{}'", call.task))?;

    for line in String::from_utf8_lossy(&output.stderr).lines() {
        if call.verbose {
            info!(task = %call.task, "stderr: {}", line);
        } else {
            debug!(task = %call.task, "stderr: {}", line);
        }
    }

    if !output.status.success() {
        bail!(
            "command `{}` exited with status {}",
            cmd,
            output.status.code().unwrap_or(-1)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut outcome = TaskOutcome::Changed;
    for line in stdout.lines() {
        match protocol.parse(line) {
            Some(Directive::Set { key, value }) => {
                let key = expand_template(&key, call.params);
                debug!(task = %call.task, key = %key, "task set cache value");
                call.set(&key, value);
            }
            Some(Directive::Unchanged) => outcome = TaskOutcome::Unchanged,
            None if call.verbose => info!(task = %call.task, "stdout: {}", line),
            None => debug!(task = %call.task, "stdout: {}", line),
        }
    }

    Ok(outcome)
}

#[derive(Debug, PartialEq, Eq)]
enum Directive {
    Set { key: String, value: String },
    Unchanged,
}

/// Parser for the `mcuflow:` stdout directives.
#[derive(Debug)]
struct StdoutProtocol {
    set: Regex,
    unchanged: Regex,
}

impl StdoutProtocol {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| McuflowError::Config(format!("invalid regex: {e}")))
        };
        Ok(Self {
            set: compile(r"^\s*mcuflow:set\s+([^=\s]+)\s*=\s*(.*?)\s*$")?,
            unchanged: compile(r"^\s*mcuflow:unchanged\s*$")?,
        })
    }

    fn parse(&self, line: &str) -> Option<Directive> {
        if let Some(caps) = self.set.captures(line) {
            return Some(Directive::Set {
                key: caps[1].to_string(),
                value: caps[2].to_string(),
            });
        }
        if self.unchanged.is_match(line) {
            return Some(Directive::Unchanged);
        }
        None
    }
}

/// Upper-case a key and map everything but ASCII alphanumerics to `_`.
pub fn env_suffix(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn param_env_value(value: &ParamValue) -> String {
    match value {
        ParamValue::Bool(true) => "1".to_string(),
        ParamValue::Bool(false) => "0".to_string(),
        other => other.to_string(),
    }
}
