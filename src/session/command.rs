// src/session/command.rs

//! Pipeline collaborators backed by shell commands.
//!
//! The command runs via `sh -c` with these variables set:
//!
//! - `MCUFLOW_OUTPUT_DIR`: directory to write outputs into (also the cwd)
//! - `MCUFLOW_MODEL`: model name (frontends only)
//! - `MCUFLOW_INPUTS`: `:`-separated paths of the previous stage's artifacts
//! - `MCUFLOW_CONFIG_<KEY>`: run config entries
//!
//! Every file left in the output directory becomes an artifact. Targets may
//! write a `metrics.json` object, which becomes the run's metrics.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context};
use tracing::debug;

use crate::config::model::ComponentSpec;
use crate::session::artifact::{Artifact, Metrics};
use crate::session::components::{Backend, Frontend, Platform, Target};
use crate::session::features::Config;
use crate::setup::shell::env_suffix;

pub const METRICS_FILE: &str = "metrics.json";

#[derive(Debug, Clone)]
pub struct CommandComponent {
    name: String,
    cmd: String,
    framework: String,
    env: BTreeMap<String, String>,
    home: PathBuf,
}

impl CommandComponent {
    pub fn new(name: &str, spec: &ComponentSpec, home: &Path) -> Self {
        Self {
            name: name.to_string(),
            cmd: spec.cmd.clone(),
            framework: spec.framework.clone().unwrap_or_else(|| name.to_string()),
            env: spec.env.clone(),
            home: home.to_path_buf(),
        }
    }

    fn execute(
        &self,
        model: Option<&str>,
        inputs: &[Artifact],
        config: &Config,
        out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("creating output dir {}", out_dir.display()))?;

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.cmd)
            .current_dir(out_dir)
            .env("MCUFLOW_HOME", &self.home)
            .env("MCUFLOW_OUTPUT_DIR", out_dir)
            .env("MCUFLOW_COMPONENT", &self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(model) = model {
            command.env("MCUFLOW_MODEL", model);
        }
        let paths: Vec<String> = inputs
            .iter()
            .filter_map(Artifact::path)
            .map(|p| p.display().to_string())
            .collect();
        command.env("MCUFLOW_INPUTS", paths.join(":"));
        for (key, value) in config {
            command.env(format!("MCUFLOW_CONFIG_{}", env_suffix(key)), value);
        }
        command.envs(&self.env);

        debug!(component = %self.name, cmd = %self.cmd, "starting component process");
        let output = command
            .output()
            .with_context(|| format!("spawning process for component '{}'", self.name))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(component = %self.name, "stdout: {}", line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            debug!(component = %self.name, "stderr: {}", line);
        }
        if !output.status.success() {
            bail!(
                "component '{}' exited with status {}",
                self.name,
                output.status.code().unwrap_or(-1)
            );
        }

        collect_artifacts(out_dir)
    }
}

fn collect_artifacts(dir: &Path) -> anyhow::Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        artifacts.push(Artifact::file(name, entry.path()));
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

impl Frontend for CommandComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_models(
        &self,
        model: &str,
        config: &Config,
        out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>> {
        self.execute(Some(model), &[], config, out_dir)
    }
}

impl Backend for CommandComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn framework(&self) -> &str {
        &self.framework
    }

    fn generate_code(
        &self,
        inputs: &[Artifact],
        config: &Config,
        out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>> {
        self.execute(None, inputs, config, out_dir)
    }
}

impl Platform for CommandComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn compile(
        &self,
        inputs: &[Artifact],
        config: &Config,
        out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>> {
        self.execute(None, inputs, config, out_dir)
    }
}

impl Target for CommandComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_metrics(
        &self,
        inputs: &[Artifact],
        config: &Config,
        out_dir: &Path,
    ) -> anyhow::Result<(Metrics, Vec<Artifact>)> {
        let artifacts = self.execute(None, inputs, config, out_dir)?;
        let metrics_path = out_dir.join(METRICS_FILE);
        let metrics = if metrics_path.exists() {
            let text = fs::read_to_string(&metrics_path)
                .with_context(|| format!("reading {}", metrics_path.display()))?;
            serde_json::from_str::<Metrics>(&text)
                .with_context(|| format!("parsing {}", metrics_path.display()))?
        } else {
            Metrics::new()
        };
        Ok((metrics, artifacts))
    }
}
