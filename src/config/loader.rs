// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{Environment, RawEnvironment};
use crate::errors::Result;

pub const ENVIRONMENT_FILE: &str = "environment.toml";

/// Load an environment file and return the raw `RawEnvironment`.
///
/// This only performs TOML deserialization; use [`load_and_validate`] for
/// semantic checks.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawEnvironment> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let raw: RawEnvironment = toml::from_str(&contents)?;

    Ok(raw)
}

/// Load an environment file from path, validate it, and anchor relative
/// paths at the directory holding the file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Environment> {
    let path = path.as_ref();
    let raw = load_from_path(path)?;
    let home = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let env = Environment::try_from(raw)?.with_home(home);
    debug!(
        home = %env.home.display(),
        tasks = env.task.len(),
        "loaded environment"
    );
    Ok(env)
}

/// Resolve the environment file location.
///
/// Priority: explicit `--home`, then `MCUFLOW_HOME`, then the current
/// directory.
pub fn default_environment_path(home: Option<&Path>) -> PathBuf {
    let dir = match home {
        Some(dir) => dir.to_path_buf(),
        None => std::env::var_os("MCUFLOW_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    dir.join(ENVIRONMENT_FILE)
}
