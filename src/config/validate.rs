// src/config/validate.rs

use crate::config::model::{Environment, RawEnvironment};
use crate::errors::{McuflowError, Result};
use crate::logging::parse_level_str;
use crate::types::ExecutorKind;

impl TryFrom<RawEnvironment> for Environment {
    type Error = McuflowError;

    fn try_from(raw: RawEnvironment) -> std::result::Result<Self, Self::Error> {
        validate_raw_environment(&raw)?;
        Ok(Environment::new_unchecked(raw))
    }
}

fn validate_raw_environment(env: &RawEnvironment) -> Result<()> {
    validate_defaults(env)?;
    validate_session(env)?;
    validate_tasks(env)?;
    validate_components(env)?;
    Ok(())
}

fn validate_defaults(env: &RawEnvironment) -> Result<()> {
    if let Some(level) = &env.defaults.log_level {
        if parse_level_str(level).is_none() {
            return Err(McuflowError::Config(format!(
                "[defaults].log_level has unknown level '{level}'"
            )));
        }
    }
    Ok(())
}

fn validate_session(env: &RawEnvironment) -> Result<()> {
    let session = &env.session;
    if session.num_workers == 0 {
        return Err(McuflowError::Config(
            "[session].num_workers must be >= 1 (got 0)".to_string(),
        ));
    }
    if session.batch_size == 0 {
        return Err(McuflowError::Config(
            "[session].batch_size must be >= 1 (got 0)".to_string(),
        ));
    }
    if session.executor == ExecutorKind::ProcessPool && (session.per_stage || session.use_init_stage)
    {
        return Err(McuflowError::Config(
            "[session] process_pool executor supports neither per_stage nor use_init_stage"
                .to_string(),
        ));
    }
    Ok(())
}

fn validate_tasks(env: &RawEnvironment) -> Result<()> {
    for (name, task) in env.task.iter() {
        if task.cmd.trim().is_empty() {
            return Err(McuflowError::Config(format!(
                "task '{name}' has an empty `cmd`"
            )));
        }
        for (param, values) in task.params.iter() {
            if values.is_empty() {
                return Err(McuflowError::Config(format!(
                    "task '{name}' declares param '{param}' without values"
                )));
            }
        }
        for param in task.exclude.keys() {
            if !task.params.contains_key(param) {
                return Err(McuflowError::Config(format!(
                    "task '{name}' excludes unknown param '{param}'"
                )));
            }
        }
        for key in task.needs.iter().chain(task.optional.iter()) {
            if task.provides.contains(key) {
                return Err(McuflowError::Config(format!(
                    "task '{name}' cannot depend on its own key '{key}'"
                )));
            }
        }
    }
    Ok(())
}

fn validate_components(env: &RawEnvironment) -> Result<()> {
    let sections = [
        ("frontend", &env.frontend),
        ("backend", &env.backend),
        ("platform", &env.platform),
        ("target", &env.target),
    ];
    for (kind, components) in sections {
        for (name, spec) in components.iter() {
            if spec.cmd.trim().is_empty() {
                return Err(McuflowError::Config(format!(
                    "{kind} '{name}' has an empty `cmd`"
                )));
            }
            if spec.framework.as_deref().is_some_and(|f| f.trim().is_empty()) {
                return Err(McuflowError::Config(format!(
                    "{kind} '{name}' has an empty `framework`"
                )));
            }
        }
    }
    Ok(())
}
