// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod errors;
pub mod logging;
pub mod progress;
pub mod report;
pub mod session;
pub mod setup;
pub mod types;

use std::fs;
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tracing::{debug, info};

use crate::cli::{CliArgs, Command, FlowArgs, SessionsArgs, SetupArgs, WorkerArgs};
use crate::config::model::Environment;
use crate::context::Context;
use crate::session::components::ComponentRegistry;
use crate::session::initializer::RunInitializer;
use crate::session::postprocess::SessionPostprocess;
use crate::session::scheduler::{serve_worker, SchedulerOptions, WorkerRequest};
use crate::setup::executor::{plan_variants, InvokeOptions};
use crate::setup::installer::{InstallOptions, Installer};
use crate::setup::shell::registry_from_environment;
use crate::types::DepsLockMode;

/// High-level entry point used by `main.rs`.
///
/// Returns `Ok(false)` when the command itself worked but some of its
/// units (tasks under `--keep-going`, runs of a flow) failed.
pub async fn run(args: CliArgs, env: Environment) -> Result<bool> {
    match args.command {
        Command::Setup(setup_args) => setup(setup_args, env),
        Command::Flow(flow_args) => flow(flow_args, env).await,
        Command::Worker(worker_args) => worker(worker_args, env),
        Command::Sessions(sessions_args) => sessions(sessions_args, env),
    }
}

fn setup(args: SetupArgs, env: Environment) -> Result<bool> {
    let registry = registry_from_environment(&env)?;
    let mut installer = Installer::new(&registry)?;

    if let Some(path) = &args.dot {
        fs::write(path, installer.graph().to_dot())
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "wrote task graph");
    }

    let mode = if args.dry_run {
        DepsLockMode::Read
    } else {
        DepsLockMode::Write
    };
    let mut ctx = Context::open(env, mode)?;
    let task_env = ctx.task_env();

    if args.dry_run {
        println!("mcuflow setup dry-run");
        println!("install order ({}):", installer.graph().install_order().len());
        for name in installer.graph().install_order() {
            let Some(task) = registry.get(name) else {
                continue;
            };
            let variants = plan_variants(task, &task_env);
            println!("  - {name} [{}] ({} variants)", task.category(), variants.len());
            for dep in installer.graph().dependencies_of(name) {
                println!("      after: {dep}");
            }
        }
        ctx.close()?;
        debug!("dry-run complete (no execution)");
        return Ok(true);
    }

    let opts = InstallOptions {
        invoke: InvokeOptions {
            rebuild: args.rebuild,
            verbose: args.verbose,
            threads: args.threads.max(1),
        },
        progress: args.progress,
        keep_going: args.keep_going,
    };

    let success = match &args.task {
        Some(name) => {
            let result = installer.invoke_single(name, &task_env, ctx.cache_mut(), &opts);
            ctx.save_cache()?;
            let report = result?;
            println!(
                "{}: {} variant(s), {} changed",
                report.task, report.variants, report.changed
            );
            true
        }
        None => {
            let result = installer.install_all(&task_env, ctx.cache_mut(), &opts);
            ctx.save_cache()?;
            let summary = result?;
            println!(
                "installed {} task(s), {} failed",
                summary.reports.len(),
                summary.failed.len()
            );
            for (task, reason) in &summary.failed {
                println!("  {task}: {reason}");
            }
            summary.is_success()
        }
    };

    ctx.close()?;
    Ok(success)
}

async fn flow(args: FlowArgs, env: Environment) -> Result<bool> {
    let mut ctx = Context::open(env, DepsLockMode::Read)?;
    let components = Arc::new(ComponentRegistry::from_environment(ctx.env()));

    let mut session_postprocesses: Vec<Arc<dyn SessionPostprocess>> = Vec::new();
    for name in &args.postprocesses {
        if let Some(postprocess) = components.session_postprocess(name) {
            session_postprocesses.push(postprocess);
        } else if !components.has_postprocess(name) {
            bail!("unknown postprocess '{name}'");
        }
    }

    let defaults = &ctx.env().session;
    let options = SchedulerOptions {
        until: args.until,
        per_stage: args.per_stage || defaults.per_stage,
        executor: args.executor.unwrap_or(defaults.executor),
        num_workers: args.parallel.unwrap_or(defaults.num_workers),
        batch_size: args.batch_size.unwrap_or(defaults.batch_size),
        shuffle: args.shuffle || defaults.shuffle,
        progress: args.progress || defaults.progress,
        use_init_stage: defaults.use_init_stage,
        export: true,
        worker_exe: defaults.worker_exe.clone(),
        home: ctx.env().home.clone(),
    };

    let mut session = ctx.create_session(&args.label)?;

    let backends = fan_out(&args.backends);
    let targets = fan_out(&args.targets);
    for model in &args.models {
        for backend in &backends {
            for target in &targets {
                let init = RunInitializer {
                    idx: None,
                    model: model.clone(),
                    frontend: args.frontend.clone(),
                    backend: backend.clone(),
                    platform: args.platform.clone(),
                    target: target.clone(),
                    features: args.features.clone(),
                    config: args.config.iter().cloned().collect(),
                    postprocesses: args.postprocesses.clone(),
                    comment: args.comment.clone(),
                };
                let created = if options.use_init_stage {
                    session.add_initializer(init).map(|_| ())
                } else {
                    session.create_run(&init, &components).map(|_| ())
                };
                if let Err(e) = created {
                    session.close_with_error()?;
                    return Err(e.into());
                }
            }
        }
    }

    let outcome = match session
        .process_runs(options, components, session_postprocesses)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            session.close_with_error()?;
            return Err(e.into());
        }
    };
    session.close()?;

    println!("{}", outcome.summary.message());
    for line in outcome.summary.stage_lines() {
        println!("  {line}");
    }
    println!("report: {}", session.dir().join("report.csv").display());

    ctx.close()?;
    Ok(outcome.summary.is_success())
}

/// `[]` means "no such component" and still yields one run.
fn fan_out(names: &[String]) -> Vec<Option<String>> {
    if names.is_empty() {
        vec![None]
    } else {
        names.iter().cloned().map(Some).collect()
    }
}

fn worker(args: WorkerArgs, env: Environment) -> Result<bool> {
    let components = ComponentRegistry::from_environment(&env);

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading worker request")?;
    let request: WorkerRequest =
        serde_json::from_str(&input).context("parsing worker request")?;
    debug!(runs = request.runs.len(), session = request.session_idx, "worker started");

    let results = serve_worker(&request, &components, &args.session_dir, args.until);

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &results)?;
    stdout.flush()?;
    Ok(true)
}

fn sessions(args: SessionsArgs, env: Environment) -> Result<bool> {
    let mut ctx = Context::open(env, DepsLockMode::Read)?;

    match args.cleanup {
        Some(keep) => {
            let removed = ctx.cleanup_sessions(keep)?;
            println!("removed {} session(s)", removed.len());
        }
        None => {
            for info in ctx.load_recent_sessions(None)? {
                let (status, label, runs) = match &info.meta {
                    Some(meta) => (meta.status.to_string(), meta.label.clone(), meta.runs),
                    None => ("unknown".to_string(), String::new(), 0),
                };
                let locked = if info.locked { " (in use)" } else { "" };
                println!("{:>4}  {status:<7} {runs:>4} run(s)  {label}{locked}", info.idx);
            }
        }
    }

    ctx.close()?;
    Ok(true)
}
