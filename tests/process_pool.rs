// tests/process_pool.rs

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use common::init_tracing;
use mcuflow::config::{load_and_validate, ENVIRONMENT_FILE};
use mcuflow::session::{
    ComponentRegistry, Run, RunInitializer, RunStage, SchedulerOptions, SessionScheduler,
};
use mcuflow::types::ExecutorKind;
use mcuflow_test_utils::with_timeout;
use tempfile::tempdir;

const ENVIRONMENT: &str = r##"
[frontend.gen]
cmd = 'printf model > "$MCUFLOW_MODEL.tflite"'

[backend.emit]
cmd = 'test -n "$MCUFLOW_INPUTS" && printf code > code.c'
framework = "c"

[target.sim]
cmd = '''printf '{"Cycles": 42}' > metrics.json'''

[target.broken]
cmd = "exit 3"
"##;

fn write_home(dir: &Path) -> PathBuf {
    let home = dir.join("home");
    fs::create_dir_all(&home).unwrap();
    fs::write(home.join(ENVIRONMENT_FILE), ENVIRONMENT).unwrap();
    home
}

fn registry(home: &Path) -> ComponentRegistry {
    let env = load_and_validate(home.join(ENVIRONMENT_FILE)).unwrap();
    ComponentRegistry::from_environment(&env)
}

fn runs_for(
    targets: &[&str],
    components: &ComponentRegistry,
    runs_dir: &Path,
) -> Vec<Arc<Mutex<Run>>> {
    targets
        .iter()
        .enumerate()
        .map(|(idx, target)| {
            let mut init = RunInitializer::new(format!("model{idx}"));
            init.frontend = Some("gen".into());
            init.backend = Some("emit".into());
            init.target = Some(target.to_string());
            let run = init
                .realize(components, idx, runs_dir.join(idx.to_string()))
                .unwrap();
            Arc::new(Mutex::new(run))
        })
        .collect()
}

fn pool_options(home: &Path, batch_size: usize) -> SchedulerOptions {
    SchedulerOptions {
        executor: ExecutorKind::ProcessPool,
        num_workers: 2,
        batch_size,
        worker_exe: Some(PathBuf::from(env!("CARGO_BIN_EXE_mcuflow"))),
        home: home.to_path_buf(),
        ..SchedulerOptions::default()
    }
}

#[tokio::test]
async fn worker_results_are_applied_to_the_parent_runs() {
    init_tracing();
    let dir = tempdir().unwrap();
    let home = write_home(dir.path());
    let components = registry(&home);
    let runs_dir = dir.path().join("session").join("runs");
    let runs = runs_for(&["sim", "broken", "sim"], &components, &runs_dir);

    let mut scheduler = SessionScheduler::new(
        runs.clone(),
        Vec::new(),
        runs_dir.clone(),
        3,
        Arc::new(components),
        pool_options(&home, 2),
    );
    with_timeout(scheduler.process()).await.unwrap();

    for idx in [0, 2] {
        let run = runs[idx].lock().unwrap();
        assert_eq!(run.stage(), RunStage::Run, "run {idx}");
        assert!(!run.is_failing(), "run {idx}");
        let report = run.get_report();
        assert_eq!(report.get("Cycles"), Some(&serde_json::json!(42)));
        assert_eq!(report.get("Session"), Some(&serde_json::json!(3)));
        assert!(runs_dir.join(idx.to_string()).join("report.csv").is_file());
    }

    let broken = runs[1].lock().unwrap();
    assert!(broken.is_failing());
    assert_eq!(broken.failed_stage(), Some(RunStage::Run));
    assert_eq!(broken.stage(), RunStage::Build);
    assert_eq!(broken.get_report().get("Failing"), Some(&serde_json::json!(true)));
    drop(broken);

    let expected = BTreeMap::from([(RunStage::Run, vec![1])]);
    assert_eq!(scheduler.stage_failures(), &expected);
    assert_eq!(scheduler.summary().failed, 1);
    assert_eq!(scheduler.num_barriers(), 1);
}

#[tokio::test]
async fn missing_worker_binary_fails_every_run_of_the_batch() {
    init_tracing();
    let dir = tempdir().unwrap();
    let home = write_home(dir.path());
    let components = registry(&home);
    let runs_dir = dir.path().join("session").join("runs");
    let runs = runs_for(&["sim", "sim"], &components, &runs_dir);

    let mut options = pool_options(&home, 2);
    options.worker_exe = Some(dir.path().join("no-such-mcuflow"));
    let mut scheduler = SessionScheduler::new(
        runs.clone(),
        Vec::new(),
        runs_dir,
        0,
        Arc::new(components),
        options,
    );
    with_timeout(scheduler.process()).await.unwrap();

    for run in &runs {
        let run = run.lock().unwrap();
        assert!(run.is_failing());
        assert_eq!(run.stage(), RunStage::Nop);
        assert_eq!(run.failed_stage(), Some(RunStage::Load));
    }
    let expected = BTreeMap::from([(RunStage::Load, vec![0, 1])]);
    assert_eq!(scheduler.stage_failures(), &expected);
}

#[tokio::test]
async fn worker_exiting_with_an_error_only_fails_its_own_batch() {
    init_tracing();
    let dir = tempdir().unwrap();
    let home = write_home(dir.path());
    let components = registry(&home);
    let runs_dir = dir.path().join("session").join("runs");
    let runs = runs_for(&["sim", "sim"], &components, &runs_dir);

    // Already-failing runs are not sent, so only the healthy batch spawns a
    // worker. Pointing it at a home without an environment file makes that
    // worker exit non-zero.
    runs[1]
        .lock()
        .unwrap()
        .mark_failing(RunStage::Load, "marked before scheduling");

    let empty_home = dir.path().join("empty");
    fs::create_dir_all(&empty_home).unwrap();
    let mut scheduler = SessionScheduler::new(
        runs.clone(),
        Vec::new(),
        runs_dir,
        0,
        Arc::new(components),
        pool_options(&empty_home, 1),
    );
    with_timeout(scheduler.process()).await.unwrap();

    let first = runs[0].lock().unwrap();
    assert!(first.is_failing());
    assert_eq!(first.failed_stage(), Some(RunStage::Load));
    assert!(first.get_report().get("Reason").is_some_and(|r| {
        r.as_str().is_some_and(|s| s.contains("worker process failed"))
    }));
    drop(first);

    let second = runs[1].lock().unwrap();
    assert_eq!(
        second.get_report().get("Reason"),
        Some(&serde_json::json!("marked before scheduling"))
    );
    drop(second);

    let expected = BTreeMap::from([(RunStage::Load, vec![0, 1])]);
    assert_eq!(scheduler.stage_failures(), &expected);
}
