// tests/scheduler.rs

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use common::init_tracing;
use mcuflow::errors::McuflowError;
use mcuflow::report::{Report, ReportRow};
use mcuflow::session::postprocess::RenameColumns;
use mcuflow::session::{
    serve_worker, ComponentRegistry, Run, RunInitializer, RunStage, ScheduleSummary,
    SchedulerOptions, SessionPostprocess, SessionScheduler, WorkerRequest,
};
use mcuflow::types::ExecutorKind;
use mcuflow_test_utils::fakes::{fake_registry, EventLog, FAIL_KEY, PANIC_KEY};
use mcuflow_test_utils::with_timeout;
use tempfile::tempdir;

fn init(model: &str, extra: &[(&str, &str)]) -> RunInitializer {
    let mut init = RunInitializer::new(model);
    init.frontend = Some("fake_fe".into());
    init.backend = Some("fake_be".into());
    init.target = Some("fake_tg".into());
    init.config.insert("model".into(), model.into());
    for (k, v) in extra {
        init.config.insert(k.to_string(), v.to_string());
    }
    init
}

fn realize_all(
    inits: &[RunInitializer],
    components: &ComponentRegistry,
    runs_dir: &Path,
) -> Vec<Arc<Mutex<Run>>> {
    inits
        .iter()
        .enumerate()
        .map(|(idx, init)| {
            let run = init
                .realize(components, idx, runs_dir.join(idx.to_string()))
                .unwrap();
            Arc::new(Mutex::new(run))
        })
        .collect()
}

fn stage_of(run: &Arc<Mutex<Run>>) -> RunStage {
    run.lock().unwrap().stage()
}

#[tokio::test]
async fn failing_run_does_not_affect_others() {
    init_tracing();

    for batch_size in 1..=3 {
        let dir = tempdir().unwrap();
        let log = EventLog::new();
        let components = Arc::new(fake_registry(&log));
        let inits = vec![
            init("a", &[]),
            init("b", &[(FAIL_KEY, "BUILD")]),
            init("c", &[]),
        ];
        let runs = realize_all(&inits, &components, &dir.path().join("runs"));

        let options = SchedulerOptions {
            num_workers: 2,
            batch_size,
            ..SchedulerOptions::default()
        };
        let mut scheduler = SessionScheduler::new(
            runs.clone(),
            Vec::new(),
            dir.path().join("runs"),
            0,
            components,
            options,
        );
        with_timeout(scheduler.process()).await.unwrap();

        assert_eq!(stage_of(&runs[0]), RunStage::Run, "batch_size={batch_size}");
        assert_eq!(stage_of(&runs[1]), RunStage::Load, "batch_size={batch_size}");
        assert_eq!(stage_of(&runs[2]), RunStage::Run, "batch_size={batch_size}");
        assert!(runs[1].lock().unwrap().is_failing());

        let summary = scheduler.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.stage_failures.get(&RunStage::Build), Some(&vec![1]));
        assert_eq!(summary.message(), "2 out of 3 runs completed successfully");
        assert_eq!(log.count(RunStage::Run), 2);
    }
}

#[tokio::test]
async fn per_stage_mode_separates_stages_with_barriers() {
    init_tracing();
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));
    let inits = vec![
        init("a", &[("fake.delay_ms", "20")]),
        init("b", &[]),
        init("c", &[]),
    ];
    let runs = realize_all(&inits, &components, &dir.path().join("runs"));

    let options = SchedulerOptions {
        per_stage: true,
        num_workers: 3,
        ..SchedulerOptions::default()
    };
    let mut scheduler =
        SessionScheduler::new(runs, Vec::new(), dir.path().join("runs"), 0, components, options);
    with_timeout(scheduler.process()).await.unwrap();

    let used: Vec<RunStage> = scheduler.used_stages().iter().copied().collect();
    assert_eq!(used, vec![RunStage::Load, RunStage::Build, RunStage::Run]);
    assert_eq!(scheduler.num_barriers(), used.len());

    let stages = log.stages();
    assert_eq!(stages.len(), 9);
    let last_load = stages.iter().rposition(|s| *s == RunStage::Load).unwrap();
    let first_build = stages.iter().position(|s| *s == RunStage::Build).unwrap();
    let last_build = stages.iter().rposition(|s| *s == RunStage::Build).unwrap();
    let first_run = stages.iter().position(|s| *s == RunStage::Run).unwrap();
    assert!(last_load < first_build);
    assert!(last_build < first_run);
}

#[tokio::test]
async fn non_per_stage_mode_uses_a_single_barrier() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));
    let runs = realize_all(&[init("a", &[]), init("b", &[])], &components, dir.path());

    let mut scheduler = SessionScheduler::new(
        runs,
        Vec::new(),
        dir.path().join("runs"),
        0,
        components,
        SchedulerOptions::default(),
    );
    with_timeout(scheduler.process()).await.unwrap();
    assert_eq!(scheduler.num_barriers(), 1);
}

#[tokio::test]
async fn two_runs_per_stage_until_build_cross_two_barriers() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));
    let runs = realize_all(&[init("a", &[]), init("b", &[])], &components, dir.path());

    let options = SchedulerOptions {
        until: RunStage::Build,
        per_stage: true,
        batch_size: 1,
        ..SchedulerOptions::default()
    };
    let mut scheduler = SessionScheduler::new(
        runs.clone(),
        Vec::new(),
        dir.path().join("runs"),
        0,
        components,
        options,
    );
    with_timeout(scheduler.process()).await.unwrap();

    assert!(runs.iter().all(|run| stage_of(run) == RunStage::Build));
    assert_eq!(log.count(RunStage::Run), 0);
    assert_eq!(scheduler.num_barriers(), 2);
}

#[tokio::test]
async fn panicking_worker_only_fails_its_batch() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));
    let inits = vec![
        init("a", &[(PANIC_KEY, "LOAD")]),
        init("b", &[]),
        init("c", &[]),
    ];
    let runs = realize_all(&inits, &components, &dir.path().join("runs"));

    let options = SchedulerOptions {
        num_workers: 2,
        batch_size: 1,
        ..SchedulerOptions::default()
    };
    let mut scheduler = SessionScheduler::new(
        runs.clone(),
        Vec::new(),
        dir.path().join("runs"),
        0,
        components,
        options,
    );
    with_timeout(scheduler.process()).await.unwrap();

    let failed = runs[0].lock().unwrap_or_else(|p| p.into_inner());
    assert!(failed.is_failing());
    assert_eq!(failed.failed_stage(), Some(RunStage::Load));
    drop(failed);
    assert_eq!(stage_of(&runs[1]), RunStage::Run);
    assert_eq!(stage_of(&runs[2]), RunStage::Run);

    let summary = scheduler.summary();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stage_failures.get(&RunStage::Load), Some(&vec![0]));
}

#[tokio::test]
async fn init_stage_realizes_pending_runs() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));

    let mut good = init("a", &[]);
    good.idx = Some(0);
    let mut bad = init("b", &[]);
    bad.idx = Some(1);
    bad.target = Some("missing_target".into());

    let options = SchedulerOptions {
        use_init_stage: true,
        num_workers: 2,
        ..SchedulerOptions::default()
    };
    let mut scheduler = SessionScheduler::new(
        Vec::new(),
        vec![good, bad],
        dir.path().join("runs"),
        7,
        components,
        options,
    );
    with_timeout(scheduler.process()).await.unwrap();

    assert_eq!(scheduler.runs().len(), 2);
    let summary = scheduler.summary();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.stage_failures.get(&RunStage::Nop), Some(&vec![1]));
    assert_eq!(log.count(RunStage::Run), 1);

    let realized = scheduler
        .runs()
        .iter()
        .find(|run| run.lock().unwrap().idx() == 0)
        .unwrap();
    let row = realized.lock().unwrap().get_report();
    assert_eq!(row.get("Session"), Some(&serde_json::json!(7)));
    assert_eq!(realized.lock().unwrap().dir(), dir.path().join("runs").join("0"));
}

#[tokio::test]
async fn per_stage_init_stage_counts_as_a_barrier() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));
    let mut pending = init("a", &[(FAIL_KEY, "LOAD")]);
    pending.idx = Some(0);

    let options = SchedulerOptions {
        use_init_stage: true,
        per_stage: true,
        ..SchedulerOptions::default()
    };
    let mut scheduler = SessionScheduler::new(
        Vec::new(),
        vec![pending],
        dir.path().join("runs"),
        0,
        components,
        options,
    );
    with_timeout(scheduler.process()).await.unwrap();

    // init + LOAD + BUILD + RUN; the run fails at LOAD and is not resubmitted.
    assert_eq!(scheduler.num_barriers(), 4);
    assert_eq!(log.stages(), vec![RunStage::Load]);
    assert_eq!(scheduler.summary().stage_failures.get(&RunStage::Load), Some(&vec![0]));
}

#[tokio::test]
async fn shuffled_order_still_processes_every_run() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));
    let inits: Vec<RunInitializer> = (0..8).map(|i| init(&format!("m{i}"), &[])).collect();
    let runs = realize_all(&inits, &components, &dir.path().join("runs"));

    let options = SchedulerOptions {
        shuffle: true,
        num_workers: 3,
        batch_size: 2,
        ..SchedulerOptions::default()
    };
    let mut scheduler = SessionScheduler::new(
        runs.clone(),
        Vec::new(),
        dir.path().join("runs"),
        0,
        components,
        options,
    );
    with_timeout(scheduler.process()).await.unwrap();

    assert!(runs.iter().all(|run| stage_of(run) == RunStage::Run));
    assert!(scheduler.summary().is_success());
    assert_eq!(scheduler.summary().message(), "All runs completed successfully");
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = Arc::new(fake_registry(&log));

    let cases = [
        SchedulerOptions {
            executor: ExecutorKind::ProcessPool,
            per_stage: true,
            ..SchedulerOptions::default()
        },
        SchedulerOptions {
            executor: ExecutorKind::ProcessPool,
            use_init_stage: true,
            ..SchedulerOptions::default()
        },
        SchedulerOptions {
            num_workers: 0,
            ..SchedulerOptions::default()
        },
        SchedulerOptions {
            batch_size: 0,
            ..SchedulerOptions::default()
        },
    ];
    for options in cases {
        let mut scheduler = SessionScheduler::new(
            Vec::new(),
            Vec::new(),
            dir.path().join("runs"),
            0,
            components.clone(),
            options.clone(),
        );
        let err = scheduler.process().await.unwrap_err();
        assert!(matches!(err, McuflowError::Config(_)), "{options:?}: {err}");
    }
    assert!(log.events().is_empty());
}

struct Broken;

impl SessionPostprocess for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn apply(&self, report: &mut Report) -> anyhow::Result<()> {
        report.drop_column("Model");
        anyhow::bail!("broken postprocess")
    }
}

#[test]
fn session_postprocess_failure_leaves_report_untouched() {
    let log = EventLog::new();
    let scheduler = SessionScheduler::new(
        Vec::new(),
        Vec::new(),
        "/tmp/unused/runs".into(),
        0,
        Arc::new(fake_registry(&log)),
        SchedulerOptions::default(),
    );

    let mut row = ReportRow::new();
    row.set("Model", "resnet");
    row.set("Cycles", 10);
    let mut report = Report::new(vec![row]);

    let rename: Arc<dyn SessionPostprocess> = Arc::new(RenameColumns::new(
        "rename",
        BTreeMap::from([("Cycles".to_string(), "Total Cycles".to_string())]),
    ));
    let postprocesses: Vec<Arc<dyn SessionPostprocess>> =
        vec![Arc::new(Broken), rename.clone(), rename];
    scheduler.postprocess(&mut report, &postprocesses);

    assert_eq!(report.columns(), vec!["Model", "Total Cycles"]);
    assert_eq!(report.rows[0].get("Model"), Some(&serde_json::json!("resnet")));
}

#[test]
fn summary_messages() {
    let mut summary = ScheduleSummary {
        total: 3,
        ..ScheduleSummary::default()
    };
    assert_eq!(summary.message(), "All runs completed successfully");

    summary.failed = 3;
    summary.stage_failures.insert(RunStage::Load, vec![0, 2]);
    summary.stage_failures.insert(RunStage::Run, vec![1]);
    assert_eq!(summary.message(), "All runs have failed");
    assert_eq!(
        summary.stage_lines(),
        vec![
            "2 failed at stage LOAD: runs 0, 2".to_string(),
            "1 failed at stage RUN: runs 1".to_string(),
        ]
    );
}

#[test]
fn worker_serves_a_request_from_json() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = fake_registry(&log);

    let mut ok = init("a", &[]);
    ok.idx = Some(0);
    let mut failing = init("b", &[(FAIL_KEY, "RUN")]);
    failing.idx = Some(1);
    let request = WorkerRequest {
        session_idx: 2,
        runs: vec![ok, failing],
    };
    let wire = serde_json::to_string(&request).unwrap();
    let request: WorkerRequest = serde_json::from_str(&wire).unwrap();

    let results = serve_worker(&request, &components, dir.path(), RunStage::Done);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].stage, RunStage::Run);
    assert!(!results[0].failing);
    assert!(results[1].failing);
    assert_eq!(results[1].failed_stage, Some(RunStage::Run));
    assert!(dir.path().join("runs").join("1").join("report.csv").exists());

    // Results applied in the parent match what the worker computed.
    let mut parent = request.runs[1]
        .realize(&components, 1, dir.path().join("runs").join("1"))
        .unwrap();
    parent.apply_result(&results[1]);
    assert!(parent.is_failing());
    assert_eq!(parent.stage(), RunStage::Build);
    assert_eq!(parent.get_report(), results[1].report);
}
