// tests/run_stages.rs

use std::sync::Arc;

use mcuflow::errors::McuflowError;
use mcuflow::session::{Run, RunInitializer, RunStage};
use mcuflow_test_utils::fakes::{
    fake_registry, EventLog, FakeBackend, FakeFrontend, FakePlatform, FakeTarget, FAIL_KEY,
};
use tempfile::tempdir;

fn full_run(dir: &std::path::Path, log: &EventLog) -> Run {
    Run::new(0, "resnet", dir.join("0"))
        .with_frontend(Arc::new(FakeFrontend::new("fake_fe", log.clone())))
        .with_backend(Arc::new(FakeBackend::new("fake_be", log.clone())))
        .with_platform(Arc::new(FakePlatform::new("fake_pl", log.clone())))
        .with_target(Arc::new(FakeTarget::new("fake_tg", 1000, log.clone())))
}

#[test]
fn stages_advance_in_order() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut run = full_run(dir.path(), &log);

    assert_eq!(run.stage(), RunStage::Nop);
    assert_eq!(run.next_stage(), Some(RunStage::Load));

    run.load().unwrap();
    assert_eq!(run.stage(), RunStage::Load);
    run.build().unwrap();
    run.compile().unwrap();
    run.run().unwrap();

    assert_eq!(run.stage(), RunStage::Run);
    assert_eq!(run.next_stage(), None);
    assert_eq!(
        log.stages(),
        vec![RunStage::Load, RunStage::Build, RunStage::Compile, RunStage::Run]
    );
    assert_eq!(run.metrics()["Cycles"], serde_json::json!(1000));
    assert_eq!(run.artifacts(RunStage::Load)[0].name, "resnet.tflite");
}

#[test]
fn skipping_a_stage_is_rejected() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut run = full_run(dir.path(), &log);

    let err = run.compile().unwrap_err();
    assert!(matches!(
        err,
        McuflowError::StageOrder { stage: RunStage::Compile, current: RunStage::Nop, .. }
    ));
    assert!(log.events().is_empty());
    assert_eq!(run.stage(), RunStage::Nop);
}

#[test]
fn process_is_idempotent_and_never_goes_back() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut run = full_run(dir.path(), &log);

    run.process(RunStage::Build, false).unwrap();
    assert_eq!(run.stage(), RunStage::Build);
    assert_eq!(log.events().len(), 2);

    run.process(RunStage::Build, false).unwrap();
    run.process(RunStage::Load, false).unwrap();
    assert_eq!(run.stage(), RunStage::Build);
    assert_eq!(log.events().len(), 2);

    run.process(RunStage::Done, false).unwrap();
    assert_eq!(run.stage(), RunStage::Run);
    assert_eq!(log.events().len(), 4);
}

#[test]
fn rerunning_a_stage_keeps_the_highest_stage() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut run = full_run(dir.path(), &log);

    run.process(RunStage::Compile, false).unwrap();
    run.build().unwrap();
    assert_eq!(run.stage(), RunStage::Compile);
}

#[test]
fn runs_without_a_component_skip_its_stage() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut run = Run::new(3, "resnet", dir.path().join("3"))
        .with_frontend(Arc::new(FakeFrontend::new("fake_fe", log.clone())))
        .with_backend(Arc::new(FakeBackend::new("fake_be", log.clone())));

    assert!(!run.has_stage(RunStage::Compile));
    run.process(RunStage::Done, false).unwrap();
    assert_eq!(run.stage(), RunStage::Build);
    assert!(matches!(run.compile(), Err(McuflowError::Config(_))));

    let row = run.get_report();
    assert_eq!(row.get("Incomplete"), Some(&serde_json::json!(true)));
    assert_eq!(row.get("Platform"), Some(&serde_json::Value::Null));
}

#[test]
fn stage_failure_marks_the_run_failing() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = fake_registry(&log);
    let mut init = RunInitializer::new("resnet");
    init.frontend = Some("fake_fe".into());
    init.backend = Some("fake_be".into());
    init.target = Some("fake_tg".into());
    init.config.insert(FAIL_KEY.into(), "BUILD".into());
    let mut run = init.realize(&components, 0, dir.path().join("0")).unwrap();

    let err = run.process(RunStage::Done, false).unwrap_err();
    assert!(matches!(err, McuflowError::Stage { stage: RunStage::Build, .. }));
    assert!(run.is_failing());
    assert_eq!(run.failed_stage(), Some(RunStage::Build));
    assert_eq!(run.stage(), RunStage::Load);

    let row = run.get_report();
    assert_eq!(row.get("Failing"), Some(&serde_json::json!(true)));
    let reason = row.get("Reason").and_then(|v| v.as_str()).unwrap();
    assert!(reason.contains("fake failure in stage BUILD"));
}

#[test]
fn export_writes_run_files() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut run = full_run(dir.path(), &log).with_comment("nightly");

    run.process(RunStage::Done, true).unwrap();

    let run_dir = dir.path().join("0");
    assert!(run_dir.join("run.txt").exists());
    assert!(run_dir.join("load").join("resnet.tflite").exists());
    let csv = std::fs::read_to_string(run_dir.join("report.csv")).unwrap();
    assert!(csv.lines().next().unwrap().contains("Cycles"));
    assert!(csv.contains("nightly"));
}

#[test]
fn copies_and_initializers_preserve_the_configuration() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let components = fake_registry(&log);
    let mut init = RunInitializer::new("resnet");
    init.frontend = Some("fake_fe".into());
    init.target = Some("fake_tg".into());
    init.config.insert("model".into(), "resnet".into());
    init.comment = Some("baseline".into());

    let mut run = init.realize(&components, 4, dir.path().join("4")).unwrap();
    run.process(RunStage::Load, false).unwrap();

    let copy = run.copy(9, dir.path().join("9")).unwrap();
    assert_eq!(copy.idx(), 9);
    assert_eq!(copy.stage(), RunStage::Load);
    assert_eq!(copy.target_name(), Some("fake_tg"));

    let again = copy.to_initializer();
    assert_eq!(again.idx, Some(9));
    assert_eq!(again.model, init.model);
    assert_eq!(again.config, init.config);
    assert_eq!(again.comment, init.comment);
}

#[test]
fn copies_own_their_exported_artifacts() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut run = full_run(dir.path(), &log);
    run.process(RunStage::Build, true).unwrap();

    let source = run.artifacts(RunStage::Load)[0].path().unwrap().to_path_buf();
    assert!(source.starts_with(dir.path().join("0")));

    let copy = run.copy(1, dir.path().join("1")).unwrap();
    for stage in [RunStage::Load, RunStage::Build] {
        for artifact in copy.artifacts(stage) {
            let path = artifact.path().unwrap();
            assert!(path.starts_with(dir.path().join("1")), "{}", path.display());
            assert!(path.is_file());
        }
    }
    assert!(source.is_file());
    assert_eq!(copy.stage(), RunStage::Build);
}

#[test]
fn unknown_component_names_fail_to_realize() {
    let log = EventLog::new();
    let components = fake_registry(&log);
    let mut init = RunInitializer::new("resnet");
    init.backend = Some("nope".into());
    assert!(matches!(
        init.realize(&components, 0, "/tmp/unused"),
        Err(McuflowError::Config(msg)) if msg.contains("unknown backend 'nope'")
    ));
}
