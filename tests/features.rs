// tests/features.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use mcuflow::config::PostprocessSpec;
use mcuflow::report::{Report, ReportRow};
use mcuflow::session::postprocess::{FilterColumns, RatioPostprocess};
use mcuflow::session::{
    ComponentRegistry, Config, ConfigPipeline, FeatureStep, RunInitializer, RunPostprocess,
    RunStage, SessionPostprocess,
};
use mcuflow_test_utils::builders::EnvironmentBuilder;
use mcuflow_test_utils::fakes::{fake_registry, EventLog, FakeTarget};
use proptest::prelude::*;
use tempfile::tempdir;

fn set(key: &'static str, value: &'static str) -> FeatureStep {
    FeatureStep::new(format!("set_{key}_{value}"), move |config: &Config| {
        let mut next = config.clone();
        next.insert(key.to_string(), value.to_string());
        next
    })
}

#[test]
fn later_features_override_earlier_ones() {
    let pipeline = ConfigPipeline::new()
        .with_step(set("mlif.optimize", "s"))
        .with_step(set("mlif.debug", "1"))
        .with_step(set("mlif.optimize", "3"));

    let base = Config::from([("mlif.optimize".to_string(), "0".to_string())]);
    let effective = pipeline.run(&base);

    assert_eq!(effective["mlif.optimize"], "3");
    assert_eq!(effective["mlif.debug"], "1");
    assert_eq!(base["mlif.optimize"], "0");
    assert_eq!(
        pipeline.names().collect::<Vec<_>>(),
        vec!["set_mlif.optimize_s", "set_mlif.debug_1", "set_mlif.optimize_3"]
    );
}

#[test]
fn feature_steps_can_read_the_incoming_config() {
    let double = FeatureStep::new("double_unroll", |config: &Config| {
        let mut next = config.clone();
        let unroll: u32 = config
            .get("unroll")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        next.insert("unroll".to_string(), (unroll * 2).to_string());
        next
    });
    let pipeline = ConfigPipeline::new()
        .with_step(double.clone())
        .with_step(double);
    assert_eq!(pipeline.run(&Config::new())["unroll"], "4");
}

#[test]
fn environment_features_feed_the_run_config() {
    let home = tempdir().unwrap();
    let env = EnvironmentBuilder::new()
        .with_feature("debug", &[("mlif.debug", "1"), ("mlif.optimize", "0")])
        .with_feature("vext", &[("spike.vlen", "128")])
        .build(home.path());
    let components = ComponentRegistry::from_environment(&env);

    let mut init = RunInitializer::new("resnet");
    init.features = vec!["debug".into(), "vext".into()];
    init.config.insert("mlif.optimize".into(), "s".into());
    init.config.insert("spike.vlen".into(), "64".into());

    let run = init.realize(&components, 0, home.path().join("run")).unwrap();
    assert_eq!(run.config()["mlif.debug"], "1");
    assert_eq!(run.config()["mlif.optimize"], "0");
    assert_eq!(run.config()["spike.vlen"], "128");
    assert_eq!(run.features(), ["debug", "vext"]);
    // The initializer keeps the user config, not the effective one.
    assert_eq!(run.to_initializer().config, init.config);

    init.features.push("missing".into());
    assert!(init.realize(&components, 1, home.path().join("run1")).is_err());
}

#[test]
fn ratio_postprocess_adds_a_column_in_the_postprocess_stage() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut components = fake_registry(&log);
    components.add_run_postprocess(Arc::new(RatioPostprocess::new(
        "ipc",
        "Instructions",
        "Cycles",
        "IPC",
    )));

    let mut init = RunInitializer::new("resnet");
    init.target = Some("fake_tg".into());
    init.postprocesses = vec!["ipc".into()];
    let mut run = init.realize(&components, 0, dir.path().join("0")).unwrap();

    assert!(run.has_stage(RunStage::Postprocess));
    run.process(RunStage::Done, false).unwrap();
    assert_eq!(run.stage(), RunStage::Postprocess);
    assert_eq!(run.get_report().get("IPC"), Some(&serde_json::json!(0.5)));
    assert_eq!(
        run.get_report().get("Postprocesses"),
        Some(&serde_json::json!("[ipc]"))
    );
}

#[test]
fn ratio_postprocess_failure_fails_the_run() {
    let dir = tempdir().unwrap();
    let log = EventLog::new();
    let mut components = fake_registry(&log);
    components.add_target(Arc::new(FakeTarget::new("idle_tg", 0, log.clone())));
    components.add_run_postprocess(Arc::new(RatioPostprocess::new(
        "ipc",
        "Instructions",
        "Cycles",
        "IPC",
    )));

    let mut init = RunInitializer::new("resnet");
    init.target = Some("idle_tg".into());
    init.postprocesses = vec!["ipc".into()];
    let mut run = init.realize(&components, 0, dir.path().join("0")).unwrap();

    assert!(run.process(RunStage::Done, false).is_err());
    assert_eq!(run.failed_stage(), Some(RunStage::Postprocess));
    assert_eq!(run.stage(), RunStage::Run);
    let reason = run.get_report().get("Reason").cloned().unwrap();
    assert!(reason.as_str().unwrap().contains("division by zero"));
}

#[test]
fn postprocess_kinds_register_at_the_right_level() {
    let home = tempdir().unwrap();
    let env = EnvironmentBuilder::new()
        .with_postprocess(
            "ipc",
            PostprocessSpec::Ratio {
                numerator: "Instructions".into(),
                denominator: "Cycles".into(),
                column: "IPC".into(),
            },
        )
        .with_postprocess(
            "short_names",
            PostprocessSpec::Rename {
                columns: BTreeMap::from([("Cycles".to_string(), "Cyc".to_string())]),
            },
        )
        .build(home.path());
    let components = ComponentRegistry::from_environment(&env);

    assert!(components.run_postprocess("ipc").is_some());
    assert!(components.session_postprocess("ipc").is_none());
    assert!(components.session_postprocess("short_names").is_some());
    assert!(components.has_postprocess("short_names"));
    assert!(!components.has_postprocess("nope"));

    // Session-level names are accepted on a run but not attached to it.
    let mut init = RunInitializer::new("resnet");
    init.postprocesses = vec!["short_names".into()];
    let run = init.realize(&components, 0, home.path().join("0")).unwrap();
    assert!(!run.has_stage(RunStage::Postprocess));

    init.postprocesses = vec!["nope".into()];
    assert!(init.realize(&components, 0, home.path().join("0")).is_err());
}

#[test]
fn filter_drops_columns_from_every_row() {
    let mut a = ReportRow::new();
    a.set("Model", "resnet");
    a.set("Config", "{}");
    let mut b = ReportRow::new();
    b.set("Model", "toycar");
    b.set("Comment", "with, comma");
    let mut report = Report::new(vec![a, b]);

    FilterColumns::new("slim", vec!["Config".into()])
        .apply(&mut report)
        .unwrap();
    assert_eq!(report.columns(), vec!["Model", "Comment"]);
    assert_eq!(report.to_csv(), "Model,Comment\nresnet,\ntoycar,\"with, comma\"\n");
}

#[test]
fn ratio_accepts_numeric_strings() {
    let mut row = ReportRow::new();
    row.set("Instructions", "300");
    row.set("Cycles", 600);
    RatioPostprocess::new("ipc", "Instructions", "Cycles", "IPC")
        .apply(&mut row, &[])
        .unwrap();
    assert_eq!(row.get("IPC"), Some(&serde_json::json!(0.5)));
}

proptest! {
    #[test]
    fn pipeline_equals_manual_fold(values in proptest::collection::vec("[a-z]{1,4}", 0..6)) {
        let steps: Vec<FeatureStep> = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let value = value.clone();
                FeatureStep::new(format!("step{i}"), move |config: &Config| {
                    let mut next = config.clone();
                    next.insert("k".to_string(), value.clone());
                    next.insert(format!("seen{i}"), config.get("k").cloned().unwrap_or_default());
                    next
                })
            })
            .collect();

        let mut pipeline = ConfigPipeline::new();
        for step in &steps {
            pipeline.push(step.clone());
        }

        let mut expected = Config::new();
        for step in &steps {
            expected = step.apply(&expected);
        }
        let effective = pipeline.run(&Config::new());
        prop_assert_eq!(&effective, &expected);
        if let Some(last) = values.last() {
            prop_assert_eq!(effective["k"].as_str(), last.as_str());
        }
    }
}
