//! In-memory pipeline collaborators.
//!
//! Every fake checks two config keys so tests can make individual runs
//! misbehave without extra wiring:
//!
//! - `fake.fail = "<STAGE>"`: return an error in that stage
//! - `fake.panic = "<STAGE>"`: panic in that stage
//!
//! All fakes share an [`EventLog`] recording `(stage, label)` in call order.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use mcuflow::session::{
    Artifact, Backend, ComponentRegistry, Config, Frontend, Metrics, Platform, RunStage, Target,
};

pub const FAIL_KEY: &str = "fake.fail";
pub const PANIC_KEY: &str = "fake.panic";
/// Milliseconds each fake call sleeps; widens race windows in tests.
pub const DELAY_KEY: &str = "fake.delay_ms";

#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<(RunStage, String)>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: RunStage, label: &str) {
        self.0.lock().unwrap().push((stage, label.to_string()));
    }

    pub fn events(&self) -> Vec<(RunStage, String)> {
        self.0.lock().unwrap().clone()
    }

    pub fn stages(&self) -> Vec<RunStage> {
        self.events().into_iter().map(|(stage, _)| stage).collect()
    }

    pub fn count(&self, stage: RunStage) -> usize {
        self.stages().into_iter().filter(|s| *s == stage).count()
    }
}

fn misbehave(stage: RunStage, config: &Config) -> anyhow::Result<()> {
    if let Some(ms) = config.get(DELAY_KEY).and_then(|v| v.parse::<u64>().ok()) {
        std::thread::sleep(Duration::from_millis(ms));
    }
    if config.get(PANIC_KEY).map(String::as_str) == Some(stage.as_str()) {
        panic!("fake panic in stage {stage}");
    }
    if config.get(FAIL_KEY).map(String::as_str) == Some(stage.as_str()) {
        bail!("fake failure in stage {stage}");
    }
    Ok(())
}

fn label(config: &Config) -> String {
    config.get("model").cloned().unwrap_or_default()
}

pub struct FakeFrontend {
    name: String,
    log: EventLog,
}

impl FakeFrontend {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
        }
    }
}

impl Frontend for FakeFrontend {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_models(
        &self,
        model: &str,
        config: &Config,
        _out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>> {
        self.log.record(RunStage::Load, model);
        misbehave(RunStage::Load, config)?;
        Ok(vec![Artifact::text(format!("{model}.tflite"), model)])
    }
}

pub struct FakeBackend {
    name: String,
    framework: String,
    log: EventLog,
}

impl FakeBackend {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            framework: "fakeflow".to_string(),
            log,
        }
    }
}

impl Backend for FakeBackend {
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
        _out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>> {
        self.log.record(RunStage::Build, &label(config));
        misbehave(RunStage::Build, config)?;
        let names: Vec<&str> = inputs.iter().map(|a| a.name.as_str()).collect();
        Ok(vec![Artifact::text("model.c", names.join("\n"))])
    }
}

pub struct FakePlatform {
    name: String,
    log: EventLog,
}

impl FakePlatform {
    pub fn new(name: &str, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            log,
        }
    }
}

impl Platform for FakePlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn compile(
        &self,
        inputs: &[Artifact],
        config: &Config,
        _out_dir: &Path,
    ) -> anyhow::Result<Vec<Artifact>> {
        self.log.record(RunStage::Compile, &label(config));
        misbehave(RunStage::Compile, config)?;
        Ok(vec![Artifact::text("app.elf", format!("{} inputs", inputs.len()))])
    }
}

pub struct FakeTarget {
    name: String,
    cycles: u64,
    log: EventLog,
}

impl FakeTarget {
    pub fn new(name: &str, cycles: u64, log: EventLog) -> Self {
        Self {
            name: name.to_string(),
            cycles,
            log,
        }
    }
}

impl Target for FakeTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate_metrics(
        &self,
        _inputs: &[Artifact],
        config: &Config,
        _out_dir: &Path,
    ) -> anyhow::Result<(Metrics, Vec<Artifact>)> {
        self.log.record(RunStage::Run, &label(config));
        misbehave(RunStage::Run, config)?;
        let mut metrics = Metrics::new();
        metrics.insert("Cycles".to_string(), serde_json::json!(self.cycles));
        metrics.insert("Instructions".to_string(), serde_json::json!(self.cycles / 2));
        Ok((metrics, vec![Artifact::text("stdout.log", "ok")]))
    }
}

/// Registry with one fake of each kind: `fake_fe`, `fake_be`, `fake_pl`
/// and `fake_tg` (1000 cycles).
pub fn fake_registry(log: &EventLog) -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    registry.add_frontend(Arc::new(FakeFrontend::new("fake_fe", log.clone())));
    registry.add_backend(Arc::new(FakeBackend::new("fake_be", log.clone())));
    registry.add_platform(Arc::new(FakePlatform::new("fake_pl", log.clone())));
    registry.add_target(Arc::new(FakeTarget::new("fake_tg", 1000, log.clone())));
    registry
}
