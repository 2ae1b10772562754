// src/session/mod.rs

//! Runs, sessions and the scheduler that drives them.
//!
//! - [`stage`]: the ordered pipeline stages.
//! - [`run`]: a single pipeline instance and its stage state machine.
//! - [`components`]: collaborator traits and their name registry.
//! - [`session`]: a workspace holding a set of runs.
//! - [`scheduler`]: batching, barriers and worker pools.

pub mod artifact;
pub mod command;
pub mod components;
pub mod features;
pub mod initializer;
pub mod postprocess;
pub mod run;
pub mod scheduler;
#[allow(clippy::module_inception)]
pub mod session;
pub mod stage;

pub use artifact::{Artifact, ArtifactData, Metrics};
pub use components::{Backend, ComponentRegistry, Frontend, Platform, Target};
pub use features::{Config, ConfigPipeline, FeatureStep};
pub use initializer::RunInitializer;
pub use postprocess::{RunPostprocess, SessionPostprocess};
pub use run::{Run, RunResult};
pub use scheduler::{
    serve_worker, ScheduleSummary, SchedulerOptions, SessionScheduler, WorkerRequest,
};
pub use session::{Session, SessionMeta, SessionOutcome};
pub use stage::RunStage;
