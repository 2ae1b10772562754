// src/setup/mod.rs

//! Dependency installation: task descriptors, the provider/consumer graph,
//! the executor interpreting task contracts, and the installer driving it.

pub mod executor;
pub mod graph;
pub mod installer;
pub mod params;
pub mod registry;
pub mod shell;
pub mod task;

pub use executor::{plan_variants, InvokeOptions, TaskExecutor, TaskReport};
pub use graph::TaskGraph;
pub use installer::{InstallOptions, InstallSummary, Installer};
pub use params::{get_combs, Flags, ParamValue, Params};
pub use registry::TaskRegistry;
pub use task::{Task, TaskBuilder, TaskCall, TaskCategory, TaskEnv, TaskOutcome};
