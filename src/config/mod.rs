// src/config/mod.rs

//! Environment configuration for mcuflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load an environment file from disk (`loader.rs`).
//! - Validate basic invariants like sane scheduler settings (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_environment_path, load_and_validate, load_from_path, ENVIRONMENT_FILE};
pub use model::{
    ComponentSpec, DefaultsSection, EnabledSection, Environment, FeatureSpec, PathsSection,
    PostprocessSpec, RawEnvironment, SessionSection, TaskSpec,
};
