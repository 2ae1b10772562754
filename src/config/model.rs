// src/config/model.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::setup::params::ParamValue;
use crate::setup::task::TaskCategory;
use crate::types::ExecutorKind;

/// Environment file (`environment.toml`) exactly as deserialized.
///
/// ```toml
/// [paths]
/// deps = "deps"
///
/// [session]
/// executor = "thread_pool"
/// num_workers = 4
///
/// [task.install_spike]
/// cmd = "./scripts/install_spike.sh"
/// provides = ["spike.exe"]
/// ```
///
/// All sections are optional and have reasonable defaults. Use
/// `Environment::try_from` to get a validated [`Environment`].
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawEnvironment {
    #[serde(default)]
    pub paths: PathsSection,

    #[serde(default)]
    pub defaults: DefaultsSection,

    #[serde(default)]
    pub session: SessionSection,

    /// Extra values available to `Context::lookup`.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    #[serde(default)]
    pub enabled: EnabledSection,

    /// Installation tasks from `[task.<name>]`.
    #[serde(default)]
    pub task: BTreeMap<String, TaskSpec>,

    #[serde(default)]
    pub frontend: BTreeMap<String, ComponentSpec>,

    #[serde(default)]
    pub backend: BTreeMap<String, ComponentSpec>,

    #[serde(default)]
    pub platform: BTreeMap<String, ComponentSpec>,

    #[serde(default)]
    pub target: BTreeMap<String, ComponentSpec>,

    #[serde(default)]
    pub feature: BTreeMap<String, FeatureSpec>,

    #[serde(default)]
    pub postprocess: BTreeMap<String, PostprocessSpec>,
}

/// Validated environment plus the directory it was loaded from.
#[derive(Debug, Clone)]
pub struct Environment {
    pub home: PathBuf,
    pub paths: PathsSection,
    pub defaults: DefaultsSection,
    pub session: SessionSection,
    pub vars: BTreeMap<String, String>,
    pub enabled: EnabledSection,
    pub task: BTreeMap<String, TaskSpec>,
    pub frontend: BTreeMap<String, ComponentSpec>,
    pub backend: BTreeMap<String, ComponentSpec>,
    pub platform: BTreeMap<String, ComponentSpec>,
    pub target: BTreeMap<String, ComponentSpec>,
    pub feature: BTreeMap<String, FeatureSpec>,
    pub postprocess: BTreeMap<String, PostprocessSpec>,
}

impl Environment {
    /// Build without validation. Prefer `Environment::try_from`.
    pub(crate) fn new_unchecked(raw: RawEnvironment) -> Self {
        Self {
            home: PathBuf::from("."),
            paths: raw.paths,
            defaults: raw.defaults,
            session: raw.session,
            vars: raw.vars,
            enabled: raw.enabled,
            task: raw.task,
            frontend: raw.frontend,
            backend: raw.backend,
            platform: raw.platform,
            target: raw.target,
            feature: raw.feature,
            postprocess: raw.postprocess,
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.home.join(path)
        }
    }

    pub fn deps_dir(&self) -> PathBuf {
        self.resolve(&self.paths.deps)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.resolve(&self.paths.temp)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.temp_dir().join("sessions")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.resolve(&self.paths.results)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.deps_dir().join("cache.ini")
    }
}

/// `[paths]` section; relative paths are resolved against the home dir.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    #[serde(default = "default_deps")]
    pub deps: PathBuf,
    #[serde(default = "default_temp")]
    pub temp: PathBuf,
    #[serde(default = "default_results")]
    pub results: PathBuf,
}

fn default_deps() -> PathBuf {
    PathBuf::from("deps")
}

fn default_temp() -> PathBuf {
    PathBuf::from("temp")
}

fn default_results() -> PathBuf {
    PathBuf::from("results")
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            deps: default_deps(),
            temp: default_temp(),
            results: default_results(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsSection {
    /// Used when neither `--log-level` nor `MCUFLOW_LOG` is given.
    #[serde(default)]
    pub log_level: Option<String>,

    /// Remove old sessions when the context closes.
    #[serde(default)]
    pub cleanup_auto: bool,

    /// Sessions kept by automatic cleanup.
    #[serde(default = "default_cleanup_keep")]
    pub cleanup_keep: usize,
}

fn default_cleanup_keep() -> usize {
    50
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            log_level: None,
            cleanup_auto: false,
            cleanup_keep: default_cleanup_keep(),
        }
    }
}

/// `[session]` section: scheduler defaults, overridable from the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub executor: ExecutorKind,

    #[serde(default = "default_one")]
    pub num_workers: usize,

    #[serde(default)]
    pub per_stage: bool,

    #[serde(default = "default_one")]
    pub batch_size: usize,

    #[serde(default)]
    pub shuffle: bool,

    #[serde(default)]
    pub progress: bool,

    /// Realize run initializers inside the scheduler instead of upfront.
    #[serde(default)]
    pub use_init_stage: bool,

    /// Binary spawned for process-pool workers (defaults to this executable).
    #[serde(default)]
    pub worker_exe: Option<PathBuf>,
}

fn default_one() -> usize {
    1
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::default(),
            num_workers: 1,
            per_stage: false,
            batch_size: 1,
            shuffle: false,
            progress: false,
            use_init_stage: false,
            worker_exe: None,
        }
    }
}

/// `[enabled]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnabledSection {
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

/// `[task.<name>]` section: a shell-backed installation task.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    /// Command run with `sh -c`.
    pub cmd: String,

    #[serde(default)]
    pub provides: Vec<String>,

    #[serde(default)]
    pub needs: Vec<String>,

    #[serde(default)]
    pub optional: Vec<String>,

    /// Parameter axes; their cartesian product gives the variants.
    #[serde(default)]
    pub params: BTreeMap<String, Vec<ParamValue>>,

    #[serde(default)]
    pub category: TaskCategory,

    /// Task only runs when all of these components/features are enabled.
    #[serde(default)]
    pub enabled_if: Vec<String>,

    /// Variants matching all of these param values are skipped.
    #[serde(default)]
    pub exclude: BTreeMap<String, ParamValue>,
}

/// `[frontend|backend|platform|target.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentSpec {
    /// Command run with `sh -c` inside the stage output directory.
    pub cmd: String,

    /// Framework name reported by backends.
    #[serde(default)]
    pub framework: Option<String>,

    /// Extra environment variables for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// `[feature.<name>]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeatureSpec {
    /// Config entries set by this feature.
    #[serde(default)]
    pub config: BTreeMap<String, ParamValue>,
}

/// `[postprocess.<name>]` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PostprocessSpec {
    /// Per run: add `column = numerator / denominator` from two metrics.
    Ratio {
        numerator: String,
        denominator: String,
        column: String,
    },
    /// Per session: rename report columns.
    Rename { columns: BTreeMap<String, String> },
    /// Per session: drop report columns.
    Filter { drop: Vec<String> },
}
