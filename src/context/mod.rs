// src/context/mod.rs

//! The environment context: loaded configuration, the dependency cache,
//! the dependency-directory lock and the session workspaces.
//!
//! Opening a context takes the dependency lock in the requested mode
//! (`Write` while installing, `Read` while running flows), so an install
//! never races with a running flow.

pub mod lock;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::TaskCache;
use crate::config::model::Environment;
use crate::errors::{McuflowError, Result};
use crate::session::session::{Session, SessionMeta, SESSION_META_FILE};
use crate::setup::params::Flags;
use crate::setup::shell::env_suffix;
use crate::setup::task::TaskEnv;
use crate::types::DepsLockMode;

use self::lock::{FileLock, ReadFileLock, WriteFileLock};

const SESSION_LINK_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A session directory found on disk.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub idx: usize,
    pub dir: PathBuf,
    /// `None` if `session.toml` is missing or unreadable.
    pub meta: Option<SessionMeta>,
    /// Some process holds the session open.
    pub locked: bool,
}

enum DepsLock {
    Read(ReadFileLock),
    Write(WriteFileLock),
}

impl DepsLock {
    fn release(&mut self) -> Result<()> {
        match self {
            DepsLock::Read(lock) => lock.release(),
            DepsLock::Write(lock) => lock.release(),
        }
    }
}

pub struct Context {
    env: Environment,
    cache: TaskCache,
    deps_lock: Option<DepsLock>,
}

impl Context {
    /// Create the environment directories, take the dependency lock and
    /// load the cache.
    pub fn open(env: Environment, mode: DepsLockMode) -> Result<Self> {
        for dir in [env.deps_dir(), env.sessions_dir(), env.results_dir()] {
            fs::create_dir_all(&dir)?;
        }

        let lock_path = env.home.join(".deps_lock");
        let deps_lock = match mode {
            DepsLockMode::Read => {
                let mut lock = ReadFileLock::new(lock_path);
                lock.acquire(true)?;
                DepsLock::Read(lock)
            }
            DepsLockMode::Write => {
                let mut lock = WriteFileLock::new(lock_path);
                lock.acquire(true)?;
                DepsLock::Write(lock)
            }
        };

        let cache = TaskCache::read_from_file(&env.cache_file())?;
        debug!(home = %env.home.display(), entries = cache.len(), ?mode, "context opened");
        Ok(Self {
            env,
            cache,
            deps_lock: Some(deps_lock),
        })
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The view of the environment handed to task validators and bodies.
    pub fn task_env(&self) -> TaskEnv {
        TaskEnv {
            home: self.env.home.clone(),
            deps_dir: self.env.deps_dir(),
            enabled: self
                .env
                .enabled
                .components
                .iter()
                .chain(self.env.enabled.features.iter())
                .cloned()
                .collect(),
            vars: self.env.vars.clone(),
        }
    }

    pub fn cache(&self) -> &TaskCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut TaskCache {
        &mut self.cache
    }

    pub fn save_cache(&self) -> Result<()> {
        self.cache.write_to_file(&self.env.cache_file())
    }

    /// Resolve a dependency value.
    ///
    /// Order: `MCUFLOW_<KEY>` in the process environment, `[vars]`, then
    /// the best-matching cache entry for `flags`.
    pub fn lookup(&self, key: &str, flags: &Flags) -> Result<Option<String>> {
        if let Ok(value) = std::env::var(format!("MCUFLOW_{}", env_suffix(key))) {
            return Ok(Some(value));
        }
        if let Some(value) = self.env.vars.get(key) {
            return Ok(Some(value.clone()));
        }
        Ok(self
            .cache
            .find_best_match(key, flags)?
            .map(str::to_string))
    }

    /// Indices of all session directories, ascending.
    pub fn session_indices(&self) -> Result<Vec<usize>> {
        let mut found = Vec::new();
        match fs::read_dir(self.env.sessions_dir()) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    // `latest` is a symlink; only real directories count.
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    if let Ok(idx) = entry.file_name().to_string_lossy().parse::<usize>() {
                        found.push(idx);
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        found.sort_unstable();
        Ok(found)
    }

    /// Allocate a new session directory and open it.
    ///
    /// Index allocation and the `latest` link update happen under a lock so
    /// concurrent invocations never pick the same index.
    pub fn create_session(&self, label: &str) -> Result<Session> {
        let sessions_dir = self.env.sessions_dir();
        fs::create_dir_all(&sessions_dir)?;

        let mut link_lock = FileLock::new(
            self.env.home.join(".latest_session_link_lock"),
            SESSION_LINK_LOCK_TIMEOUT,
        );
        link_lock.acquire()?;

        let idx = self
            .session_indices()?
            .last()
            .map(|max| max + 1)
            .unwrap_or(0);
        let dir = sessions_dir.join(idx.to_string());
        fs::create_dir_all(&dir)?;
        update_link(&sessions_dir.join("latest"), &idx.to_string())?;

        let mut session = Session::new(idx, label, dir, self.env.results_dir());
        let opened = session.open();
        link_lock.release()?;
        opened?;

        info!(session = idx, label, "session created");
        Ok(session)
    }

    /// Sessions on disk, newest first; at most `count` if given.
    pub fn load_recent_sessions(&self, count: Option<usize>) -> Result<Vec<SessionInfo>> {
        let sessions_dir = self.env.sessions_dir();
        let mut infos: Vec<SessionInfo> = self
            .session_indices()?
            .into_iter()
            .rev()
            .map(|idx| {
                let dir = sessions_dir.join(idx.to_string());
                SessionInfo {
                    idx,
                    meta: read_meta(&dir),
                    locked: FileLock::is_locked(&dir.join(".lock")),
                    dir,
                }
            })
            .collect();
        if let Some(count) = count {
            infos.truncate(count);
        }
        Ok(infos)
    }

    /// Delete all but the newest `keep` sessions. Sessions that are still
    /// open somewhere are left alone.
    pub fn cleanup_sessions(&self, keep: usize) -> Result<Vec<usize>> {
        let indices = self.session_indices()?;
        let excess = indices.len().saturating_sub(keep);
        let mut removed = Vec::new();
        for idx in indices.into_iter().take(excess) {
            let dir = self.env.sessions_dir().join(idx.to_string());
            if FileLock::is_locked(&dir.join(".lock")) {
                warn!(session = idx, "session is in use; not removing");
                continue;
            }
            fs::remove_dir_all(&dir)?;
            removed.push(idx);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), keep, "cleaned up old sessions");
        }
        Ok(removed)
    }

    /// Run automatic cleanup if configured and release the dependency lock.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut lock) = self.deps_lock.take() else {
            return Ok(());
        };
        let cleanup = if self.env.defaults.cleanup_auto {
            self.cleanup_sessions(self.env.defaults.cleanup_keep).map(|_| ())
        } else {
            Ok(())
        };
        lock.release()?;
        debug!(home = %self.env.home.display(), "context closed");
        cleanup
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(mut lock) = self.deps_lock.take() {
            if let Err(e) = lock.release() {
                warn!(error = %e, "failed to release dependency lock");
            }
        }
    }
}

fn read_meta(dir: &Path) -> Option<SessionMeta> {
    let text = fs::read_to_string(dir.join(SESSION_META_FILE)).ok()?;
    toml::from_str(&text).ok()
}

fn update_link(link: &Path, target: &str) -> Result<()> {
    match fs::symlink_metadata(link) {
        Ok(_) => fs::remove_file(link)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(McuflowError::Io(e)),
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(target, link)?;
    #[cfg(not(unix))]
    fs::write(link, target)?;
    Ok(())
}
