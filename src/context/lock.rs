// src/context/lock.rs

//! Cooperative file locks for environment directories.
//!
//! - [`FileLock`] is an exclusive lock represented by a lock file created
//!   with `create_new`; acquisition retries until a timeout and then fails
//!   with [`McuflowError::LockTimeout`] naming the current holder.
//! - [`ReadFileLock`] / [`WriteFileLock`] share a track file listing every
//!   holder. Readers exclude writers, writers exclude everyone. The track
//!   file is only touched while holding a short-lived [`FileLock`].

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{McuflowError, Result};

/// Timeout of the inner lock guarding a read/write track file.
pub const TRACK_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive lock file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    held: bool,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
            held: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Whether any process currently holds the lock at `path`.
    pub fn is_locked(path: &Path) -> bool {
        path.exists()
    }

    /// Block until acquired or the timeout elapses.
    pub fn acquire(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.try_acquire()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let holder = fs::read_to_string(&self.path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                return Err(McuflowError::LockTimeout {
                    lock: self.path.display().to_string(),
                    holder,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                writeln!(file, "pid {} since {}", std::process::id(), Utc::now().to_rfc3339())?;
                self.held = true;
                debug!(lock = %self.path.display(), "acquired file lock");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(lock = %self.path.display(), "released file lock");
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(lock = %self.path.display(), error = %e, "failed to release file lock");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Read,
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Read => f.write_str("read"),
            LockKind::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HolderEntry {
    kind: LockKind,
    time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TrackFile {
    #[serde(default)]
    holders: BTreeMap<String, HolderEntry>,
}

/// Shared implementation of the read and write locks.
#[derive(Debug)]
struct RwFileLock {
    /// The guarded path; the track file and inner lock live next to it.
    path: PathBuf,
    kind: LockKind,
    id: Uuid,
    held: bool,
}

impl RwFileLock {
    fn new(path: impl Into<PathBuf>, kind: LockKind) -> Self {
        Self {
            path: path.into(),
            kind,
            id: Uuid::new_v4(),
            held: false,
        }
    }

    fn track_path(&self) -> PathBuf {
        sibling(&self.path, "_track")
    }

    fn inner_lock(&self) -> FileLock {
        FileLock::new(sibling(&self.path, ".lock"), TRACK_LOCK_TIMEOUT)
    }

    fn read_track(&self) -> Result<TrackFile> {
        let path = self.track_path();
        if !path.exists() {
            return Ok(TrackFile::default());
        }
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    fn write_track(&self, track: &TrackFile) -> Result<()> {
        let path = self.track_path();
        if track.holders.is_empty() {
            if path.exists() {
                fs::remove_file(path)?;
            }
            return Ok(());
        }
        let text = toml::to_string(track).map_err(|e| McuflowError::Other(e.into()))?;
        fs::write(path, text)?;
        Ok(())
    }

    fn acquire(&mut self, raise_exception: bool) -> Result<bool> {
        if self.held {
            return Ok(true);
        }
        let mut inner = self.inner_lock();
        inner.acquire()?;

        let mut track = self.read_track()?;
        let conflict = track.holders.iter().find(|(_, entry)| match self.kind {
            LockKind::Read => entry.kind == LockKind::Write,
            LockKind::Write => true,
        });

        if let Some((id, entry)) = conflict {
            let holder = format!("{} lock {} since {}", entry.kind, id, entry.time.to_rfc3339());
            debug!(lock = %self.path.display(), kind = %self.kind, %holder, "lock busy");
            if raise_exception {
                return Err(McuflowError::LockTimeout {
                    lock: self.path.display().to_string(),
                    holder,
                });
            }
            return Ok(false);
        }

        track.holders.insert(
            self.id.to_string(),
            HolderEntry {
                kind: self.kind,
                time: Utc::now(),
            },
        );
        self.write_track(&track)?;
        inner.release()?;
        self.held = true;
        debug!(lock = %self.path.display(), kind = %self.kind, id = %self.id, "acquired");
        Ok(true)
    }

    fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        let mut inner = self.inner_lock();
        inner.acquire()?;
        let mut track = self.read_track()?;
        track.holders.remove(&self.id.to_string());
        self.write_track(&track)?;
        inner.release()?;
        self.held = false;
        debug!(lock = %self.path.display(), kind = %self.kind, id = %self.id, "released");
        Ok(())
    }

    fn is_locked(&self) -> Result<bool> {
        Ok(!self.read_track()?.holders.is_empty())
    }
}

impl Drop for RwFileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Shared lock: many readers, no writers.
#[derive(Debug)]
pub struct ReadFileLock(RwFileLock);

impl ReadFileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(RwFileLock::new(path, LockKind::Read))
    }

    /// Returns `Ok(false)` when busy, or the timeout error with
    /// `raise_exception`.
    pub fn acquire(&mut self, raise_exception: bool) -> Result<bool> {
        self.0.acquire(raise_exception)
    }

    pub fn release(&mut self) -> Result<()> {
        self.0.release()
    }

    pub fn is_locked(&self) -> Result<bool> {
        self.0.is_locked()
    }
}

/// Exclusive lock: no other readers or writers.
#[derive(Debug)]
pub struct WriteFileLock(RwFileLock);

impl WriteFileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(RwFileLock::new(path, LockKind::Write))
    }

    pub fn acquire(&mut self, raise_exception: bool) -> Result<bool> {
        self.0.acquire(raise_exception)
    }

    pub fn release(&mut self) -> Result<()> {
        self.0.release()
    }

    pub fn is_locked(&self) -> Result<bool> {
        self.0.is_locked()
    }
}
