// tests/file_lock.rs

use std::time::{Duration, Instant};

use mcuflow::context::lock::{FileLock, ReadFileLock, WriteFileLock};
use mcuflow::errors::McuflowError;
use tempfile::tempdir;

#[test]
fn file_lock_is_exclusive_until_released() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("env.lock");

    let mut first = FileLock::new(&path, Duration::from_millis(100));
    first.acquire().unwrap();
    assert!(first.is_held());
    assert!(FileLock::is_locked(&path));

    let mut second = FileLock::new(&path, Duration::from_millis(100));
    assert!(!second.try_acquire().unwrap());

    first.release().unwrap();
    assert!(!FileLock::is_locked(&path));
    assert!(second.try_acquire().unwrap());
}

#[test]
fn file_lock_times_out_naming_the_holder() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("env.lock");

    let mut holder = FileLock::new(&path, Duration::from_secs(1));
    holder.acquire().unwrap();

    let mut waiter = FileLock::new(&path, Duration::from_millis(150));
    let started = Instant::now();
    let err = waiter.acquire().unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(150));

    match &err {
        McuflowError::LockTimeout { lock, holder } => {
            assert!(lock.ends_with("env.lock"));
            assert!(holder.starts_with(&format!("pid {}", std::process::id())));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("Environment busy: lock"));
}

#[test]
fn dropping_a_file_lock_releases_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("env.lock");
    {
        let mut lock = FileLock::new(&path, Duration::from_millis(50));
        lock.acquire().unwrap();
        assert!(path.exists());
    }
    assert!(!path.exists());
}

#[test]
fn readers_share_and_exclude_writers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(".deps_lock");

    let mut r1 = ReadFileLock::new(&path);
    let mut r2 = ReadFileLock::new(&path);
    assert!(r1.acquire(false).unwrap());
    assert!(r2.acquire(false).unwrap());
    assert!(r1.is_locked().unwrap());

    let mut writer = WriteFileLock::new(&path);
    assert!(!writer.acquire(false).unwrap());
    let err = writer.acquire(true).unwrap_err();
    match err {
        McuflowError::LockTimeout { holder, .. } => assert!(holder.starts_with("read lock")),
        other => panic!("unexpected error: {other}"),
    }

    r1.release().unwrap();
    assert!(!writer.acquire(false).unwrap());
    r2.release().unwrap();
    assert!(!r2.is_locked().unwrap());
    assert!(writer.acquire(false).unwrap());
}

#[test]
fn writer_excludes_everyone() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(".deps_lock");

    let mut writer = WriteFileLock::new(&path);
    assert!(writer.acquire(true).unwrap());

    let mut reader = ReadFileLock::new(&path);
    assert!(!reader.acquire(false).unwrap());
    let mut other_writer = WriteFileLock::new(&path);
    assert!(!other_writer.acquire(false).unwrap());

    drop(writer);
    assert!(reader.acquire(false).unwrap());
}
