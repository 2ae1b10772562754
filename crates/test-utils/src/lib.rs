// crates/test-utils/src/lib.rs

//! Shared helpers for the `mcuflow` integration tests.
//!
//! - [`builders`]: environment files and task specs for config tests
//! - [`fakes`]: in-memory pipeline components that record the stages they
//!   ran and fail, panic or sleep on request via run config keys

pub mod builders;
pub mod fakes;

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Route `tracing` output of the library under test into the test harness.
///
/// Output is captured per test and shown only for failures. Scheduler
/// batches log from blocking threads, so the subscriber is global rather
/// than scoped to the test thread. `RUST_LOG=mcuflow=debug` shows stage
/// transitions and worker traffic.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Fail the test if `f` has not finished within 10 seconds.
///
/// Scheduler tests wrap `process()` with this so a stuck barrier or a
/// worker that never exits shows up as a failure instead of a hang.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(10), f)
        .await
        .expect("scheduler test did not finish within 10 seconds")
}
