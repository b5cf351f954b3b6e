//! Shared test fixtures.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::activator;
use crate::app_state::AppState;
use crate::env::Environment;
use crate::migrations;
use crate::slots::DownloadSlots;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes tests that touch process environment variables.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A freshly migrated environment with the seeded configuration loaded and
/// a small slot table, backed by a tempdir the caller must keep alive.
pub(crate) fn seeded_state() -> (tempfile::TempDir, AppState) {
    let tmp = tempfile::tempdir().expect("create test tempdir");
    let env = Arc::new(Environment::new(tmp.path().join("fab"), 8080));
    migrations::run_pending(&env).expect("migrate test environment");
    let state = AppState::new(env, DownloadSlots::new(2, Duration::from_secs(60)));
    let config = activator::load_active_config(state.env()).expect("load seeded config");
    state.set_config(config);
    (tmp, state)
}
