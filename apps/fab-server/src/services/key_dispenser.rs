//! Crypto-key dispenser: keeps a key ring and a key-value database on disk
//! and fronts them with an external listener process.

use std::fs;

use fab_config::DeployConfig;

use super::{ensure_dir, ProcessSpec, ServiceError};
use crate::env::Environment;

const DEFAULT_EXECUTABLE: &str = "fab-keyd";

pub(super) fn build(
    config: &DeployConfig,
    env: &Environment,
) -> Result<Vec<ProcessSpec>, ServiceError> {
    let Some(settings) = &config.services.key_dispenser else {
        return Ok(Vec::new());
    };
    if !settings.active {
        return Ok(Vec::new());
    }
    let port = settings.port.unwrap_or_else(|| env.key_dispenser_port());

    let state_dir = env.data_dir().join("key_dispenser");
    let ring_dir = state_dir.join("ring");
    let db_dir = state_dir.join("db");
    ensure_dir(&ring_dir)?;
    ensure_dir(&db_dir)?;

    // The database file is created empty on first use and never touched
    // again here; the listener owns its contents.
    let db_file = db_dir.join("keys.db");
    if !db_file.exists() {
        fs::write(&db_file, b"")?;
    }

    let executable = settings
        .executable
        .clone()
        .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string());
    let mut spec = ProcessSpec::new("key_dispenser", executable, env.base_dir().to_path_buf());
    spec.args = vec![
        "--ring-dir".to_string(),
        ring_dir.display().to_string(),
        "--database".to_string(),
        db_file.display().to_string(),
        "--listen".to_string(),
        format!("0.0.0.0:{port}"),
    ];
    spec.port = Some(port);
    Ok(vec![spec])
}
