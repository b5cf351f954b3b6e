//! Cross-server sync: re-executes this binary in `sync-worker` mode as a
//! supervised child that pushes bundle state to each secondary on a fixed
//! interval and records per-peer status under `data/sync/`.

use fab_config::DeployConfig;

use super::{ensure_dir, ProcessSpec, ServiceError};
use crate::env::Environment;

const DEFAULT_INTERVAL_SECS: u64 = 600;

pub(super) fn build(
    config: &DeployConfig,
    env: &Environment,
) -> Result<Vec<ProcessSpec>, ServiceError> {
    let Some(settings) = &config.services.peer_sync else {
        return Ok(Vec::new());
    };
    if !settings.active {
        return Ok(Vec::new());
    }
    if settings.peers.is_empty() {
        return Err(ServiceError::BadSettings {
            service: "peer_sync".to_string(),
            reason: "active but no peers configured".to_string(),
        });
    }
    let sync_dir = env.data_dir().join("sync");
    ensure_dir(&sync_dir)?;

    let executable = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "fab-server".to_string());
    let interval = settings.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);

    let mut spec = ProcessSpec::new("peer_sync", executable, env.base_dir().to_path_buf());
    spec.args = vec!["sync-worker".to_string()];
    spec.env.insert(
        "FAB_BASE_DIR".to_string(),
        env.base_dir().display().to_string(),
    );
    spec.env
        .insert("FAB_SYNC_PEERS".to_string(), settings.peers.join(","));
    spec.env
        .insert("FAB_SYNC_INTERVAL_SECS".to_string(), interval.to_string());
    spec.env.insert(
        "FAB_SYNC_STATUS_FILE".to_string(),
        sync_dir.join("status.json").display().to_string(),
    );
    Ok(vec![spec])
}
