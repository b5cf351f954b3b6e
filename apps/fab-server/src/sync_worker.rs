//! Cross-server sync worker.
//!
//! Runs as a child process of the server (`fab-server sync-worker`) so its
//! poll loop can never block the main server. Each cycle it reads the active
//! configuration, pushes `{board, active_bundle_id, payloads}` to every
//! configured secondary, and rewrites the status file with one entry per
//! peer.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use fab_config::DeployConfig;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::activator;
use crate::env::Environment;

const DEFAULT_INTERVAL_SECS: u64 = 600;
const PUSH_TIMEOUT_SECS: u64 = 30;

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// The state pushed to each secondary.
fn bundle_state(config: &DeployConfig) -> Value {
    json!({
        "board": config.board.clone(),
        "active_bundle_id": config.active_bundle_id.clone(),
        "payloads": config.active_bundle().map(|b| b.payloads.clone()),
        "reported_at": Utc::now().to_rfc3339(),
    })
}

fn write_status_file(path: &Path, statuses: &[Value]) -> anyhow::Result<()> {
    let parent = path.parent().context("status file has no parent")?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(serde_json::to_string_pretty(&json!({ "peers": statuses }))?.as_bytes())?;
    tmp.persist(path)?;
    Ok(())
}

async fn push_cycle(
    env: &Environment,
    client: &reqwest::Client,
    peers: &[String],
) -> Vec<Value> {
    let state = match activator::load_active_config(env) {
        Ok(Some(config)) => bundle_state(&config),
        Ok(None) => {
            warn!(target: "fab::sync", "no active configuration; nothing to push");
            return Vec::new();
        }
        Err(err) => {
            warn!(target: "fab::sync", error = %err, "cannot read active configuration");
            return Vec::new();
        }
    };

    let mut statuses = Vec::with_capacity(peers.len());
    for peer in peers {
        let url = format!("{}/admin/sync", peer.trim_end_matches('/'));
        let result = client.post(&url).json(&state).send().await;
        let (ok, detail) = match result {
            Ok(resp) if resp.status().is_success() => (true, None),
            Ok(resp) => (false, Some(format!("peer answered {}", resp.status()))),
            Err(err) => (false, Some(err.to_string())),
        };
        if let Some(detail) = &detail {
            warn!(target: "fab::sync", peer = %peer, detail, "push failed");
        }
        statuses.push(json!({
            "peer": peer,
            "ok": ok,
            "detail": detail,
            "synced_at": Utc::now().to_rfc3339(),
        }));
    }
    statuses
}

pub async fn run() -> anyhow::Result<()> {
    let base_dir = std::env::var("FAB_BASE_DIR").context("FAB_BASE_DIR not set")?;
    let base_port = std::env::var("FAB_BASE_PORT")
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(8080);
    let env = Environment::new(&base_dir, base_port);
    let peers = env_list("FAB_SYNC_PEERS");
    if peers.is_empty() {
        anyhow::bail!("FAB_SYNC_PEERS is empty");
    }
    let interval = std::env::var("FAB_SYNC_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_INTERVAL_SECS)
        .max(1);
    let status_file = std::env::var("FAB_SYNC_STATUS_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env.data_dir().join("sync/status.json"));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(PUSH_TIMEOUT_SECS))
        .build()?;
    info!(
        target: "fab::sync",
        peers = peers.len(),
        interval_secs = interval,
        "sync worker started"
    );

    loop {
        let statuses = push_cycle(&env, &client, &peers).await;
        if !statuses.is_empty() {
            if let Err(err) = write_status_file(&status_file, &statuses) {
                warn!(target: "fab::sync", error = %err, "cannot write status file");
            }
        }
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
}
