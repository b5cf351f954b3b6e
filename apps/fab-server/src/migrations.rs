//! On-disk layout and schema migrations.
//!
//! One ordered table of `(version, step)` pairs; versions are sparse because
//! some releases change nothing on disk. The highest applied version lives in
//! an explicit marker file, never inferred from directory contents. The whole
//! chain runs single-threaded at startup, before any socket binds, and a
//! failing step aborts startup: there is no partial-recovery path, operators
//! restore from backup.
//!
//! Steps manipulate configuration as raw JSON. Intermediate shapes predate
//! the current schema, so the typed model only has to parse the output of the
//! final step.

use std::fs;
use std::io::Write as _;

use serde_json::{json, Value};
use tracing::info;

use crate::activator;
use crate::env::Environment;

pub type MigrationFn = fn(&Environment) -> Result<(), MigrateError>;

pub const MIGRATIONS: &[(u32, MigrationFn)] = &[
    (0, seed_environment),
    (3, canonicalize_active_config),
    (4, nest_service_keys),
    (6, relocate_key_dispenser_state),
    (7, split_log_buffer_consumers),
    (8, pointerize_staging_copy),
    (13, single_active_bundle),
    (14, drop_upload_override),
];

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] fab_store::StoreError),
    #[error("bad configuration json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Deploy(String),
    #[error("bad migration marker: {0}")]
    BadMarker(String),
}

impl From<crate::error::DomainError> for MigrateError {
    fn from(err: crate::error::DomainError) -> Self {
        MigrateError::Deploy(err.to_string())
    }
}

pub fn last_applied(env: &Environment) -> Result<Option<u32>, MigrateError> {
    match fs::read_to_string(env.migration_marker_path()) {
        Ok(raw) => {
            let trimmed = raw.trim();
            trimmed
                .parse::<u32>()
                .map(Some)
                .map_err(|_| MigrateError::BadMarker(trimmed.to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn record_applied(env: &Environment, version: u32) -> Result<(), MigrateError> {
    let mut tmp = tempfile::NamedTempFile::new_in(env.base_dir())?;
    writeln!(tmp, "{version}")?;
    tmp.as_file().sync_all()?;
    tmp.persist(env.migration_marker_path())
        .map_err(|err| MigrateError::Io(err.error))?;
    Ok(())
}

/// Applies every migration newer than the marker, strictly ascending, each
/// exactly once. Returns how many steps ran.
pub fn run_pending(env: &Environment) -> Result<u32, MigrateError> {
    env.ensure_layout()?;
    let marker = last_applied(env)?;
    let mut applied = 0;
    for (version, step) in MIGRATIONS {
        if marker.is_some_and(|m| m >= *version) {
            continue;
        }
        info!(target: "fab::migrate", version, "applying migration");
        step(env)?;
        record_applied(env, *version)?;
        applied += 1;
    }
    if applied > 0 {
        info!(target: "fab::migrate", applied, "environment migrated");
    }
    Ok(applied)
}

fn active_value(env: &Environment) -> Result<Option<Value>, MigrateError> {
    let Some(text) = activator::read_active_text(env)? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(&text)?))
}

fn write_active_value(env: &Environment, value: &Value) -> Result<(), MigrateError> {
    let text = fab_config::canonical_value_string(value);
    let resource = activator::store_config(env, &text)?;
    activator::activate(env, &resource.to_string())?;
    Ok(())
}

/// 0: seed the directory skeleton, an empty payload manifest, and an initial
/// configuration pointing at a placeholder bundle.
fn seed_environment(env: &Environment) -> Result<(), MigrateError> {
    env.ensure_layout()?;
    if activator::active_resource(env)?.is_some() {
        // An environment that predates the marker is already seeded.
        return Ok(());
    }
    let manifest = env.store().add(b"{}", "payload.json", "")?;
    let initial = json!({
        "bundles": [
            {"id": "empty", "note": "seeded empty bundle", "payloads": manifest.to_string()}
        ],
        "rulesets": [],
        "active_bundle_id": "empty",
        "services": {}
    });
    write_active_value(env, &initial)
}

/// 3: re-encode the active configuration canonically and re-home its
/// resource and pointer.
fn canonicalize_active_config(env: &Environment) -> Result<(), MigrateError> {
    let Some(value) = active_value(env)? else {
        return Ok(());
    };
    let current = activator::read_active_text(env)?.unwrap_or_default();
    if current != fab_config::canonical_value_string(&value) {
        write_active_value(env, &value)?;
    }
    Ok(())
}

/// 4: relocate legacy flat keys into the nested `services` mapping.
fn nest_service_keys(env: &Environment) -> Result<(), MigrateError> {
    let Some(mut value) = active_value(env)? else {
        return Ok(());
    };
    let Some(obj) = value.as_object_mut() else {
        return Ok(());
    };
    let rules = obj.remove("proxy_rules");
    let port = obj.remove("rsync_port");
    if rules.is_none() && port.is_none() {
        return Ok(());
    }
    let services = obj
        .entry("services")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| MigrateError::Deploy("`services` is not an object".to_string()))?;
    if let Some(rules) = rules {
        services.insert(
            "http_proxy".to_string(),
            json!({"active": true, "rules": rules}),
        );
    }
    if let Some(port) = port {
        let transfer = services
            .entry("file_transfer")
            .or_insert_with(|| json!({}));
        if let Some(transfer) = transfer.as_object_mut() {
            transfer.insert("port".to_string(), port);
        }
    }
    write_active_value(env, &value)
}

/// 6: move key-dispenser state from the legacy top-level directory into the
/// mutable-data tree.
fn relocate_key_dispenser_state(env: &Environment) -> Result<(), MigrateError> {
    let legacy = env.base_dir().join("dkps");
    let target = env.data_dir().join("key_dispenser");
    if legacy.is_dir() && !target.exists() {
        fs::create_dir_all(env.data_dir())?;
        fs::rename(&legacy, &target)?;
    }
    Ok(())
}

/// 7: split the flat log buffer into per-consumer subdirectories.
fn split_log_buffer_consumers(env: &Environment) -> Result<(), MigrateError> {
    let buffer_dir = env.data_dir().join("log_buffer");
    if !buffer_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&buffer_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "log") {
            continue;
        }
        let Some(consumer) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let consumer_dir = buffer_dir.join(consumer);
        fs::create_dir_all(&consumer_dir)?;
        fs::rename(&path, consumer_dir.join("buffer.log"))?;
    }
    Ok(())
}

/// 8: replace the legacy full staging copy with a staging pointer.
fn pointerize_staging_copy(env: &Environment) -> Result<(), MigrateError> {
    let legacy = env.base_dir().join("staging_fab.json");
    if !legacy.is_file() {
        return Ok(());
    }
    let content = fs::read_to_string(&legacy)?;
    let resource = activator::store_config(env, &content)?;
    activator::stage(env, &resource.to_string())?;
    fs::remove_file(&legacy)?;
    Ok(())
}

/// 13: collapse per-bundle boolean `active` flags into one
/// `active_bundle_id`. The first flagged bundle wins.
fn single_active_bundle(env: &Environment) -> Result<(), MigrateError> {
    let Some(mut value) = active_value(env)? else {
        return Ok(());
    };
    let Some(bundles) = value.get_mut("bundles").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    let had_flags = bundles.iter().any(|b| b.get("active").is_some());
    if !had_flags {
        return Ok(());
    }
    let chosen = bundles
        .iter()
        .find(|b| b.get("active").and_then(Value::as_bool) == Some(true))
        .or_else(|| bundles.first())
        .and_then(|b| b.get("id"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    for bundle in bundles.iter_mut() {
        if let Some(obj) = bundle.as_object_mut() {
            obj.remove("active");
        }
    }
    if let (Some(id), Some(obj)) = (chosen, value.as_object_mut()) {
        obj.insert("active_bundle_id".to_string(), Value::String(id));
    }
    write_active_value(env, &value)
}

/// 14: drop the deprecated per-config `upload` override from the
/// file-transfer section; the daemon always derives the upload path now.
fn drop_upload_override(env: &Environment) -> Result<(), MigrateError> {
    let Some(mut value) = active_value(env)? else {
        return Ok(());
    };
    let removed = value
        .get_mut("services")
        .and_then(|s| s.get_mut("file_transfer"))
        .and_then(Value::as_object_mut)
        .and_then(|transfer| transfer.remove("upload"))
        .is_some();
    if removed {
        write_active_value(env, &value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fab_config::DeployConfig;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_env() -> (tempfile::TempDir, Environment) {
        let tmp = tempdir().unwrap();
        let env = Environment::new(tmp.path().join("fab"), 8080);
        (tmp, env)
    }

    #[test]
    fn fresh_environment_runs_the_full_chain_once() {
        let (_tmp, env) = test_env();
        let applied = run_pending(&env).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(last_applied(&env).unwrap(), Some(14));

        // The seeded config parses under the current schema and carries a
        // single active_bundle_id.
        let text = activator::read_active_text(&env).unwrap().unwrap();
        let config = DeployConfig::parse(&text).unwrap();
        assert_eq!(config.active_bundle_id, "empty");

        // Second run applies nothing.
        assert_eq!(run_pending(&env).unwrap(), 0);
    }

    #[test]
    fn legacy_environment_is_fully_modernized() {
        let (_tmp, env) = test_env();
        env.ensure_layout().unwrap();

        let manifest = env.store().add(b"{}", "payload.json", "").unwrap();
        let legacy = json!({
            "board": "spring",
            "bundles": [
                {"id": "b1", "note": "", "payloads": manifest.to_string(), "active": false},
                {"id": "b2", "note": "", "payloads": manifest.to_string(), "active": true}
            ],
            "rulesets": [
                {"bundle_id": "b2", "note": "", "active": true}
            ],
            "proxy_rules": [{"path": "/shopfloor/", "upstream": "http://10.0.0.5:9090/"}],
            "rsync_port": 9999,
            "services": {
                "file_transfer": {"active": true, "upload": "/old/upload"}
            }
        });
        // Active pointer at a non-canonical resource, plus legacy droppings.
        let resource = activator::store_config(&env, &legacy.to_string()).unwrap();
        activator::activate(&env, &resource.to_string()).unwrap();
        fs::write(env.base_dir().join("staging_fab.json"), legacy.to_string()).unwrap();
        fs::create_dir_all(env.base_dir().join("dkps")).unwrap();
        fs::write(env.base_dir().join("dkps/keyring"), b"ring").unwrap();
        fs::create_dir_all(env.data_dir().join("log_buffer")).unwrap();
        fs::write(env.data_dir().join("log_buffer/shipper.log"), b"entries").unwrap();

        run_pending(&env).unwrap();

        let text = activator::read_active_text(&env).unwrap().unwrap();
        let config = DeployConfig::parse(&text).unwrap();
        assert_eq!(config.active_bundle_id, "b2");
        assert_eq!(config.board.as_deref(), Some("spring"));
        let proxy = config.services.http_proxy.as_ref().unwrap();
        assert_eq!(proxy.rules.len(), 1);
        let transfer = config.services.file_transfer.as_ref().unwrap();
        assert_eq!(transfer.port, Some(9999));

        // No per-bundle active flags survive in the raw text either.
        let raw: Value = serde_json::from_str(&text).unwrap();
        for bundle in raw["bundles"].as_array().unwrap() {
            assert!(bundle.get("active").is_none());
        }
        assert!(raw["services"]["file_transfer"].get("upload").is_none());

        assert!(activator::staged_resource(&env).unwrap().is_some());
        assert!(!env.base_dir().join("staging_fab.json").exists());
        assert!(env.data_dir().join("key_dispenser/keyring").is_file());
        assert!(env.data_dir().join("log_buffer/shipper/buffer.log").is_file());
        assert_eq!(last_applied(&env).unwrap(), Some(14));
    }

    #[test]
    fn marker_prevents_reapplication_mid_chain() {
        let (_tmp, env) = test_env();
        env.ensure_layout().unwrap();
        record_applied(&env, 8).unwrap();

        // Only 13 and 14 remain; with no active config they are no-ops.
        let applied = run_pending(&env).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(last_applied(&env).unwrap(), Some(14));
        assert!(activator::active_resource(&env).unwrap().is_none());
    }

    #[test]
    fn corrupt_marker_aborts_startup() {
        let (_tmp, env) = test_env();
        env.ensure_layout().unwrap();
        fs::write(env.migration_marker_path(), "not-a-number").unwrap();
        assert!(matches!(
            run_pending(&env).unwrap_err(),
            MigrateError::BadMarker(_)
        ));
    }
}
