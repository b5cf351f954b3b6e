//! Payload manifests and the external payload tool.
//!
//! A bundle's `payloads` field names a manifest resource: JSON mapping a
//! payload kind to at least `{file, version}`. Manifests are produced by an
//! external archive-installer tool and only ever read here; exporting a
//! payload to a destination path shells out to the same tool.

use std::path::Path;
use std::process::Stdio;

use fab_config::DeployConfig;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::env::Environment;
use crate::error::DomainError;

/// Payload kinds a manifest may carry.
pub const PAYLOAD_KINDS: &[&str] = &[
    "toolkit",
    "firmware",
    "hwid",
    "rootfs_test",
    "rootfs_release",
    "netboot",
];

fn payload_tool() -> String {
    std::env::var("FAB_PAYLOAD_TOOL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "fab-payload".to_string())
}

/// Reads the payload manifest referenced by `bundle_id`.
pub fn manifest_for_bundle(
    env: &Environment,
    config: &DeployConfig,
    bundle_id: &str,
) -> Result<Value, DomainError> {
    let bundle = config
        .bundle(bundle_id)
        .ok_or_else(|| DomainError::UnknownBundle(bundle_id.to_string()))?;
    let bytes = env.store().read(&bundle.payloads)?;
    let manifest: Value = serde_json::from_slice(&bytes)
        .map_err(|err| DomainError::PayloadTool(format!("manifest is not JSON: {err}")))?;
    Ok(manifest)
}

/// Materializes one payload of one bundle at `dest` via the external tool.
pub async fn export_payload(
    env: &Environment,
    config: &DeployConfig,
    bundle_id: &str,
    kind: &str,
    dest: &Path,
) -> Result<String, DomainError> {
    if !PAYLOAD_KINDS.contains(&kind) {
        return Err(DomainError::UnknownPayloadKind(kind.to_string()));
    }
    let bundle = config
        .bundle(bundle_id)
        .ok_or_else(|| DomainError::UnknownBundle(bundle_id.to_string()))?;
    let manifest = manifest_for_bundle(env, config, bundle_id)?;
    let entry = manifest
        .get(kind)
        .ok_or_else(|| DomainError::UnknownPayloadKind(kind.to_string()))?;
    let resource = entry
        .get("file")
        .and_then(Value::as_str)
        .ok_or_else(|| DomainError::PayloadTool(format!("manifest entry `{kind}` has no file")))?;
    // Resolved up front so a missing blob fails as NotFound before the tool runs.
    let resource_path = env.store().path_of(resource, true)?;
    let manifest_path = env.store().path_of(&bundle.payloads, true)?;
    let tool = payload_tool();
    debug!(
        target: "fab::payload",
        %tool, bundle = bundle_id, kind, dest = %dest.display(),
        "exporting payload"
    );
    let output = Command::new(&tool)
        .arg("install")
        .arg(&manifest_path)
        .arg(dest)
        .arg(kind)
        .current_dir(env.base_dir())
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| DomainError::PayloadTool(format!("spawn `{tool}`: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DomainError::PayloadTool(format!(
            "`{tool} install` exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    info!(
        target: "fab::payload",
        bundle = bundle_id, kind, resource = %resource_path.display(),
        "payload exported"
    );
    Ok(resource.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn env_with_manifest() -> (tempfile::TempDir, Environment, DeployConfig) {
        let tmp = tempdir().unwrap();
        let env = Environment::new(tmp.path().join("fab"), 8080);
        env.ensure_layout().unwrap();

        let blob = env.store().add(b"toolkit bits", "toolkit.tar", "1.0").unwrap();
        let manifest = json!({
            "toolkit": {"file": blob.to_string(), "version": "1.0"}
        });
        let manifest_res = env
            .store()
            .add(manifest.to_string().as_bytes(), "payload.json", "")
            .unwrap();

        let raw = json!({
            "bundles": [{"id": "b1", "note": "", "payloads": manifest_res.to_string()}],
            "rulesets": [],
            "active_bundle_id": "b1",
            "services": {}
        });
        let config = DeployConfig::parse(&raw.to_string()).unwrap();
        (tmp, env, config)
    }

    #[test]
    fn manifest_resolves_through_bundle() {
        let (_tmp, env, config) = env_with_manifest();
        let manifest = manifest_for_bundle(&env, &config, "b1").unwrap();
        assert!(manifest.get("toolkit").is_some());
    }

    #[test]
    fn unknown_bundle_is_reported_by_name() {
        let (_tmp, env, config) = env_with_manifest();
        let err = manifest_for_bundle(&env, &config, "b9").unwrap_err();
        assert!(matches!(err, DomainError::UnknownBundle(id) if id == "b9"));
    }

    #[tokio::test]
    async fn export_rejects_unknown_payload_kind() {
        let (tmp, env, config) = env_with_manifest();
        let err = export_payload(&env, &config, "b1", "karaoke", tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::UnknownPayloadKind(kind) if kind == "karaoke"));

        // Known kind, absent from this bundle's manifest.
        let err = export_payload(&env, &config, "b1", "firmware", tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::UnknownPayloadKind(kind) if kind == "firmware"));
    }

    #[tokio::test]
    async fn export_runs_the_configured_tool() {
        let (tmp, env, config) = env_with_manifest();
        let _env_guard = crate::test_support::env_lock();
        // `true` accepts any arguments and exits 0.
        std::env::set_var("FAB_PAYLOAD_TOOL", "true");
        let dest = tmp.path().join("out.tar");
        let result = export_payload(&env, &config, "b1", "toolkit", &dest).await;
        std::env::remove_var("FAB_PAYLOAD_TOOL");
        assert!(result.unwrap().starts_with("toolkit.tar#1.0#"));
    }
}
