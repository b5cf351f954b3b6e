//! Deploy: promote the staged configuration and reconcile services.
//!
//! Deploying is a single-writer operation. A compare-exchange on the
//! `deploying` flag keeps two operators from interleaving service restarts; a
//! half-applied service set is the principal failure mode this guards
//! against. Readers never take part: they keep seeing the previous
//! configuration snapshot until the pointer swap lands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fab_config::DeployConfig;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::activator;
use crate::app_state::AppState;
use crate::error::DomainError;
use crate::services::{self, RedeploySummary};

#[derive(Clone, Debug, Serialize)]
pub struct DeployOutcome {
    pub resource: String,
    pub services: RedeploySummary,
}

struct DeployGuard<'a>(&'a AtomicBool);

impl Drop for DeployGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Checks that every bundle reachable from an active ruleset (or the global
/// fallback) has its payload manifest on disk. A configuration that names a
/// missing manifest never becomes active.
fn validate_payload_resources(
    state: &AppState,
    config: &DeployConfig,
) -> Result<(), DomainError> {
    let store = state.env().store();
    let mut ids: Vec<&str> = vec![config.active_bundle_id.as_str()];
    ids.extend(
        config
            .rulesets
            .iter()
            .filter(|r| r.active)
            .map(|r| r.bundle_id.as_str()),
    );
    for id in ids {
        let bundle = config
            .bundle(id)
            .ok_or_else(|| DomainError::UnknownBundle(id.to_string()))?;
        if !store.contains(&bundle.payloads)? {
            return Err(DomainError::Store(fab_store::StoreError::NotFound(
                bundle.payloads.clone(),
            )));
        }
    }
    Ok(())
}

/// Promotes staging to active and reconciles the service set, rolling the
/// pointer back if the new service set cannot even be described.
pub async fn deploy_staged(state: &AppState) -> Result<DeployOutcome, DomainError> {
    if state
        .deploying_flag()
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(DomainError::DeployInProgress);
    }
    let _guard = DeployGuard(state.deploying_flag());

    let env = state.env();
    let staged = activator::staged_resource(env)?.ok_or(DomainError::NothingStaged)?;
    let text = String::from_utf8_lossy(&env.store().read(&staged)?).into_owned();
    let config = Arc::new(DeployConfig::parse(&text)?);
    validate_payload_resources(state, &config)?;
    // Build (and port-check) the new service set before the pointer moves;
    // an undescribable set must not unseat the running configuration.
    let specs = services::build_all(&config, env)?;

    let previous = activator::active_resource(env)?;
    activator::activate(env, &staged)?;
    state.set_config(Some(Arc::clone(&config)));

    let summary = match state.registry().redeploy(specs).await {
        Ok(summary) => summary,
        Err(err) => {
            error!(target: "fab::deploy", error = %err, "redeploy failed; rolling back");
            rollback(state, previous.as_deref()).await;
            return Err(err.into());
        }
    };
    activator::clear_staging(env)?;
    for (name, detail) in &summary.failed {
        warn!(target: "fab::deploy", service = %name, detail, "service failed during deploy");
    }
    info!(
        target: "fab::deploy",
        resource = %staged,
        started = summary.started.len(),
        stopped = summary.stopped.len(),
        unchanged = summary.unchanged.len(),
        "deploy complete"
    );
    Ok(DeployOutcome {
        resource: staged,
        services: summary,
    })
}

async fn rollback(state: &AppState, previous: Option<&str>) {
    let env = state.env();
    let Some(previous) = previous else {
        state.set_config(None);
        return;
    };
    if let Err(err) = activator::activate(env, previous) {
        error!(target: "fab::deploy", error = %err, "rollback activation failed");
        return;
    }
    match activator::load_active_config(env) {
        Ok(config) => {
            if let Some(config) = &config {
                match services::build_all(config, env) {
                    Ok(specs) => {
                        if let Err(err) = state.registry().redeploy(specs).await {
                            error!(target: "fab::deploy", error = %err, "rollback redeploy failed");
                        }
                    }
                    Err(err) => {
                        error!(target: "fab::deploy", error = %err, "rollback rebuild failed")
                    }
                }
            }
            state.set_config(config);
            info!(target: "fab::deploy", resource = previous, "rolled back to previous configuration");
        }
        Err(err) => error!(target: "fab::deploy", error = %err, "rollback reload failed"),
    }
}

/// Startup reconciliation: load whatever is active and bring services up.
/// A service that cannot launch is that service's problem, not the server's.
pub async fn reconcile_on_startup(state: &AppState) -> Result<(), DomainError> {
    let env = state.env();
    let Some(config) = activator::load_active_config(env)? else {
        warn!(target: "fab::deploy", "no active configuration at startup");
        return Ok(());
    };
    // The snapshot goes live first: devices keep resolving bundles even if
    // every auxiliary service turns out to be unlaunchable.
    state.set_config(Some(Arc::clone(&config)));
    let specs = match services::build_all(&config, env) {
        Ok(specs) => specs,
        Err(err) => {
            error!(target: "fab::deploy", error = %err, "active service set is undescribable");
            return Ok(());
        }
    };
    let summary = state.registry().redeploy(specs).await?;
    for (name, detail) in &summary.failed {
        warn!(target: "fab::deploy", service = %name, detail, "service failed at startup");
    }
    info!(
        target: "fab::deploy",
        started = summary.started.len(),
        "startup reconciliation complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn staged_state() -> (tempfile::TempDir, AppState) {
        let (tmp, state) = crate::test_support::seeded_state();
        let env = state.env();
        let manifest = env.store().add(b"{}", "payload.json", "").unwrap();
        let raw = json!({
            "bundles": [{"id": "b1", "note": "", "payloads": manifest.to_string()}],
            "rulesets": [],
            "active_bundle_id": "b1",
            "services": {}
        });
        let config = DeployConfig::parse(&raw.to_string()).unwrap();
        let resource = activator::store_config(env, &config.to_canonical_string()).unwrap();
        activator::stage(env, &resource.to_string()).unwrap();
        (tmp, state)
    }

    #[tokio::test]
    async fn deploy_promotes_staging_and_swaps_snapshot() {
        let (_tmp, state) = staged_state();
        let outcome = deploy_staged(&state).await.unwrap();

        let env = state.env();
        assert_eq!(
            activator::active_resource(env).unwrap().as_deref(),
            Some(outcome.resource.as_str())
        );
        assert!(activator::staged_resource(env).unwrap().is_none());
        assert_eq!(state.config().unwrap().active_bundle_id, "b1");
    }

    #[tokio::test]
    async fn deploy_without_staging_fails_cleanly() {
        let (_tmp, state) = crate::test_support::seeded_state();
        let before = activator::active_resource(state.env()).unwrap();
        let err = deploy_staged(&state).await.unwrap_err();
        assert!(matches!(err, DomainError::NothingStaged));
        assert_eq!(activator::active_resource(state.env()).unwrap(), before);
    }

    #[tokio::test]
    async fn contended_deploy_is_rejected() {
        let (_tmp, state) = staged_state();
        state
            .deploying_flag()
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = deploy_staged(&state).await.unwrap_err();
        assert!(matches!(err, DomainError::DeployInProgress));
        state
            .deploying_flag()
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    #[tokio::test]
    async fn invalid_staged_config_never_activates() {
        let (_tmp, state) = crate::test_support::seeded_state();
        let env = state.env();
        let before = activator::active_resource(env).unwrap();

        // Dangling active_bundle_id: schema-valid JSON, invalid semantics.
        let bad = json!({
            "bundles": [],
            "rulesets": [],
            "active_bundle_id": "ghost",
            "services": {}
        });
        let resource = activator::store_config(env, &bad.to_string()).unwrap();
        activator::stage(env, &resource.to_string()).unwrap();

        let err = deploy_staged(&state).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidConfig(_)));
        // The previously active configuration keeps serving.
        assert_eq!(activator::active_resource(env).unwrap(), before);
        assert!(!state.is_deploying());
    }

    #[tokio::test]
    async fn missing_payload_manifest_blocks_deploy() {
        let (_tmp, state) = crate::test_support::seeded_state();
        let env = state.env();
        let raw = json!({
            "bundles": [{"id": "b1", "note": "", "payloads": "gone.json##e3b0c442"}],
            "rulesets": [],
            "active_bundle_id": "b1",
            "services": {}
        });
        let resource = activator::store_config(env, &raw.to_string()).unwrap();
        activator::stage(env, &resource.to_string()).unwrap();

        let err = deploy_staged(&state).await.unwrap_err();
        assert!(matches!(
            err,
            DomainError::Store(fab_store::StoreError::NotFound(_))
        ));
    }
}
