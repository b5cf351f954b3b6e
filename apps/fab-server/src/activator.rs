//! Configuration persistence and atomic activation.
//!
//! Configurations are stored as ordinary resources; which one is live is
//! decided by two pointer files at the base directory root, `active` and
//! `staging`, each holding a single resource name. Pointers are only ever
//! replaced by writing under a temporary name and renaming over the old
//! pointer, so a crash mid-activation leaves either the old or the new
//! pointer in place, never neither.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use fab_config::DeployConfig;
use fab_store::ResourceName;
use tracing::info;

use crate::env::Environment;
use crate::error::DomainError;

/// Resource name under which configuration text is stored.
pub const CONFIG_RESOURCE_NAME: &str = "fab.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeployState {
    NoConfig,
    Staged,
    Active,
}

impl DeployState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployState::NoConfig => "no_config",
            DeployState::Staged => "staged",
            DeployState::Active => "active",
        }
    }
}

/// Persists configuration text as a resource and returns its name.
pub fn store_config(env: &Environment, text: &str) -> Result<ResourceName, DomainError> {
    Ok(env.store().add(text.as_bytes(), CONFIG_RESOURCE_NAME, "")?)
}

fn read_pointer(path: &Path) -> Result<Option<String>, DomainError> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let trimmed = raw.trim().to_string();
            Ok((!trimmed.is_empty()).then_some(trimmed))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_pointer(env: &Environment, pointer: &Path, resource: &str) -> Result<(), DomainError> {
    let mut tmp = tempfile::NamedTempFile::new_in(env.base_dir())?;
    writeln!(tmp, "{resource}")?;
    tmp.as_file().sync_all()?;
    tmp.persist(pointer).map_err(|err| err.error)?;
    Ok(())
}

/// Repoints `active` at a fully-written resource.
pub fn activate(env: &Environment, resource: &str) -> Result<(), DomainError> {
    // The pointer must never name a blob that is not fully on disk.
    env.store().path_of(resource, true)?;
    write_pointer(env, &env.active_pointer_path(), resource)?;
    info!(target: "fab::deploy", resource, "configuration activated");
    Ok(())
}

/// Repoints `staging` at a candidate resource without touching `active`.
pub fn stage(env: &Environment, resource: &str) -> Result<(), DomainError> {
    env.store().path_of(resource, true)?;
    write_pointer(env, &env.staging_pointer_path(), resource)?;
    info!(target: "fab::deploy", resource, "configuration staged");
    Ok(())
}

pub fn clear_staging(env: &Environment) -> Result<(), DomainError> {
    match fs::remove_file(env.staging_pointer_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

pub fn active_resource(env: &Environment) -> Result<Option<String>, DomainError> {
    read_pointer(&env.active_pointer_path())
}

/// Absent staging reads as "nothing staged", not an error.
pub fn staged_resource(env: &Environment) -> Result<Option<String>, DomainError> {
    read_pointer(&env.staging_pointer_path())
}

pub fn deploy_state(env: &Environment) -> Result<DeployState, DomainError> {
    if active_resource(env)?.is_some() {
        Ok(DeployState::Active)
    } else if staged_resource(env)?.is_some() {
        Ok(DeployState::Staged)
    } else {
        Ok(DeployState::NoConfig)
    }
}

pub fn read_active_text(env: &Environment) -> Result<Option<String>, DomainError> {
    let Some(resource) = active_resource(env)? else {
        return Ok(None);
    };
    let bytes = env.store().read(&resource)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Loads and re-validates the active configuration.
pub fn load_active_config(env: &Environment) -> Result<Option<Arc<DeployConfig>>, DomainError> {
    let Some(text) = read_active_text(env)? else {
        return Ok(None);
    };
    Ok(Some(Arc::new(DeployConfig::parse(&text)?)))
}

/// Promotes the staged configuration to active and clears staging. The only
/// deploy path apart from migrations.
pub fn promote_staging(env: &Environment) -> Result<String, DomainError> {
    let staged = staged_resource(env)?.ok_or(DomainError::NothingStaged)?;
    activate(env, &staged)?;
    clear_staging(env)?;
    Ok(staged)
}
