//! Declarative service descriptors and the builders that produce them.
//!
//! Each auxiliary daemon a deployment depends on is one `ServiceKind`; a kind
//! turns the active configuration into zero or more `ProcessSpec`s. Specs are
//! plain data, comparable across deploys, so the registry can tell changed
//! services from untouched ones. No two specs may claim the same port; a
//! conflict rejects the whole set before anything is spawned.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fab_config::DeployConfig;

use crate::env::Environment;

mod file_transfer;
mod http_proxy;
mod key_dispenser;
mod peer_sync;
pub mod registry;

pub use registry::{RedeploySummary, ServiceRegistry, ServiceState, ServiceStatus};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("port {port} claimed by both `{first}` and `{second}`")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },
    #[error("service `{service}`: {reason}")]
    BadSettings { service: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One supervised OS process, fully described.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Port the process binds, if any; feeds the pre-spawn conflict check.
    pub port: Option<u16>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, executable: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            args: Vec::new(),
            working_dir,
            env: BTreeMap::new(),
            port: None,
        }
    }
}

/// The closed set of service kinds this server supervises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    HttpProxy,
    FileTransfer,
    KeyDispenser,
    PeerSync,
}

impl ServiceKind {
    pub const ALL: &'static [ServiceKind] = &[
        ServiceKind::HttpProxy,
        ServiceKind::FileTransfer,
        ServiceKind::KeyDispenser,
        ServiceKind::PeerSync,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::HttpProxy => "http_proxy",
            ServiceKind::FileTransfer => "file_transfer",
            ServiceKind::KeyDispenser => "key_dispenser",
            ServiceKind::PeerSync => "peer_sync",
        }
    }

    /// Builds the processes this kind needs under `config`. An inactive or
    /// absent service section builds nothing.
    pub fn build_processes(
        self,
        config: &DeployConfig,
        env: &Environment,
    ) -> Result<Vec<ProcessSpec>, ServiceError> {
        match self {
            ServiceKind::HttpProxy => http_proxy::build(config, env),
            ServiceKind::FileTransfer => file_transfer::build(config, env),
            ServiceKind::KeyDispenser => key_dispenser::build(config, env),
            ServiceKind::PeerSync => peer_sync::build(config, env),
        }
    }
}

/// Builds every kind's processes and rejects duplicate port claims.
pub fn build_all(
    config: &DeployConfig,
    env: &Environment,
) -> Result<Vec<ProcessSpec>, ServiceError> {
    let mut specs = Vec::new();
    for kind in ServiceKind::ALL {
        specs.extend(kind.build_processes(config, env)?);
    }
    check_port_conflicts(&specs)?;
    Ok(specs)
}

pub fn check_port_conflicts(specs: &[ProcessSpec]) -> Result<(), ServiceError> {
    let mut claimed: HashMap<u16, &str> = HashMap::new();
    for spec in specs {
        let Some(port) = spec.port else { continue };
        if let Some(first) = claimed.insert(port, &spec.name) {
            return Err(ServiceError::PortConflict {
                port,
                first: first.to_string(),
                second: spec.name.clone(),
            });
        }
    }
    Ok(())
}

/// Writes a generated config file under `conf/`, atomically.
fn write_conf(env: &Environment, file_name: &str, contents: &str) -> Result<PathBuf, ServiceError> {
    let path = env.conf_dir().join(file_name);
    let mut tmp = tempfile::NamedTempFile::new_in(env.conf_dir())?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(&path).map_err(|err| err.error)?;
    Ok(path)
}

fn ensure_dir(path: &Path) -> Result<(), ServiceError> {
    fs::create_dir_all(path)?;
    Ok(())
}
