//! Process-wide environment: the base directory, its derived subdirectories,
//! the activation pointers, and the port plan.
//!
//! One `Environment` is constructed at server start and passed by reference
//! to every component; nothing in the server reaches for hidden globals.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use fab_store::ResourceStore;
use tracing::info;

const DEFAULT_BASE_DIR: &str = "/var/lib/fab";
const DEFAULT_BASE_PORT: u16 = 8080;

const RESOURCES_DIR: &str = "resources";
const CONF_DIR: &str = "conf";
const LOG_DIR: &str = "log";
const RUN_DIR: &str = "run";
const DATA_DIR: &str = "data";

const ACTIVE_POINTER: &str = "active";
const STAGING_POINTER: &str = "staging";
const MIGRATION_MARKER: &str = ".migration-version";

// Auxiliary services bind at fixed offsets from the base port so a whole
// server instance relocates by changing one number.
const PROXY_PORT_OFFSET: u16 = 1;
const FILE_TRANSFER_PORT_OFFSET: u16 = 4;
const KEY_DISPENSER_PORT_OFFSET: u16 = 6;

#[derive(Debug)]
pub struct Environment {
    base_dir: PathBuf,
    base_port: u16,
}

impl Environment {
    pub fn new(base_dir: impl Into<PathBuf>, base_port: u16) -> Self {
        Self {
            base_dir: base_dir.into(),
            base_port,
        }
    }

    pub fn from_env() -> Self {
        let base_dir = std::env::var("FAB_BASE_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_DIR.to_string());
        let base_port = std::env::var("FAB_BASE_PORT")
            .ok()
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_BASE_PORT);
        let env = Self::new(base_dir, base_port);
        info!(
            target: "fab::env",
            base_dir = %env.base_dir.display(),
            base_port = env.base_port,
            "resolved environment"
        );
        env
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.base_dir.join(RESOURCES_DIR)
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.base_dir.join(CONF_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join(LOG_DIR)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base_dir.join(RUN_DIR)
    }

    /// Mutable service-owned state (key-dispenser database, sync status,
    /// upload spool, log buffers).
    pub fn data_dir(&self) -> PathBuf {
        self.base_dir.join(DATA_DIR)
    }

    pub fn active_pointer_path(&self) -> PathBuf {
        self.base_dir.join(ACTIVE_POINTER)
    }

    pub fn staging_pointer_path(&self) -> PathBuf {
        self.base_dir.join(STAGING_POINTER)
    }

    pub fn migration_marker_path(&self) -> PathBuf {
        self.base_dir.join(MIGRATION_MARKER)
    }

    pub fn store(&self) -> ResourceStore {
        ResourceStore::new(self.resources_dir())
    }

    pub fn proxy_port(&self) -> u16 {
        self.base_port + PROXY_PORT_OFFSET
    }

    pub fn file_transfer_port(&self) -> u16 {
        self.base_port + FILE_TRANSFER_PORT_OFFSET
    }

    pub fn key_dispenser_port(&self) -> u16 {
        self.base_port + KEY_DISPENSER_PORT_OFFSET
    }

    pub fn http_addr(&self) -> SocketAddr {
        std::env::var("FAB_HTTP_ADDR")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.base_port)))
    }

    /// Creates the directory skeleton. Idempotent.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.base_dir.clone(),
            self.resources_dir(),
            self.conf_dir(),
            self.log_dir(),
            self.run_dir(),
            self.data_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
