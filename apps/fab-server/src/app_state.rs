//! Shared handler state.
//!
//! Handlers read a whole-snapshot `Arc<DeployConfig>`; the activator's atomic
//! pointer swap plus this whole-Arc replacement means a reader sees either
//! the fully-old or fully-new configuration, never a blend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use fab_config::DeployConfig;

use crate::env::Environment;
use crate::services::ServiceRegistry;
use crate::slots::DownloadSlots;

#[derive(Clone)]
pub struct AppState {
    env: Arc<Environment>,
    config: Arc<RwLock<Option<Arc<DeployConfig>>>>,
    registry: Arc<ServiceRegistry>,
    slots: Arc<DownloadSlots>,
    deploying: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(env: Arc<Environment>, slots: DownloadSlots) -> Self {
        Self {
            env,
            config: Arc::new(RwLock::new(None)),
            registry: Arc::new(ServiceRegistry::new()),
            slots: Arc::new(slots),
            deploying: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn slots(&self) -> &DownloadSlots {
        &self.slots
    }

    pub fn config(&self) -> Option<Arc<DeployConfig>> {
        self.config.read().expect("config snapshot lock").clone()
    }

    pub fn set_config(&self, config: Option<Arc<DeployConfig>>) {
        *self.config.write().expect("config snapshot lock") = config;
    }

    pub fn deploying_flag(&self) -> &AtomicBool {
        &self.deploying
    }

    pub fn is_deploying(&self) -> bool {
        self.deploying.load(Ordering::SeqCst)
    }
}
