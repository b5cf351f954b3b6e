//! Owns the set of running service processes.
//!
//! Redeploys are diffs: services whose descriptors disappeared or changed are
//! stopped, new or changed ones started, untouched ones left alone. A launch
//! failure is recorded against that one service and never takes the server
//! down; the registry's view is exposed through the status RPC.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{check_port_conflicts, ProcessSpec, ServiceError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    Error,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Running => "running",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RedeploySummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug)]
struct Health {
    state: ServiceState,
    detail: Option<String>,
}

struct Supervised {
    spec: ProcessSpec,
    pid: Option<u32>,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
    health: Arc<StdMutex<Health>>,
}

enum Entry {
    Running(Supervised),
    Failed { detail: String },
}

#[derive(Default)]
pub struct ServiceRegistry {
    // One lock serializes every start/stop; each service owns singleton OS
    // resources (a bound port, a pid file) that concurrent redeploys would
    // fight over.
    entries: Mutex<HashMap<String, Entry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a full desired service set. Port conflicts reject the whole
    /// call before any process is touched.
    pub async fn redeploy(&self, specs: Vec<ProcessSpec>) -> Result<RedeploySummary, ServiceError> {
        check_port_conflicts(&specs)?;
        let mut entries = self.entries.lock().await;
        let mut summary = RedeploySummary::default();

        let desired: HashMap<String, ProcessSpec> =
            specs.into_iter().map(|s| (s.name.clone(), s)).collect();

        let existing: Vec<String> = entries.keys().cloned().collect();
        for name in existing {
            let keep = match (entries.get(&name), desired.get(&name)) {
                (Some(Entry::Running(running)), Some(spec)) => running.spec == *spec,
                // Failed entries always retry; gone entries always stop.
                _ => false,
            };
            if keep {
                summary.unchanged.push(name);
                continue;
            }
            if let Some(entry) = entries.remove(&name) {
                if let Entry::Running(running) = entry {
                    stop_supervised(running).await;
                    if !desired.contains_key(&name) {
                        summary.stopped.push(name);
                    }
                }
            }
        }

        let mut to_start: Vec<&ProcessSpec> = desired
            .values()
            .filter(|spec| !summary.unchanged.contains(&spec.name))
            .collect();
        to_start.sort_by(|a, b| a.name.cmp(&b.name));
        for spec in to_start {
            match spawn_supervised(spec.clone()) {
                Ok(running) => {
                    info!(
                        target: "fab::service",
                        service = %spec.name,
                        pid = running.pid,
                        "service started"
                    );
                    summary.started.push(spec.name.clone());
                    entries.insert(spec.name.clone(), Entry::Running(running));
                }
                Err(err) => {
                    warn!(
                        target: "fab::service",
                        service = %spec.name,
                        error = %err,
                        "service failed to launch"
                    );
                    summary.failed.push((spec.name.clone(), err.to_string()));
                    entries.insert(
                        spec.name.clone(),
                        Entry::Failed {
                            detail: err.to_string(),
                        },
                    );
                }
            }
        }
        Ok(summary)
    }

    pub async fn statuses(&self) -> Vec<ServiceStatus> {
        let entries = self.entries.lock().await;
        let mut out: Vec<ServiceStatus> = entries
            .iter()
            .map(|(name, entry)| match entry {
                Entry::Running(running) => {
                    let health = running.health.lock().expect("service health lock");
                    ServiceStatus {
                        name: name.clone(),
                        state: health.state,
                        pid: running.pid,
                        detail: health.detail.clone(),
                    }
                }
                Entry::Failed { detail, .. } => ServiceStatus {
                    name: name.clone(),
                    state: ServiceState::Error,
                    pid: None,
                    detail: Some(detail.clone()),
                },
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (name, entry) in entries.drain() {
            if let Entry::Running(running) = entry {
                info!(target: "fab::service", service = %name, "stopping service");
                stop_supervised(running).await;
            }
        }
    }
}

fn spawn_supervised(spec: ProcessSpec) -> Result<Supervised, ServiceError> {
    let mut command = Command::new(&spec.executable);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = command.spawn()?;
    let pid = child.id();
    let cancel = CancellationToken::new();
    let health = Arc::new(StdMutex::new(Health {
        state: ServiceState::Running,
        detail: None,
    }));

    let monitor = {
        let cancel = cancel.clone();
        let health = Arc::clone(&health);
        let name = spec.name.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    let mut h = health.lock().expect("service health lock");
                    h.state = ServiceState::Stopped;
                }
                status = child.wait() => {
                    let detail = match status {
                        Ok(code) => format!("exited unexpectedly: {code}"),
                        Err(err) => format!("wait failed: {err}"),
                    };
                    warn!(target: "fab::service", service = %name, %detail, "service down");
                    let mut h = health.lock().expect("service health lock");
                    h.state = ServiceState::Error;
                    h.detail = Some(detail);
                }
            }
        })
    };

    Ok(Supervised {
        spec,
        pid,
        cancel,
        monitor,
        health,
    })
}

async fn stop_supervised(running: Supervised) {
    running.cancel.cancel();
    // Wait for the child to actually die so a follow-up start can rebind the
    // same port and pid file.
    let _ = running.monitor.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn sleeper(name: &str, secs: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            executable: "sleep".to_string(),
            args: vec![secs.to_string()],
            working_dir: PathBuf::from("/"),
            env: BTreeMap::new(),
            port: None,
        }
    }

    #[tokio::test]
    async fn redeploy_with_unchanged_specs_touches_nothing() {
        let registry = ServiceRegistry::new();
        let summary = registry.redeploy(vec![sleeper("a", "30")]).await.unwrap();
        assert_eq!(summary.started, vec!["a"]);

        let first_pid = registry.statuses().await[0].pid;
        assert!(first_pid.is_some());

        let summary = registry.redeploy(vec![sleeper("a", "30")]).await.unwrap();
        assert_eq!(summary.unchanged, vec!["a"]);
        assert!(summary.started.is_empty());
        assert!(summary.stopped.is_empty());
        assert_eq!(registry.statuses().await[0].pid, first_pid);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn changed_spec_restarts_only_that_service() {
        let registry = ServiceRegistry::new();
        registry
            .redeploy(vec![sleeper("a", "30"), sleeper("b", "30")])
            .await
            .unwrap();
        let pids: HashMap<String, Option<u32>> = registry
            .statuses()
            .await
            .into_iter()
            .map(|s| (s.name, s.pid))
            .collect();

        let summary = registry
            .redeploy(vec![sleeper("a", "30"), sleeper("b", "31")])
            .await
            .unwrap();
        assert_eq!(summary.unchanged, vec!["a"]);
        assert_eq!(summary.started, vec!["b"]);

        let statuses = registry.statuses().await;
        let a = statuses.iter().find(|s| s.name == "a").unwrap();
        let b = statuses.iter().find(|s| s.name == "b").unwrap();
        assert_eq!(a.pid, pids["a"]);
        assert_ne!(b.pid, pids["b"]);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn removed_spec_is_stopped_and_forgotten() {
        let registry = ServiceRegistry::new();
        registry
            .redeploy(vec![sleeper("a", "30"), sleeper("b", "30")])
            .await
            .unwrap();

        let summary = registry.redeploy(vec![sleeper("a", "30")]).await.unwrap();
        assert_eq!(summary.stopped, vec!["b"]);
        let statuses = registry.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].name, "a");

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn launch_failure_is_partial_not_fatal() {
        let registry = ServiceRegistry::new();
        let mut broken = sleeper("broken", "30");
        broken.executable = "/nonexistent/fab-daemon".to_string();

        let summary = registry
            .redeploy(vec![broken, sleeper("ok", "30")])
            .await
            .unwrap();
        assert_eq!(summary.started, vec!["ok"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "broken");

        let statuses = registry.statuses().await;
        let broken_status = statuses.iter().find(|s| s.name == "broken").unwrap();
        assert_eq!(broken_status.state, ServiceState::Error);
        let ok_status = statuses.iter().find(|s| s.name == "ok").unwrap();
        assert_eq!(ok_status.state, ServiceState::Running);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn port_conflict_rejects_whole_redeploy() {
        let registry = ServiceRegistry::new();
        let mut a = sleeper("a", "30");
        a.port = Some(8084);
        let mut b = sleeper("b", "30");
        b.port = Some(8084);

        let err = registry.redeploy(vec![a, b]).await.unwrap_err();
        assert!(matches!(err, ServiceError::PortConflict { port: 8084, .. }));
        assert!(registry.statuses().await.is_empty());
    }
}
