//! File-transfer daemon: read-only resource module plus the deprecated
//! upload module old toolkits still write reports into.

use std::fmt::Write as _;

use fab_config::DeployConfig;

use super::{ensure_dir, write_conf, ProcessSpec, ServiceError};
use crate::env::Environment;

const DEFAULT_EXECUTABLE: &str = "rsync";
const CONF_FILE: &str = "file_transfer.conf";

pub(super) fn build(
    config: &DeployConfig,
    env: &Environment,
) -> Result<Vec<ProcessSpec>, ServiceError> {
    let Some(settings) = &config.services.file_transfer else {
        return Ok(Vec::new());
    };
    if !settings.active {
        return Ok(Vec::new());
    }
    let port = settings.port.unwrap_or_else(|| env.file_transfer_port());
    let upload_dir = env.data_dir().join("upload");
    ensure_dir(&upload_dir)?;

    let mut conf = String::new();
    let _ = writeln!(conf, "pid file = {}/file_transfer.pid", env.run_dir().display());
    let _ = writeln!(conf, "log file = {}/file_transfer.log", env.log_dir().display());
    let _ = writeln!(conf, "port = {port}");
    let _ = writeln!(conf, "use chroot = no");
    let _ = writeln!(conf);
    let _ = writeln!(conf, "[resources]");
    let _ = writeln!(conf, "  path = {}", env.resources_dir().display());
    let _ = writeln!(conf, "  read only = true");
    let _ = writeln!(conf);
    // Deprecated: report uploads moved to the HTTP surface, but devices in
    // the field still push here.
    let _ = writeln!(conf, "[upload]");
    let _ = writeln!(conf, "  path = {}", upload_dir.display());
    let _ = writeln!(conf, "  read only = false");

    let conf_path = write_conf(env, CONF_FILE, &conf)?;

    let executable = settings
        .executable
        .clone()
        .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string());
    let mut spec = ProcessSpec::new("file_transfer", executable, env.base_dir().to_path_buf());
    spec.args = vec![
        "--daemon".to_string(),
        "--no-detach".to_string(),
        format!("--config={}", conf_path.display()),
    ];
    spec.port = Some(port);
    Ok(vec![spec])
}

#[cfg(test)]
mod tests {
    use super::super::tests::config_with_services;
    use serde_json::json;

    #[test]
    fn daemon_config_lists_both_modules() {
        let (config, env, _tmp) = config_with_services(json!({
            "file_transfer": {"active": true}
        }));
        let specs = super::build(&config, &env).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].port, Some(8084));
        assert!(env.data_dir().join("upload").is_dir());

        let conf = std::fs::read_to_string(env.conf_dir().join("file_transfer.conf")).unwrap();
        assert!(conf.contains("[resources]"));
        assert!(conf.contains("read only = true"));
        assert!(conf.contains("[upload]"));
        assert!(conf.contains("read only = false"));
        assert!(conf.contains("port = 8084"));
    }
}
