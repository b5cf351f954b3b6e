//! Reverse-proxy / static-resource service.
//!
//! Generates a server configuration exposing the resource store under `/res/`
//! plus any forward rules from the settings, then launches the external proxy
//! binary in the foreground so the registry can supervise it.

use std::fmt::Write as _;

use fab_config::DeployConfig;
use serde_json::Value;

use super::{write_conf, ProcessSpec, ServiceError};
use crate::env::Environment;
use crate::payloads;

const DEFAULT_EXECUTABLE: &str = "nginx";
const CONF_FILE: &str = "http_proxy.conf";

pub(super) fn build(
    config: &DeployConfig,
    env: &Environment,
) -> Result<Vec<ProcessSpec>, ServiceError> {
    let Some(settings) = &config.services.http_proxy else {
        return Ok(Vec::new());
    };
    if !settings.active {
        return Ok(Vec::new());
    }
    let port = settings.port.unwrap_or_else(|| env.proxy_port());

    let mut conf = String::new();
    let _ = writeln!(conf, "daemon off;");
    let _ = writeln!(conf, "error_log {}/http_proxy.err;", env.log_dir().display());
    let _ = writeln!(conf, "events {{}}");
    let _ = writeln!(conf, "http {{");
    let _ = writeln!(conf, "  access_log {}/http_proxy.log;", env.log_dir().display());
    let _ = writeln!(conf, "  server {{");
    let _ = writeln!(conf, "    listen {port};");
    let _ = writeln!(conf, "    location /res/ {{");
    let _ = writeln!(conf, "      alias {}/;", env.resources_dir().display());
    let _ = writeln!(conf, "    }}");
    // Exact-match entries for the active bundle's payload files keep the
    // proxy from ever serving a blob the current deployment does not name.
    for file in active_bundle_payload_files(config, env) {
        let _ = writeln!(conf, "    location = /res/{file} {{");
        let _ = writeln!(conf, "      alias {}/{file};", env.resources_dir().display());
        let _ = writeln!(conf, "    }}");
    }
    for rule in &settings.rules {
        let _ = writeln!(conf, "    location {} {{", rule.path);
        let _ = writeln!(conf, "      proxy_pass {};", rule.upstream);
        let _ = writeln!(conf, "    }}");
    }
    let _ = writeln!(conf, "  }}");
    let _ = writeln!(conf, "}}");

    let conf_path = write_conf(env, CONF_FILE, &conf)?;

    let executable = settings
        .executable
        .clone()
        .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string());
    let mut spec = ProcessSpec::new("http_proxy", executable, env.base_dir().to_path_buf());
    spec.args = vec![
        "-c".to_string(),
        conf_path.display().to_string(),
        "-p".to_string(),
        env.base_dir().display().to_string(),
    ];
    spec.port = Some(port);
    Ok(vec![spec])
}

/// Resource names of the active bundle's payload files; an unreadable or
/// absent manifest contributes nothing rather than blocking the deploy.
fn active_bundle_payload_files(config: &DeployConfig, env: &Environment) -> Vec<String> {
    let Ok(manifest) = payloads::manifest_for_bundle(env, config, &config.active_bundle_id) else {
        return Vec::new();
    };
    let Value::Object(entries) = manifest else {
        return Vec::new();
    };
    entries
        .values()
        .filter_map(|entry| entry.get("file").and_then(Value::as_str))
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::config_with_services;
    use serde_json::json;

    #[test]
    fn generates_conf_and_launch_spec() {
        let (config, env, _tmp) = config_with_services(json!({
            "http_proxy": {
                "active": true,
                "rules": [{"path": "/shopfloor/", "upstream": "http://10.0.0.5:9090/"}]
            }
        }));
        let specs = super::build(&config, &env).unwrap();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.name, "http_proxy");
        assert_eq!(spec.port, Some(8081));

        let conf = std::fs::read_to_string(env.conf_dir().join("http_proxy.conf")).unwrap();
        assert!(conf.contains("listen 8081;"));
        assert!(conf.contains("location /res/"));
        assert!(conf.contains("proxy_pass http://10.0.0.5:9090/;"));
    }

    #[test]
    fn explicit_port_and_executable_override_defaults() {
        let (config, env, _tmp) = config_with_services(json!({
            "http_proxy": {"active": true, "port": 9999, "executable": "/opt/proxy/bin/proxyd"}
        }));
        let specs = super::build(&config, &env).unwrap();
        assert_eq!(specs[0].port, Some(9999));
        assert_eq!(specs[0].executable, "/opt/proxy/bin/proxyd");
    }

    #[test]
    fn inactive_section_builds_nothing() {
        let (config, env, _tmp) = config_with_services(json!({
            "http_proxy": {"active": false}
        }));
        assert!(super::build(&config, &env).unwrap().is_empty());
    }
}
