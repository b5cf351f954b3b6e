//! Deployment configuration: schema, validation, canonical serialization.
//!
//! A configuration names the install bundles a server offers, the routing
//! rulesets that steer individual devices to bundles, the single globally
//! active bundle, and per-service settings for the auxiliary daemons. An
//! invalid configuration is rejected here, before it can ever be stored as a
//! candidate for activation.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod matcher;

pub use matcher::{parse_device_header, resolve_bundle, select_ruleset, HeaderError};

/// Matcher names a ruleset may use.
pub const KNOWN_MATCHERS: &[&str] = &["sn", "mlb_sn", "stage", "mac", "sn_range", "mlb_sn_range"];

/// Range matchers and the device attribute each one inspects.
pub const RANGE_MATCHERS: &[(&str, &str)] = &[("sn_range", "sn"), ("mlb_sn_range", "mlb_sn")];

/// Service names the `services` section may configure.
pub const KNOWN_SERVICES: &[&str] = &[
    "http_proxy",
    "file_transfer",
    "key_dispenser",
    "peer_sync",
    "multicast",
];

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid configuration: {0}")]
    Parse(String),
    #[error("duplicate bundle id `{0}`")]
    DuplicateBundle(String),
    #[error("ruleset references unknown bundle `{0}`")]
    UnknownRulesetBundle(String),
    #[error("active_bundle_id references unknown bundle `{0}`")]
    UnknownActiveBundle(String),
    #[error("unknown matcher `{matcher}` in ruleset for bundle `{bundle_id}`")]
    UnknownMatcher { matcher: String, bundle_id: String },
    #[error("range matcher `{matcher}` must have exactly two entries")]
    BadRange { matcher: String },
    #[error("unknown service `{0}`")]
    UnknownService(String),
}

/// A named, immutable reference to one payload manifest resource.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Bundle {
    pub id: String,
    #[serde(default)]
    pub note: String,
    pub payloads: String,
}

/// An ordered routing rule. `match` maps matcher name to matcher values;
/// a ruleset with no `match` matches every device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Ruleset {
    pub bundle_id: String,
    #[serde(default)]
    pub note: String,
    pub active: bool,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_conditions: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProxyRule {
    pub path: String,
    pub upstream: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HttpProxyConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<ProxyRule>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileTransferConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KeyDispenserConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PeerSyncConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MulticastConfig {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgroup: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_transfer: Option<FileTransferConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_dispenser: Option<KeyDispenserConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_sync: Option<PeerSyncConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast: Option<MulticastConfig>,
}

/// Top-level deployment configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    pub bundles: Vec<Bundle>,
    pub rulesets: Vec<Ruleset>,
    pub active_bundle_id: String,
    #[serde(default)]
    pub services: ServicesConfig,
}

impl DeployConfig {
    /// Parses and validates configuration text. Nothing invalid ever leaves
    /// this function as a `DeployConfig`.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let raw: Value =
            serde_json::from_str(text).map_err(|err| ValidationError::Parse(err.to_string()))?;
        // Service names are checked against the known set up front so an
        // unknown service reports its own name rather than a generic
        // unknown-field parse error.
        if let Some(services) = raw.get("services").and_then(Value::as_object) {
            for name in services.keys() {
                if !KNOWN_SERVICES.contains(&name.as_str()) {
                    return Err(ValidationError::UnknownService(name.clone()));
                }
            }
        }
        let config: DeployConfig =
            serde_json::from_value(raw).map_err(|err| ValidationError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut seen = HashSet::new();
        for bundle in &self.bundles {
            if !seen.insert(bundle.id.as_str()) {
                return Err(ValidationError::DuplicateBundle(bundle.id.clone()));
            }
        }
        if !seen.contains(self.active_bundle_id.as_str()) {
            return Err(ValidationError::UnknownActiveBundle(
                self.active_bundle_id.clone(),
            ));
        }
        for ruleset in &self.rulesets {
            if !seen.contains(ruleset.bundle_id.as_str()) {
                return Err(ValidationError::UnknownRulesetBundle(
                    ruleset.bundle_id.clone(),
                ));
            }
            let Some(conditions) = &ruleset.match_conditions else {
                continue;
            };
            for (matcher, values) in conditions {
                if !KNOWN_MATCHERS.contains(&matcher.as_str()) {
                    return Err(ValidationError::UnknownMatcher {
                        matcher: matcher.clone(),
                        bundle_id: ruleset.bundle_id.clone(),
                    });
                }
                if RANGE_MATCHERS.iter().any(|(name, _)| name == matcher) && values.len() != 2 {
                    return Err(ValidationError::BadRange {
                        matcher: matcher.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn bundle(&self, id: &str) -> Option<&Bundle> {
        self.bundles.iter().find(|b| b.id == id)
    }

    pub fn active_bundle(&self) -> Option<&Bundle> {
        self.bundle(&self.active_bundle_id)
    }

    /// Canonical text form: sorted keys, two-space indentation, trailing
    /// newline. Identical logical configurations always serialize to
    /// byte-identical text, and therefore to identically-addressed resources.
    pub fn to_canonical_string(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()));
        canonical_value_string(&value)
    }
}

/// Renders any JSON value with recursively sorted object keys. Used for the
/// configuration itself and by migrations that rewrite raw configuration
/// text.
pub fn canonical_value_string(value: &Value) -> String {
    let mut out = serde_json::to_string_pretty(&canonicalize(value))
        .unwrap_or_else(|_| "{}".to_string());
    out.push('\n');
    out
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (key, val) in pairs {
                out.insert(key.clone(), canonicalize(val));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}
