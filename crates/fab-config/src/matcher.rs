//! Device-attribute header parsing and first-match-wins bundle selection.
//!
//! Devices report their identity in a cookie-syntax request header
//! (`sn=SN001; mlb_sn=MLB001; mac.eth0=aa:bb:..`). Rulesets are evaluated in
//! file order; the first active ruleset whose every condition holds wins, and
//! a device that matches nothing falls back to the globally active bundle.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::{Bundle, DeployConfig, Ruleset};

/// Exact attribute keys a device may report.
static SCALAR_KEYS: &[&str] = &["sn", "mlb_sn", "board", "firmware", "ec", "pd", "stage"];

/// Keys accepted either bare or with a dotted suffix (`mac`, `mac.eth0`).
static PREFIX_KEYS: &[&str] = &["mac"];

/// Keys old toolkits still send; accepted, then dropped from the result so
/// nothing can route on them.
static LEGACY_KEYS: &[&str] = &["uuid", "toolkit_version"];

static PREFIX_DOTTED: Lazy<Vec<String>> =
    Lazy::new(|| PREFIX_KEYS.iter().map(|k| format!("{k}.")).collect());

pub type DeviceAttrs = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("unrecognized device attribute keys: {}", .0.join(", "))]
    UnknownKeys(Vec<String>),
}

fn is_prefix_key(key: &str) -> bool {
    PREFIX_KEYS.contains(&key) || PREFIX_DOTTED.iter().any(|p| key.starts_with(p.as_str()))
}

/// Parses a `key=value; key=value` device header into an attribute map.
/// Legacy keys are dropped; anything else unrecognized fails, listing every
/// offender.
pub fn parse_device_header(raw: &str) -> Result<DeviceAttrs, HeaderError> {
    let mut attrs = DeviceAttrs::new();
    let mut offenders = Vec::new();
    for part in raw.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            offenders.push(part.to_string());
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if LEGACY_KEYS.contains(&key) {
            continue;
        }
        if SCALAR_KEYS.contains(&key) || is_prefix_key(key) {
            attrs.insert(key.to_string(), value.to_string());
        } else {
            offenders.push(key.to_string());
        }
    }
    if offenders.is_empty() {
        Ok(attrs)
    } else {
        Err(HeaderError::UnknownKeys(offenders))
    }
}

fn in_range(value: &str, range: &[String]) -> bool {
    let (start, end) = (&range[0], &range[1]);
    (start == "-" || value >= start.as_str()) && (end == "-" || value <= end.as_str())
}

fn condition_matches(matcher: &str, values: &[String], attrs: &DeviceAttrs) -> bool {
    match matcher {
        "mac" => attrs
            .iter()
            .any(|(key, value)| is_prefix_key(key) && values.iter().any(|v| v == value)),
        "sn_range" | "mlb_sn_range" => {
            let attr = if matcher == "sn_range" { "sn" } else { "mlb_sn" };
            match attrs.get(attr) {
                Some(value) if values.len() == 2 => in_range(value, values),
                _ => false,
            }
        }
        // Scalar matchers: the device value must appear in the list.
        _ => attrs
            .get(matcher)
            .is_some_and(|value| values.iter().any(|v| v == value)),
    }
}

fn ruleset_matches(ruleset: &Ruleset, attrs: &DeviceAttrs) -> bool {
    match &ruleset.match_conditions {
        None => true,
        Some(conditions) => conditions
            .iter()
            .all(|(matcher, values)| condition_matches(matcher, values, attrs)),
    }
}

/// First active ruleset whose every condition is satisfied, in file order.
pub fn select_ruleset<'a>(config: &'a DeployConfig, attrs: &DeviceAttrs) -> Option<&'a Ruleset> {
    config
        .rulesets
        .iter()
        .filter(|r| r.active)
        .find(|r| ruleset_matches(r, attrs))
}

/// The bundle a device should install: the first matching active ruleset's
/// target, or the globally active bundle when no ruleset applies.
pub fn resolve_bundle<'a>(config: &'a DeployConfig, attrs: &DeviceAttrs) -> Option<&'a Bundle> {
    match select_ruleset(config, attrs) {
        Some(ruleset) => config.bundle(&ruleset.bundle_id),
        None => config.active_bundle(),
    }
}
