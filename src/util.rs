//! Name grammar and query-parameter helpers

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{Error, Result};

static RESOURCE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^(-?([a-z0-9]+-)*[a-z0-9]+|)$").expect("resource name regex"));

/// Whether `s` is a legal resource name. Empty is accepted (the root
/// path); a leading `-` marks the resource privileged.
pub fn is_resource_name(s: &str) -> bool {
    RESOURCE_NAME.is_match(s)
}

/// Registration-time assertion of the name grammar.
pub fn check_resource_name(s: &str) {
    if !is_resource_name(s) {
        panic!("'{}' not a valid resource name", s);
    }
}

/// Resource name a shape's auto-defined identity resource gets. Shape
/// names starting lowercase map to privileged (`-`-prefixed) resources.
pub fn type_name_to_resource_name(type_name: &str) -> String {
    let lowered = type_name.to_lowercase();
    match type_name.chars().next() {
        Some(c) if c.is_lowercase() => format!("-{}", lowered),
        _ => lowered,
    }
}

/// Whether a resource name is privileged.
pub fn is_privileged_name(name: &str) -> bool {
    name.starts_with('-')
}

pub fn parse_param_i64(
    params: &std::collections::BTreeMap<String, String>,
    key: &str,
    default: i64,
) -> Result<i64> {
    match params.get(key) {
        Some(v) => v.parse().map_err(|e| {
            Error::with_cause(
                crate::types::ErrorKind::BadRequest,
                format!("param {} parse error, want int, got {}", key, v),
                e,
            )
        }),
        None => Ok(default),
    }
}

pub fn parse_param_bool(
    params: &std::collections::BTreeMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool> {
    match params.get(key) {
        Some(v) => v.parse().map_err(|e| {
            Error::with_cause(
                crate::types::ErrorKind::BadRequest,
                format!("param {} parse error, want bool, got {}", key, v),
                e,
            )
        }),
        None => Ok(default),
    }
}

pub fn parse_param_object_id(
    params: &std::collections::BTreeMap<String, String>,
    key: &str,
) -> Result<Option<bson::oid::ObjectId>> {
    match params.get(key) {
        Some(v) => bson::oid::ObjectId::parse_str(v).map(Some).map_err(|e| {
            Error::with_cause(
                crate::types::ErrorKind::BadRequest,
                format!("param {} parse error, want objectId, got {}", key, v),
                e,
            )
        }),
        None => Ok(None),
    }
}
