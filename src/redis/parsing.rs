//! Parsing helpers for Redis and Sentinel text replies.
//!
//! Redis answers `INFO` with `key:value` lines grouped under `# Section`
//! headers, and Sentinel answers `SENTINEL MASTERS`/`SLAVES` with flat arrays
//! of alternating field names and values. The functions here turn both shapes
//! into maps so the typed reply structs can pick fields by name.
//!
//! All parsing functions are pure and never panic on malformed input.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Errors that can occur during parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: String, value: String },
}

static INFO_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^([\w-]+):(.*)$").ok());

/// Parse key-value pairs from INFO command output.
///
/// Section headers (`# Replication`) and blank lines are skipped.
///
/// # Example
/// ```
/// use saas_operator::redis::parsing::parse_info_output;
///
/// let info = "# Replication\r\nrole:slave\r\nmaster_link_status:up\r\n";
/// let parsed = parse_info_output(info);
/// assert_eq!(parsed.get("master_link_status").map(String::as_str), Some("up"));
/// ```
pub fn parse_info_output(info: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let Some(kv_regex) = INFO_LINE.as_ref() else {
        return result;
    };

    for line in info.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(caps) = kv_regex.captures(line)
            && let (Some(key), Some(value)) = (caps.get(1), caps.get(2))
        {
            result.insert(key.as_str().to_string(), value.as_str().to_string());
        }
    }

    result
}

/// Parse a specific value from INFO output by key name.
pub fn parse_info_value(info: &str, key: &str) -> Option<String> {
    parse_info_output(info).remove(key)
}

/// Keep only the requested keys of an INFO reply.
///
/// Used by discovery so that the status projection stays small and stable.
pub fn select_info_fields(info: &str, keys: &[&str]) -> BTreeMap<String, String> {
    let parsed = parse_info_output(info);
    keys.iter()
        .filter_map(|k| parsed.get(*k).map(|v| ((*k).to_string(), v.clone())))
        .collect()
}

/// Decode a Sentinel flat reply (`[field, value, field, value, ...]`).
///
/// A trailing field without a value is dropped.
pub fn parse_flat_pairs(fields: &[String]) -> HashMap<String, String> {
    fields
        .chunks_exact(2)
        .filter_map(|pair| match pair {
            [k, v] => Some((k.clone(), v.clone())),
            _ => None,
        })
        .collect()
}

/// Format an endpoint as `host:port`, wrapping IPv6 hosts in brackets.
pub fn join_host_port(host: &str, port: impl std::fmt::Display) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split a `host:port` pair. IPv6 hosts may be bracketed (`[::1]:6379`);
/// the returned host never is.
pub fn split_host_port(address: &str) -> Result<(String, u16), ParseError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ParseError::Parse(format!("address without port: {}", address)))?;
    let port = port.parse().map_err(|_| ParseError::InvalidValue {
        field: "port".to_string(),
        value: port.to_string(),
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(ParseError::Parse(format!("address without host: {}", address)));
    }
    Ok((host.to_string(), port))
}

/// Fetch a required string field from a decoded map.
pub(crate) fn required(map: &HashMap<String, String>, field: &str) -> Result<String, ParseError> {
    map.get(field)
        .cloned()
        .ok_or_else(|| ParseError::MissingField(field.to_string()))
}

/// Fetch an optional integer field; absent fields yield `Ok(None)`.
pub(crate) fn optional_int(
    map: &HashMap<String, String>,
    field: &str,
) -> Result<Option<i64>, ParseError> {
    match map.get(field) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ParseError::InvalidValue {
                field: field.to_string(),
                value: v.clone(),
            }),
    }
}

/// Replication facts from `INFO replication`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationInfo {
    /// Master link status ("up" or "down").
    pub master_link_status: Option<String>,
    /// Whether a full sync with the master is in progress.
    pub master_sync_in_progress: Option<bool>,
    /// Master's replication offset.
    pub master_repl_offset: Option<i64>,
    /// Replica's replication offset.
    pub slave_repl_offset: Option<i64>,
    /// Role ("master" or "slave").
    pub role: Option<String>,
}

impl ReplicationInfo {
    /// Parse from INFO REPLICATION output string.
    pub fn parse(info: &str) -> Self {
        let parsed = parse_info_output(info);

        ReplicationInfo {
            master_link_status: parsed.get("master_link_status").cloned(),
            master_sync_in_progress: parsed
                .get("master_sync_in_progress")
                .map(|v| v.trim() == "1"),
            master_repl_offset: parsed
                .get("master_repl_offset")
                .and_then(|v| v.trim().parse().ok()),
            slave_repl_offset: parsed
                .get("slave_repl_offset")
                .and_then(|v| v.trim().parse().ok()),
            role: parsed.get("role").cloned(),
        }
    }

    /// Replica is linked to its master and not in a full sync.
    pub fn is_synced(&self) -> bool {
        self.master_link_status.as_deref() == Some("up")
            && self.master_sync_in_progress != Some(true)
    }
}
