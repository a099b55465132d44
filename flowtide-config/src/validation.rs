//! Custom validation functions for configuration.
//!
//! Shared by the config structs here and by the engine when settings arrive
//! at runtime instead of from a file.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use validator::ValidationError;

use crate::rules::{PatternKind, RuleConfig};

/// Parse a server address that may be either a bare IP or a CIDR block.
///
/// A bare address becomes a host network (/32 or /128).
pub fn parse_server_network(value: &str) -> Option<IpNetwork> {
    let value = value.trim();
    if value.contains('/') {
        return value.parse::<IpNetwork>().ok();
    }
    let ip: IpAddr = value.parse().ok()?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(ip, prefix).ok()
}

/// Validate the server address (IP or CIDR).
pub fn validate_server_address(value: &str) -> Result<(), ValidationError> {
    match parse_server_network(value) {
        Some(IpNetwork::V4(net)) if net.ip().octets() == [0, 0, 0, 0] && net.prefix() == 32 => {
            Err(ValidationError::new("unspecified_address"))
        }
        Some(_) => Ok(()),
        None => Err(ValidationError::new("invalid_server_address")),
    }
}

/// Validate that a pattern compiles as a byte regex.
pub fn validate_regex(pattern: &str) -> Result<(), ValidationError> {
    if pattern.is_empty() {
        return Err(ValidationError::new("empty_pattern"));
    }
    regex::bytes::Regex::new(pattern)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_regex"))
}

/// Validate a tracing level name.
pub fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid = ["trace", "debug", "info", "warn", "error"].contains(&level.to_lowercase().as_str());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level"))
    }
}

/// Validate a rule's pattern against its declared kind.
pub fn validate_rule(rule: &RuleConfig) -> Result<(), ValidationError> {
    match rule.kind {
        PatternKind::Regex => validate_regex(&rule.pattern),
        PatternKind::Literal if rule.pattern.is_empty() => {
            Err(ValidationError::new("empty_pattern"))
        }
        PatternKind::Literal => Ok(()),
        PatternKind::Hex => match hex_decode(&rule.pattern) {
            Some(bytes) if !bytes.is_empty() => Ok(()),
            _ => Err(ValidationError::new("invalid_hex_pattern")),
        },
    }
}

/// Decode a hex pattern, tolerating whitespace between byte pairs.
pub fn hex_decode(pattern: &str) -> Option<Vec<u8>> {
    let digits: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
