//! Detection rule and service table configuration.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// How a rule's `pattern` string is interpreted.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    Regex,
    Literal,
    Hex,
}

/// A named detection rule.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
#[validate(schema(function = validation::validate_rule))]
pub struct RuleConfig {
    /// Stable identifier; derived from the name when omitted.
    #[serde(default)]
    pub id: Option<String>,

    #[validate(length(min = 1, max = 64))]
    pub name: String,

    #[serde(default)]
    pub kind: PatternKind,

    pub pattern: String,

    /// Only apply to flows whose server port is listed (empty = all).
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Only apply to flows classified as one of these services (empty = all).
    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Upper bound on a regex match length, sizes the boundary window.
    #[validate(range(min = 1, max = 1048576))]
    #[serde(default)]
    pub max_match_len: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl RuleConfig {
    /// Identifier used in match documents.
    pub fn resolved_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            self.name
                .trim()
                .to_lowercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect()
        })
    }
}

/// Destination port to service name mapping.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    #[validate(range(min = 1))]
    pub port: u16,

    #[validate(length(min = 1, max = 32))]
    pub name: String,
}

impl ServiceConfig {
    pub fn new(port: u16, name: impl Into<String>) -> Self {
        Self {
            port,
            name: name.into(),
        }
    }
}

pub(crate) fn default_services() -> Vec<ServiceConfig> {
    [
        (21, "ftp"),
        (22, "ssh"),
        (25, "smtp"),
        (53, "dns"),
        (80, "http"),
        (443, "https"),
        (3306, "mysql"),
        (5432, "postgres"),
        (6379, "redis"),
        (8080, "http-alt"),
    ]
    .into_iter()
    .map(|(port, name)| ServiceConfig::new(port, name))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(kind: PatternKind, pattern: &str) -> RuleConfig {
        RuleConfig {
            id: None,
            name: "Shell Code".into(),
            kind,
            pattern: pattern.into(),
            ports: vec![],
            services: vec![],
            enabled: true,
            max_match_len: None,
        }
    }

    #[test]
    fn id_is_derived_from_name() {
        assert_eq!(rule(PatternKind::Literal, "x").resolved_id(), "shell_code");
    }

    #[test]
    fn pattern_checked_against_kind() {
        assert!(rule(PatternKind::Regex, "a+").validate().is_ok());
        assert!(rule(PatternKind::Regex, "a(").validate().is_err());
        assert!(rule(PatternKind::Hex, "9090").validate().is_ok());
        assert!(rule(PatternKind::Hex, "909").validate().is_err());
        assert!(rule(PatternKind::Literal, "").validate().is_err());
    }
}
