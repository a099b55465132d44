//! ## flowtide-detection::rules
//! **Rule compilation: byte regexes plus one Aho-Corasick automaton for all literals**
//!
//! A [`RuleSet`] is immutable once compiled and shared by every flow of a
//! session. Each rule carries a match-length bound, which sizes the trailing
//! window the matcher keeps across flush boundaries.

use std::collections::HashSet;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use regex::bytes::Regex;
use thiserror::Error;

/// Id and name of the rule built from the configured flag pattern.
pub const FLAG_RULE_ID: &str = "flag";

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Rule {rule}: invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },
    #[error("Rule {0}: empty pattern")]
    EmptyPattern(String),
    #[error("Duplicate rule id {0}")]
    DuplicateRule(String),
    #[error("Literal automaton build failed: {0}")]
    Automaton(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSource {
    Regex(String),
    Literal(Vec<u8>),
}

/// Uncompiled rule definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub id: String,
    pub name: String,
    pub pattern: PatternSource,
    pub ports: Vec<u16>,
    pub services: Vec<String>,
    pub enabled: bool,
    /// Upper bound on regex match length; literals use their own length.
    pub max_match_len: Option<usize>,
}

impl RuleSpec {
    pub fn regex(id: impl Into<String>, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(id, name, PatternSource::Regex(pattern.into()))
    }

    pub fn literal(id: impl Into<String>, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(id, name, PatternSource::Literal(bytes.into()))
    }

    /// The competition flag rule.
    pub fn flag(pattern: impl Into<String>) -> Self {
        Self::regex(FLAG_RULE_ID, FLAG_RULE_ID, pattern)
    }

    fn new(id: impl Into<String>, name: impl Into<String>, pattern: PatternSource) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            pattern,
            ports: Vec::new(),
            services: Vec::new(),
            enabled: true,
            max_match_len: None,
        }
    }

    pub fn with_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.ports = ports.into_iter().collect();
        self
    }

    pub fn with_services<S: Into<String>>(mut self, services: impl IntoIterator<Item = S>) -> Self {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_match_len(mut self, len: usize) -> Self {
        self.max_match_len = Some(len);
        self
    }
}

/// What a flow looks like to rule scoping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleScope {
    pub server_port: u16,
    pub service: Option<String>,
}

impl RuleScope {
    pub fn new(server_port: u16, service: Option<&str>) -> Self {
        Self {
            server_port,
            service: service.map(str::to_owned),
        }
    }
}

#[derive(Debug)]
pub(crate) enum CompiledPattern {
    Regex(Regex),
    /// Index into the literal automaton.
    Literal(usize),
}

#[derive(Debug)]
pub(crate) struct CompiledRule {
    pub(crate) id: Arc<str>,
    pub(crate) name: Arc<str>,
    pub(crate) pattern: CompiledPattern,
    pub(crate) bound: usize,
    ports: Vec<u16>,
    services: Vec<String>,
}

impl CompiledRule {
    fn applies_to(&self, scope: &RuleScope) -> bool {
        let port_ok = self.ports.is_empty() || self.ports.contains(&scope.server_port);
        let service_ok = self.services.is_empty()
            || scope
                .service
                .as_deref()
                .is_some_and(|s| self.services.iter().any(|svc| svc == s));
        port_ok && service_ok
    }
}

#[derive(Debug)]
pub struct RuleSet {
    pub(crate) rules: Vec<CompiledRule>,
    pub(crate) literals: Option<AhoCorasick>,
    /// Literal pattern index to rule index.
    pub(crate) literal_rules: Vec<usize>,
    pub(crate) window: usize,
}

impl RuleSet {
    /// Compiles enabled rules. `default_window` bounds regex rules that do
    /// not declare `max_match_len`.
    pub fn compile(
        specs: impl IntoIterator<Item = RuleSpec>,
        default_window: usize,
    ) -> Result<Self, DetectionError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::new();
        let mut literal_patterns: Vec<Vec<u8>> = Vec::new();
        let mut literal_rules = Vec::new();

        for spec in specs.into_iter().filter(|s| s.enabled) {
            if !seen.insert(spec.id.clone()) {
                return Err(DetectionError::DuplicateRule(spec.id));
            }
            let (pattern, bound) = match spec.pattern {
                PatternSource::Regex(source) => {
                    if source.is_empty() {
                        return Err(DetectionError::EmptyPattern(spec.id));
                    }
                    let regex = Regex::new(&source).map_err(|source| {
                        DetectionError::InvalidPattern {
                            rule: spec.id.clone(),
                            source,
                        }
                    })?;
                    let bound = spec.max_match_len.unwrap_or(default_window).max(1);
                    (CompiledPattern::Regex(regex), bound)
                }
                PatternSource::Literal(bytes) => {
                    if bytes.is_empty() {
                        return Err(DetectionError::EmptyPattern(spec.id));
                    }
                    let bound = bytes.len();
                    literal_rules.push(rules.len());
                    literal_patterns.push(bytes);
                    (CompiledPattern::Literal(literal_patterns.len() - 1), bound)
                }
            };
            rules.push(CompiledRule {
                id: spec.id.into(),
                name: spec.name.into(),
                pattern,
                bound,
                ports: spec.ports,
                services: spec.services,
            });
        }

        let literals = if literal_patterns.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::new(&literal_patterns)
                    .map_err(|e| DetectionError::Automaton(e.to_string()))?,
            )
        };
        let window = rules.iter().map(|r| r.bound).max().unwrap_or(0);

        Ok(Self {
            rules,
            literals,
            literal_rules,
            window,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| &*r.id)
    }

    /// Largest match-length bound over all rules.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Indices of the rules that apply to a flow.
    pub(crate) fn applicable(&self, scope: &RuleScope) -> Vec<bool> {
        self.rules.iter().map(|r| r.applies_to(scope)).collect()
    }
}
