//! Where detection rules come from.
//!
//! The flag rule is always first. Named rules are gathered from every
//! registered [`RuleSource`]; a later source replaces an earlier rule with
//! the same id, so rules stored at runtime override the configuration file.

use std::sync::Arc;

use async_trait::async_trait;
use flowtide_config::validation::hex_decode;
use flowtide_config::{PatternKind, RuleConfig};
use flowtide_detection::{RuleSpec, FLAG_RULE_ID};
use flowtide_storage::{documents, Collection, Filter, Storage};
use tracing::debug;
use validator::Validate;

use crate::error::EngineError;

#[async_trait]
pub trait RuleSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn rules(&self) -> Result<Vec<RuleConfig>, EngineError>;
}

/// Rules listed in the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigRuleSource {
    rules: Vec<RuleConfig>,
}

impl ConfigRuleSource {
    pub fn new(rules: Vec<RuleConfig>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl RuleSource for ConfigRuleSource {
    fn name(&self) -> &'static str {
        "config"
    }

    async fn rules(&self) -> Result<Vec<RuleConfig>, EngineError> {
        Ok(self.rules.clone())
    }
}

/// Rules kept in the `rules` collection.
#[derive(Clone)]
pub struct StoredRuleSource {
    storage: Arc<dyn Storage>,
}

impl StoredRuleSource {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RuleSource for StoredRuleSource {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn rules(&self) -> Result<Vec<RuleConfig>, EngineError> {
        let rules: Vec<RuleConfig> =
            documents::list(self.storage.as_ref(), Collection::Rules, &Filter::all()).await?;
        for rule in &rules {
            rule.validate().map_err(|e| EngineError::InvalidRule {
                rule: rule.name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(rules)
    }
}

/// Builds the rule list for one configuration: the flag rule followed by
/// every enabled named rule.
pub async fn collect_rule_specs(
    flag_regex: &str,
    sources: &[Arc<dyn RuleSource>],
) -> Result<Vec<RuleSpec>, EngineError> {
    let mut named: Vec<RuleConfig> = Vec::new();
    for source in sources {
        let rules = source.rules().await?;
        debug!(source = source.name(), count = rules.len(), "Rules loaded");
        for rule in rules {
            let id = rule.resolved_id();
            match named.iter_mut().find(|r| r.resolved_id() == id) {
                Some(existing) => *existing = rule,
                None => named.push(rule),
            }
        }
    }

    let mut specs = vec![RuleSpec::flag(flag_regex)];
    for rule in named.iter().filter(|r| r.enabled) {
        if rule.resolved_id() == FLAG_RULE_ID {
            return Err(EngineError::InvalidRule {
                rule: rule.name.clone(),
                reason: format!("id {FLAG_RULE_ID} is reserved for the flag pattern"),
            });
        }
        specs.push(rule_spec(rule)?);
    }
    Ok(specs)
}

pub fn rule_spec(rule: &RuleConfig) -> Result<RuleSpec, EngineError> {
    let id = rule.resolved_id();
    let spec = match rule.kind {
        PatternKind::Regex => RuleSpec::regex(id, rule.name.clone(), rule.pattern.clone()),
        PatternKind::Literal => {
            RuleSpec::literal(id, rule.name.clone(), rule.pattern.clone().into_bytes())
        }
        PatternKind::Hex => {
            let bytes = hex_decode(&rule.pattern).ok_or_else(|| EngineError::InvalidRule {
                rule: rule.name.clone(),
                reason: "pattern is not valid hex".to_string(),
            })?;
            RuleSpec::literal(id, rule.name.clone(), bytes)
        }
    };
    let spec = spec
        .with_ports(rule.ports.iter().copied())
        .with_services(rule.services.iter().cloned());
    Ok(match rule.max_match_len {
        Some(len) => spec.with_max_match_len(len),
        None => spec,
    })
}
