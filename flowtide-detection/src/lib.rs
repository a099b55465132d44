//! # Flowtide Detection Engine
//!
//! Compiles detection rules once per configuration and scans reassembled
//! streams for them, one [`RuleMatcher`] per flow.

pub mod matcher;
pub mod rules;

pub use flowtide_core::record::RawMatch;
pub use matcher::RuleMatcher;
pub use rules::{DetectionError, PatternSource, RuleScope, RuleSet, RuleSpec, FLAG_RULE_ID};
