//! Capture classification settings.
//!
//! The server subnet decides which endpoint of a flow is the service under
//! attack/defense, and the flag regex is installed as the default rule.
//! Both may be absent in a file: the application context stays unconfigured
//! until they are supplied.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Server subnet and flag pattern.
#[derive(Default, Debug, Serialize, Deserialize, Validate, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Server address, either a bare IP or a CIDR block.
    #[validate(custom(function = validation::validate_server_address))]
    #[serde(default)]
    pub server_address: Option<String>,

    /// Regular expression describing the competition flag format.
    #[validate(custom(function = validation::validate_regex))]
    #[serde(default)]
    pub flag_regex: Option<String>,
}

impl CaptureConfig {
    pub fn new(server_address: impl Into<String>, flag_regex: impl Into<String>) -> Self {
        Self {
            server_address: Some(server_address.into()),
            flag_regex: Some(flag_regex.into()),
        }
    }

    /// Both halves are present (validity is checked separately).
    pub fn is_complete(&self) -> bool {
        self.server_address.as_deref().is_some_and(|s| !s.is_empty())
            && self.flag_regex.as_deref().is_some_and(|s| !s.is_empty())
    }
}
