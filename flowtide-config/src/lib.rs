//! # Flowtide Configuration System
//!
//! Hierarchical configuration for the capture ingestion pipeline.
//!
//! ## Features
//! - **Layered Loading**: defaults, YAML files and `FLOWTIDE_*` environment overrides
//! - **Validation**: subnet, regex and numeric bounds are checked before anything runs
//! - **Human Sizes**: byte limits accept `"1MiB"` style strings

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod capture;
mod error;
mod reassembly;
mod rules;
mod session;
mod size;
mod telemetry;
pub mod validation;

pub use capture::CaptureConfig;
pub use error::ConfigError;
pub use reassembly::ReassemblyConfig;
pub use rules::{PatternKind, RuleConfig, ServiceConfig};
pub use session::{PersistenceConfig, SessionConfig};
pub use telemetry::TelemetryConfig;

/// Top‑level configuration container for all Flowtide components.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct FlowtideConfig {
    /// Server subnet and flag pattern.
    #[validate(nested)]
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Additional named detection rules.
    #[validate(nested)]
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Port to service name table used at finalization.
    #[validate(nested)]
    #[serde(default = "rules::default_services")]
    pub services: Vec<ServiceConfig>,

    /// Stream reassembly bounds.
    #[validate(nested)]
    #[serde(default)]
    pub reassembly: ReassemblyConfig,

    /// Import session scheduling.
    #[validate(nested)]
    #[serde(default)]
    pub session: SessionConfig,

    /// Storage write retry policy.
    #[validate(nested)]
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging parameters.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for FlowtideConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            rules: Vec::new(),
            services: rules::default_services(),
            reassembly: ReassemblyConfig::default(),
            session: SessionConfig::default(),
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl FlowtideConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default Values
    /// 2. `config/flowtide.yaml` - Base settings. If missing, defaults are used.
    /// 3. `config/<environment>.yaml` - Environment‑specific overrides.
    /// 4. `FLOWTIDE_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(FlowtideConfig::default()));

        if Path::new("config/flowtide.yaml").exists() {
            figment = figment.merge(Yaml::file("config/flowtide.yaml"));
        }

        let env = std::env::var("FLOWTIDE_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::extract(figment)
    }

    /// Load configuration from a specific path, still honouring environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        let figment = Figment::from(Serialized::defaults(FlowtideConfig::default()))
            .merge(Yaml::file(path));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed("FLOWTIDE_").split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}
