//! Application configuration state.
//!
//! [`AppContext`] starts unconfigured. `configure` installs an immutable
//! [`PipelineContext`] once; changing settings afterwards goes through
//! `reconfigure`, which builds a fresh context. Sessions hold the context they
//! started with, so a reconfiguration never changes a running import.

use std::sync::Arc;

use flowtide_config::validation::parse_server_network;
use flowtide_config::{CaptureConfig, ConfigError, FlowtideConfig, ServiceConfig};
use flowtide_core::events::NotificationSink;
use flowtide_core::reassembly::ReassemblyLimits;
use flowtide_core::record::RecordOptions;
use flowtide_core::services::ServiceTable;
use flowtide_core::time::NANOS_PER_SEC;
use flowtide_detection::RuleSet;
use flowtide_storage::{documents, Collection, Filter, Storage};
use flowtide_telemetry::PipelineMetrics;
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::error::EngineError;
use crate::pipeline::persist::{Persister, RetryPolicy};
use crate::rules::{collect_rule_specs, ConfigRuleSource, RuleSource, StoredRuleSource};

/// Id of the settings document.
pub const SETTINGS_ID: &str = "config";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(rename = "_id")]
    id: String,
    config: CaptureConfig,
}

/// Everything an import session needs, fixed at configuration time.
pub struct PipelineContext {
    pub config: FlowtideConfig,
    pub server_network: IpNetwork,
    pub rules: Arc<RuleSet>,
    pub services: Arc<ServiceTable>,
    pub storage: Arc<dyn Storage>,
    pub notifier: Arc<dyn NotificationSink>,
    pub metrics: Arc<PipelineMetrics>,
}

impl PipelineContext {
    pub fn settings(&self) -> &CaptureConfig {
        &self.config.capture
    }

    pub fn persister(&self) -> Persister {
        Persister::new(
            Arc::clone(&self.storage),
            RetryPolicy::from(&self.config.persistence),
            Arc::clone(&self.metrics),
        )
    }

    pub fn reassembly_limits(&self) -> ReassemblyLimits {
        let r = &self.config.reassembly;
        ReassemblyLimits::new(r.max_held_bytes, r.max_held_segments, r.hold_timeout_ms)
    }

    pub fn record_options(&self) -> RecordOptions {
        RecordOptions {
            chunk_size: self.config.reassembly.chunk_size,
            checkpoint_interval_ns: self.config.session.partial_flush_secs.saturating_mul(NANOS_PER_SEC),
        }
    }

    pub fn idle_timeout_ns(&self) -> u64 {
        self.config.reassembly.idle_timeout_secs.saturating_mul(NANOS_PER_SEC)
    }
}

enum ConfigState {
    Unconfigured,
    Configured(Arc<PipelineContext>),
}

pub struct AppContext {
    base: FlowtideConfig,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn NotificationSink>,
    metrics: Arc<PipelineMetrics>,
    rule_sources: Vec<Arc<dyn RuleSource>>,
    state: RwLock<ConfigState>,
    /// Serialises configure and reconfigure.
    transition: tokio::sync::Mutex<()>,
}

impl AppContext {
    /// An unconfigured context. Rules come from `base.rules` and from the
    /// `rules` collection, in that order.
    pub fn new(
        base: FlowtideConfig,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, EngineError> {
        let metrics = PipelineMetrics::new().map_err(|e| EngineError::Metrics(e.to_string()))?;
        let rule_sources: Vec<Arc<dyn RuleSource>> = vec![
            Arc::new(ConfigRuleSource::new(base.rules.clone())),
            Arc::new(StoredRuleSource::new(Arc::clone(&storage))),
        ];
        Ok(Self {
            base,
            storage,
            notifier,
            metrics: Arc::new(metrics),
            rule_sources,
            state: RwLock::new(ConfigState::Unconfigured),
            transition: tokio::sync::Mutex::new(()),
        })
    }

    /// Replaces the rule sources consulted at configuration time.
    pub fn with_rule_sources(mut self, sources: Vec<Arc<dyn RuleSource>>) -> Self {
        self.rule_sources = sources;
        self
    }

    /// Creates a context and restores the persisted settings. It is
    /// configured right away when the stored settings, or failing those the
    /// file settings, are complete.
    #[instrument(level = "info", skip_all)]
    pub async fn load(
        base: FlowtideConfig,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self, EngineError> {
        let context = Self::new(base, storage, notifier)?;
        let stored: Option<SettingsDocument> =
            documents::get(context.storage.as_ref(), Collection::Settings, SETTINGS_ID).await?;

        let settings = match stored {
            Some(doc) if doc.config.is_complete() => {
                info!("Restoring persisted settings");
                doc.config
            }
            _ => context.base.capture.clone(),
        };
        if settings.is_complete() {
            context.configure(settings).await?;
        } else {
            info!("No complete settings yet, starting unconfigured");
        }
        Ok(context)
    }

    pub fn is_configured(&self) -> bool {
        matches!(*self.state.read(), ConfigState::Configured(_))
    }

    pub fn context(&self) -> Result<Arc<PipelineContext>, EngineError> {
        match &*self.state.read() {
            ConfigState::Configured(context) => Ok(Arc::clone(context)),
            ConfigState::Unconfigured => Err(EngineError::NotConfigured),
        }
    }

    /// Configuration the context was created with.
    pub fn config(&self) -> &FlowtideConfig {
        &self.base
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// The only transition out of the unconfigured state.
    #[instrument(level = "info", skip_all, fields(server = ?settings.server_address))]
    pub async fn configure(&self, settings: CaptureConfig) -> Result<Arc<PipelineContext>, EngineError> {
        let _transition = self.transition.lock().await;
        if self.is_configured() {
            warn!("Configure rejected, already configured");
            return Err(EngineError::AlreadyConfigured);
        }
        self.install(settings).await
    }

    /// Replaces the settings of a configured (or unconfigured) context.
    #[instrument(level = "info", skip_all, fields(server = ?settings.server_address))]
    pub async fn reconfigure(&self, settings: CaptureConfig) -> Result<Arc<PipelineContext>, EngineError> {
        let _transition = self.transition.lock().await;
        self.install(settings).await
    }

    async fn install(&self, settings: CaptureConfig) -> Result<Arc<PipelineContext>, EngineError> {
        let context = Arc::new(self.build(settings).await?);

        let document = SettingsDocument {
            id: SETTINGS_ID.to_string(),
            config: context.settings().clone(),
        };
        context.persister().put(Collection::Settings, &document).await?;

        *self.state.write() = ConfigState::Configured(Arc::clone(&context));
        info!(
            rules = context.rules.len(),
            services = context.services.len(),
            network = %context.server_network,
            "Application configured"
        );
        Ok(context)
    }

    async fn build(&self, settings: CaptureConfig) -> Result<PipelineContext, EngineError> {
        if !settings.is_complete() {
            return Err(EngineError::IncompleteSettings);
        }
        settings.validate().map_err(ConfigError::from)?;
        let (Some(address), Some(flag_regex)) = (&settings.server_address, &settings.flag_regex)
        else {
            return Err(EngineError::IncompleteSettings);
        };
        let server_network = parse_server_network(address).ok_or(EngineError::IncompleteSettings)?;

        let specs = collect_rule_specs(flag_regex, &self.rule_sources).await?;
        let rules = RuleSet::compile(specs, self.base.reassembly.default_match_window)?;

        let stored_services: Vec<ServiceConfig> =
            documents::list(self.storage.as_ref(), Collection::Services, &Filter::all()).await?;
        let services = ServiceTable::new(self.base.services.iter().map(|s| (s.port, s.name.clone())))
            .with_overrides(stored_services.into_iter().map(|s| (s.port, s.name)));

        let mut config = self.base.clone();
        config.capture = settings;
        Ok(PipelineContext {
            config,
            server_network,
            rules: Arc::new(rules),
            services: Arc::new(services),
            storage: Arc::clone(&self.storage),
            notifier: Arc::clone(&self.notifier),
            metrics: Arc::clone(&self.metrics),
        })
    }
}
