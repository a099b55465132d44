//! # Flowtide Telemetry
//!
//! Logging initialisation and prometheus metrics for the ingestion pipeline.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::PipelineMetrics;
