//! ## flowtide-telemetry::logging
//! **Structured logging with tracing**
//!
//! `RUST_LOG` wins over the configured level so a single run can be turned up
//! without editing the config file.

use tracing::info_span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global subscriber. Calling it twice is harmless: the
    /// second installation attempt is ignored.
    pub fn init(level: &str, json: bool) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let builder = fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_span_events(FmtSpan::NONE);

        let _ = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };
    }

    /// Logs a detection or lifecycle event inside its own span so log
    /// processors can group by `event_type`.
    pub fn log_event(event_type: &str, connection_id: &str, detail: &str) {
        let span = info_span!("stream_event", event_type = event_type);
        let _enter = span.enter();
        tracing::info!(connection_id, detail, "Stream event recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn logs_stream_event() {
        EventLogger::log_event("rule_match", "abc123", "flag");
        assert!(logs_contain("Stream event recorded"));
        assert!(logs_contain("abc123"));
    }
}
