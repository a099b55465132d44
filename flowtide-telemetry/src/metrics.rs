//! ## flowtide-telemetry::metrics
//! **Prometheus counters for the ingestion pipeline**
//!
//! Each import context owns its own registry; nothing is registered globally.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub registry: Registry,
    pub frames: IntCounter,
    pub payload_bytes: IntCounter,
    pub flows_opened: IntCounter,
    pub flows_finalized: IntCounter,
    pub flows_corrupted: IntCounter,
    pub matches: IntCounter,
    pub persistence_retries: IntCounter,
    pub persistence_failures: IntCounter,
    pub scan_latency: Histogram,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let frames = counter("flowtide_frames_total", "Frames read from capture sources")?;
        let payload_bytes = counter("flowtide_payload_bytes_total", "Reassembled payload bytes")?;
        let flows_opened = counter("flowtide_flows_opened_total", "Flows created")?;
        let flows_finalized = counter("flowtide_flows_finalized_total", "Flows finalized")?;
        let flows_corrupted =
            counter("flowtide_flows_corrupted_total", "Flows finalized as corrupted")?;
        let matches = counter("flowtide_matches_total", "Rule matches reported")?;
        let persistence_retries =
            counter("flowtide_persistence_retries_total", "Storage write retries")?;
        let persistence_failures = counter(
            "flowtide_persistence_failures_total",
            "Storage writes abandoned after retries",
        )?;

        let scan_latency = Histogram::with_opts(
            HistogramOpts::new("flowtide_scan_latency_ns", "Rule scan time per flush")
                .buckets(vec![1_000.0, 10_000.0, 100_000.0, 1_000_000.0, 10_000_000.0]),
        )?;
        registry.register(Box::new(scan_latency.clone()))?;

        Ok(Self {
            registry,
            frames,
            payload_bytes,
            flows_opened,
            flows_finalized,
            flows_corrupted,
            matches,
            persistence_retries,
            persistence_failures,
            scan_latency,
        })
    }

    /// Renders the text exposition format.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.frames.inc_by(3);
        metrics.matches.inc();

        let text = metrics.gather().unwrap();
        assert!(text.contains("flowtide_frames_total 3"));
        assert!(text.contains("flowtide_matches_total 1"));
    }

    #[test]
    fn registries_are_independent() {
        let a = PipelineMetrics::new().unwrap();
        let b = PipelineMetrics::new().unwrap();
        a.frames.inc();
        assert_eq!(b.frames.get(), 0);
    }
}
