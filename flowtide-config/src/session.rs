//! Import session scheduling and persistence retry policy.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

/// Worker pool and backpressure parameters for one import.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct SessionConfig {
    /// Pool workers draining per-flow mailboxes.
    #[validate(range(min = 1, max = 1024))]
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Dispatched work items whose effects are not yet persisted.
    #[validate(range(min = 1, max = 1048576))]
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Frames buffered between the capture reader and the demultiplexer.
    #[validate(range(min = 1, max = 1048576))]
    #[serde(default = "default_frame_queue")]
    pub frame_queue: usize,

    /// Capture time between partial record writes of a long‑lived flow (seconds).
    #[validate(range(min = 1, max = 86400))]
    #[serde(default = "default_partial_flush_secs")]
    pub partial_flush_secs: u64,

    /// Capture time between idle sweeps (milliseconds).
    #[validate(range(min = 10, max = 600000))]
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Finished sessions a manager keeps queryable in memory.
    #[validate(range(min = 1, max = 1048576))]
    #[serde(default = "default_retained_sessions")]
    pub retained_sessions: usize,
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_max_in_flight() -> usize {
    4096
}

fn default_frame_queue() -> usize {
    1024
}

fn default_partial_flush_secs() -> u64 {
    30
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_retained_sessions() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_in_flight: default_max_in_flight(),
            frame_queue: default_frame_queue(),
            partial_flush_secs: default_partial_flush_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            retained_sessions: default_retained_sessions(),
        }
    }
}

/// Bounded exponential backoff for storage writes.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct PersistenceConfig {
    #[validate(range(max = 32))]
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[validate(range(min = 1, max = 60000))]
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[validate(range(min = 1, max = 600000))]
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}
