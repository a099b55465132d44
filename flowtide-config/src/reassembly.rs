//! Stream reassembly bounds.
//!
//! All timeouts are measured in capture time (frame timestamps), not wall
//! clock, so replaying an old capture behaves the same as the live run did.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::size::deserialize_size;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct ReassemblyConfig {
    /// Bytes held out of order per direction before the gap is declared lost.
    #[validate(range(min = 1024, max = 268435456))]
    #[serde(default = "default_max_held_bytes", deserialize_with = "deserialize_size")]
    pub max_held_bytes: usize,

    /// Segments held out of order per direction.
    #[validate(range(min = 1, max = 65536))]
    #[serde(default = "default_max_held_segments")]
    pub max_held_segments: usize,

    /// Oldest held segment age before the gap is declared lost (milliseconds).
    #[validate(range(min = 1, max = 3600000))]
    #[serde(default = "default_hold_timeout_ms")]
    pub hold_timeout_ms: u64,

    /// Flows without traffic for this long are closed (seconds).
    #[validate(range(min = 1, max = 86400))]
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Largest persisted stream chunk.
    #[validate(range(min = 512, max = 16777216))]
    #[serde(default = "default_chunk_size", deserialize_with = "deserialize_size")]
    pub chunk_size: usize,

    /// Boundary window for regex rules that do not declare `max_match_len`.
    #[validate(range(min = 16, max = 1048576))]
    #[serde(default = "default_match_window")]
    pub default_match_window: usize,
}

fn default_max_held_bytes() -> usize {
    1024 * 1024
}

fn default_max_held_segments() -> usize {
    1024
}

fn default_hold_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_match_window() -> usize {
    512
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_held_bytes: default_max_held_bytes(),
            max_held_segments: default_max_held_segments(),
            hold_timeout_ms: default_hold_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            chunk_size: default_chunk_size(),
            default_match_window: default_match_window(),
        }
    }
}
