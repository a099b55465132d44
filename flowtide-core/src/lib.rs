//! # flowtide-core
//!
//! Data model and per-flow state for the capture ingestion pipeline.
//!
//! ### Key Submodules:
//! - `flow`: flow keys, directions and decoded TCP segments
//! - `reassembly`: the per-flow TCP state machine producing ordered byte streams
//! - `record`: the persistable connection projection and its builder
//! - `events`: fire-and-forget notifications to subscribers
//! - `services`: destination port to service name table
//!
//! Nothing in this crate is shared between flows; every stateful type here is
//! owned by exactly one flow actor.

pub mod error;
pub mod events;
pub mod flow;
pub mod ids;
pub mod reassembly;
pub mod record;
pub mod services;
pub mod time;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::events::*;
    pub use crate::flow::*;
    pub use crate::reassembly::*;
    pub use crate::record::*;
    pub use crate::services::*;
}

pub use error::{ReassemblyError, RecordError};
