//! ## flowtide-engine
//! **Capture import pipeline: from frames to persisted connection records**
//!
//! [`AppContext`] holds the validated settings and compiled rules.
//! [`SessionManager`] starts [`ImportSession`]s against it; each session
//! reads a [`PacketSource`](flowtide_capture::PacketSource), reassembles and
//! scans every TCP flow, and writes records through the configured storage.

pub mod context;
pub mod error;
pub mod manager;
pub mod pipeline;
pub mod rules;
pub mod session;

pub use context::{AppContext, PipelineContext, SETTINGS_ID};
pub use error::EngineError;
pub use manager::SessionManager;
pub use pipeline::persist::{Persister, RetryPolicy};
pub use rules::{ConfigRuleSource, RuleSource, StoredRuleSource};
pub use session::status::{ErrorScope, FlowCounts, SessionError, SessionState, SessionStatus};
pub use session::{ImportSession, SessionHandle};
