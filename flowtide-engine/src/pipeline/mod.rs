//! Stages a session wires together: demultiplexing, per-flow actors, the
//! worker pool that drives them, and the persister they write through.

pub(crate) mod actor;
pub mod demux;
pub mod persist;
pub(crate) mod pool;
