//! flowtide-capture
//!
//! Capture sources and frame decoding for the ingestion pipeline.
//! Stored captures (pcap and pcapng) are always available; live capture
//! through libpcap sits behind the `live` feature.

pub mod decode;
pub mod error;
pub mod file;
pub mod frame;
#[cfg(feature = "live")]
pub mod live;
pub mod source;

pub use decode::{decode, Decoded, DecodedTcp, SkipReason};
pub use error::{CaptureError, DecodeError};
pub use file::CaptureFile;
pub use frame::{Frame, LinkType};
#[cfg(feature = "live")]
pub use live::LiveCapture;
pub use source::{MemorySource, PacketSource};
