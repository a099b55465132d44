use bytes::Bytes;

/// Link-layer framing of captured bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Bare IPv4 or IPv6 packets.
    RawIp,
    LinuxSll,
    /// BSD loopback: a 4-byte address family, then IP.
    Null,
}

/// One captured frame, as read from a source.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position within the source, starting at zero.
    pub index: u64,
    pub timestamp_ns: u64,
    pub link_type: LinkType,
    pub data: Bytes,
    /// Length on the wire; larger than `data` for truncated snapshots.
    pub original_len: u32,
}

impl Frame {
    pub fn new(index: u64, timestamp_ns: u64, link_type: LinkType, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            index,
            timestamp_ns,
            link_type,
            original_len: data.len() as u32,
            data,
        }
    }
}
