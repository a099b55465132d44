//! Frame decoding down to TCP.
//!
//! Only Ethernet/IP/TCP framing is understood. Anything else is reported as
//! skipped with a reason, so the session can count it without treating it
//! as an error.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use flowtide_core::flow::TcpFlags;

use crate::error::DecodeError;
use crate::frame::{Frame, LinkType};

/// TCP header fields and payload of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTcp {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub seq: u32,
    pub flags: TcpFlags,
    /// Shares the frame's buffer.
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotIp,
    Fragmented,
    Udp,
    Icmp,
    OtherTransport,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotIp => "not_ip",
            SkipReason::Fragmented => "fragmented",
            SkipReason::Udp => "udp",
            SkipReason::Icmp => "icmp",
            SkipReason::OtherTransport => "other_transport",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Tcp(DecodedTcp),
    Skipped(SkipReason),
}

pub fn decode(frame: &Frame) -> Result<Decoded, DecodeError> {
    let malformed = |message: String| DecodeError::Malformed {
        frame: frame.index,
        message,
    };
    let data = &frame.data[..];
    let sliced = match frame.link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).map_err(|e| malformed(e.to_string())),
        LinkType::RawIp => SlicedPacket::from_ip(data).map_err(|e| malformed(e.to_string())),
        LinkType::LinuxSll => SlicedPacket::from_linux_sll(data).map_err(|e| malformed(e.to_string())),
        LinkType::Null => match data.get(4..) {
            Some(ip) => SlicedPacket::from_ip(ip).map_err(|e| malformed(e.to_string())),
            None => Err(malformed("loopback header truncated".to_string())),
        },
    }?;

    let (source_ip, destination_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            if ipv4.is_payload_fragmented() {
                return Ok(Decoded::Skipped(SkipReason::Fragmented));
            }
            let header = ipv4.header();
            (
                IpAddr::V4(header.source_addr()),
                IpAddr::V4(header.destination_addr()),
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            if ipv6.is_payload_fragmented() {
                return Ok(Decoded::Skipped(SkipReason::Fragmented));
            }
            let header = ipv6.header();
            (
                IpAddr::V6(header.source_addr()),
                IpAddr::V6(header.destination_addr()),
            )
        }
        _ => return Ok(Decoded::Skipped(SkipReason::NotIp)),
    };

    let tcp = match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        Some(TransportSlice::Udp(_)) => return Ok(Decoded::Skipped(SkipReason::Udp)),
        Some(TransportSlice::Icmpv4(_)) | Some(TransportSlice::Icmpv6(_)) => {
            return Ok(Decoded::Skipped(SkipReason::Icmp))
        }
        _ => return Ok(Decoded::Skipped(SkipReason::OtherTransport)),
    };

    let payload = tcp.payload();
    let payload = if payload.is_empty() {
        Bytes::new()
    } else {
        frame.data.slice_ref(payload)
    };

    Ok(Decoded::Tcp(DecodedTcp {
        source: SocketAddr::new(source_ip, tcp.source_port()),
        destination: SocketAddr::new(destination_ip, tcp.destination_port()),
        seq: tcp.sequence_number(),
        flags: TcpFlags {
            syn: tcp.syn(),
            ack: tcp.ack(),
            fin: tcp.fin(),
            rst: tcp.rst(),
        },
        payload,
    }))
}
