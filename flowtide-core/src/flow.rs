//! Flow identity and decoded segments.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Transport protocol of a flow. Only TCP is reassembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
        }
    }
}

/// Which endpoint sent a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::ClientToServer, Direction::ServerToClient];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Direction::ClientToServer => 0,
            Direction::ServerToClient => 1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToServer => "client_to_server",
            Direction::ServerToClient => "server_to_client",
        }
    }
}

/// Whether the server side of a flow was decided by the configured subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionClass {
    /// At least one endpoint lies in the server subnet.
    Classified,
    /// Neither endpoint is in the subnet; orientation is a heuristic.
    Unclassified,
}

/// Oriented flow identity: client first, server second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub transport: Transport,
}

impl FlowKey {
    pub fn tcp(client: SocketAddr, server: SocketAddr) -> Self {
        Self {
            client_ip: client.ip(),
            client_port: client.port(),
            server_ip: server.ip(),
            server_port: server.port(),
            transport: Transport::Tcp,
        }
    }

    pub fn client(&self) -> SocketAddr {
        SocketAddr::new(self.client_ip, self.client_port)
    }

    pub fn server(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.server_port)
    }

    /// The same connection seen with the roles swapped.
    pub fn reversed(&self) -> Self {
        Self {
            client_ip: self.server_ip,
            client_port: self.server_port,
            server_ip: self.client_ip,
            server_port: self.client_port,
            transport: self.transport,
        }
    }

    /// Direction of a packet sent from `source`, or `None` if the source is
    /// not an endpoint of this flow.
    pub fn direction_from(&self, source: SocketAddr) -> Option<Direction> {
        if source == self.client() {
            Some(Direction::ClientToServer)
        } else if source == self.server() {
            Some(Direction::ServerToClient)
        } else {
            None
        }
    }

    /// Stable byte encoding used when deriving document ids.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(40);
        for (ip, port) in [
            (self.client_ip, self.client_port),
            (self.server_ip, self.server_port),
        ] {
            match ip {
                IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
                IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
            }
            out.extend_from_slice(&port.to_be_bytes());
        }
        out.extend_from_slice(self.transport.as_str().as_bytes());
        out
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}/{}",
            self.client(),
            self.server(),
            self.transport.as_str()
        )
    }
}

/// TCP control flags relevant to reassembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    /// A bare SYN opens a connection from the client side.
    pub fn is_connection_request(&self) -> bool {
        self.syn && !self.ack
    }
}

/// One unit of TCP payload routed to a flow. Immutable once built.
#[derive(Debug, Clone)]
pub struct Segment {
    pub key: FlowKey,
    pub direction: Direction,
    pub seq: u32,
    pub payload: Bytes,
    pub flags: TcpFlags,
    pub timestamp_ns: u64,
    /// Position of the carrying frame within its capture source.
    pub frame_index: u64,
}

impl Segment {
    /// Whether this segment may open a new flow. Bare ACKs, FINs and RSTs
    /// for an unknown flow are stragglers of a connection already closed.
    pub fn can_open_flow(&self) -> bool {
        !self.flags.rst && (self.flags.syn || !self.payload.is_empty())
    }
}
