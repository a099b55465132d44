//! ## flowtide-engine::pipeline::demux
//! **Routes decoded TCP packets to per-flow slots**
//!
//! The registry is owned by the single driver task, so a key is looked up
//! and, if absent, inserted without any locking and at most once. The slot
//! type is generic so routing can be exercised without a running session.

use std::collections::HashMap;
use std::net::SocketAddr;

use flowtide_capture::DecodedTcp;
use flowtide_core::flow::{Direction, DirectionClass, FlowKey, Segment, TcpFlags};
use ipnetwork::IpNetwork;
use tracing::trace;

#[derive(Debug)]
struct Entry<T> {
    slot: T,
    last_seen_ns: u64,
}

/// Outcome of routing one packet.
#[derive(Debug)]
pub enum Routed<T> {
    Dispatch {
        slot: T,
        segment: Segment,
        /// The slot was created for this packet.
        opened: bool,
    },
    /// The packet belongs to no known flow and cannot open one.
    Dropped,
}

#[derive(Debug)]
pub struct FlowDemultiplexer<T> {
    server_network: IpNetwork,
    idle_timeout_ns: u64,
    flows: HashMap<FlowKey, Entry<T>>,
}

impl<T: Clone> FlowDemultiplexer<T> {
    pub fn new(server_network: IpNetwork, idle_timeout_ns: u64) -> Self {
        Self {
            server_network,
            idle_timeout_ns,
            flows: HashMap::new(),
        }
    }

    /// Finds the flow of `packet` in either orientation, or creates one
    /// through `open` when the packet may start a connection.
    pub fn route<F>(&mut self, packet: DecodedTcp, frame_index: u64, timestamp_ns: u64, open: F) -> Routed<T>
    where
        F: FnOnce(&FlowKey, DirectionClass) -> T,
    {
        let forward = FlowKey::tcp(packet.source, packet.destination);
        let known = if self.flows.contains_key(&forward) {
            Some((forward, Direction::ClientToServer))
        } else if self.flows.contains_key(&forward.reversed()) {
            Some((forward.reversed(), Direction::ServerToClient))
        } else {
            None
        };

        let (key, direction, opened) = match known {
            Some((key, direction)) => (key, direction, false),
            None => {
                let (key, classification) = self.orient(&packet);
                let direction = key
                    .direction_from(packet.source)
                    .unwrap_or(Direction::ClientToServer);
                let segment = segment(key, direction, packet, frame_index, timestamp_ns);
                if !segment.can_open_flow() {
                    trace!(key = %key, "Packet for unknown flow dropped");
                    return Routed::Dropped;
                }
                let slot = open(&key, classification);
                self.flows.insert(
                    key,
                    Entry {
                        slot: slot.clone(),
                        last_seen_ns: timestamp_ns,
                    },
                );
                return Routed::Dispatch {
                    slot,
                    segment,
                    opened: true,
                };
            }
        };

        let Some(entry) = self.flows.get_mut(&key) else {
            return Routed::Dropped;
        };
        entry.last_seen_ns = entry.last_seen_ns.max(timestamp_ns);
        Routed::Dispatch {
            slot: entry.slot.clone(),
            segment: segment(key, direction, packet, frame_index, timestamp_ns),
            opened,
        }
    }

    /// Removes and returns flows without traffic for the idle timeout.
    pub fn sweep_idle(&mut self, now_ns: u64) -> Vec<T> {
        let timeout = self.idle_timeout_ns;
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, entry)| now_ns.saturating_sub(entry.last_seen_ns) >= timeout)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.flows.remove(&key))
            .map(|entry| entry.slot)
            .collect()
    }

    /// Removes every flow, oldest activity first.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut entries: Vec<Entry<T>> = self.flows.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.last_seen_ns);
        entries.into_iter().map(|entry| entry.slot).collect()
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Decides which endpoint is the server. Membership in the server
    /// network wins; otherwise the connection handshake, then the port
    /// numbers decide, and the flow is marked unclassified unless one
    /// endpoint was in the network.
    fn orient(&self, packet: &DecodedTcp) -> (FlowKey, DirectionClass) {
        let source_in = self.server_network.contains(packet.source.ip());
        let destination_in = self.server_network.contains(packet.destination.ip());
        match (source_in, destination_in) {
            (false, true) => (
                FlowKey::tcp(packet.source, packet.destination),
                DirectionClass::Classified,
            ),
            (true, false) => (
                FlowKey::tcp(packet.destination, packet.source),
                DirectionClass::Classified,
            ),
            (true, true) => (heuristic(packet), DirectionClass::Classified),
            (false, false) => (heuristic(packet), DirectionClass::Unclassified),
        }
    }
}

fn heuristic(packet: &DecodedTcp) -> FlowKey {
    let (source, destination) = (packet.source, packet.destination);
    let source_is_client = if packet.flags.is_connection_request() {
        true
    } else if packet.flags.syn && packet.flags.ack {
        false
    } else {
        higher_port_is(source, destination)
    };
    if source_is_client {
        FlowKey::tcp(source, destination)
    } else {
        FlowKey::tcp(destination, source)
    }
}

/// Ephemeral ports are usually the higher ones. Ties keep the sender as client.
fn higher_port_is(candidate: SocketAddr, other: SocketAddr) -> bool {
    candidate.port() >= other.port()
}

fn segment(key: FlowKey, direction: Direction, packet: DecodedTcp, frame_index: u64, timestamp_ns: u64) -> Segment {
    Segment {
        key,
        direction,
        seq: packet.seq,
        payload: packet.payload,
        flags: packet.flags,
        timestamp_ns,
        frame_index,
    }
}
