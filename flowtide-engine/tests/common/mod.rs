//! Capture builders and storage doubles shared by the engine tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use async_trait::async_trait;
use etherparse::PacketBuilder;
use flowtide_capture::{CaptureError, Frame, LinkType, MemorySource, PacketSource};
use flowtide_config::{CaptureConfig, FlowtideConfig};
use flowtide_core::events::{BroadcastNotifier, NotificationSink};
use flowtide_engine::{AppContext, SessionManager};
use flowtide_storage::{Collection, Filter, MemoryStorage, Storage, StorageError, UpsertOutcome};
use pcap_file::pcap::{PcapPacket, PcapWriter};
use serde_json::Value;

pub const FLAG: &str = r"FLAG\{[a-f0-9]{8}\}";
pub const SERVER_NET: &str = "10.10.0.0/16";

const CLIENT_MAC: [u8; 6] = [2, 0, 0, 0, 0, 1];
const SERVER_MAC: [u8; 6] = [2, 0, 0, 0, 0, 2];
const FRAME_STEP_NS: u64 = 1_000_000;

/// Frames of one capture, stamped from a shared clock.
#[derive(Debug, Default)]
pub struct Capture {
    frames: Vec<(u64, Vec<u8>)>,
    clock_ns: u64,
}

impl Capture {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            clock_ns: 1_700_000_000_000_000_000,
        }
    }

    /// Moves the capture clock forward without emitting anything.
    pub fn advance(&mut self, by: Duration) {
        self.clock_ns += by.as_nanos() as u64;
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.clock_ns += FRAME_STEP_NS;
        self.frames.push((self.clock_ns, frame));
    }

    pub fn udp(&mut self, source: ([u8; 4], u16), destination: ([u8; 4], u16), payload: &[u8]) {
        let builder = PacketBuilder::ethernet2(CLIENT_MAC, SERVER_MAC)
            .ipv4(source.0, destination.0, 64)
            .udp(source.1, destination.1);
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        self.push(out);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn source(&self, capture_id: &str) -> MemorySource {
        MemorySource::new(capture_id, LinkType::Ethernet).with_frames(self.frames.clone())
    }

    /// Writes the frames as a classic pcap file.
    pub fn write_pcap(&self, path: &Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = PcapWriter::new(file).unwrap();
        for (timestamp_ns, data) in &self.frames {
            let packet = PcapPacket::new(Duration::from_nanos(*timestamp_ns), data.len() as u32, data);
            writer.write_packet(&packet).unwrap();
        }
    }
}

#[derive(Clone, Copy)]
enum Side {
    Client,
    Server,
}

/// One TCP connection, tracking both sequence spaces.
pub struct Conversation {
    pub client: SocketAddr,
    pub server: SocketAddr,
    client_seq: u32,
    server_seq: u32,
}

impl Conversation {
    pub fn new(client: &str, server: &str) -> Self {
        Self {
            client: client.parse().unwrap(),
            server: server.parse().unwrap(),
            client_seq: 1_000,
            server_seq: 50_000,
        }
    }

    pub fn with_isn(mut self, client_seq: u32, server_seq: u32) -> Self {
        self.client_seq = client_seq;
        self.server_seq = server_seq;
        self
    }

    fn endpoints(&self, side: Side) -> (SocketAddr, SocketAddr, [u8; 6], [u8; 6]) {
        match side {
            Side::Client => (self.client, self.server, CLIENT_MAC, SERVER_MAC),
            Side::Server => (self.server, self.client, SERVER_MAC, CLIENT_MAC),
        }
    }

    fn seq(&mut self, side: Side) -> &mut u32 {
        match side {
            Side::Client => &mut self.client_seq,
            Side::Server => &mut self.server_seq,
        }
    }

    fn frame(&self, side: Side, seq: u32, flags: &str, payload: &[u8]) -> Vec<u8> {
        let (from, to, from_mac, to_mac) = self.endpoints(side);
        let ack = match side {
            Side::Client => self.server_seq,
            Side::Server => self.client_seq,
        };
        let (SocketAddr::V4(from), SocketAddr::V4(to)) = (from, to) else {
            panic!("test conversations are IPv4");
        };
        let ip = |a: &std::net::SocketAddrV4| -> [u8; 4] { Ipv4Addr::octets(a.ip()) };

        let mut builder = PacketBuilder::ethernet2(from_mac, to_mac)
            .ipv4(ip(&from), ip(&to), 64)
            .tcp(from.port(), to.port(), seq, 65_535);
        for flag in flags.chars() {
            builder = match flag {
                'S' => builder.syn(),
                'A' => builder.ack(ack),
                'P' => builder.psh(),
                'F' => builder.fin(),
                'R' => builder.rst(),
                other => panic!("unknown flag {other}"),
            };
        }
        let mut out = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut out, payload).unwrap();
        out
    }

    fn send(&mut self, capture: &mut Capture, side: Side, flags: &str, payload: &[u8]) {
        let seq = *self.seq(side);
        let frame = self.frame(side, seq, flags, payload);
        let consumed = payload.len() as u32 + u32::from(flags.contains('S')) + u32::from(flags.contains('F'));
        *self.seq(side) = seq.wrapping_add(consumed);
        capture.push(frame);
    }

    pub fn handshake(&mut self, capture: &mut Capture) -> &mut Self {
        self.send(capture, Side::Client, "S", &[]);
        self.send(capture, Side::Server, "SA", &[]);
        self.send(capture, Side::Client, "A", &[]);
        self
    }

    pub fn client_sends(&mut self, capture: &mut Capture, payload: &[u8]) -> &mut Self {
        self.send(capture, Side::Client, "PA", payload);
        self
    }

    pub fn server_sends(&mut self, capture: &mut Capture, payload: &[u8]) -> &mut Self {
        self.send(capture, Side::Server, "PA", payload);
        self
    }

    /// Client bytes that never make it into the capture.
    pub fn client_loses(&mut self, len: u32) -> &mut Self {
        self.client_seq = self.client_seq.wrapping_add(len);
        self
    }

    pub fn reset(&mut self, capture: &mut Capture) -> &mut Self {
        self.send(capture, Side::Client, "RA", &[]);
        self
    }

    /// FIN from each side, then the last ACK.
    pub fn close(&mut self, capture: &mut Capture) -> &mut Self {
        self.send(capture, Side::Client, "FA", &[]);
        self.send(capture, Side::Server, "FA", &[]);
        self.send(capture, Side::Client, "A", &[]);
        self
    }
}

pub fn base_config() -> FlowtideConfig {
    let mut config = FlowtideConfig::default();
    config.session.workers = 4;
    config.persistence.initial_backoff_ms = 1;
    config.persistence.max_backoff_ms = 5;
    config
}

pub async fn configured_app(config: FlowtideConfig, storage: Arc<dyn Storage>) -> Arc<AppContext> {
    let notifier: Arc<dyn NotificationSink> = Arc::new(BroadcastNotifier::new(1024));
    let app = AppContext::new(config, storage, notifier).unwrap();
    app.configure(CaptureConfig::new(SERVER_NET, FLAG)).await.unwrap();
    Arc::new(app)
}

pub async fn manager(storage: Arc<dyn Storage>) -> SessionManager {
    SessionManager::new(configured_app(base_config(), storage).await)
}

/// Serves frames up to `open_after`, then blocks until the gate is released.
pub struct GatedSource {
    inner: MemorySource,
    open_after: u64,
    served: u64,
    gate: Option<mpsc::Receiver<()>>,
}

impl GatedSource {
    pub fn new(inner: MemorySource, open_after: u64) -> (Self, mpsc::Sender<()>) {
        let (release, gate) = mpsc::channel();
        (
            Self {
                inner,
                open_after,
                served: 0,
                gate: Some(gate),
            },
            release,
        )
    }
}

impl PacketSource for GatedSource {
    fn capture_id(&self) -> &str {
        self.inner.capture_id()
    }

    fn link_type(&self) -> LinkType {
        self.inner.link_type()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.served == self.open_after {
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
        }
        self.served += 1;
        self.inner.next_frame()
    }
}

/// Memory storage that rejects some writes with a transient error.
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    failing_port: Option<u16>,
    match_failures: AtomicUsize,
    pub rejected: AtomicUsize,
}

impl FaultyStorage {
    /// Every connection upsert for this server port fails.
    pub fn failing_port(port: u16) -> Self {
        Self {
            inner: MemoryStorage::new(),
            failing_port: Some(port),
            match_failures: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    /// The next `times` match upserts fail.
    pub fn failing_matches(times: usize) -> Self {
        Self {
            inner: MemoryStorage::new(),
            failing_port: None,
            match_failures: AtomicUsize::new(times),
            rejected: AtomicUsize::new(0),
        }
    }

    fn rejects(&self, collection: Collection, document: &Value) -> bool {
        match collection {
            Collection::Connections => self
                .failing_port
                .is_some_and(|port| document["server_port"].as_u64() == Some(u64::from(port))),
            Collection::Matches => self
                .match_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok(),
            _ => false,
        }
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, StorageError> {
        self.inner.find(collection, filter).await
    }

    async fn find_one(&self, collection: Collection, filter: &Filter) -> Result<Option<Value>, StorageError> {
        self.inner.find_one(collection, filter).await
    }

    async fn upsert(&self, collection: Collection, document: Value) -> Result<UpsertOutcome, StorageError> {
        if self.rejects(collection, &document) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("connection refused".into()));
        }
        self.inner.upsert(collection, document).await
    }

    async fn update(&self, collection: Collection, filter: &Filter, changes: Value) -> Result<usize, StorageError> {
        self.inner.update(collection, filter, changes).await
    }
}
