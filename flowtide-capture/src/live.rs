//! Live capture from a network interface through libpcap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use pcap::{Active, Capture, Device};
use tracing::info;

use crate::error::CaptureError;
use crate::frame::{Frame, LinkType};
use crate::source::PacketSource;

const READ_TIMEOUT_MS: i32 = 250;

pub struct LiveCapture {
    capture: Capture<Active>,
    capture_id: String,
    link_type: LinkType,
    stop: Arc<AtomicBool>,
    next_index: u64,
}

impl LiveCapture {
    /// Opens `interface`. The returned flag ends the capture when set; the
    /// source then reports end of stream at the next read timeout.
    pub fn open(
        interface: &str,
        snaplen: i32,
        promiscuous: bool,
    ) -> Result<(Self, Arc<AtomicBool>), CaptureError> {
        let live = |e: pcap::Error| CaptureError::Live(e.to_string());
        let device = Device::list()
            .map_err(live)?
            .into_iter()
            .find(|d| d.name == interface)
            .ok_or_else(|| CaptureError::Live(format!("interface {interface} not found")))?;

        let capture = Capture::from_device(device)
            .map_err(live)?
            .promisc(promiscuous)
            .snaplen(snaplen)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(live)?;

        let link_type = match capture.get_datalink() {
            pcap::Linktype::ETHERNET => LinkType::Ethernet,
            pcap::Linktype::RAW | pcap::Linktype::IPV4 | pcap::Linktype::IPV6 => LinkType::RawIp,
            pcap::Linktype::LINUX_SLL => LinkType::LinuxSll,
            pcap::Linktype::NULL => LinkType::Null,
            other => return Err(CaptureError::UnsupportedLinkType(format!("{other:?}"))),
        };

        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let capture_id = format!("live:{interface}:{started}");
        info!(interface, %capture_id, ?link_type, "Live capture started");

        let stop = Arc::new(AtomicBool::new(false));
        Ok((
            Self {
                capture,
                capture_id,
                link_type,
                stop: Arc::clone(&stop),
                next_index: 0,
            },
            stop,
        ))
    }
}

impl PacketSource for LiveCapture {
    fn capture_id(&self) -> &str {
        &self.capture_id
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        while !self.stop.load(Ordering::Relaxed) {
            match self.capture.next_packet() {
                Ok(packet) => {
                    let ts = packet.header.ts;
                    let timestamp_ns =
                        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_usec as u64 * 1_000;
                    let frame = Frame {
                        index: self.next_index,
                        timestamp_ns,
                        link_type: self.link_type,
                        data: Bytes::copy_from_slice(packet.data),
                        original_len: packet.header.len,
                    };
                    self.next_index += 1;
                    return Ok(Some(frame));
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(CaptureError::Live(e.to_string())),
            }
        }
        Ok(None)
    }
}
