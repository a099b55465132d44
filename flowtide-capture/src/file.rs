//! Stored capture files.
//!
//! Both classic pcap and pcapng are accepted; the format is chosen from the
//! leading magic number. The capture id is the blake3 digest of the whole
//! file, so the same file imported twice maps to the same documents.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::DataLink;
use tracing::{debug, info};

use crate::error::CaptureError;
use crate::frame::{Frame, LinkType};
use crate::source::PacketSource;

const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

enum Reader {
    Pcap(PcapReader<BufReader<File>>),
    PcapNg {
        reader: PcapNgReader<BufReader<File>>,
        /// Link type per interface, in declaration order.
        interfaces: Vec<Result<LinkType, String>>,
    },
}

pub struct CaptureFile {
    path: PathBuf,
    capture_id: String,
    link_type: LinkType,
    reader: Reader,
    next_index: u64,
}

impl std::fmt::Debug for CaptureFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureFile")
            .field("path", &self.path)
            .field("capture_id", &self.capture_id)
            .field("link_type", &self.link_type)
            .field("next_index", &self.next_index)
            .finish()
    }
}

impl CaptureFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |source: io::Error| CaptureError::Open {
            path: path.clone(),
            source,
        };

        let capture_id = {
            let mut file = File::open(&path).map_err(open_err)?;
            let mut hasher = blake3::Hasher::new();
            io::copy(&mut file, &mut hasher).map_err(open_err)?;
            hasher.finalize().to_hex().to_string()
        };

        let mut buffered = BufReader::new(File::open(&path).map_err(open_err)?);
        let is_pcapng = buffered.fill_buf().map_err(open_err)?.starts_with(&PCAPNG_MAGIC);

        let (reader, link_type) = if is_pcapng {
            let reader = PcapNgReader::new(buffered)
                .map_err(|e| CaptureError::Format(e.to_string()))?;
            let reader = Reader::PcapNg {
                reader,
                interfaces: Vec::new(),
            };
            // Refined once the first interface block is read.
            (reader, LinkType::Ethernet)
        } else {
            let reader =
                PcapReader::new(buffered).map_err(|e| CaptureError::Format(e.to_string()))?;
            let link_type = link_type_of(reader.header().datalink)
                .map_err(CaptureError::UnsupportedLinkType)?;
            (Reader::Pcap(reader), link_type)
        };

        info!(path = %path.display(), %capture_id, pcapng = is_pcapng, "Capture file opened");
        Ok(Self {
            path,
            capture_id,
            link_type,
            reader,
            next_index: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn framing(&self, message: impl ToString) -> CaptureError {
        CaptureError::Framing {
            frame: self.next_index,
            message: message.to_string(),
        }
    }

    /// Takes ownership of the record bytes; the frame shares that buffer.
    fn emit(&mut self, timestamp_ns: u64, link_type: LinkType, data: Vec<u8>, original_len: u32) -> Frame {
        let frame = Frame {
            index: self.next_index,
            timestamp_ns,
            link_type,
            data: Bytes::from(data),
            original_len,
        };
        self.next_index += 1;
        frame
    }
}

impl PacketSource for CaptureFile {
    fn capture_id(&self) -> &str {
        &self.capture_id
    }

    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let link_type = self.link_type;
        match &mut self.reader {
            Reader::Pcap(reader) => {
                let packet = match reader.next_packet() {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(self.framing(e)),
                    Some(Ok(packet)) => packet,
                };
                let timestamp_ns = packet.timestamp.as_nanos() as u64;
                let original_len = packet.orig_len;
                let data = packet.data.into_owned();
                Ok(Some(self.emit(timestamp_ns, link_type, data, original_len)))
            }
            Reader::PcapNg { .. } => self.next_pcapng_frame(),
        }
    }
}

impl CaptureFile {
    fn next_pcapng_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        loop {
            let Reader::PcapNg { reader, interfaces } = &mut self.reader else {
                return Ok(None);
            };
            let (interface, timestamp_ns, original_len, data) = match reader.next_block() {
                None => return Ok(None),
                Some(Err(e)) => {
                    let message = e.to_string();
                    return Err(self.framing(message));
                }
                Some(Ok(Block::InterfaceDescription(idb))) => {
                    let link_type = link_type_of(idb.linktype);
                    if interfaces.is_empty() {
                        if let Ok(first) = link_type {
                            self.link_type = first;
                        }
                    }
                    debug!(interface = interfaces.len(), ?link_type, "Interface declared");
                    interfaces.push(link_type);
                    continue;
                }
                Some(Ok(Block::EnhancedPacket(epb))) => (
                    epb.interface_id as usize,
                    epb.timestamp.as_nanos() as u64,
                    epb.original_len,
                    epb.data.into_owned(),
                ),
                Some(Ok(Block::SimplePacket(spb))) => (0, 0, spb.original_len, spb.data.into_owned()),
                Some(Ok(_)) => continue,
            };

            let link_type = match interfaces.get(interface) {
                Some(Ok(link_type)) => *link_type,
                Some(Err(name)) => return Err(CaptureError::UnsupportedLinkType(name.clone())),
                None => {
                    return Err(self.framing(format!("packet for undeclared interface {interface}")))
                }
            };
            return Ok(Some(self.emit(timestamp_ns, link_type, data, original_len)));
        }
    }
}

fn link_type_of(datalink: DataLink) -> Result<LinkType, String> {
    match datalink {
        DataLink::ETHERNET => Ok(LinkType::Ethernet),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => Ok(LinkType::RawIp),
        DataLink::LINUX_SLL => Ok(LinkType::LinuxSll),
        DataLink::NULL => Ok(LinkType::Null),
        other => Err(format!("{other:?}")),
    }
}
