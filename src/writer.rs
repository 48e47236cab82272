//! Capture export
//!
//! [`CaptureWriter`] re-emits fetched records as a legacy pcap stream or as a
//! pcapng stream. The global header (or section header and interface
//! description) is written once per output, even when several linked sessions
//! spanning several files are written to it. Output goes to the underlying
//! writer in fixed-size chunks.
//!
//! pcapng blocks are written little-endian:
//!
//! - Section Header Block: type, length (32), byte-order magic, version 1.0,
//!   unknown section length, empty options, length.
//! - Interface Description Block: type, length (24), link type, reserved,
//!   snap length, empty options, length.
//! - Enhanced Packet Block per record: interface 0, 64-bit microsecond
//!   timestamp as high and low words, captured and original length, the frame
//!   padded to 4 bytes, empty options.
//! - A custom block per session (type `0x80808080`, tag `MOWL`) holding the
//!   session record as length-prefixed JSON.

use std::io::Write;
use std::str::FromStr;

use async_trait::async_trait;
use circular::Buffer;
use cookie_factory::bytes::{le_i64, le_u16, le_u32};
use cookie_factory::combinator::slice;
use cookie_factory::sequence::tuple;
use cookie_factory::{gen, SerializeFn};
use rusticata_macros::align32;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::fetch::{FetchSummary, FetchedPacket, PacketSink};
use crate::linktype::Linktype;
use crate::pcap::{PacketRecord, PcapHeader};
use crate::session::{FileKey, Session};
use crate::PcapError;

pub const SHB_MAGIC: u32 = 0x0A0D_0D0A;
pub const BOM_MAGIC: u32 = 0x1A2B_3C4D;
pub const IDB_MAGIC: u32 = 0x0000_0001;
pub const EPB_MAGIC: u32 = 0x0000_0006;
pub const CUSTOM_BLOCK_MAGIC: u32 = 0x8080_8080;
pub const SESSION_BLOCK_TAG: &[u8; 4] = b"MOWL";

/// Default output chunk size
pub const WRITE_CHUNK_SIZE: usize = 0xfffe;

const SHB_LEN: u32 = 32;
const IDB_LEN: u32 = 24;

/// Output container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Legacy pcap: global header then records verbatim
    Legacy,
    /// pcapng with a session metadata block
    Enhanced,
}

impl FromStr for CaptureFormat {
    type Err = PcapError;

    fn from_str(s: &str) -> Result<CaptureFormat, PcapError> {
        match s.to_ascii_lowercase().as_str() {
            "pcap" | "legacy" => Ok(CaptureFormat::Legacy),
            "pcapng" | "enhanced" => Ok(CaptureFormat::Enhanced),
            other => Err(PcapError::Config(format!("unknown capture format {:?}", other))),
        }
    }
}

fn padding_for<'a, W: Write + 'a>(unaligned_length: u32) -> impl SerializeFn<W> + 'a {
    let length = align32!(unaligned_length) - unaligned_length;
    slice(if length > 0 {
        &[0, 0, 0, 0][..length as usize]
    } else {
        b""
    })
}

fn section_header_le<W: Write>() -> impl SerializeFn<W> {
    tuple((
        le_u32(SHB_MAGIC),
        le_u32(SHB_LEN),
        le_u32(BOM_MAGIC),
        le_u16(1),
        le_u16(0),
        le_i64(-1),
        le_u32(0),
        le_u32(SHB_LEN),
    ))
}

fn interface_description_le<W: Write>(header: &PcapHeader) -> impl SerializeFn<W> {
    tuple((
        le_u32(IDB_MAGIC),
        le_u32(IDB_LEN),
        le_u16(header.network.0 as u16),
        le_u16(0),
        le_u32(header.snaplen),
        le_u32(0),
        le_u32(IDB_LEN),
    ))
}

fn enhanced_packet_le<'a, W: Write + 'a>(record: &'a PacketRecord, nanosecond: bool) -> impl SerializeFn<W> + 'a {
    let data = record.frame();
    let caplen = data.len() as u32;
    let block_len = align32!(16 + caplen + 20);
    let ts = record.timestamp_usec(nanosecond);
    tuple((
        le_u32(EPB_MAGIC),
        le_u32(block_len),
        le_u32(0),
        le_u32((ts >> 32) as u32),
        le_u32(ts as u32),
        le_u32(caplen),
        le_u32(record.header.origlen),
        slice(data),
        padding_for(caplen),
        le_u32(0),
        le_u32(block_len),
    ))
}

fn session_block_le<'a, W: Write + 'a>(json: &'a [u8]) -> impl SerializeFn<W> + 'a {
    let json_len = json.len() as u32;
    let block_len = align32!(json_len + 20);
    tuple((
        le_u32(CUSTOM_BLOCK_MAGIC),
        le_u32(block_len),
        slice(SESSION_BLOCK_TAG),
        le_u32(json_len),
        slice(json),
        padding_for(json_len),
        le_u32(block_len),
    ))
}

fn encode<F: SerializeFn<Vec<u8>>>(f: F, capacity: usize) -> Result<Vec<u8>, PcapError> {
    let (v, _) = gen(f, Vec::with_capacity(capacity))?;
    Ok(v)
}

/// Streaming capture writer
pub struct CaptureWriter<W> {
    out: W,
    format: CaptureFormat,
    buffer: Buffer,
    chunk_size: usize,
    section_written: bool,
    /// Magic number and link type of the header written first
    header: Option<(u32, Linktype)>,
    packets: usize,
    bytes: u64,
}

impl<W: AsyncWrite + Unpin + Send> CaptureWriter<W> {
    pub fn new(out: W, format: CaptureFormat, chunk_size: usize) -> CaptureWriter<W> {
        let chunk_size = chunk_size.max(1);
        CaptureWriter {
            out,
            format,
            buffer: Buffer::with_capacity(chunk_size),
            chunk_size,
            section_written: false,
            header: None,
            packets: 0,
            bytes: 0,
        }
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn packets_written(&self) -> usize {
        self.packets
    }

    /// Emit the global header on the first call
    ///
    /// Later calls only check that the file fits the header already written:
    /// same link type and, for the legacy format whose records are copied
    /// verbatim, same byte order and timestamp precision.
    pub async fn write_header(&mut self, header: &PcapHeader) -> Result<(), PcapError> {
        if let Some((magic, network)) = self.header {
            if network != header.network {
                return Err(PcapError::IncompatibleCapture(format!(
                    "link type {} after {}",
                    header.network, network
                )));
            }
            if self.format == CaptureFormat::Legacy && magic != header.magic_number {
                return Err(PcapError::IncompatibleCapture(format!(
                    "magic {:08x} after {:08x}",
                    header.magic_number, magic
                )));
            }
            return Ok(());
        }
        match self.format {
            CaptureFormat::Legacy => self.push(&header.raw).await?,
            CaptureFormat::Enhanced => {
                self.write_section().await?;
                let idb = encode(interface_description_le(header), IDB_LEN as usize)?;
                self.push(&idb).await?;
            }
        }
        self.header = Some((header.magic_number, header.network));
        debug!(format = ?self.format, linktype = %header.network, "wrote capture header");
        Ok(())
    }

    async fn write_section(&mut self) -> Result<(), PcapError> {
        if !self.section_written {
            let shb = encode(section_header_le(), SHB_LEN as usize)?;
            self.push(&shb).await?;
            self.section_written = true;
        }
        Ok(())
    }

    /// Append one record, stored in a file with global header `header`
    pub async fn write_packet(&mut self, record: &PacketRecord, header: &PcapHeader) -> Result<(), PcapError> {
        self.write_header(header).await?;
        match self.format {
            CaptureFormat::Legacy => self.push(&record.bytes).await?,
            CaptureFormat::Enhanced => {
                let epb = encode(
                    enhanced_packet_le(record, header.is_nanosecond_precision()),
                    record.bytes.len() + 24,
                )?;
                self.push(&epb).await?;
            }
        }
        self.packets += 1;
        Ok(())
    }

    /// Append the session metadata block (pcapng only)
    pub async fn write_session_metadata(&mut self, session: &Session) -> Result<(), PcapError> {
        if self.format != CaptureFormat::Enhanced {
            return Ok(());
        }
        self.write_section().await?;
        let json = session.export_json()?;
        let block = encode(session_block_le(json.as_bytes()), json.len() + 24)?;
        self.push(&block).await
    }

    /// Flush buffered output and return the underlying writer
    pub async fn finish(mut self) -> Result<W, PcapError> {
        let rest = self.buffer.available_data();
        if rest > 0 {
            self.out.write_all(self.buffer.data()).await?;
            self.buffer.consume(rest);
        }
        self.out.flush().await?;
        info!(format = ?self.format, packets = self.packets, bytes = self.bytes, "capture written");
        Ok(self.out)
    }

    async fn push(&mut self, mut data: &[u8]) -> Result<(), PcapError> {
        self.bytes += data.len() as u64;
        while !data.is_empty() {
            let space = self.buffer.space();
            let n = space.len().min(data.len());
            space[..n].copy_from_slice(&data[..n]);
            self.buffer.fill(n);
            data = &data[n..];
            while self.buffer.available_data() >= self.chunk_size {
                self.out.write_all(&self.buffer.data()[..self.chunk_size]).await?;
                self.buffer.consume(self.chunk_size);
            }
            self.buffer.shift();
        }
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> PacketSink for CaptureWriter<W> {
    async fn on_header(&mut self, _file: &FileKey, header: &PcapHeader) -> Result<(), PcapError> {
        self.write_header(header).await
    }

    async fn on_packet(&mut self, packet: FetchedPacket) -> Result<(), PcapError> {
        self.write_packet(&packet.record, &packet.header).await
    }

    async fn on_end(&mut self, summary: &FetchSummary) -> Result<(), PcapError> {
        debug!(delivered = summary.delivered, total = self.packets, "session packets written");
        Ok(())
    }
}
