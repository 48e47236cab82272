//! Protocol decoder
//!
//! Walks a stored record from the link layer down to the transport layer,
//! dispatching on the type tag of each layer (link type, ethertype, IP
//! protocol). Every decoded layer keeps its starting offset within the record
//! bytes, so the scrubber can compute exact overwrite windows.
//!
//! Decoding never fails as a whole: an unrecognized tag or a truncated header
//! stops the walk at that layer, records a [`DecodeError`] and returns what was
//! decoded so far.

use std::fmt;
use std::net::IpAddr;
use std::ops::Range;

use thiserror::Error;
use tracing::debug;

use crate::linktype::Linktype;
use crate::pcap::{PacketRecord, RECORD_HEADER_LEN};

mod ip;
mod link;
mod transport;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_IPIP: u8 = 4;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_IPV6: u8 = 41;
pub const IPPROTO_GRE: u8 = 47;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_SCTP: u8 = 132;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
pub const ETHERTYPE_PPPOE_SESSION: u16 = 0x8864;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88a8;
pub const ETHERTYPE_TEB: u16 = 0x6558;

/// Most headers (link, VLAN tag, IP, GRE, PPPoE) decoded for one packet.
/// Tunnels nested deeper than this stop the walk.
pub const MAX_NESTED_HEADERS: usize = 16;

/// Why decoding stopped before the transport layer
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {layer} header at offset {pos}")]
    Truncated { layer: &'static str, pos: usize },
    #[error("unsupported link type {0}")]
    UnknownLinktype(Linktype),
    #[error("unknown ethertype 0x{0:04x}")]
    UnknownEthertype(u16),
    #[error("unknown IP protocol {0}")]
    UnknownProtocol(u8),
    #[error("unknown PPP protocol 0x{0:04x}")]
    UnknownPppProtocol(u16),
    #[error("too many nested headers, {layer} at offset {pos} not decoded")]
    TooDeep { layer: &'static str, pos: usize },
}

/// Capture timestamp, always in microseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub sec: u32,
    pub usec: u32,
}

impl Timestamp {
    pub fn as_micros(&self) -> u64 {
        u64::from(self.sec) * 1_000_000 + u64::from(self.usec)
    }

    /// Milliseconds, rounding the sub-millisecond part
    pub fn as_millis(&self) -> u64 {
        u64::from(self.sec) * 1000 + (u64::from(self.usec) + 500) / 1000
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthernetLayer {
    pub pos: usize,
    pub addr1: [u8; 6],
    pub addr2: [u8; 6],
    /// Ethertype after VLAN tags
    pub ethertype: u16,
    pub vlans: Vec<u16>,
}

impl EthernetLayer {
    pub fn addr1_hex(&self) -> String {
        hex::encode(self.addr1)
    }

    pub fn addr2_hex(&self) -> String {
        hex::encode(self.addr2)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpLayer {
    pub pos: usize,
    pub header_len: usize,
    /// Total length (IPv4) or payload length (IPv6) as declared
    pub len: u16,
    /// Final protocol, after IPv6 extension headers
    pub protocol: u8,
    pub ttl: u8,
    pub addr1: IpAddr,
    pub addr2: IpAddr,
    /// Payload after the header (and extension headers)
    pub data: Range<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PppoeLayer {
    pub pos: usize,
    pub len: u16,
    pub protocol: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GreLayer {
    pub pos: usize,
    pub flags_version: u16,
    pub protocol_type: u16,
    pub header_len: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IcmpLayer {
    pub pos: usize,
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// The whole ICMP message, header included
    pub data: Range<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpLayer {
    pub pos: usize,
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in 32-bit words
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub payload: Range<usize>,
}

impl TcpLayer {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn syn(&self) -> bool {
        self.flags & Self::SYN != 0
    }

    pub fn rst(&self) -> bool {
        self.flags & Self::RST != 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpLayer {
    pub pos: usize,
    pub sport: u16,
    pub dport: u16,
    pub length: u16,
    pub payload: Range<usize>,
}

/// Remainder of a layer whose type tag was not recognized
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownLayer {
    pub pos: usize,
    /// Name of the enclosing layer
    pub parent: &'static str,
    pub tag: u32,
    pub data: Range<usize>,
}

/// One decoded protocol layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layer {
    Ethernet(EthernetLayer),
    Ipv4(IpLayer),
    Ipv6(IpLayer),
    Pppoe(PppoeLayer),
    Gre(GreLayer),
    Icmp(IcmpLayer),
    Tcp(TcpLayer),
    Udp(UdpLayer),
    Unknown(UnknownLayer),
}

impl Layer {
    pub fn pos(&self) -> usize {
        match self {
            Layer::Ethernet(l) => l.pos,
            Layer::Ipv4(l) | Layer::Ipv6(l) => l.pos,
            Layer::Pppoe(l) => l.pos,
            Layer::Gre(l) => l.pos,
            Layer::Icmp(l) => l.pos,
            Layer::Tcp(l) => l.pos,
            Layer::Udp(l) => l.pos,
            Layer::Unknown(l) => l.pos,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Layer::Ethernet(_) => "ethernet",
            Layer::Ipv4(_) => "ipv4",
            Layer::Ipv6(_) => "ipv6",
            Layer::Pppoe(_) => "pppoe",
            Layer::Gre(_) => "gre",
            Layer::Icmp(_) => "icmp",
            Layer::Tcp(_) => "tcp",
            Layer::Udp(_) => "udp",
            Layer::Unknown(_) => "unknown",
        }
    }
}

/// A stored record with its decoded layers, outermost first
#[derive(Clone, Debug)]
pub struct DecodedPacket {
    pub record: PacketRecord,
    pub timestamp: Timestamp,
    pub layers: Vec<Layer>,
    pub error: Option<DecodeError>,
}

impl DecodedPacket {
    /// Record bytes in `range`
    pub fn bytes(&self, range: &Range<usize>) -> &[u8] {
        &self.record.bytes[range.clone()]
    }

    pub fn ethernet(&self) -> Option<&EthernetLayer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Ethernet(e) => Some(e),
            _ => None,
        })
    }

    /// Innermost IP header
    pub fn ip(&self) -> Option<&IpLayer> {
        self.layers.iter().rev().find_map(|l| match l {
            Layer::Ipv4(ip) | Layer::Ipv6(ip) => Some(ip),
            _ => None,
        })
    }

    pub fn icmp(&self) -> Option<&IcmpLayer> {
        self.layers.iter().rev().find_map(|l| match l {
            Layer::Icmp(icmp) => Some(icmp),
            _ => None,
        })
    }

    pub fn tcp(&self) -> Option<&TcpLayer> {
        self.layers.iter().rev().find_map(|l| match l {
            Layer::Tcp(tcp) => Some(tcp),
            _ => None,
        })
    }

    pub fn udp(&self) -> Option<&UdpLayer> {
        self.layers.iter().rev().find_map(|l| match l {
            Layer::Udp(udp) => Some(udp),
            _ => None,
        })
    }

    /// Payload of an Ethernet frame whose ethertype was not recognized
    pub fn ether_payload(&self) -> Option<&Range<usize>> {
        self.layers.iter().find_map(|l| match l {
            Layer::Unknown(u) if u.parent == "ethernet" => Some(&u.data),
            _ => None,
        })
    }

    /// Innermost transport layer, if decoding reached one
    pub fn transport(&self) -> Option<&Layer> {
        self.layers
            .iter()
            .rev()
            .find(|l| matches!(l, Layer::Icmp(_) | Layer::Tcp(_) | Layer::Udp(_)))
    }

    /// Start of the transport payload: what a payload-only scrub overwrites
    pub fn transport_payload_start(&self) -> Option<usize> {
        match self.transport()? {
            Layer::Icmp(icmp) => Some(icmp.pos + 8),
            Layer::Tcp(tcp) => Some(tcp.pos + 4 * tcp.data_offset as usize),
            Layer::Udp(udp) => Some(udp.pos + 8),
            _ => None,
        }
    }
}

impl fmt::Display for DecodedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.timestamp.sec, self.timestamp.usec)?;
        for l in &self.layers {
            write!(f, " {}@{}", l.name(), l.pos())?;
        }
        if let Some(e) = &self.error {
            write!(f, " ({})", e)?;
        }
        Ok(())
    }
}

/// Layer accumulator shared by the per-layer decoders
pub(crate) struct Decoder<'a> {
    /// Whole record, record header included
    buf: &'a [u8],
    layers: Vec<Layer>,
    error: Option<DecodeError>,
    /// Headers entered so far, bounded by [`MAX_NESTED_HEADERS`]
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// Account for one more nested header; false (and decoding stopped) past the limit
    fn enter(&mut self, layer: &'static str, pos: usize) -> bool {
        self.depth += 1;
        if self.depth > MAX_NESTED_HEADERS {
            self.stop(DecodeError::TooDeep { layer, pos });
            return false;
        }
        true
    }

    fn stop(&mut self, error: DecodeError) {
        debug!(%error, "decode stopped");
        self.error = Some(error);
    }

    fn truncated(&mut self, layer: &'static str, pos: usize) {
        self.stop(DecodeError::Truncated { layer, pos });
    }

    fn unknown(&mut self, parent: &'static str, tag: u32, data: Range<usize>, error: DecodeError) {
        self.push(Layer::Unknown(UnknownLayer {
            pos: data.start,
            parent,
            tag,
            data,
        }));
        self.stop(error);
    }
}

/// Decode a stored record of a file with the given link type
///
/// `nanosecond` is the precision flag of the file header; timestamps are
/// reduced to microseconds.
pub fn decode(record: PacketRecord, linktype: Linktype, nanosecond: bool) -> DecodedPacket {
    let mut usec = record.header.ts_usec;
    if nanosecond {
        usec /= 1000;
    }
    let timestamp = Timestamp {
        sec: record.header.ts_sec,
        usec,
    };
    let end = record.bytes.len().min(record.header.record_len());
    let mut d = Decoder {
        buf: &record.bytes,
        layers: Vec::new(),
        error: None,
        depth: 0,
    };
    d.link(linktype, RECORD_HEADER_LEN, end);
    let Decoder { layers, error, .. } = d;
    DecodedPacket {
        record,
        timestamp,
        layers,
        error,
    }
}
