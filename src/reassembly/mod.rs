//! Stream reassembly
//!
//! Turns the ordered, decoded packets of one session into byte-stream
//! segments, one per direction change. ICMP and UDP payloads are simply
//! concatenated; TCP is sorted by sequence number, de-duplicated and merged
//! (see [`reassemble_tcp`]). Sessions of non-IP frames fall back to the
//! Ethernet payloads. [`packet_flow`] gives the unmerged, per-packet view.

use tracing::info;

use crate::decode::{DecodedPacket, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};
use crate::PcapError;

mod datagram;
mod flow;
mod tcp;

pub use datagram::*;
pub use flow::*;
pub use tcp::*;

/// Contiguous bytes sent by one side of a conversation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Segment {
    /// Sender key (`addr:port`); empty for a gap marker
    pub key: String,
    pub data: Vec<u8>,
    /// Capture time of the first contributing packet, in milliseconds
    pub ts: Option<u64>,
}

impl Segment {
    /// Marker inserted where more than a TCP window of data is missing
    pub fn is_gap_marker(&self) -> bool {
        self.key.is_empty()
    }
}

/// Reassemble a session's packets with the algorithm of its IP protocol
///
/// `protocol` is the session's recorded protocol; without it the protocol of
/// the first packet is used. A first packet carrying a non-IP Ethernet
/// payload selects [`reassemble_generic_ether`] whatever the protocol. At
/// most `max_packets` packets contribute.
pub fn reassemble(
    packets: &[DecodedPacket],
    protocol: Option<u8>,
    max_packets: usize,
    client_key: &str,
) -> Result<Vec<Segment>, PcapError> {
    let Some(first) = packets.first() else {
        return Ok(Vec::new());
    };
    if first.ip().is_none() && first.ether_payload().is_some() {
        let segments = reassemble_generic_ether(packets, max_packets);
        info!(packets = packets.len(), segments = segments.len(), "reassembled non-IP session");
        return Ok(segments);
    }
    let protocol = match protocol.or_else(|| first.ip().map(|ip| ip.protocol)) {
        Some(p) => p,
        None => return Err(PcapError::Reassembly("first packet has no IP header".to_string())),
    };
    let segments = match protocol {
        IPPROTO_TCP => reassemble_tcp(packets, max_packets, client_key)?,
        IPPROTO_UDP => reassemble_udp(packets, max_packets),
        IPPROTO_ICMP | IPPROTO_ICMPV6 => reassemble_icmp(packets, max_packets),
        _ if first.ip().is_some() => reassemble_generic_ip(packets, max_packets),
        other => return Err(PcapError::Reassembly(format!("unknown ip protocol {}", other))),
    };
    info!(
        protocol,
        packets = packets.len(),
        segments = segments.len(),
        "reassembled session"
    );
    Ok(segments)
}
