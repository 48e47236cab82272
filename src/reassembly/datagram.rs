use tracing::debug;

use super::Segment;
use crate::decode::{DecodedPacket, Layer};
use crate::session::endpoint_key;

/// Concatenate consecutive payloads with the same key into one segment
fn concat_by_key<'a, F>(packets: &'a [DecodedPacket], max_packets: usize, extract: F) -> Vec<Segment>
where
    F: Fn(&'a DecodedPacket) -> Option<(String, &'a [u8])>,
{
    let mut results: Vec<Segment> = Vec::new();
    for (i, p) in packets.iter().take(max_packets).enumerate() {
        let Some((key, data)) = extract(p) else {
            debug!(index = i, "packet skipped, layer missing");
            continue;
        };
        match results.last_mut() {
            Some(last) if last.key == key => last.data.extend_from_slice(data),
            _ => results.push(Segment {
                key,
                data: data.to_vec(),
                ts: Some(p.timestamp.as_millis()),
            }),
        }
    }
    results
}

/// ICMP: whole messages, keyed by sender address
pub fn reassemble_icmp(packets: &[DecodedPacket], max_packets: usize) -> Vec<Segment> {
    concat_by_key(packets, max_packets, |p| {
        let ip = p.ip()?;
        let icmp = p.icmp()?;
        Some((ip.addr1.to_string(), p.bytes(&icmp.data)))
    })
}

/// UDP: payloads, keyed by sender address and port
pub fn reassemble_udp(packets: &[DecodedPacket], max_packets: usize) -> Vec<Segment> {
    concat_by_key(packets, max_packets, |p| {
        let ip = p.ip()?;
        let udp = p.udp()?;
        Some((endpoint_key(&ip.addr1, udp.sport), p.bytes(&udp.payload)))
    })
}

/// Any other IP protocol: the IP payload, keyed by sender address
pub fn reassemble_generic_ip(packets: &[DecodedPacket], max_packets: usize) -> Vec<Segment> {
    concat_by_key(packets, max_packets, |p| {
        let (addr, data) = p.layers.iter().rev().find_map(|l| match l {
            Layer::Ipv4(ip) | Layer::Ipv6(ip) => Some((ip.addr1, &ip.data)),
            _ => None,
        })?;
        Some((addr.to_string(), p.bytes(data)))
    })
}

/// Non-IP frames: the Ethernet payload, keyed by the first (destination) address
pub fn reassemble_generic_ether(packets: &[DecodedPacket], max_packets: usize) -> Vec<Segment> {
    concat_by_key(packets, max_packets, |p| {
        let eth = p.ethernet()?;
        let data = p.ether_payload()?;
        Some((eth.addr1_hex(), p.bytes(data)))
    })
}
