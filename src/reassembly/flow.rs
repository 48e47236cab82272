use crate::decode::{DecodedPacket, TcpLayer, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};
use crate::session::endpoint_key;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub fin: bool,
    pub urg: bool,
}

impl From<u8> for TcpFlags {
    fn from(flags: u8) -> TcpFlags {
        TcpFlags {
            syn: flags & TcpLayer::SYN != 0,
            ack: flags & TcpLayer::ACK != 0,
            psh: flags & TcpLayer::PSH != 0,
            rst: flags & TcpLayer::RST != 0,
            fin: flags & TcpLayer::FIN != 0,
            urg: flags & TcpLayer::URG != 0,
        }
    }
}

/// One packet of a session, as shown frame by frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Sender key, as in [`Segment::key`](super::Segment::key)
    pub key: String,
    /// Capture time in milliseconds
    pub ts: u64,
    /// Sent by the source side of the session
    pub src: bool,
    /// Transport payload (ICMP: whole message; no IP: Ethernet payload)
    pub data: Vec<u8>,
    pub tcp_flags: Option<TcpFlags>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketFlow {
    pub source_key: String,
    /// Key of the first packet not sent by the source side
    pub destination_key: Option<String>,
    pub frames: Vec<Frame>,
}

/// Sender key of a single packet: `addr:port` for TCP and UDP, the address
/// for other IP protocols, the first MAC address without IP
pub fn packet_key(p: &DecodedPacket) -> String {
    let Some(ip) = p.ip() else {
        return p.ethernet().map(|e| e.addr1_hex()).unwrap_or_default();
    };
    let port = match ip.protocol {
        IPPROTO_TCP => p.tcp().map(|t| t.sport),
        IPPROTO_UDP => p.udp().map(|u| u.sport),
        _ => None,
    };
    match port {
        Some(port) => endpoint_key(&ip.addr1, port),
        None => ip.addr1.to_string(),
    }
}

fn frame_data(p: &DecodedPacket) -> (&[u8], Option<TcpFlags>) {
    let Some(ip) = p.ip() else {
        return (p.ether_payload().map(|r| p.bytes(r)).unwrap_or_default(), None);
    };
    match ip.protocol {
        IPPROTO_ICMP | IPPROTO_ICMPV6 => (p.icmp().map(|i| p.bytes(&i.data)).unwrap_or_default(), None),
        IPPROTO_TCP => match p.tcp() {
            Some(tcp) => (p.bytes(&tcp.payload), Some(TcpFlags::from(tcp.flags))),
            None => (&[][..], None),
        },
        IPPROTO_UDP => (p.udp().map(|u| p.bytes(&u.payload)).unwrap_or_default(), None),
        _ => (p.bytes(&ip.data), None),
    }
}

/// Per-packet view of the first `max_packets` packets
///
/// `session_key` names the source side. It is replaced by the first packet's
/// own key unless that packet is TCP, whose session key carries the port of
/// the opening side.
pub fn packet_flow(packets: &[DecodedPacket], max_packets: usize, session_key: &str) -> PacketFlow {
    let packets = &packets[..packets.len().min(max_packets)];
    let source_key = match packets.first() {
        Some(first) if first.ip().map(|ip| ip.protocol) != Some(IPPROTO_TCP) => packet_key(first),
        _ => session_key.to_string(),
    };
    let mut destination_key = None;
    let frames = packets
        .iter()
        .map(|p| {
            let key = packet_key(p);
            let src = key == source_key;
            if !src && destination_key.is_none() {
                destination_key = Some(key.clone());
            }
            let (data, tcp_flags) = frame_data(p);
            Frame {
                key,
                ts: p.timestamp.as_millis(),
                src,
                data: data.to_vec(),
                tcp_flags,
            }
        })
        .collect();
    PacketFlow {
        source_key,
        destination_key,
        frames,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::linktype::Linktype;
    use crate::pcap::PacketRecord;
    use crate::reassembly::tests::{packet, tcp_frame, udp_frame};
    use hex_literal::hex;

    const A: [u8; 4] = [10, 0, 0, 1];
    const B: [u8; 4] = [10, 0, 0, 2];

    #[test]
    fn tcp_frames() {
        let pkts = vec![
            packet(1, &tcp_frame(A, B, 1234, 80, 100, 0, 0x02, b"")),
            packet(2, &tcp_frame(B, A, 80, 1234, 500, 101, 0x12, b"")),
            packet(3, &tcp_frame(A, B, 1234, 80, 101, 501, 0x18, b"GET /")),
        ];
        let flow = packet_flow(&pkts, 200, "10.0.0.1:1234");
        assert_eq!(flow.source_key, "10.0.0.1:1234");
        assert_eq!(flow.destination_key.as_deref(), Some("10.0.0.2:80"));
        let src: Vec<bool> = flow.frames.iter().map(|f| f.src).collect();
        assert_eq!(src, vec![true, false, true]);
        let syn_ack = flow.frames[1].tcp_flags.expect("flags");
        assert!(syn_ack.syn && syn_ack.ack && !syn_ack.psh);
        assert_eq!(flow.frames[2].data, b"GET /");
        assert_eq!(flow.frames[2].ts, 3000);
    }

    #[test]
    fn first_packet_names_source_unless_tcp() {
        let pkts = vec![
            packet(1, &udp_frame(B, A, 53, 5000, b"reply")),
            packet(2, &udp_frame(A, B, 5000, 53, b"query")),
        ];
        let flow = packet_flow(&pkts, 200, "10.0.0.1:5000");
        assert_eq!(flow.source_key, "10.0.0.2:53");
        assert!(flow.frames[0].src);
        assert_eq!(flow.frames[1].data, b"query");
        assert_eq!(flow.frames[1].tcp_flags, None);
        assert_eq!(packet_flow(&pkts, 1, "x").frames.len(), 1);
    }

    #[test]
    fn non_ip_frames() {
        let frame = hex!("00 11 22 33 44 55 66 77 88 99 aa bb 88 cc 02 07 04");
        let p = decode(PacketRecord::new(1, 0, &frame), Linktype::ETHERNET, false);
        let flow = packet_flow(&[p], 200, "10.0.0.1");
        assert_eq!(flow.source_key, "001122334455");
        assert_eq!(flow.frames[0].data, hex!("02 07 04"));
        assert!(flow.destination_key.is_none());
    }
}
