use std::net::{Ipv4Addr, Ipv6Addr};

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use super::*;

const IPV6_HEADER_LEN: usize = 40;

/// IPv6 extension headers walked over to reach the upper-layer protocol
const IPV6_EXTENSIONS: [u8; 4] = [0, 43, 44, 60];

struct Ipv4Header {
    ihl: u8,
    total_len: u16,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

fn parse_ipv4_header(i: &[u8]) -> IResult<&[u8], Ipv4Header> {
    let (i, vihl) = be_u8(i)?;
    let (i, _tos) = be_u8(i)?;
    let (i, total_len) = be_u16(i)?;
    let (i, _id_frag) = take(4usize)(i)?;
    let (i, ttl) = be_u8(i)?;
    let (i, protocol) = be_u8(i)?;
    let (i, _checksum) = be_u16(i)?;
    let (i, src) = take(4usize)(i)?;
    let (i, dst) = take(4usize)(i)?;
    let header = Ipv4Header {
        ihl: vihl & 0xf,
        total_len,
        ttl,
        protocol,
        src: Ipv4Addr::new(src[0], src[1], src[2], src[3]),
        dst: Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3]),
    };
    Ok((i, header))
}

fn ipv6_addr(b: &[u8]) -> Ipv6Addr {
    let mut a = [0u8; 16];
    a.copy_from_slice(&b[..16]);
    Ipv6Addr::from(a)
}

impl<'a> Decoder<'a> {
    pub(super) fn ip4(&mut self, pos: usize, end: usize) {
        if !self.enter("ipv4", pos) {
            return;
        }
        if end < pos {
            return self.truncated("ipv4", pos);
        }
        let Ok((_, h)) = parse_ipv4_header(&self.buf[pos..end]) else {
            return self.truncated("ipv4", pos);
        };
        let header_len = 4 * h.ihl as usize;
        // a zero total length (TSO captures) means "up to the end of the frame"
        let ip_end = if h.total_len == 0 {
            end
        } else {
            end.min(pos + h.total_len as usize)
        };
        if header_len < 20 || ip_end < pos + header_len {
            return self.truncated("ipv4", pos);
        }
        let data = pos + header_len..ip_end;
        self.push(Layer::Ipv4(IpLayer {
            pos,
            header_len,
            len: h.total_len,
            protocol: h.protocol,
            ttl: h.ttl,
            addr1: IpAddr::V4(h.src),
            addr2: IpAddr::V4(h.dst),
            data: data.clone(),
        }));
        self.ip_protocol(h.protocol, data.start, data.end, "ipv4")
    }

    pub(super) fn ip6(&mut self, pos: usize, end: usize) {
        if !self.enter("ipv6", pos) {
            return;
        }
        if end < pos + IPV6_HEADER_LEN {
            return self.truncated("ipv6", pos);
        }
        let b = &self.buf[pos..end];
        let payload_len = u16::from_be_bytes([b[4], b[5]]);
        let mut next = b[6];
        let hop_limit = b[7];
        let addr1 = ipv6_addr(&b[8..24]);
        let addr2 = ipv6_addr(&b[24..40]);
        let ip_end = if payload_len == 0 {
            end
        } else {
            end.min(pos + IPV6_HEADER_LEN + payload_len as usize)
        };

        let mut off = pos + IPV6_HEADER_LEN;
        while IPV6_EXTENSIONS.contains(&next) {
            if ip_end < off + 2 {
                return self.truncated("ipv6", off);
            }
            let ext = &self.buf[off..off + 2];
            next = ext[0];
            off += (ext[1] as usize + 1) << 3;
        }
        if ip_end < off {
            return self.truncated("ipv6", pos);
        }
        self.push(Layer::Ipv6(IpLayer {
            pos,
            header_len: off - pos,
            len: payload_len,
            protocol: next,
            ttl: hop_limit,
            addr1: IpAddr::V6(addr1),
            addr2: IpAddr::V6(addr2),
            data: off..ip_end,
        }));
        self.ip_protocol(next, off, ip_end, "ipv6")
    }

    /// Dispatch the payload of an IP header on its protocol number
    fn ip_protocol(&mut self, protocol: u8, pos: usize, end: usize, parent: &'static str) {
        match protocol {
            IPPROTO_ICMP | IPPROTO_ICMPV6 => self.icmp(pos, end),
            IPPROTO_TCP => self.tcp(pos, end),
            IPPROTO_UDP => self.udp(pos, end),
            IPPROTO_GRE => self.gre(pos, end),
            IPPROTO_IPIP => self.ip4(pos, end),
            IPPROTO_IPV6 => self.ip6(pos, end),
            other => self.unknown(parent, u32::from(other), pos..end, DecodeError::UnknownProtocol(other)),
        }
    }
}
