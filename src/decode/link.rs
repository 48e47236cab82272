use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::IResult;

use super::*;

/// Address families of the NULL/LOOP header that carry IPv6
const AF_INET6: [u32; 3] = [24, 28, 30];

fn parse_mac(i: &[u8]) -> IResult<&[u8], [u8; 6]> {
    let (i, b) = take(6usize)(i)?;
    let mut mac = [0u8; 6];
    mac.copy_from_slice(b);
    Ok((i, mac))
}

fn parse_ether_header(i: &[u8]) -> IResult<&[u8], ([u8; 6], [u8; 6], u16)> {
    let (i, addr1) = parse_mac(i)?;
    let (i, addr2) = parse_mac(i)?;
    let (i, ethertype) = be_u16(i)?;
    Ok((i, (addr1, addr2, ethertype)))
}

impl<'a> Decoder<'a> {
    /// Dispatch on the link type of the file; `pos..end` is the frame
    pub(super) fn link(&mut self, linktype: Linktype, pos: usize, end: usize) {
        match linktype {
            Linktype::ETHERNET => self.ether(pos, end),
            Linktype::NULL | Linktype::LOOP => {
                if end < pos + 4 {
                    return self.truncated("null", pos);
                }
                let b = &self.buf[pos..pos + 4];
                // NULL is in the byte order of the capturing host, LOOP in network order
                let family = if linktype == Linktype::LOOP || (b[0] == 0 && b[1] == 0) {
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
                } else {
                    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
                };
                if AF_INET6.contains(&family) {
                    self.ip6(pos + 4, end)
                } else {
                    self.ip4(pos + 4, end)
                }
            }
            Linktype::RAW | Linktype::RAW_OPENBSD => {
                if end <= pos {
                    return self.truncated("raw", pos);
                }
                if self.buf[pos] & 0xf0 == 0x60 {
                    self.ip6(pos, end)
                } else {
                    self.ip4(pos, end)
                }
            }
            Linktype::IPV4 => self.ip4(pos, end),
            Linktype::IPV6 => self.ip6(pos, end),
            Linktype::LINUX_SLL => {
                if end < pos + 16 {
                    return self.truncated("sll", pos);
                }
                let proto = u16::from_be_bytes([self.buf[pos + 14], self.buf[pos + 15]]);
                self.ethertype(proto, pos + 16, end, "sll")
            }
            Linktype::LINUX_SLL2 => {
                if end < pos + 20 {
                    return self.truncated("sll2", pos);
                }
                let proto = u16::from_be_bytes([self.buf[pos], self.buf[pos + 1]]);
                self.ethertype(proto, pos + 20, end, "sll2")
            }
            other => self.stop(DecodeError::UnknownLinktype(other)),
        }
    }

    pub(super) fn ether(&mut self, pos: usize, end: usize) {
        if !self.enter("ethernet", pos) {
            return;
        }
        if end < pos {
            return self.truncated("ethernet", pos);
        }
        let Ok((_, (addr1, addr2, mut ethertype))) = parse_ether_header(&self.buf[pos..end]) else {
            return self.truncated("ethernet", pos);
        };
        let mut next = pos + 14;
        let mut vlans = Vec::new();
        // VLAN and Q-in-Q tags: TCI then the inner ethertype
        while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
            if end < next + 4 {
                return self.truncated("vlan", next);
            }
            vlans.push(u16::from_be_bytes([self.buf[next], self.buf[next + 1]]) & 0x0fff);
            ethertype = u16::from_be_bytes([self.buf[next + 2], self.buf[next + 3]]);
            next += 4;
        }
        self.push(Layer::Ethernet(EthernetLayer {
            pos,
            addr1,
            addr2,
            ethertype,
            vlans,
        }));
        self.ethertype(ethertype, next, end, "ethernet")
    }

    /// Dispatch a payload at `pos` on its ethertype
    pub(super) fn ethertype(&mut self, ethertype: u16, pos: usize, end: usize, parent: &'static str) {
        match ethertype {
            ETHERTYPE_IPV4 => self.ip4(pos, end),
            ETHERTYPE_IPV6 => self.ip6(pos, end),
            ETHERTYPE_PPPOE_SESSION => self.pppoe(pos, end),
            ETHERTYPE_TEB => self.ether(pos, end),
            ETHERTYPE_VLAN | ETHERTYPE_QINQ => {
                if !self.enter("vlan", pos) {
                    return;
                }
                if end < pos + 4 {
                    return self.truncated("vlan", pos);
                }
                let inner = u16::from_be_bytes([self.buf[pos + 2], self.buf[pos + 3]]);
                self.ethertype(inner, pos + 4, end, parent)
            }
            other => self.unknown(parent, u32::from(other), pos..end, DecodeError::UnknownEthertype(other)),
        }
    }

    /// PPPoE session: 6-byte header, then the PPP protocol
    pub(super) fn pppoe(&mut self, pos: usize, end: usize) {
        if !self.enter("pppoe", pos) {
            return;
        }
        if end < pos + 8 {
            return self.truncated("pppoe", pos);
        }
        let b = &self.buf[pos..];
        let len = u16::from_be_bytes([b[4], b[5]]).saturating_sub(2);
        let protocol = u16::from_be_bytes([b[6], b[7]]);
        self.push(Layer::Pppoe(PppoeLayer { pos, len, protocol }));
        let inner_end = end.min(pos + 8 + len as usize);
        match protocol {
            0x21 => self.ip4(pos + 8, inner_end),
            0x57 => self.ip6(pos + 8, inner_end),
            other => self.unknown("pppoe", u32::from(other), pos + 8..inner_end, DecodeError::UnknownPppProtocol(other)),
        }
    }

    /// GRE (RFC 1701/2784/2637): optional fields follow the flag bits
    pub(super) fn gre(&mut self, pos: usize, end: usize) {
        if !self.enter("gre", pos) {
            return;
        }
        if end < pos + 4 {
            return self.truncated("gre", pos);
        }
        let b = &self.buf[pos..end];
        let flags_version = u16::from_be_bytes([b[0], b[1]]);
        let protocol_type = u16::from_be_bytes([b[2], b[3]]);
        let mut off = 4;
        // checksum and offset are both present if either bit is set
        if flags_version & (0x8000 | 0x4000) != 0 {
            off += 4;
        }
        if flags_version & 0x2000 != 0 {
            off += 4;
        }
        if flags_version & 0x1000 != 0 {
            off += 4;
        }
        if flags_version & 0x4000 != 0 {
            // source route entries: family(2) offset(1) length(1) data, until a null entry
            loop {
                if b.len() < off + 4 {
                    return self.truncated("gre", pos);
                }
                let family = u16::from_be_bytes([b[off], b[off + 1]]);
                let sre_len = b[off + 3] as usize;
                off += 4;
                if family == 0 && sre_len == 0 {
                    break;
                }
                off += sre_len;
            }
        }
        if flags_version & 0x0080 != 0 {
            off += 4;
        }
        if b.len() < off {
            return self.truncated("gre", pos);
        }
        self.push(Layer::Gre(GreLayer {
            pos,
            flags_version,
            protocol_type,
            header_len: off,
        }));
        self.ethertype(protocol_type, pos + off, end, "gre")
    }
}
