use nom::number::complete::{be_u16, be_u32, be_u8};
use nom::IResult;

use super::*;

fn parse_tcp_header(i: &[u8]) -> IResult<&[u8], (u16, u16, u32, u32, u8, u8, u16)> {
    let (i, sport) = be_u16(i)?;
    let (i, dport) = be_u16(i)?;
    let (i, seq) = be_u32(i)?;
    let (i, ack) = be_u32(i)?;
    let (i, off) = be_u8(i)?;
    let (i, flags) = be_u8(i)?;
    let (i, window) = be_u16(i)?;
    let (i, _checksum) = be_u16(i)?;
    let (i, _urgent) = be_u16(i)?;
    Ok((i, (sport, dport, seq, ack, off >> 4, flags, window)))
}

impl<'a> Decoder<'a> {
    pub(super) fn icmp(&mut self, pos: usize, end: usize) {
        if end < pos + 4 {
            return self.truncated("icmp", pos);
        }
        let b = &self.buf[pos..end];
        self.push(Layer::Icmp(IcmpLayer {
            pos,
            icmp_type: b[0],
            code: b[1],
            checksum: u16::from_be_bytes([b[2], b[3]]),
            data: pos..end,
        }));
    }

    pub(super) fn tcp(&mut self, pos: usize, end: usize) {
        if end < pos {
            return self.truncated("tcp", pos);
        }
        let Ok((_, (sport, dport, seq, ack, data_offset, flags, window))) = parse_tcp_header(&self.buf[pos..end]) else {
            return self.truncated("tcp", pos);
        };
        // a header length past the segment leaves an empty payload
        let start = (pos + 4 * data_offset as usize).min(end);
        self.push(Layer::Tcp(TcpLayer {
            pos,
            sport,
            dport,
            seq,
            ack,
            data_offset,
            flags,
            window,
            payload: start..end,
        }));
    }

    pub(super) fn udp(&mut self, pos: usize, end: usize) {
        if end < pos + 8 {
            return self.truncated("udp", pos);
        }
        let b = &self.buf[pos..end];
        self.push(Layer::Udp(UdpLayer {
            pos,
            sport: u16::from_be_bytes([b[0], b[1]]),
            dport: u16::from_be_bytes([b[2], b[3]]),
            length: u16::from_be_bytes([b[4], b[5]]),
            payload: pos + 8..end,
        }));
    }
}
