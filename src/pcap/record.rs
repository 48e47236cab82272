use nom::IResult;

use crate::endianness::{PcapBE, PcapEndianness, PcapLE};
use crate::PcapError;

/// Size of a legacy record header
pub const RECORD_HEADER_LEN: usize = 16;

/// Largest captured length accepted for a single record
pub const MAX_RECORD_LEN: u32 = 0xffff;

/// Legacy PCAP record header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordHeader {
    pub ts_sec: u32,
    /// Microseconds, or nanoseconds for nanosecond-precision files
    pub ts_usec: u32,
    pub caplen: u32,
    pub origlen: u32,
}

impl RecordHeader {
    /// Total record size: header plus captured bytes
    pub fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.caplen as usize
    }
}

fn inner_parse_record_header<En: PcapEndianness>(i: &[u8]) -> IResult<&[u8], RecordHeader, PcapError> {
    let (i, ts_sec) = En::parse_u32(i)?;
    let (i, ts_usec) = En::parse_u32(i)?;
    let (i, caplen) = En::parse_u32(i)?;
    let (i, origlen) = En::parse_u32(i)?;
    let header = RecordHeader {
        ts_sec,
        ts_usec,
        caplen,
        origlen,
    };
    Ok((i, header))
}

/// Read a PCAP record header (16 bytes) in the byte order of the file
pub fn parse_record_header(i: &[u8], big_endian: bool) -> IResult<&[u8], RecordHeader, PcapError> {
    if i.len() < RECORD_HEADER_LEN {
        return Err(nom::Err::Incomplete(nom::Needed::new(RECORD_HEADER_LEN - i.len())));
    }
    if big_endian {
        inner_parse_record_header::<PcapBE>(i)
    } else {
        inner_parse_record_header::<PcapLE>(i)
    }
}

/// One stored capture record, owned: the 16-byte record header followed by the frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketRecord {
    /// Record bytes exactly as stored (after decryption)
    pub bytes: Vec<u8>,
    pub header: RecordHeader,
    pub big_endian: bool,
}

impl PacketRecord {
    /// Build a record from its stored bytes, validating the declared length
    pub fn from_bytes(bytes: Vec<u8>, big_endian: bool) -> Result<PacketRecord, PcapError> {
        let header = match parse_record_header(&bytes, big_endian) {
            Ok((_, header)) => header,
            Err(nom::Err::Incomplete(_)) => return Err(PcapError::NomError(nom::error::ErrorKind::Eof)),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => return Err(e),
        };
        if header.caplen > MAX_RECORD_LEN || bytes.len() < header.record_len() {
            return Err(PcapError::NomError(nom::error::ErrorKind::LengthValue));
        }
        let mut bytes = bytes;
        bytes.truncate(header.record_len());
        Ok(PacketRecord {
            bytes,
            header,
            big_endian,
        })
    }

    /// Build a little-endian record around a frame
    pub fn new(ts_sec: u32, ts_usec: u32, frame: &[u8]) -> PacketRecord {
        let caplen = frame.len() as u32;
        let mut bytes = Vec::with_capacity(RECORD_HEADER_LEN + frame.len());
        bytes.extend_from_slice(&ts_sec.to_le_bytes());
        bytes.extend_from_slice(&ts_usec.to_le_bytes());
        bytes.extend_from_slice(&caplen.to_le_bytes());
        bytes.extend_from_slice(&caplen.to_le_bytes());
        bytes.extend_from_slice(frame);
        PacketRecord {
            bytes,
            header: RecordHeader {
                ts_sec,
                ts_usec,
                caplen,
                origlen: caplen,
            },
            big_endian: false,
        }
    }

    /// Link-layer frame, without the record header
    #[inline]
    pub fn frame(&self) -> &[u8] {
        &self.bytes[RECORD_HEADER_LEN..]
    }

    /// Timestamp in microseconds, reducing nanosecond-precision values
    pub fn timestamp_usec(&self, nanosecond: bool) -> u64 {
        let frac = if nanosecond {
            self.header.ts_usec / 1000
        } else {
            self.header.ts_usec
        };
        u64::from(self.header.ts_sec) * 1_000_000 + u64::from(frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const RECORD_LE: &[u8] = &hex!(
        "01 00 00 00 10 00 00 00 04 00 00 00 3c 00 00 00
         de ad be ef"
    );

    #[test]
    fn record_header_le() {
        let (rem, h) = parse_record_header(RECORD_LE, false).expect("header");
        assert_eq!(rem.len(), 4);
        assert_eq!(h.ts_sec, 1);
        assert_eq!(h.ts_usec, 16);
        assert_eq!(h.caplen, 4);
        assert_eq!(h.origlen, 60);
        assert_eq!(h.record_len(), 20);
    }

    #[test]
    fn record_header_be() {
        let raw = hex!("00 00 00 01 00 00 00 10 00 00 00 04 00 00 00 3c");
        let (_, h) = parse_record_header(&raw, true).expect("header");
        assert_eq!(h.ts_usec, 16);
        assert_eq!(h.caplen, 4);
    }

    #[test]
    fn record_header_incomplete() {
        assert!(matches!(
            parse_record_header(&RECORD_LE[..10], false),
            Err(nom::Err::Incomplete(_))
        ));
    }

    #[test]
    fn packet_record_frame() {
        let mut raw = RECORD_LE.to_vec();
        raw.extend_from_slice(b"trailing");
        let rec = PacketRecord::from_bytes(raw, false).expect("record");
        assert_eq!(rec.frame(), &hex!("de ad be ef"));
        assert_eq!(rec.bytes.len(), 20);
        assert_eq!(rec.timestamp_usec(false), 1_000_016);
    }

    #[test]
    fn packet_record_new() {
        let rec = PacketRecord::new(2, 5_000_000, b"abc");
        let parsed = PacketRecord::from_bytes(rec.bytes.clone(), false).expect("record");
        assert_eq!(parsed, rec);
        assert_eq!(rec.timestamp_usec(true), 2_005_000);
    }
}
