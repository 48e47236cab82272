use nom::number::complete::{be_i32, be_u16, be_u32, le_i32, le_u16, le_u32};
use nom::IResult;

use crate::linktype::Linktype;
use crate::PcapError;

/// Size of the legacy global header
pub const PCAP_HEADER_LEN: usize = 24;

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const PCAP_MAGIC_NSEC: u32 = 0xa1b2_3c4d;

/// PCAP global header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcapHeader {
    /// File format and byte ordering, read as little-endian. If equal to `0xa1b2c3d4` or
    /// `0xa1b23c4d` then the rest of the file is little-endian. If `0xd4c3b2a1` or
    /// `0x4d3cb2a1` (swapped), then all following fields are big-endian.
    pub magic_number: u32,
    /// Version major number (currently 2)
    pub version_major: u16,
    /// Version minor number (currently 4)
    pub version_minor: u16,
    /// The correction time in seconds between GMT (UTC) and the local timezone of the following packet header timestamps
    pub thiszone: i32,
    /// In theory, the accuracy of time stamps in the capture; in practice, all tools set it to 0
    pub sigfigs: u32,
    /// max len of captured packets, in octets
    pub snaplen: u32,
    /// Data link type
    pub network: Linktype,
    /// The header exactly as stored (after decryption), re-emitted verbatim by the legacy writer
    pub raw: [u8; PCAP_HEADER_LEN],
}

impl PcapHeader {
    /// Build a little-endian, microsecond-precision header
    pub fn new(network: Linktype, snaplen: u32) -> PcapHeader {
        let mut raw = [0u8; PCAP_HEADER_LEN];
        raw[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
        raw[4..6].copy_from_slice(&2u16.to_le_bytes());
        raw[6..8].copy_from_slice(&4u16.to_le_bytes());
        raw[16..20].copy_from_slice(&snaplen.to_le_bytes());
        raw[20..24].copy_from_slice(&(network.0 as u32).to_le_bytes());
        PcapHeader {
            magic_number: PCAP_MAGIC,
            version_major: 2,
            version_minor: 4,
            thiszone: 0,
            sigfigs: 0,
            snaplen,
            network,
            raw,
        }
    }

    pub const fn size(&self) -> usize {
        PCAP_HEADER_LEN
    }

    pub fn is_bigendian(&self) -> bool {
        (self.magic_number & 0xFFFF) == 0xb2a1 // works for both nanosecond and microsecond resolution timestamps
    }

    pub fn is_nanosecond_precision(&self) -> bool {
        self.magic_number == PCAP_MAGIC_NSEC || self.magic_number == PCAP_MAGIC_NSEC.swap_bytes()
    }
}

/// Read the PCAP global header
///
/// The magic number is always read little-endian; its value decides how the
/// remaining fields (and every record header of the file) are read.
pub fn parse_pcap_header(i: &[u8]) -> IResult<&[u8], PcapHeader, PcapError> {
    if i.len() < PCAP_HEADER_LEN {
        return Err(nom::Err::Error(PcapError::HeaderNotRecognized));
    }
    let mut raw = [0u8; PCAP_HEADER_LEN];
    raw.copy_from_slice(&i[..PCAP_HEADER_LEN]);
    let (i, magic_number) = le_u32(i)?;
    match magic_number {
        PCAP_MAGIC | PCAP_MAGIC_NSEC => {
            let (i, version_major) = le_u16(i)?;
            let (i, version_minor) = le_u16(i)?;
            let (i, thiszone) = le_i32(i)?;
            let (i, sigfigs) = le_u32(i)?;
            let (i, snaplen) = le_u32(i)?;
            let (i, network) = le_i32(i)?;
            let header = PcapHeader {
                magic_number,
                version_major,
                version_minor,
                thiszone,
                sigfigs,
                snaplen,
                network: Linktype(network),
                raw,
            };
            Ok((i, header))
        }
        0xd4c3_b2a1 | 0x4d3c_b2a1 => {
            let (i, version_major) = be_u16(i)?;
            let (i, version_minor) = be_u16(i)?;
            let (i, thiszone) = be_i32(i)?;
            let (i, sigfigs) = be_u32(i)?;
            let (i, snaplen) = be_u32(i)?;
            let (i, network) = be_i32(i)?;
            let header = PcapHeader {
                magic_number,
                version_major,
                version_minor,
                thiszone,
                sigfigs,
                snaplen,
                network: Linktype(network),
                raw,
            };
            Ok((i, header))
        }
        _ => Err(nom::Err::Error(PcapError::HeaderNotRecognized)),
    }
}

/// Parse a global header from a buffer holding at least 24 bytes, mapping nom errors
pub fn read_pcap_header(i: &[u8]) -> Result<PcapHeader, PcapError> {
    match parse_pcap_header(i) {
        Ok((_, header)) => Ok(header),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e),
        Err(nom::Err::Incomplete(_)) => Err(PcapError::HeaderNotRecognized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const HEADER_LE: &[u8] = &hex!(
        "d4 c3 b2 a1 02 00 04 00 00 00 00 00 00 00 00 00
         ff ff 00 00 01 00 00 00"
    );
    const HEADER_BE: &[u8] = &hex!(
        "a1 b2 c3 d4 00 02 00 04 00 00 00 00 00 00 00 00
         00 00 ff ff 00 00 00 01"
    );

    #[test]
    fn header_little_endian() {
        let h = read_pcap_header(HEADER_LE).expect("header");
        assert_eq!(h.magic_number, PCAP_MAGIC);
        assert!(!h.is_bigendian());
        assert_eq!(h.network, Linktype::ETHERNET);
        assert_eq!(h.snaplen, 65535);
        assert_eq!(&h.raw[..], HEADER_LE);
    }

    #[test]
    fn header_big_endian() {
        let h = read_pcap_header(HEADER_BE).expect("header");
        assert_eq!(h.magic_number, 0xd4c3_b2a1);
        assert!(h.is_bigendian());
        assert_eq!(h.version_major, 2);
        assert_eq!(h.version_minor, 4);
        assert_eq!(h.network, Linktype::ETHERNET);
    }

    #[test]
    fn header_nanosecond() {
        let mut raw = HEADER_LE.to_vec();
        raw[0..4].copy_from_slice(&PCAP_MAGIC_NSEC.to_le_bytes());
        let h = read_pcap_header(&raw).expect("header");
        assert!(h.is_nanosecond_precision());
        assert!(!h.is_bigendian());
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut raw = HEADER_LE.to_vec();
        raw[0] = 0;
        assert!(matches!(read_pcap_header(&raw), Err(PcapError::HeaderNotRecognized)));
        assert!(matches!(read_pcap_header(&raw[..10]), Err(PcapError::HeaderNotRecognized)));
    }

    #[test]
    fn new_header_round_trips() {
        let h = PcapHeader::new(Linktype::RAW, 1500);
        let parsed = read_pcap_header(&h.raw).expect("header");
        assert_eq!(parsed, h);
    }
}
