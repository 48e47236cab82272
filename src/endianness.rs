use nom::error::ParseError;
use nom::number::complete::{be_u32, le_u32};
use nom::IResult;

pub(crate) struct PcapBE;
pub(crate) struct PcapLE;

/// Byte order of the numeric fields of a legacy capture file.
///
/// The global header magic fixes the order once per file; record headers
/// follow it. Packet contents are always network order.
pub(crate) trait PcapEndianness {
    fn parse_u32<'a, E: ParseError<&'a [u8]>>(i: &'a [u8]) -> IResult<&'a [u8], u32, E>;
}

impl PcapEndianness for PcapBE {
    #[inline]
    fn parse_u32<'a, E: ParseError<&'a [u8]>>(i: &'a [u8]) -> IResult<&'a [u8], u32, E> {
        be_u32(i)
    }
}

impl PcapEndianness for PcapLE {
    #[inline]
    fn parse_u32<'a, E: ParseError<&'a [u8]>>(i: &'a [u8]) -> IResult<&'a [u8], u32, E> {
        le_u32(i)
    }
}
