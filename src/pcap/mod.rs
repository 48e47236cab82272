//! Legacy PCAP container
//!
//! See <https://wiki.wireshark.org/Development/LibpcapFileFormat> for details.
//!
//! A capture file is a 24-byte global header followed by records. Each record is
//! a 16-byte header (timestamp seconds, timestamp fraction, captured length,
//! original length) and `captured length` bytes of link-layer frame. The magic
//! number of the global header fixes the byte order of every numeric field that
//! follows, including record headers.
//!
//! Records are never iterated here: sessions address them by byte offset, so
//! [`parse_pcap_header`] is used once per file and [`parse_record_header`] once
//! per packet location.

mod header;
mod record;

pub use header::*;
pub use record::*;
