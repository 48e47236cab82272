//! # Session stream reassembly over stored pcap records
//!
//! Capture nodes store packets in legacy pcap files and, per session, an
//! ordered list of packet locations (file number switches and record
//! offsets). This crate turns such a list back into something usable:
//!
//! - application byte streams, one [`Segment`](reassembly::Segment) per
//!   direction change, for display ([`PcapService::decode_and_reassemble`]);
//! - the raw records, delivered in stored order whatever order the reads
//!   complete in ([`PcapService::fetch_raw_packets`]);
//! - a pcap or pcapng export of the session and the sessions linked to it
//!   ([`PcapService::write_capture_stream`]);
//! - in-place redaction of the stored packets ([`PcapService::scrub_session`]).
//!
//! Capture files may be encrypted at rest (`aes-256-ctr` or `xor-2048`); reads
//! decrypt transparently. Session metadata comes from a [`MetadataStore`];
//! [`JsonMetadataStore`] implements it over a JSON document.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pcap_session::{Config, JsonMetadataStore, PcapService};
//!
//! # async fn run() -> Result<(), pcap_session::PcapError> {
//! let store = JsonMetadataStore::load("metadata.json".as_ref())?;
//! let service = PcapService::new(Arc::new(store), Config::default());
//! for segment in service.decode_and_reassemble("session-id", None, None).await? {
//!     println!("{}: {} bytes", segment.key, segment.data.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The library logs through `tracing` and never installs a subscriber.

mod endianness;
mod error;
mod linktype;
pub use error::*;
pub use linktype::*;

pub mod config;
pub mod crypto;
pub mod decode;
pub mod fetch;
pub mod file;
pub mod pcap;
pub mod reassembly;
pub mod scrub;
pub mod service;
pub mod session;
pub mod writer;

pub use config::Config;
pub use service::PcapService;
pub use session::{FileKey, JsonMetadataStore, MetadataStore, PacketLocation, Session};
