//! In-place redaction of a session's packets
//!
//! Every packet location is overwritten three times (all `0x00`, all `0x01`,
//! then a repeated readable marker), each pass followed by `fsync`. Files are
//! opened through a write-mode [`FileRegistry`] of [`ScrubFile`] handles, never
//! through the read handles. A location that cannot be scrubbed is reported in
//! the summary and the others are still processed; rerunning a scrub with the
//! same granularity is harmless.

use std::str::FromStr;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::decode::decode;
use crate::file::{FileLease, FileRegistry, ScrubFile};
use crate::fetch::resolve_locations;
use crate::pcap::RECORD_HEADER_LEN;
use crate::session::{FileKey, MetadataStore, Session};
use crate::PcapError;

pub const DEFAULT_SCRUB_MARKER: &str = "Scrubbed! Hoot! ";

/// Region of each record that is overwritten
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrubGranularity {
    /// Transport payload only; link, IP and transport headers are kept
    Payload,
    /// The whole frame; only the 16-byte capture record header is kept
    Entire,
}

impl FromStr for ScrubGranularity {
    type Err = PcapError;

    fn from_str(s: &str) -> Result<ScrubGranularity, PcapError> {
        match s {
            "payload" | "pcap" => Ok(ScrubGranularity::Payload),
            "entire" | "all" => Ok(ScrubGranularity::Entire),
            other => Err(PcapError::Config(format!("unknown scrub granularity {:?}", other))),
        }
    }
}

/// What happened to the session metadata after the packets were scrubbed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataAction {
    Deleted,
    MarkedScrubbed,
    /// Some packets failed; metadata kept so the scrub can be retried
    Retained,
}

#[derive(Debug)]
pub struct PacketScrub {
    pub index: usize,
    pub file: FileKey,
    pub offset: u64,
    /// Bytes overwritten, or why the packet was not scrubbed
    pub result: Result<usize, PcapError>,
}

#[derive(Debug)]
pub struct ScrubSummary {
    pub session_id: String,
    pub granularity: ScrubGranularity,
    pub packets: Vec<PacketScrub>,
    pub metadata: MetadataAction,
}

impl ScrubSummary {
    pub fn scrubbed(&self) -> usize {
        self.packets.iter().filter(|p| p.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.packets.len() - self.scrubbed()
    }

    pub fn bytes(&self) -> usize {
        self.packets.iter().filter_map(|p| p.result.as_ref().ok()).sum()
    }
}

pub struct Scrubber {
    store: Arc<dyn MetadataStore>,
    registry: Arc<FileRegistry<ScrubFile>>,
    concurrency: usize,
    passes: [Vec<u8>; 3],
}

impl Scrubber {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        registry: Arc<FileRegistry<ScrubFile>>,
        concurrency: usize,
        marker: &str,
    ) -> Scrubber {
        let marker = if marker.is_empty() { DEFAULT_SCRUB_MARKER } else { marker };
        Scrubber {
            store,
            registry,
            concurrency: concurrency.max(1),
            passes: [vec![0x00], vec![0x01], marker.as_bytes().to_vec()],
        }
    }

    /// Scrub every packet of `session`, then delete its metadata or mark it scrubbed
    pub async fn scrub_session(
        &self,
        session: &Session,
        granularity: ScrubGranularity,
        delete_metadata: bool,
        by: &str,
    ) -> Result<ScrubSummary, PcapError> {
        let locations = resolve_locations(&session.node, &session.packet_positions, None)?;
        let packets = self.scrub_locations(&locations, granularity).await;
        let mut summary = ScrubSummary {
            session_id: session.id.clone(),
            granularity,
            packets,
            metadata: MetadataAction::Retained,
        };
        if summary.failed() > 0 {
            warn!(
                session = %session.id,
                failed = summary.failed(),
                "scrub incomplete, keeping session metadata"
            );
        } else if delete_metadata {
            self.store.delete_session(&session.id).await?;
            summary.metadata = MetadataAction::Deleted;
        } else {
            self.store.mark_scrubbed(&session.id, by).await?;
            summary.metadata = MetadataAction::MarkedScrubbed;
        }
        info!(
            session = %session.id,
            packets = summary.scrubbed(),
            bytes = summary.bytes(),
            metadata = ?summary.metadata,
            "scrubbed session"
        );
        Ok(summary)
    }

    /// Scrub each location, at most `concurrency` at a time; results are in input order
    pub async fn scrub_locations(&self, locations: &[(FileKey, u64)], granularity: ScrubGranularity) -> Vec<PacketScrub> {
        stream::iter(locations.iter().enumerate())
            .map(|(index, (file, offset))| async move {
                let result = self.scrub_packet(file, *offset, granularity).await;
                if let Err(e) = &result {
                    warn!(file = %file, offset, "couldn't scrub packet: {}", e);
                }
                PacketScrub {
                    index,
                    file: file.clone(),
                    offset: *offset,
                    result,
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn lease(&self, file: &FileKey) -> Result<FileLease<ScrubFile>, PcapError> {
        self.registry
            .acquire(file.clone(), || async {
                let Some(info) = self.store.lookup_capture_file(file).await? else {
                    return Err(PcapError::FileUnavailable {
                        node: file.node.clone(),
                        num: file.num,
                    });
                };
                let cipher = info.cipher(self.store.as_ref()).await?;
                ScrubFile::open(info.path, &cipher).await
            })
            .await
    }

    /// Overwrite one record; returns the number of bytes covered by each pass
    pub async fn scrub_packet(&self, file: &FileKey, offset: u64, granularity: ScrubGranularity) -> Result<usize, PcapError> {
        let handle = self.lease(file).await?;
        let header = handle.header().await?;
        let record = handle.read_packet_at(offset).await?;
        let end = record.bytes.len();
        let start = match granularity {
            ScrubGranularity::Entire => RECORD_HEADER_LEN,
            ScrubGranularity::Payload => {
                let packet = decode(record, header.network, header.is_nanosecond_precision());
                match packet.transport_payload_start() {
                    Some(start) => start.min(end),
                    None => {
                        return Err(PcapError::Unscrubbable(format!(
                            "unknown transport in {} at offset {}",
                            file, offset
                        )))
                    }
                }
            }
        };
        let len = end - start;
        for pattern in &self.passes {
            handle.overwrite(offset + start as u64, len, pattern).await?;
        }
        debug!(file = %file, offset, start, len, "scrubbed packet");
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::ETH_IPV4_TCP;
    use crate::linktype::Linktype;
    use crate::pcap::{PacketRecord, PcapHeader};
    use crate::session::{CaptureFileInfo, JsonMetadataStore};
    use std::path::Path;
    use std::time::Duration;

    fn write_capture(path: &Path, frames: &[&[u8]]) -> Vec<i64> {
        let mut out = PcapHeader::new(Linktype::ETHERNET, 65535).raw.to_vec();
        let mut pos = vec![-1];
        for f in frames {
            pos.push(out.len() as i64);
            out.extend_from_slice(&PacketRecord::new(1, 0, f).bytes);
        }
        std::fs::write(path, out).expect("write capture");
        pos
    }

    fn setup(dir: &tempfile::TempDir, frames: &[&[u8]]) -> (Arc<JsonMetadataStore>, Session) {
        let path = dir.path().join("n1-1.pcap");
        let pos = write_capture(&path, frames);
        let store = Arc::new(JsonMetadataStore::new());
        store.insert_file(CaptureFileInfo {
            node: "n1".to_string(),
            num: 1,
            path,
            encryption: None,
            size: None,
        });
        let session: Session = serde_json::from_value(serde_json::json!({
            "id": "s1", "node": "n1", "ipProtocol": 6,
            "source": {"ip": "10.0.0.1", "port": 1234},
            "destination": {"ip": "10.0.0.2", "port": 80},
            "packetPos": pos,
        }))
        .expect("session");
        store.insert_session(session.clone());
        (store, session)
    }

    fn scrubber(store: Arc<JsonMetadataStore>) -> Scrubber {
        Scrubber::new(store, FileRegistry::new(Duration::ZERO), 4, DEFAULT_SCRUB_MARKER)
    }

    #[tokio::test]
    async fn payload_scrub_keeps_headers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, session) = setup(&dir, &[ETH_IPV4_TCP, ETH_IPV4_TCP]);
        let s = scrubber(store.clone());
        let summary = s
            .scrub_session(&session, ScrubGranularity::Payload, false, "admin")
            .await
            .expect("scrub");
        assert_eq!(summary.scrubbed(), 2);
        assert_eq!(summary.bytes(), 10);
        assert_eq!(summary.metadata, MetadataAction::MarkedScrubbed);
        let marked = store.session("s1").expect("kept");
        assert_eq!(marked.extra.get("scrubby"), Some(&serde_json::json!("admin")));

        let data = std::fs::read(dir.path().join("n1-1.pcap")).expect("read");
        let rec = &data[24..24 + 16 + ETH_IPV4_TCP.len()];
        let payload_at = ETH_IPV4_TCP.len() - 5;
        assert_eq!(&rec[16..16 + payload_at], &ETH_IPV4_TCP[..payload_at]);
        assert_eq!(&rec[16 + payload_at..], b"Scrub");
    }

    #[tokio::test]
    async fn scrub_twice_is_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, session) = setup(&dir, &[ETH_IPV4_TCP]);
        let s = scrubber(store);
        let locs = resolve_locations("n1", &session.packet_positions, None).expect("locs");
        for granularity in [ScrubGranularity::Payload, ScrubGranularity::Entire] {
            s.scrub_locations(&locs, granularity).await;
            let once = std::fs::read(dir.path().join("n1-1.pcap")).expect("read");
            let again = s.scrub_locations(&locs, granularity).await;
            assert!(again[0].result.is_ok());
            let twice = std::fs::read(dir.path().join("n1-1.pcap")).expect("read");
            assert_eq!(once, twice);
        }
    }

    #[tokio::test]
    async fn entire_scrub_and_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, session) = setup(&dir, &[ETH_IPV4_TCP]);
        let s = scrubber(store.clone());
        let summary = s
            .scrub_session(&session, ScrubGranularity::Entire, true, "admin")
            .await
            .expect("scrub");
        assert_eq!(summary.bytes(), ETH_IPV4_TCP.len());
        assert_eq!(summary.metadata, MetadataAction::Deleted);
        assert!(store.session("s1").is_none());

        let data = std::fs::read(dir.path().join("n1-1.pcap")).expect("read");
        // record header intact, frame replaced by the marker
        assert_eq!(&data[24..40], &PacketRecord::new(1, 0, ETH_IPV4_TCP).bytes[..16]);
        assert_eq!(&data[40..56], DEFAULT_SCRUB_MARKER.as_bytes());
    }

    #[tokio::test]
    async fn per_packet_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        // an ARP frame has no transport layer
        let mut arp = ETH_IPV4_TCP[..14].to_vec();
        arp[12..14].copy_from_slice(&[0x08, 0x06]);
        arp.extend_from_slice(&[0u8; 28]);
        let (store, mut session) = setup(&dir, &[&arp, ETH_IPV4_TCP]);
        session.packet_positions.extend_from_slice(&[-2, 24]);
        let s = scrubber(store.clone());
        let summary = s
            .scrub_session(&session, ScrubGranularity::Payload, true, "admin")
            .await
            .expect("scrub");
        assert_eq!(summary.packets.len(), 3);
        assert!(matches!(summary.packets[0].result, Err(PcapError::Unscrubbable(_))));
        assert_eq!(summary.packets[1].result.as_ref().ok(), Some(&5));
        assert!(matches!(summary.packets[2].result, Err(PcapError::FileUnavailable { .. })));
        assert_eq!(summary.metadata, MetadataAction::Retained);
        assert!(store.session("s1").is_some());
    }

    #[test]
    fn granularity_names() {
        assert_eq!("all".parse::<ScrubGranularity>().expect("g"), ScrubGranularity::Entire);
        assert_eq!("payload".parse::<ScrubGranularity>().expect("g"), ScrubGranularity::Payload);
        assert!("spi".parse::<ScrubGranularity>().is_err());
    }
}
