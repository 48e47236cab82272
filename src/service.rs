//! Operations exposed to the API layer
//!
//! [`PcapService`] ties a [`MetadataStore`] to a [`PacketSource`] and offers
//! the session-level operations: reassembly for display (merged or frame by
//! frame), raw ordered packet delivery, capture export and scrubbing.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::decode::{decode, DecodedPacket};
use crate::fetch::{fetch_packets, resolve_locations, CollectSink, FetchSummary, LocalPacketSource, PacketSink, PacketSource};
use crate::file::FileRegistry;
use crate::reassembly::{packet_flow, reassemble, PacketFlow, Segment};
use crate::scrub::{ScrubGranularity, ScrubSummary, Scrubber};
use crate::session::{MetadataStore, Session};
use crate::writer::{CaptureFormat, CaptureWriter};
use crate::PcapError;

pub struct PcapService {
    config: Config,
    store: Arc<dyn MetadataStore>,
    source: Arc<dyn PacketSource>,
    scrubber: Scrubber,
}

impl PcapService {
    /// Service reading local capture files named by the store's file table
    pub fn new(store: Arc<dyn MetadataStore>, config: Config) -> PcapService {
        let source = LocalPacketSource::new(
            store.clone(),
            FileRegistry::new(config.eviction_grace()),
            config.read_window,
        );
        PcapService::with_source(store, Arc::new(source), config)
    }

    /// Service reading packets through another strategy, such as a
    /// [`BlockPacketSource`](crate::fetch::BlockPacketSource)
    pub fn with_source(store: Arc<dyn MetadataStore>, source: Arc<dyn PacketSource>, config: Config) -> PcapService {
        let scrubber = Scrubber::new(
            store.clone(),
            FileRegistry::new(config.eviction_grace()),
            config.scrub_concurrency,
            &config.scrub_marker,
        );
        PcapService {
            config,
            store,
            source,
            scrubber,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch and decode the first `max_packets` packets of a session, in order
    ///
    /// Packets that could not be read are left out. If none could be read,
    /// the first failure is returned.
    pub async fn decode_packets(&self, session: &Session, max_packets: Option<usize>) -> Result<Vec<DecodedPacket>, PcapError> {
        let locations = resolve_locations(&session.node, &session.packet_positions, max_packets)?;
        let mut sink = CollectSink::default();
        let mut summary = fetch_packets(self.source.as_ref(), &locations, self.config.fetch_concurrency, &mut sink).await?;
        if sink.packets.is_empty() && !summary.failures.is_empty() {
            let first = summary.failures.swap_remove(0);
            warn!(session = %session.id, "capture data no longer available: {}", first.error);
            return Err(first.error);
        }
        Ok(sink
            .packets
            .into_iter()
            .map(|p| decode(p.record, p.header.network, p.header.is_nanosecond_precision()))
            .collect())
    }

    /// Reassemble a session into per-direction segments
    ///
    /// `protocol_hint` overrides the protocol recorded on the session.
    pub async fn decode_and_reassemble(
        &self,
        session_id: &str,
        max_packets: Option<usize>,
        protocol_hint: Option<u8>,
    ) -> Result<Vec<Segment>, PcapError> {
        let session = self.store.get_session(session_id).await?;
        let max_packets = max_packets.unwrap_or(self.config.max_packets);
        let packets = self.decode_packets(&session, Some(max_packets)).await?;
        debug!(session = session_id, packets = packets.len(), "decoded session");
        reassemble(
            &packets,
            protocol_hint.or(session.protocol),
            max_packets,
            &session.client_key(),
        )
    }

    /// Per-packet view of a session, for showing it frame by frame
    pub async fn packet_flow(&self, session_id: &str, max_packets: Option<usize>) -> Result<PacketFlow, PcapError> {
        let session = self.store.get_session(session_id).await?;
        let max_packets = max_packets.unwrap_or(self.config.max_packets);
        let packets = self.decode_packets(&session, Some(max_packets)).await?;
        Ok(packet_flow(&packets, max_packets, &session.flow_key()))
    }

    /// Deliver a session's raw records to `sink`, strictly in stored order
    pub async fn fetch_raw_packets<K: PacketSink + ?Sized>(
        &self,
        session_id: &str,
        sink: &mut K,
        max_packets: Option<usize>,
        concurrency: Option<usize>,
    ) -> Result<FetchSummary, PcapError> {
        let session = self.store.get_session(session_id).await?;
        let locations = resolve_locations(&session.node, &session.packet_positions, max_packets)?;
        fetch_packets(
            self.source.as_ref(),
            &locations,
            concurrency.unwrap_or(self.config.fetch_concurrency),
            sink,
        )
        .await
    }

    /// Sessions exported together with `session`: those sharing its root id,
    /// oldest last packet first
    async fn export_chain(&self, session: Session) -> Result<Vec<Session>, PcapError> {
        let Some(root) = session.root_id.clone() else {
            return Ok(vec![session]);
        };
        let mut chain = self.store.linked_sessions(&root).await?;
        if !chain.iter().any(|s| s.id == session.id) {
            chain.push(session);
        }
        chain.sort_by(|a, b| a.last_packet.cmp(&b.last_packet).then_with(|| a.id.cmp(&b.id)));
        Ok(chain)
    }

    /// Export a session (and the sessions linked to it) as a capture stream written to `out`
    ///
    /// All packets go under one header, so files with another link type (or,
    /// for the legacy format, another byte order or precision) than the first
    /// fail the export with [`PcapError::IncompatibleCapture`].
    pub async fn write_capture_stream<W: AsyncWrite + Unpin + Send>(
        &self,
        session_id: &str,
        format: CaptureFormat,
        out: W,
    ) -> Result<W, PcapError> {
        let session = self.store.get_session(session_id).await?;
        let chain = self.export_chain(session).await?;
        let mut writer = CaptureWriter::new(out, format, self.config.write_chunk_size);
        for s in &chain {
            let locations = resolve_locations(&s.node, &s.packet_positions, None)?;
            let summary = fetch_packets(self.source.as_ref(), &locations, self.config.fetch_concurrency, &mut writer).await?;
            if !summary.failures.is_empty() {
                warn!(session = %s.id, failed = summary.failures.len(), "exported session is missing packets");
            }
            writer.write_session_metadata(s).await?;
        }
        info!(session = session_id, sessions = chain.len(), packets = writer.packets_written(), "exported capture");
        writer.finish().await
    }

    /// Overwrite a session's packets on disk, then delete or mark its metadata
    pub async fn scrub_session(
        &self,
        session_id: &str,
        granularity: ScrubGranularity,
        delete_metadata: bool,
        by: &str,
    ) -> Result<ScrubSummary, PcapError> {
        let session = self.store.get_session(session_id).await?;
        self.scrubber.scrub_session(&session, granularity, delete_metadata, by).await
    }
}
