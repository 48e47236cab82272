//! Packet location resolution and ordered, bounded-concurrency fetching
//!
//! A session's packet list is resolved into `(file, offset)` pairs with
//! [`resolve_locations`]. [`fetch_packets`] then reads them through a
//! [`PacketSource`] with at most `concurrency` reads in flight, and hands the
//! results to a [`PacketSink`] strictly in list order, whatever order the
//! reads complete in.
//!
//! Failures are classified with [`PcapError::is_fatal`]: a per-item failure
//! (missing or unreadable file) is recorded in the [`FetchSummary`] and the
//! fetch goes on; a fatal one (corrupt framing) stops it. Reads still in
//! flight at that point are dropped and their results discarded.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use crate::pcap::{PacketRecord, PcapHeader};
use crate::session::{FileKey, PacketLocation};
use crate::PcapError;

mod cache;
mod reorder;
mod source;

pub use cache::*;
pub use reorder::*;
pub use source::*;

/// One record delivered to a [`PacketSink`]
#[derive(Clone, Debug)]
pub struct FetchedPacket {
    /// Position in the resolved location list
    pub index: usize,
    pub file: FileKey,
    pub offset: u64,
    pub record: PacketRecord,
    /// Global header of the owning file (link type, byte order, precision)
    pub header: Arc<PcapHeader>,
}

/// A location that could not be read
#[derive(Debug)]
pub struct FetchFailure {
    pub index: usize,
    pub file: FileKey,
    pub offset: u64,
    pub error: PcapError,
}

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub requested: usize,
    pub delivered: usize,
    pub failures: Vec<FetchFailure>,
}

impl FetchSummary {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.delivered == self.requested
    }
}

/// Consumer of fetched packets
#[async_trait]
pub trait PacketSink: Send {
    /// Called before the first packet of each file, with that file's header
    ///
    /// Called again whenever the delivered packets move to another file.
    async fn on_header(&mut self, file: &FileKey, header: &PcapHeader) -> Result<(), PcapError>;

    async fn on_packet(&mut self, packet: FetchedPacket) -> Result<(), PcapError>;

    /// Called once after the last packet, unless the fetch failed
    async fn on_end(&mut self, _summary: &FetchSummary) -> Result<(), PcapError> {
        Ok(())
    }
}

/// Collects delivered packets in order
#[derive(Debug, Default)]
pub struct CollectSink {
    pub header: Option<Arc<PcapHeader>>,
    pub packets: Vec<FetchedPacket>,
}

#[async_trait]
impl PacketSink for CollectSink {
    async fn on_header(&mut self, _file: &FileKey, header: &PcapHeader) -> Result<(), PcapError> {
        if self.header.is_none() {
            self.header = Some(Arc::new(header.clone()));
        }
        Ok(())
    }

    async fn on_packet(&mut self, packet: FetchedPacket) -> Result<(), PcapError> {
        self.packets.push(packet);
        Ok(())
    }
}

/// Resolve a stored packet list into `(file, offset)` pairs
///
/// Negative entries switch the active file number, other entries are
/// offsets in the active file. At most `max_packets` offsets are kept.
pub fn resolve_locations(
    node: &str,
    positions: &[i64],
    max_packets: Option<usize>,
) -> Result<Vec<(FileKey, u64)>, PcapError> {
    let limit = max_packets.unwrap_or(usize::MAX);
    let mut current: Option<FileKey> = None;
    let mut out = Vec::with_capacity(positions.len().min(limit));
    for (i, &pos) in positions.iter().enumerate() {
        if out.len() >= limit {
            break;
        }
        match PacketLocation::try_from(pos)? {
            PacketLocation::SwitchFile(num) => current = Some(FileKey::new(node, num)),
            PacketLocation::Offset(offset) => match &current {
                Some(file) => out.push((file.clone(), offset)),
                None => {
                    return Err(PcapError::InvalidLocations(format!(
                        "offset {} at index {} precedes any file number",
                        offset, i
                    )))
                }
            },
        }
    }
    Ok(out)
}

/// Read `locations` through `source` and deliver them to `sink` in order
///
/// On success the sink's `on_end` has been called and the summary lists any
/// per-item failures. A fatal read error, or any sink error, is returned as is.
pub async fn fetch_packets<S, K>(
    source: &S,
    locations: &[(FileKey, u64)],
    concurrency: usize,
    sink: &mut K,
) -> Result<FetchSummary, PcapError>
where
    S: PacketSource + ?Sized,
    K: PacketSink + ?Sized,
{
    let concurrency = concurrency.max(1);
    let mut summary = FetchSummary {
        requested: locations.len(),
        ..FetchSummary::default()
    };
    let mut in_flight = FuturesUnordered::new();
    let mut reorder = ReorderBuffer::new();
    let mut next_start = 0;
    let mut header_file: Option<&FileKey> = None;

    loop {
        while next_start < locations.len() && next_start < reorder.next_expected() + concurrency {
            let index = next_start;
            let (file, offset) = &locations[index];
            in_flight.push(async move {
                let res = match source.header(file).await {
                    Ok(header) => source.read_packet(file, *offset).await.map(|r| (header, r)),
                    Err(e) => Err(e),
                };
                (index, res)
            });
            next_start += 1;
        }

        let Some((index, res)) = in_flight.next().await else {
            break;
        };
        reorder.insert(index, res);

        while let Some((index, res)) = reorder.pop_ready() {
            let (file, offset) = &locations[index];
            match res {
                Ok((header, record)) => {
                    if header_file != Some(file) {
                        sink.on_header(file, &header).await?;
                        header_file = Some(file);
                    }
                    sink.on_packet(FetchedPacket {
                        index,
                        file: file.clone(),
                        offset: *offset,
                        record,
                        header,
                    })
                    .await?;
                    summary.delivered += 1;
                }
                Err(error) if error.is_fatal() => {
                    warn!(file = %file, offset, pending = in_flight.len(), "fetch aborted: {}", error);
                    return Err(error);
                }
                Err(error) => {
                    debug!(file = %file, offset, "packet unavailable: {}", error);
                    summary.failures.push(FetchFailure {
                        index,
                        file: file.clone(),
                        offset: *offset,
                        error,
                    });
                }
            }
        }
    }

    if !summary.failures.is_empty() {
        warn!(
            failed = summary.failures.len(),
            requested = summary.requested,
            "some packets could not be read"
        );
    }
    info!(delivered = summary.delivered, requested = summary.requested, "fetched packets");
    sink.on_end(&summary).await?;
    Ok(summary)
}
