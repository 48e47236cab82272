use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::cache::LruCache;
use crate::file::{CaptureFile, FileLease, FileRegistry};
use crate::pcap::{parse_record_header, read_pcap_header, PacketRecord, PcapHeader, MAX_RECORD_LEN, PCAP_HEADER_LEN, RECORD_HEADER_LEN};
use crate::session::{FileKey, MetadataStore};
use crate::PcapError;

/// Where packet bytes come from
///
/// Both strategies return plaintext records; decryption, when needed,
/// happens below this interface.
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Global header of `file`
    async fn header(&self, file: &FileKey) -> Result<Arc<PcapHeader>, PcapError>;

    /// Record (16-byte header plus frame) at `offset` in `file`
    async fn read_packet(&self, file: &FileKey, offset: u64) -> Result<PacketRecord, PcapError>;
}

/// Direct reads of local capture files through the shared handle registry
pub struct LocalPacketSource {
    store: Arc<dyn MetadataStore>,
    registry: Arc<FileRegistry<CaptureFile>>,
    read_window: usize,
}

impl LocalPacketSource {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        registry: Arc<FileRegistry<CaptureFile>>,
        read_window: usize,
    ) -> LocalPacketSource {
        LocalPacketSource {
            store,
            registry,
            read_window,
        }
    }

    async fn lease(&self, file: &FileKey) -> Result<FileLease<CaptureFile>, PcapError> {
        self.registry
            .acquire(file.clone(), || async {
                let Some(info) = self.store.lookup_capture_file(file).await? else {
                    warn!(file = %file, "only session metadata left, capture file no longer available");
                    return Err(PcapError::FileUnavailable {
                        node: file.node.clone(),
                        num: file.num,
                    });
                };
                let cipher = info.cipher(self.store.as_ref()).await?;
                CaptureFile::open(info.path, cipher, self.read_window).await
            })
            .await
    }
}

#[async_trait]
impl PacketSource for LocalPacketSource {
    async fn header(&self, file: &FileKey) -> Result<Arc<PcapHeader>, PcapError> {
        self.lease(file).await?.header().await
    }

    async fn read_packet(&self, file: &FileKey, offset: u64) -> Result<PacketRecord, PcapError> {
        self.lease(file).await?.read_packet_at(offset).await
    }
}

/// Byte-range access to remotely stored capture files
#[async_trait]
pub trait BlockReader: Send + Sync {
    /// Up to `len` bytes of `file` starting at `pos`; shorter only at end of file
    async fn read_block(&self, file: &FileKey, pos: u64, len: usize) -> Result<Vec<u8>, PcapError>;
}

/// Block-fetch strategy: reads go through an injected [`BlockReader`], and
/// per-file headers are kept in a small LRU cache
pub struct BlockPacketSource<R> {
    reader: R,
    headers: LruCache<FileKey, Arc<PcapHeader>>,
    block_size: usize,
}

impl<R: BlockReader> BlockPacketSource<R> {
    pub fn new(reader: R, header_cache_entries: usize, block_size: usize) -> BlockPacketSource<R> {
        BlockPacketSource {
            reader,
            headers: LruCache::new(header_cache_entries),
            block_size: block_size.max(RECORD_HEADER_LEN),
        }
    }

    pub fn header_cache(&self) -> &LruCache<FileKey, Arc<PcapHeader>> {
        &self.headers
    }

    fn short_read(file: &FileKey, offset: u64, wanted: usize, got: usize) -> PcapError {
        error!(file = %file, offset, wanted, got, "short block read");
        PcapError::ShortRead {
            path: PathBuf::from(file.to_string()),
            offset,
            wanted,
            got,
        }
    }
}

#[async_trait]
impl<R: BlockReader> PacketSource for BlockPacketSource<R> {
    async fn header(&self, file: &FileKey) -> Result<Arc<PcapHeader>, PcapError> {
        if let Some(h) = self.headers.get(file) {
            debug!(file = %file, "header cache hit");
            return Ok(h);
        }
        let buf = self.reader.read_block(file, 0, PCAP_HEADER_LEN).await?;
        if buf.len() < PCAP_HEADER_LEN {
            return Err(Self::short_read(file, 0, PCAP_HEADER_LEN, buf.len()));
        }
        let header = Arc::new(read_pcap_header(&buf)?);
        self.headers.put(file.clone(), header.clone());
        Ok(header)
    }

    async fn read_packet(&self, file: &FileKey, offset: u64) -> Result<PacketRecord, PcapError> {
        let big_endian = self.header(file).await?.is_bigendian();
        let mut buf = self.reader.read_block(file, offset, self.block_size).await?;
        let rh = match parse_record_header(&buf, big_endian) {
            Ok((_, rh)) => rh,
            Err(_) => return Err(Self::short_read(file, offset, RECORD_HEADER_LEN, buf.len())),
        };
        if rh.caplen > MAX_RECORD_LEN {
            error!(file = %file, offset, caplen = rh.caplen, "corrupt record length");
            return Err(PcapError::CorruptRecord {
                path: PathBuf::from(file.to_string()),
                offset,
                reason: format!("declared length {} outside [0, {}]", rh.caplen, MAX_RECORD_LEN),
            });
        }
        let need = rh.record_len();
        if buf.len() < need && buf.len() == self.block_size {
            let more = self
                .reader
                .read_block(file, offset + buf.len() as u64, need - buf.len())
                .await?;
            buf.extend_from_slice(&more);
        }
        if buf.len() < need {
            return Err(Self::short_read(file, offset, need, buf.len()));
        }
        buf.truncate(need);
        Ok(PacketRecord {
            bytes: buf,
            header: rh,
            big_endian,
        })
    }
}
