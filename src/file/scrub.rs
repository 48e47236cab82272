use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

use super::handle::{open_blocking, read_at};
use crate::crypto::Cipher;
use crate::pcap::{parse_record_header, read_pcap_header, PacketRecord, PcapHeader, MAX_RECORD_LEN, RECORD_HEADER_LEN};
use crate::PcapError;

/// Write-mode handle used only for in-place redaction
///
/// Never shares a descriptor with [`CaptureFile`](super::CaptureFile). Writes
/// are serialized per file and every write is followed by `fsync`.
#[derive(Debug)]
pub struct ScrubFile {
    path: PathBuf,
    file: Arc<File>,
    header: OnceCell<Arc<PcapHeader>>,
    write_lock: Arc<Mutex<()>>,
}

impl ScrubFile {
    /// Open `path` read-write. Encrypted files cannot be rewritten in place.
    pub async fn open(path: impl Into<PathBuf>, cipher: &Cipher) -> Result<ScrubFile, PcapError> {
        let path = path.into();
        if cipher.is_encrypted() {
            return Err(PcapError::Encryption(format!(
                "can't write encrypted file {} ({})",
                path.display(),
                cipher.name()
            )));
        }
        let file = open_blocking(path.clone(), true).await?;
        debug!(path = %path.display(), "opened capture file for writing");
        Ok(ScrubFile {
            path,
            file: Arc::new(file),
            header: OnceCell::new(),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn header(&self) -> Result<Arc<PcapHeader>, PcapError> {
        self.header
            .get_or_try_init(|| async {
                let buf = read_at(self.file.clone(), 0, crate::pcap::PCAP_HEADER_LEN)
                    .await
                    .map_err(|e| self.io_error(e))?;
                Ok(Arc::new(read_pcap_header(&buf)?))
            })
            .await
            .cloned()
    }

    /// Read the record at `offset`, as the scrubber needs it to find the payload
    pub async fn read_packet_at(&self, offset: u64) -> Result<PacketRecord, PcapError> {
        let big_endian = self.header().await?.is_bigendian();
        let head = read_at(self.file.clone(), offset, RECORD_HEADER_LEN)
            .await
            .map_err(|e| self.io_error(e))?;
        let rh = match parse_record_header(&head, big_endian) {
            Ok((_, rh)) => rh,
            Err(_) => {
                return Err(PcapError::ShortRead {
                    path: self.path.clone(),
                    offset,
                    wanted: RECORD_HEADER_LEN,
                    got: head.len(),
                })
            }
        };
        if rh.caplen > MAX_RECORD_LEN {
            return Err(PcapError::CorruptRecord {
                path: self.path.clone(),
                offset,
                reason: format!("declared length {} outside [0, {}]", rh.caplen, MAX_RECORD_LEN),
            });
        }
        let bytes = read_at(self.file.clone(), offset, rh.record_len())
            .await
            .map_err(|e| self.io_error(e))?;
        if bytes.len() < rh.record_len() {
            return Err(PcapError::ShortRead {
                path: self.path.clone(),
                offset,
                wanted: rh.record_len(),
                got: bytes.len(),
            });
        }
        Ok(PacketRecord {
            bytes,
            header: rh,
            big_endian,
        })
    }

    /// Overwrite `len` bytes at `pos` with `pattern` repeated, then fsync
    pub async fn overwrite(&self, pos: u64, len: usize, pattern: &[u8]) -> Result<(), PcapError> {
        if len == 0 || pattern.is_empty() {
            return Ok(());
        }
        let data: Vec<u8> = pattern.iter().copied().cycle().take(len).collect();
        let file = self.file.clone();
        let lock = self.write_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            pwrite_all(&file, &data, pos)?;
            file.sync_all()
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|r| r)
        .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: io::Error) -> PcapError {
        PcapError::File {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(unix)]
fn pwrite_all(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn pwrite_all(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::XOR_2048;
    use crate::linktype::Linktype;

    #[tokio::test]
    async fn overwrite_in_place() {
        let mut data = PcapHeader::new(Linktype::RAW, 65535).raw.to_vec();
        data.extend_from_slice(&PacketRecord::new(1, 2, b"0123456789").bytes);
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("s.pcap");
        std::fs::write(&path, &data).expect("write");

        let f = ScrubFile::open(&path, &Cipher::None).await.expect("open");
        let rec = f.read_packet_at(24).await.expect("read");
        assert_eq!(rec.frame(), b"0123456789");
        f.overwrite(24 + 16 + 2, 5, b"ab").await.expect("overwrite");
        let after = std::fs::read(&path).expect("read");
        assert_eq!(&after[40..], b"01ababa789");
        assert_eq!(after.len(), data.len());
    }

    #[tokio::test]
    async fn refuses_encrypted() {
        let key = [1u8; 256];
        let cipher = Cipher::new(XOR_2048, &key, None).expect("xor");
        let err = ScrubFile::open("/nonexistent", &cipher).await.unwrap_err();
        assert!(matches!(err, PcapError::Encryption(_)));
    }
}
