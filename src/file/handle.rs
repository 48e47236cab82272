use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::crypto::Cipher;
use crate::pcap::{parse_record_header, read_pcap_header, PacketRecord, PcapHeader, MAX_RECORD_LEN, RECORD_HEADER_LEN};
use crate::PcapError;

/// Bytes read for the global header; more than 24 so the first cipher blocks are complete
const HEADER_READ_LEN: usize = 64;

/// Read-mode handle on one capture file
///
/// The global header is read and cached on first use. Record reads start on
/// a cipher-aligned boundary so encrypted files decrypt correctly at any offset.
#[derive(Debug)]
pub struct CaptureFile {
    path: PathBuf,
    file: Arc<File>,
    cipher: Cipher,
    read_window: usize,
    header: OnceCell<Arc<PcapHeader>>,
}

impl CaptureFile {
    /// Open `path` read-only. `read_window` is rounded up to a multiple of 256.
    pub async fn open(path: impl Into<PathBuf>, cipher: Cipher, read_window: usize) -> Result<CaptureFile, PcapError> {
        let path = path.into();
        let file = open_blocking(path.clone(), false).await?;
        debug!(path = %path.display(), cipher = cipher.name(), "opened capture file");
        Ok(CaptureFile {
            path,
            file: Arc::new(file),
            cipher,
            read_window: round_up(read_window.max(RECORD_HEADER_LEN), 256),
            header: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// Global header, read and decrypted once
    pub async fn header(&self) -> Result<Arc<PcapHeader>, PcapError> {
        self.header
            .get_or_try_init(|| async {
                let mut buf = read_at(self.file.clone(), 0, HEADER_READ_LEN).await.map_err(|e| self.io_error(e))?;
                if buf.len() < crate::pcap::PCAP_HEADER_LEN {
                    return Err(PcapError::CorruptRecord {
                        path: self.path.clone(),
                        offset: 0,
                        reason: format!("missing pcap header, only have {} bytes", buf.len()),
                    });
                }
                self.cipher.apply(&mut buf, 0);
                let header = read_pcap_header(&buf)?;
                debug!(
                    path = %self.path.display(),
                    linktype = %header.network,
                    big_endian = header.is_bigendian(),
                    "read capture header"
                );
                Ok(Arc::new(header))
            })
            .await
            .cloned()
    }

    /// Read the record (16-byte header plus frame) stored at `offset`
    pub async fn read_packet_at(&self, offset: u64) -> Result<PacketRecord, PcapError> {
        let header = self.header().await?;
        let big_endian = header.is_bigendian();

        let start = offset - offset % self.cipher.alignment();
        let inside = (offset - start) as usize;
        let window = round_up(self.read_window.max(inside + RECORD_HEADER_LEN), 256);

        let mut buf = read_at(self.file.clone(), start, window).await.map_err(|e| self.io_error(e))?;
        self.cipher.apply(&mut buf, start);
        if buf.len() < inside + RECORD_HEADER_LEN {
            return Err(self.short_read(offset, RECORD_HEADER_LEN, buf.len().saturating_sub(inside)));
        }

        let rh = match parse_record_header(&buf[inside..], big_endian) {
            Ok((_, rh)) => rh,
            Err(_) => return Err(self.short_read(offset, RECORD_HEADER_LEN, buf.len() - inside)),
        };
        if rh.caplen > MAX_RECORD_LEN {
            error!(path = %self.path.display(), offset, caplen = rh.caplen, "corrupt record length");
            return Err(PcapError::CorruptRecord {
                path: self.path.clone(),
                offset,
                reason: format!("declared length {} outside [0, {}]", rh.caplen, MAX_RECORD_LEN),
            });
        }

        let need = inside + rh.record_len();
        if buf.len() < need && buf.len() == window {
            // continue the keystream at the next aligned position
            let cont_start = start + window as u64;
            let mut more = read_at(self.file.clone(), cont_start, need - window)
                .await
                .map_err(|e| self.io_error(e))?;
            self.cipher.apply(&mut more, cont_start);
            buf.extend_from_slice(&more);
        }
        if buf.len() < need {
            return Err(self.short_read(offset, rh.record_len(), buf.len() - inside));
        }

        buf.truncate(need);
        let bytes = if inside == 0 { buf } else { buf.split_off(inside) };
        Ok(PacketRecord {
            bytes,
            header: rh,
            big_endian,
        })
    }

    fn io_error(&self, source: io::Error) -> PcapError {
        PcapError::File {
            path: self.path.clone(),
            source,
        }
    }

    fn short_read(&self, offset: u64, wanted: usize, got: usize) -> PcapError {
        error!(path = %self.path.display(), offset, wanted, got, "short read");
        PcapError::ShortRead {
            path: self.path.clone(),
            offset,
            wanted,
            got,
        }
    }
}

#[inline]
pub(crate) fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Open a file on the blocking pool, logging permission hints on `EACCES`
pub(crate) async fn open_blocking(path: PathBuf, write: bool) -> Result<File, PcapError> {
    let p = path.clone();
    let res = tokio::task::spawn_blocking(move || std::fs::OpenOptions::new().read(true).write(write).open(&p))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    match res.and_then(|r| r) {
        Ok(f) => Ok(f),
        Err(source) => {
            warn!(path = %path.display(), error = %source, "couldn't open capture file");
            if source.kind() == io::ErrorKind::PermissionDenied {
                permission_hint(&path);
            }
            Err(PcapError::File { path, source })
        }
    }
}

/// Name the first directory lacking search permission, or the file itself
fn permission_hint(path: &Path) {
    let abs = std::fs::canonicalize(path)
        .ok()
        .or_else(|| std::env::current_dir().ok().map(|d| d.join(path)))
        .unwrap_or_else(|| path.to_path_buf());
    let mut dirs: Vec<&Path> = abs.ancestors().skip(1).filter(|d| d.parent().is_some()).collect();
    dirs.reverse();
    for dir in dirs {
        // stat of "dir/." needs search permission on dir
        if let Err(e) = std::fs::metadata(dir.join(".")) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                warn!("directory permissions issue, possible fix \"chmod a+x '{}'\"", dir.display());
                return;
            }
        }
    }
    warn!("file permissions issue, possible fix \"chmod a+r '{}'\"", path.display());
}

/// Positional read of up to `len` bytes, shorter only at end of file
pub(crate) async fn read_at(file: Arc<File>, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        let mut done = 0;
        while done < len {
            match pread(&file, &mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(done);
        Ok(buf)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
