use nom::error::{ErrorKind, ParseError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while locating, reading, decoding or rewriting capture data.
///
/// Variants fall in two classes. Per-item failures (a missing file, a file that
/// cannot be opened, a packet that cannot be scrubbed) are attached to the
/// location that caused them and the surrounding operation continues.
/// Fatal failures (corrupt record framing, short reads) stop the current
/// fetch, because every following offset in the same file becomes suspect.
/// See [`PcapError::is_fatal`].
#[derive(Debug, Error)]
pub enum PcapError {
    #[error("cannot open capture file {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("capture data no longer available for {node}-{num}")]
    FileUnavailable { node: String, num: u32 },

    #[error("corrupt record at offset {offset} in {}: {reason}", path.display())]
    CorruptRecord {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("short read at offset {offset} in {}: wanted {wanted} bytes, got {got}", path.display())]
    ShortRead {
        path: PathBuf,
        offset: u64,
        wanted: usize,
        got: usize,
    },

    #[error("pcap header not recognized")]
    HeaderNotRecognized,

    #[error("reassembly failed: {0}")]
    Reassembly(String),

    #[error("encryption: {0}")]
    Encryption(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("invalid packet locations: {0}")]
    InvalidLocations(String),

    #[error("captures cannot be written as one file: {0}")]
    IncompatibleCapture(String),

    #[error("cannot scrub packet: {0}")]
    Unscrubbable(String),

    #[error("metadata store: {0}")]
    Metadata(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("serialization: {0}")]
    Serialize(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error: {0:?}")]
    NomError(ErrorKind),
}

impl PcapError {
    /// Whether this error must abort the remaining reads of a session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PcapError::CorruptRecord { .. }
                | PcapError::ShortRead { .. }
                | PcapError::HeaderNotRecognized
                | PcapError::InvalidLocations(_)
        )
    }
}

impl<I> ParseError<I> for PcapError {
    fn from_error_kind(_input: I, kind: ErrorKind) -> Self {
        PcapError::NomError(kind)
    }
    fn append(_input: I, kind: ErrorKind, _other: Self) -> Self {
        PcapError::NomError(kind)
    }
}

impl From<cookie_factory::GenError> for PcapError {
    fn from(e: cookie_factory::GenError) -> Self {
        PcapError::Serialize(format!("{:?}", e))
    }
}

impl From<serde_json::Error> for PcapError {
    fn from(e: serde_json::Error) -> Self {
        PcapError::Serialize(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PcapError>;
