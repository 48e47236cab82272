//! Session metadata and the store it comes from
//!
//! Sessions, the capture-file table and key material live in an external
//! document store. The core only needs the few lookups of [`MetadataStore`];
//! [`JsonMetadataStore`] implements them over a JSON document so the crate is
//! usable on its own.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::{unwrap_dek, Cipher};
use crate::decode::{IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP};
use crate::PcapError;

/// Identity of one capture file: the capturing node and its file number
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileKey {
    pub node: String,
    pub num: u32,
}

impl FileKey {
    pub fn new(node: impl Into<String>, num: u32) -> FileKey {
        FileKey { node: node.into(), num }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.node, self.num)
    }
}

/// One entry of a session's packet list
///
/// Stored as a signed integer: a negative value switches the active file
/// number, a non-negative value is a record offset in the active file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketLocation {
    SwitchFile(u32),
    Offset(u64),
}

impl TryFrom<i64> for PacketLocation {
    type Error = PcapError;

    fn try_from(v: i64) -> Result<PacketLocation, PcapError> {
        if v < 0 {
            u32::try_from(v.unsigned_abs())
                .map(PacketLocation::SwitchFile)
                .map_err(|_| PcapError::InvalidLocations(format!("file number {} out of range", v.unsigned_abs())))
        } else {
            Ok(PacketLocation::Offset(v as u64))
        }
    }
}

impl From<PacketLocation> for i64 {
    fn from(l: PacketLocation) -> i64 {
        match l {
            PacketLocation::SwitchFile(num) => -i64::from(num),
            PacketLocation::Offset(off) => off as i64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    #[serde(default)]
    pub port: u16,
}

impl Endpoint {
    /// Conversation key: `addr:port` for IPv4, `addr.port` for IPv6
    pub fn key(&self) -> String {
        endpoint_key(&self.ip, self.port)
    }
}

pub fn endpoint_key(ip: &IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(a) => format!("{}:{}", a, port),
        IpAddr::V6(a) => format!("{}.{}", a, port),
    }
}

/// Session record, as stored by the capture side
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub node: String,
    #[serde(default, rename = "ipProtocol")]
    pub protocol: Option<u8>,
    pub source: Endpoint,
    pub destination: Endpoint,
    #[serde(default, rename = "packetPos")]
    pub packet_positions: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    /// Milliseconds since the epoch
    #[serde(default)]
    pub first_packet: u64,
    #[serde(default)]
    pub last_packet: u64,
    /// Any other fields, carried through to exported metadata
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    pub fn locations(&self) -> impl Iterator<Item = Result<PacketLocation, PcapError>> + '_ {
        self.packet_positions.iter().map(|&p| PacketLocation::try_from(p))
    }

    /// Key of the side that opened the conversation
    pub fn client_key(&self) -> String {
        self.source.key()
    }

    /// Source side as the per-packet view names it: with the port for
    /// port-based protocols, the bare address otherwise
    pub fn flow_key(&self) -> String {
        match self.protocol {
            Some(IPPROTO_TCP | IPPROTO_UDP | IPPROTO_SCTP) => self.source.key(),
            _ => self.source.ip.to_string(),
        }
    }

    /// Session record as embedded in exported captures: no packet list, plus the producer version
    pub fn export_json(&self) -> Result<String, PcapError> {
        let mut v = serde_json::to_value(self)?;
        if let Some(obj) = v.as_object_mut() {
            obj.remove("packetPos");
            obj.insert(
                "version".to_string(),
                serde_json::Value::String(env!("CARGO_PKG_VERSION").to_string()),
            );
        }
        Ok(serde_json::to_string(&v)?)
    }
}

/// At-rest encryption parameters of a capture file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    /// `aes-256-ctr` or `xor-2048`
    pub encoding: String,
    /// Wrapped data encryption key, hex
    #[serde(default)]
    pub dek: Option<String>,
    /// Counter IV, hex
    #[serde(default)]
    pub iv: Option<String>,
    /// Id of the key-encryption key that wraps `dek`
    #[serde(default)]
    pub kek_id: Option<String>,
}

/// Entry of the capture-file table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFileInfo {
    pub node: String,
    pub num: u32,
    #[serde(rename = "name")]
    pub path: PathBuf,
    #[serde(flatten)]
    pub encryption: Option<EncryptionSpec>,
    #[serde(default, rename = "filesize", skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl CaptureFileInfo {
    pub fn key(&self) -> FileKey {
        FileKey::new(self.node.clone(), self.num)
    }

    /// Build the decryption transform, unwrapping the data key through the store
    pub async fn cipher(&self, store: &dyn MetadataStore) -> Result<Cipher, PcapError> {
        let Some(enc) = &self.encryption else {
            return Ok(Cipher::None);
        };
        if matches!(enc.encoding.as_str(), "" | "normal" | "none") {
            return Ok(Cipher::None);
        }
        let (Some(dek), Some(kek_id)) = (&enc.dek, &enc.kek_id) else {
            return Err(PcapError::Encryption(format!(
                "missing key material for {} ({})",
                self.key(),
                enc.encoding
            )));
        };
        let kek = store.get_key_material(kek_id).await?;
        let key = unwrap_dek(dek, &kek)?;
        Cipher::new(&enc.encoding, &key, enc.iv.as_deref())
    }
}

/// Lookups consumed from the session-metadata store
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// File table entry, or `None` once the file has been expired
    async fn lookup_capture_file(&self, key: &FileKey) -> Result<Option<CaptureFileInfo>, PcapError>;

    async fn get_session(&self, id: &str) -> Result<Session, PcapError>;

    /// Key-encryption key bytes for `key_id`
    async fn get_key_material(&self, key_id: &str) -> Result<Vec<u8>, PcapError>;

    /// Every session sharing `root_id`, in no particular order
    async fn linked_sessions(&self, root_id: &str) -> Result<Vec<Session>, PcapError>;

    async fn delete_session(&self, id: &str) -> Result<(), PcapError>;

    /// Record that the packets of `id` were scrubbed
    async fn mark_scrubbed(&self, id: &str, by: &str) -> Result<(), PcapError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    files: Vec<CaptureFileInfo>,
    /// Key id to passphrase
    #[serde(default)]
    keks: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct StoreData {
    sessions: BTreeMap<String, Session>,
    files: HashMap<FileKey, CaptureFileInfo>,
    keks: BTreeMap<String, String>,
}

/// In-memory store, loadable from and savable to a JSON document
///
/// ```json
/// { "sessions": [ ... ], "files": [ {"node": "n1", "num": 5, "name": "/data/n1-5.pcap"} ],
///   "keks": { "kek1": "passphrase" } }
/// ```
#[derive(Debug, Default)]
pub struct JsonMetadataStore {
    data: RwLock<StoreData>,
}

impl JsonMetadataStore {
    pub fn new() -> JsonMetadataStore {
        JsonMetadataStore::default()
    }

    pub fn from_json(s: &str) -> Result<JsonMetadataStore, PcapError> {
        let doc: StoreDocument =
            serde_json::from_str(s).map_err(|e| PcapError::Metadata(format!("bad metadata document: {}", e)))?;
        let store = JsonMetadataStore::new();
        {
            let mut data = store.data.write();
            data.keks = doc.keks;
            for f in doc.files {
                data.files.insert(f.key(), f);
            }
            for s in doc.sessions {
                data.sessions.insert(s.id.clone(), s);
            }
        }
        Ok(store)
    }

    pub fn load(path: &Path) -> Result<JsonMetadataStore, PcapError> {
        let s = std::fs::read_to_string(path).map_err(|source| PcapError::File {
            path: path.to_path_buf(),
            source,
        })?;
        let store = JsonMetadataStore::from_json(&s)?;
        debug!(path = %path.display(), sessions = store.data.read().sessions.len(), "loaded metadata");
        Ok(store)
    }

    pub fn to_json(&self) -> Result<String, PcapError> {
        let data = self.data.read();
        let mut files: Vec<CaptureFileInfo> = data.files.values().cloned().collect();
        files.sort_by(|a, b| a.key().cmp(&b.key()));
        let doc = StoreDocument {
            sessions: data.sessions.values().cloned().collect(),
            files,
            keks: data.keks.clone(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), PcapError> {
        let s = self.to_json()?;
        std::fs::write(path, s).map_err(|source| PcapError::File {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn insert_session(&self, session: Session) {
        self.data.write().sessions.insert(session.id.clone(), session);
    }

    pub fn insert_file(&self, file: CaptureFileInfo) {
        self.data.write().files.insert(file.key(), file);
    }

    pub fn remove_file(&self, key: &FileKey) {
        self.data.write().files.remove(key);
    }

    pub fn insert_kek(&self, id: impl Into<String>, passphrase: impl Into<String>) {
        self.data.write().keks.insert(id.into(), passphrase.into());
    }

    pub fn session(&self, id: &str) -> Option<Session> {
        self.data.read().sessions.get(id).cloned()
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn lookup_capture_file(&self, key: &FileKey) -> Result<Option<CaptureFileInfo>, PcapError> {
        Ok(self.data.read().files.get(key).cloned())
    }

    async fn get_session(&self, id: &str) -> Result<Session, PcapError> {
        self.session(id).ok_or_else(|| PcapError::SessionNotFound(id.to_string()))
    }

    async fn get_key_material(&self, key_id: &str) -> Result<Vec<u8>, PcapError> {
        match self.data.read().keks.get(key_id) {
            Some(k) => Ok(k.as_bytes().to_vec()),
            None => {
                warn!(key_id, "couldn't find kek");
                Err(PcapError::Encryption(format!("couldn't find kek {}", key_id)))
            }
        }
    }

    async fn linked_sessions(&self, root_id: &str) -> Result<Vec<Session>, PcapError> {
        Ok(self
            .data
            .read()
            .sessions
            .values()
            .filter(|s| s.root_id.as_deref() == Some(root_id))
            .cloned()
            .collect())
    }

    async fn delete_session(&self, id: &str) -> Result<(), PcapError> {
        match self.data.write().sessions.remove(id) {
            Some(_) => Ok(()),
            None => Err(PcapError::SessionNotFound(id.to_string())),
        }
    }

    async fn mark_scrubbed(&self, id: &str, by: &str) -> Result<(), PcapError> {
        let mut data = self.data.write();
        let session = data
            .sessions
            .get_mut(id)
            .ok_or_else(|| PcapError::SessionNotFound(id.to_string()))?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        session.extra.insert("scrubby".to_string(), by.into());
        session.extra.insert("scrubat".to_string(), now.into());
        Ok(())
    }
}
