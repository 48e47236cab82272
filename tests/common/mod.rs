#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pcap_session::session::CaptureFileInfo;
use pcap_session::{JsonMetadataStore, Linktype, Session};

pub const CLIENT: [u8; 4] = [10, 0, 0, 1];
pub const SERVER: [u8; 4] = [10, 0, 0, 2];

pub const ACK: u8 = 0x10;
pub const PSH_ACK: u8 = 0x18;

/// Ethernet / IPv4 / TCP frame
pub fn eth_tcp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut f = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x08, 0x00];
    f.extend_from_slice(&[0x45, 0x00]);
    f.extend_from_slice(&((40 + payload.len()) as u16).to_be_bytes());
    f.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00]);
    f.extend_from_slice(&src);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&dport.to_be_bytes());
    f.extend_from_slice(&seq.to_be_bytes());
    f.extend_from_slice(&ack.to_be_bytes());
    f.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
    f.extend_from_slice(payload);
    f
}

/// Legacy capture file image with records at known offsets
pub struct CaptureBuilder {
    bytes: Vec<u8>,
    big_endian: bool,
}

impl CaptureBuilder {
    pub fn new(linktype: Linktype, big_endian: bool) -> CaptureBuilder {
        let mut bytes = Vec::new();
        if big_endian {
            bytes.extend_from_slice(&0xa1b2_c3d4u32.to_be_bytes());
            bytes.extend_from_slice(&2u16.to_be_bytes());
            bytes.extend_from_slice(&4u16.to_be_bytes());
            bytes.extend_from_slice(&[0u8; 8]);
            bytes.extend_from_slice(&65535u32.to_be_bytes());
            bytes.extend_from_slice(&(linktype.0 as u32).to_be_bytes());
        } else {
            bytes.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
            bytes.extend_from_slice(&2u16.to_le_bytes());
            bytes.extend_from_slice(&4u16.to_le_bytes());
            bytes.extend_from_slice(&[0u8; 8]);
            bytes.extend_from_slice(&65535u32.to_le_bytes());
            bytes.extend_from_slice(&(linktype.0 as u32).to_le_bytes());
        }
        CaptureBuilder { bytes, big_endian }
    }

    fn u32(&self, v: u32) -> [u8; 4] {
        if self.big_endian {
            v.to_be_bytes()
        } else {
            v.to_le_bytes()
        }
    }

    /// Fill with zeros up to `offset`
    pub fn pad_to(&mut self, offset: usize) -> &mut Self {
        if self.bytes.len() < offset {
            self.bytes.resize(offset, 0);
        }
        self
    }

    /// Append a record, returning its offset
    pub fn push(&mut self, ts_sec: u32, ts_usec: u32, frame: &[u8]) -> i64 {
        self.push_with_len(ts_sec, ts_usec, frame.len() as u32, frame)
    }

    pub fn push_with_len(&mut self, ts_sec: u32, ts_usec: u32, caplen: u32, frame: &[u8]) -> i64 {
        let offset = self.bytes.len() as i64;
        for v in [ts_sec, ts_usec, caplen, frame.len() as u32] {
            let b = self.u32(v);
            self.bytes.extend_from_slice(&b);
        }
        self.bytes.extend_from_slice(frame);
        offset
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("write capture");
    path
}

pub fn file_info(node: &str, num: u32, path: PathBuf) -> CaptureFileInfo {
    CaptureFileInfo {
        node: node.to_string(),
        num,
        path,
        encryption: None,
        size: None,
    }
}

pub fn session(id: &str, positions: &[i64]) -> Session {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "node": "n1",
        "ipProtocol": 6,
        "source": {"ip": "10.0.0.1", "port": 1234},
        "destination": {"ip": "10.0.0.2", "port": 80},
        "packetPos": positions,
        "firstPacket": 1000,
        "lastPacket": 2000,
    }))
    .expect("session")
}

pub fn store() -> Arc<JsonMetadataStore> {
    Arc::new(JsonMetadataStore::new())
}

/// Client request split in two contiguous packets, then the server reply
pub fn http_exchange(b: &mut CaptureBuilder) -> Vec<i64> {
    let mut pos = vec![
        b.push(1, 0, &eth_tcp(CLIENT, SERVER, 1234, 80, 1000, 5000, PSH_ACK, b"GET / HT")),
        b.push(1, 10, &eth_tcp(CLIENT, SERVER, 1234, 80, 1008, 5000, PSH_ACK, b"TP/1.0\r\n\r\n")),
    ];
    pos.push(b.push(1, 20, &eth_tcp(SERVER, CLIENT, 80, 1234, 5000, 1018, PSH_ACK, b"HTTP/1.0 200 OK\r\n")));
    pos
}
