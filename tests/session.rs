mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use pcap_session::crypto::{wrap_dek, Cipher, AES_256_CTR, XOR_2048};
use pcap_session::decode::Layer;
use pcap_session::fetch::{BlockPacketSource, BlockReader, CollectSink};
use pcap_session::session::EncryptionSpec;
use pcap_session::{Config, FileKey, Linktype, PcapError, PcapService};

#[tokio::test]
async fn scenario_contiguous_and_gapped() {
    let dir = tempfile::tempdir().expect("tempdir");
    for (second_seq, expected) in [(1005u32, 1usize), (1000 + 0x20000, 2)] {
        let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
        let first = b.push(10, 0, &eth_tcp(CLIENT, SERVER, 1234, 80, 1000, 1, PSH_ACK, b"hello"));
        b.pad_to(1500);
        let second = b.push(10, 500, &eth_tcp(CLIENT, SERVER, 1234, 80, second_seq, 1, PSH_ACK, b"world"));
        assert_eq!((first, second), (24, 1500));

        let path = write_file(dir.path(), &format!("n1-5-{}.pcap", second_seq), b.bytes());
        let store = store();
        store.insert_file(file_info("n1", 5, path));
        store.insert_session(session("s1", &[-5, 24, 1500]));
        let service = PcapService::new(store.clone(), Config::default());

        let sess = store.session("s1").expect("session");
        let packets = service.decode_packets(&sess, None).await.expect("decode");
        assert_eq!(packets.len(), 2);
        for p in &packets {
            let names: Vec<&str> = p.layers.iter().map(Layer::name).collect();
            assert_eq!(names, vec!["ethernet", "ipv4", "tcp"]);
            let ip = p.ip().expect("ip");
            assert_eq!(ip.addr1.to_string(), "10.0.0.1");
            assert_eq!(ip.addr2.to_string(), "10.0.0.2");
            assert!(p.error.is_none());
        }

        let segments = service.decode_and_reassemble("s1", None, None).await.expect("reassemble");
        let data: Vec<&[u8]> = segments
            .iter()
            .filter(|s| !s.is_gap_marker())
            .map(|s| &s.data[..])
            .collect();
        assert_eq!(data.len(), expected);
        if expected == 1 {
            assert_eq!(data[0], b"helloworld");
            assert_eq!(segments[0].key, "10.0.0.1:1234");
            assert_eq!(segments[0].ts, Some(10_000));
        } else {
            assert_eq!(data, vec![&b"hello"[..], &b"world"[..]]);
        }
    }
}

#[tokio::test]
async fn conversation_segments() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let mut pos = vec![-1];
    pos.extend(http_exchange(&mut b));
    let path = write_file(dir.path(), "n1-1.pcap", b.bytes());
    let store = store();
    store.insert_file(file_info("n1", 1, path));
    store.insert_session(session("s1", &pos));
    let service = PcapService::new(store, Config::default());

    let segments = service.decode_and_reassemble("s1", None, None).await.expect("reassemble");
    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].key, "10.0.0.1:1234");
    assert_eq!(segments[0].data, b"GET / HTTP/1.0\r\n\r\n");
    assert_eq!(segments[1].key, "10.0.0.2:80");
    assert_eq!(segments[1].data, b"HTTP/1.0 200 OK\r\n");

    // only the first packet
    let capped = service.decode_and_reassemble("s1", Some(1), None).await.expect("reassemble");
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].data, b"GET / HT");
}

#[tokio::test]
async fn big_endian_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, true);
    assert_eq!(&b.bytes()[..4], &[0xa1, 0xb2, 0xc3, 0xd4]);
    let mut pos = vec![-1];
    pos.extend(http_exchange(&mut b));
    let path = write_file(dir.path(), "n1-1.pcap", b.bytes());
    let store = store();
    store.insert_file(file_info("n1", 1, path));
    store.insert_session(session("s1", &pos));
    let service = PcapService::new(store, Config::default());

    let mut sink = CollectSink::default();
    let summary = service.fetch_raw_packets("s1", &mut sink, None, None).await.expect("fetch");
    assert!(summary.is_complete());
    let header = sink.header.expect("header");
    assert!(header.is_bigendian());
    assert_eq!(header.network, Linktype::ETHERNET);
    let rec = &sink.packets[1].record;
    assert!(rec.big_endian);
    assert_eq!((rec.header.ts_sec, rec.header.ts_usec), (1, 10));
    assert_eq!(rec.header.caplen as usize, rec.frame().len());

    let segments = service.decode_and_reassemble("s1", None, None).await.expect("reassemble");
    assert_eq!(segments[0].data, b"GET / HTTP/1.0\r\n\r\n");
}

#[tokio::test]
async fn missing_file_is_per_item() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let off = b.push(1, 0, &eth_tcp(CLIENT, SERVER, 1234, 80, 1000, 1, PSH_ACK, b"abc"));
    let path = write_file(dir.path(), "n1-5.pcap", b.bytes());
    let store = store();
    store.insert_file(file_info("n1", 5, path));
    store.insert_session(session("s1", &[-5, off, -6, 24, 80]));
    store.insert_session(session("gone", &[-6, 24]));
    let service = PcapService::new(store, Config::default());

    let mut sink = CollectSink::default();
    let summary = service.fetch_raw_packets("s1", &mut sink, None, None).await.expect("fetch");
    assert_eq!(summary.delivered, 1);
    assert_eq!(summary.failures.len(), 2);
    assert_eq!(summary.failures[0].file, FileKey::new("n1", 6));
    assert!(matches!(summary.failures[0].error, PcapError::FileUnavailable { .. }));

    let segments = service.decode_and_reassemble("s1", None, None).await.expect("partial");
    assert_eq!(segments[0].data, b"abc");

    let err = service.decode_and_reassemble("gone", None, None).await.unwrap_err();
    assert!(matches!(err, PcapError::FileUnavailable { ref node, num: 6 } if node == "n1"));
    assert!(err.to_string().contains("no longer available"));

    let err = service.decode_and_reassemble("nope", None, None).await.unwrap_err();
    assert!(matches!(err, PcapError::SessionNotFound(_)));
}

#[tokio::test]
async fn corrupt_record_stops_fetch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let good = b.push(1, 0, &eth_tcp(CLIENT, SERVER, 1234, 80, 1000, 1, PSH_ACK, b"abc"));
    let bad = b.push_with_len(1, 0, 0x10000, &[0u8; 64]);
    let path = write_file(dir.path(), "n1-1.pcap", b.bytes());
    let store = store();
    store.insert_file(file_info("n1", 1, path));
    store.insert_session(session("s1", &[-1, good, bad, good]));
    let service = PcapService::new(store, Config::default());

    let mut sink = CollectSink::default();
    let err = service.fetch_raw_packets("s1", &mut sink, None, Some(1)).await.unwrap_err();
    assert!(matches!(err, PcapError::CorruptRecord { offset, .. } if offset == bad as u64));
    assert_eq!(sink.packets.len(), 1);
}

#[tokio::test]
async fn encrypted_captures() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let mut pos = vec![-1];
    pos.extend(http_exchange(&mut b));

    let aes_key = [9u8; 32];
    let xor_key: Vec<u8> = (0..=255u8).rev().collect();
    let iv = "0f0e0d0c0b0a090807060504";
    let cases = [
        (AES_256_CTR, aes_key.to_vec(), Some(iv)),
        (XOR_2048, xor_key, None),
    ];
    for (i, (algorithm, key, iv)) in cases.into_iter().enumerate() {
        let cipher = Cipher::new(algorithm, &key, iv).expect("cipher");
        let mut data = b.bytes().to_vec();
        cipher.apply(&mut data, 0);
        assert_ne!(&data[..4], &b.bytes()[..4]);

        let path = write_file(dir.path(), &format!("enc-{}.pcap", i), &data);
        let store = store();
        store.insert_kek("kek1", "passphrase");
        let mut info = file_info("n1", 1, path);
        info.encryption = Some(EncryptionSpec {
            encoding: algorithm.to_string(),
            dek: Some(wrap_dek(&key, b"passphrase").expect("wrap")),
            iv: iv.map(str::to_string),
            kek_id: Some("kek1".to_string()),
        });
        store.insert_file(info);
        store.insert_session(session("s1", &pos));

        // small windows force continuation reads inside the keystream
        let config = Config {
            read_window: 64,
            ..Config::default()
        };
        let service = PcapService::new(store.clone(), config);
        let segments = service.decode_and_reassemble("s1", None, None).await.expect("reassemble");
        assert_eq!(segments.len(), 2, "{}", algorithm);
        assert_eq!(segments[0].data, b"GET / HTTP/1.0\r\n\r\n");

        let scrub = service
            .scrub_session("s1", "payload".parse().expect("granularity"), false, "admin")
            .await
            .expect("summary");
        assert_eq!(scrub.failed(), 3);
        assert!(matches!(scrub.packets[0].result, Err(PcapError::Encryption(_))));
    }
}

#[tokio::test]
async fn missing_key_material() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let off = b.push(1, 0, &eth_tcp(CLIENT, SERVER, 1234, 80, 1000, 1, PSH_ACK, b"abc"));
    let path = write_file(dir.path(), "n1-1.pcap", b.bytes());
    let store = store();
    let mut info = file_info("n1", 1, path);
    info.encryption = Some(EncryptionSpec {
        encoding: AES_256_CTR.to_string(),
        dek: Some("00".to_string()),
        iv: Some("000102030405060708090a0b".to_string()),
        kek_id: Some("unknown".to_string()),
    });
    store.insert_file(info);
    store.insert_session(session("s1", &[-1, off]));
    let service = PcapService::new(store, Config::default());
    let err = service.decode_and_reassemble("s1", None, None).await.unwrap_err();
    assert!(matches!(err, PcapError::Encryption(_)));
}

/// Serves files from memory, answering early offsets last
struct SlowBlocks {
    files: HashMap<FileKey, Vec<u8>>,
}

#[async_trait]
impl BlockReader for SlowBlocks {
    async fn read_block(&self, file: &FileKey, pos: u64, len: usize) -> Result<Vec<u8>, PcapError> {
        if pos > 0 {
            let delay = 200u64.saturating_sub(pos / 2);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let data = self.files.get(file).ok_or_else(|| PcapError::FileUnavailable {
            node: file.node.clone(),
            num: file.num,
        })?;
        let start = (pos as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }
}

#[tokio::test]
async fn reassembly_independent_of_arrival_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let mut pos = vec![-1];
    let mut seq = 1000u32;
    for i in 0..8u8 {
        let chunk = vec![b'a' + i; 10];
        pos.push(b.push(1, u32::from(i), &eth_tcp(CLIENT, SERVER, 1234, 80, seq, 5000, PSH_ACK, &chunk)));
        seq += 10;
    }
    pos.push(b.push(2, 0, &eth_tcp(SERVER, CLIENT, 80, 1234, 5000, seq, ACK, b"ok")));

    let path = write_file(dir.path(), "n1-1.pcap", b.bytes());
    let store = store();
    store.insert_file(file_info("n1", 1, path));
    store.insert_session(session("s1", &pos));

    let local = PcapService::new(store.clone(), Config::default());
    let expected = local.decode_and_reassemble("s1", None, None).await.expect("local");

    let mut files = HashMap::new();
    files.insert(FileKey::new("n1", 1), b.bytes().to_vec());
    let source = BlockPacketSource::new(SlowBlocks { files }, 4, 4096);
    let remote = PcapService::with_source(store, Arc::new(source), Config::default());
    let got = remote.decode_and_reassemble("s1", None, None).await.expect("block");

    assert_eq!(got, expected);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].data.len(), 80);
    assert_eq!(&got[0].data[..10], b"aaaaaaaaaa");
    assert_eq!(got[1].data, b"ok");
}

#[tokio::test]
async fn frame_by_frame_view() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let mut pos = vec![-1];
    pos.extend(http_exchange(&mut b));
    let path = write_file(dir.path(), "n1-1.pcap", b.bytes());
    let store = store();
    store.insert_file(file_info("n1", 1, path));
    store.insert_session(session("s1", &pos));
    let service = PcapService::new(store, Config::default());

    let flow = service.packet_flow("s1", None).await.expect("flow");
    assert_eq!(flow.source_key, "10.0.0.1:1234");
    assert_eq!(flow.destination_key.as_deref(), Some("10.0.0.2:80"));
    let view: Vec<(bool, &[u8], u64)> = flow.frames.iter().map(|f| (f.src, &f.data[..], f.ts)).collect();
    assert_eq!(
        view,
        vec![
            (true, &b"GET / HT"[..], 1000),
            (true, &b"TP/1.0\r\n\r\n"[..], 1000),
            (false, &b"HTTP/1.0 200 OK\r\n"[..], 1000),
        ]
    );
    assert!(flow.frames.iter().all(|f| f.tcp_flags.map(|t| t.psh && t.ack) == Some(true)));

    let capped = service.packet_flow("s1", Some(2)).await.expect("flow");
    assert_eq!(capped.frames.len(), 2);
    assert_eq!(capped.destination_key, None);
}

#[tokio::test]
async fn non_ip_session_reassembles_ether_payload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut b = CaptureBuilder::new(Linktype::ETHERNET, false);
    let station = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
    let mut frame = station.to_vec();
    frame.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x88, 0xcc]);
    let mut first = frame.clone();
    first.extend_from_slice(b"lldp-1");
    let mut second = frame;
    second.extend_from_slice(b"lldp-2");
    let pos = vec![-1, b.push(3, 0, &first), b.push(4, 0, &second)];
    let path = write_file(dir.path(), "n1-1.pcap", b.bytes());
    let store = store();
    store.insert_file(file_info("n1", 1, path));
    store.insert_session(session("s1", &pos));
    let service = PcapService::new(store, Config::default());

    let segments = service.decode_and_reassemble("s1", None, None).await.expect("reassemble");
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].key, "001122334455");
    assert_eq!(segments[0].data, b"lldp-1lldp-2");
    assert_eq!(segments[0].ts, Some(3000));
}
