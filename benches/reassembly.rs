use criterion::{criterion_group, criterion_main, Criterion};
use pcap_session::decode::{decode, DecodedPacket};
use pcap_session::pcap::PacketRecord;
use pcap_session::reassembly::reassemble_tcp;
use pcap_session::Linktype;

fn tcp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let mut f = vec![0x45, 0];
    f.extend_from_slice(&((40 + payload.len()) as u16).to_be_bytes());
    f.extend_from_slice(&[0, 0, 0, 0, 64, 6, 0, 0]);
    f.extend_from_slice(&src);
    f.extend_from_slice(&dst);
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&dport.to_be_bytes());
    f.extend_from_slice(&seq.to_be_bytes());
    f.extend_from_slice(&ack.to_be_bytes());
    f.extend_from_slice(&[0x50, 0x18, 0xff, 0xff, 0, 0, 0, 0]);
    f.extend_from_slice(payload);
    f
}

/// Request/response exchange with some retransmissions and reordering
fn conversation(rounds: u32) -> Vec<DecodedPacket> {
    let (c, s) = ([10, 0, 0, 1], [10, 0, 0, 2]);
    let payload = [0x61u8; 512];
    let mut out = Vec::new();
    let (mut cseq, mut sseq) = (1000u32, 90_000u32);
    for i in 0..rounds {
        let req = tcp(c, s, 40000, 80, cseq, sseq, &payload[..200]);
        out.push(decode(PacketRecord::new(i, 0, &req), Linktype::RAW, false));
        if i % 7 == 0 {
            out.push(decode(PacketRecord::new(i, 1, &req), Linktype::RAW, false));
        }
        cseq += 200;
        let a = tcp(s, c, 80, 40000, sseq, cseq, &payload);
        let b = tcp(s, c, 80, 40000, sseq + 512, cseq, &payload);
        if i % 5 == 0 {
            out.push(decode(PacketRecord::new(i, 3, &b), Linktype::RAW, false));
            out.push(decode(PacketRecord::new(i, 2, &a), Linktype::RAW, false));
        } else {
            out.push(decode(PacketRecord::new(i, 2, &a), Linktype::RAW, false));
            out.push(decode(PacketRecord::new(i, 3, &b), Linktype::RAW, false));
        }
        sseq += 1024;
    }
    out
}

fn bench_reassemble_tcp(c: &mut Criterion) {
    let packets = conversation(500);
    c.bench_function("reassemble_tcp 500 rounds", |b| {
        b.iter(|| reassemble_tcp(&packets, packets.len(), "10.0.0.1:40000"))
    });
}

criterion_group!(benches, bench_reassemble_tcp);
criterion_main!(benches);
