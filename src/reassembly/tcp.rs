use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use super::Segment;
use crate::decode::DecodedPacket;
use crate::session::endpoint_key;
use crate::PcapError;

/// Largest TCP window; a bigger jump in sequence numbers is reported as a gap
const MAX_WINDOW: i64 = 0xffff;

const HALF_SEQ_SPACE: i64 = 0x7fff_ffff;
const SEQ_SPACE: i64 = 1 << 32;

struct TcpData<'a> {
    key: String,
    seq: i64,
    ack: i64,
    data: &'a [u8],
    ts: u64,
}

impl TcpData<'_> {
    /// Sequence number of the last byte carried
    fn last_seq(&self) -> i64 {
        self.seq + self.data.len() as i64 - 1
    }
}

#[derive(Default)]
struct SeqInfo {
    min: i64,
    max: i64,
    wrap_seq: bool,
    wrap_ack: bool,
}

/// Reassemble the TCP packets of one session
///
/// Packets without payload and SYN or RST packets are ignored. Sequence
/// numbers of a side whose span exceeds half the sequence space are treated
/// as wrapped. The packets are then sorted: by sequence number within one
/// side, and across sides by comparing the end of the data sent with the
/// other side's acknowledgment number, which approximates the order of the
/// conversation. At most `max_packets` packets are merged. Data already
/// covered by an earlier packet of the same side is dropped, and a jump
/// larger than a TCP window inserts an empty gap marker.
///
/// The first segment always belongs to `client_key`: an empty one is
/// prepended when the first data seen came from the other side.
pub fn reassemble_tcp(packets: &[DecodedPacket], max_packets: usize, client_key: &str) -> Result<Vec<Segment>, PcapError> {
    let mut info: HashMap<String, SeqInfo> = HashMap::new();
    let mut keys: Vec<String> = Vec::new();
    let mut items: Vec<TcpData> = Vec::new();

    for (i, p) in packets.iter().enumerate() {
        let (Some(ip), Some(tcp)) = (p.ip(), p.tcp()) else {
            return Err(PcapError::Reassembly(format!("packet {} has no tcp header", i)));
        };
        let data = p.bytes(&tcp.payload);
        if data.is_empty() || tcp.rst() || tcp.syn() {
            continue;
        }
        let key = endpoint_key(&ip.addr1, tcp.sport);
        let seq = i64::from(tcp.seq);
        match info.get_mut(&key) {
            Some(inf) => {
                inf.min = inf.min.min(seq);
                inf.max = inf.max.max(seq);
            }
            None => {
                info.insert(
                    key.clone(),
                    SeqInfo {
                        min: seq,
                        max: seq,
                        ..Default::default()
                    },
                );
                keys.push(key.clone());
            }
        }
        items.push(TcpData {
            key,
            seq,
            ack: i64::from(tcp.ack),
            data,
            ts: p.timestamp.as_millis(),
        });
    }

    if items.is_empty() {
        return Ok(Vec::new());
    }

    // one-sided data: the other side's position comes from the first packet's ack
    if keys.len() == 1 {
        let (Some(ip), Some(tcp)) = (packets[0].ip(), packets[0].tcp()) else {
            return Err(PcapError::Reassembly("first packet has no tcp header".to_string()));
        };
        let key = endpoint_key(&ip.addr2, tcp.dport);
        let ack = i64::from(tcp.ack);
        info.entry(key.clone()).or_insert(SeqInfo {
            min: ack,
            max: ack,
            ..Default::default()
        });
        if key != keys[0] {
            keys.push(key);
        }
    }

    let mut needwrap = false;
    for (this, other) in [(0usize, 1usize), (1, 0)] {
        let (Some(this_key), Some(other_key)) = (keys.get(this), keys.get(other)) else {
            continue;
        };
        let spans_half = info.get(this_key).map(|i| i.max - i.min > HALF_SEQ_SPACE).unwrap_or(false);
        if spans_half {
            if let Some(i) = info.get_mut(this_key) {
                i.wrap_seq = true;
            }
            if let Some(i) = info.get_mut(other_key) {
                i.wrap_ack = true;
            }
            needwrap = true;
        }
    }
    if needwrap {
        for item in items.iter_mut() {
            let Some(inf) = info.get(&item.key) else { continue };
            if inf.wrap_seq && item.seq < HALF_SEQ_SPACE {
                item.seq += SEQ_SPACE;
            }
            if inf.wrap_ack && item.ack < HALF_SEQ_SPACE {
                item.ack += SEQ_SPACE;
            }
        }
        debug!("tcp sequence numbers wrapped");
    }

    let first_key = items[0].key.clone();
    let order = merge_sort_indices(items.len(), |a, b| {
        let (a, b) = (&items[a], &items[b]);
        if a.key == b.key {
            a.seq.cmp(&b.seq)
        } else if a.key == first_key {
            a.last_seq().cmp(&b.ack)
        } else {
            a.ack.cmp(&b.last_seq())
        }
    });

    let mut results: Vec<Segment> = Vec::new();
    let mut high_water: HashMap<&str, i64> = HashMap::new();
    let mut start = 0i64;
    let mut previous = 0i64;
    for &idx in order.iter().take(max_packets) {
        let item = &items[idx];
        let end = item.seq + item.data.len() as i64;
        let hw = high_water.entry(item.key.as_str()).or_insert(i64::MIN);
        // pure retransmission
        if *hw >= end {
            continue;
        }
        *hw = end;

        let same_side = results.last().map(|s| s.key == item.key).unwrap_or(false);
        if !same_side || item.seq - previous > MAX_WINDOW {
            if same_side {
                results.push(Segment {
                    key: String::new(),
                    data: Vec::new(),
                    ts: Some(item.ts),
                });
            }
            start = item.seq;
            previous = item.seq;
            results.push(Segment {
                key: item.key.clone(),
                data: item.data.to_vec(),
                ts: Some(item.ts),
            });
            continue;
        }

        previous = item.seq;
        let Some(last) = results.last_mut() else { continue };
        let mut data = item.data;
        let mut offset = item.seq - start;
        if offset < 0 {
            let skip = (-offset).min(data.len() as i64) as usize;
            data = &data[skip..];
            offset = 0;
        }
        let offset = offset as usize;
        if last.data.len() < offset + data.len() {
            last.data.resize(offset + data.len(), 0);
        }
        last.data[offset..offset + data.len()].copy_from_slice(data);
    }

    if results.first().map(|s| s.key != client_key).unwrap_or(false) {
        results.insert(
            0,
            Segment {
                key: client_key.to_string(),
                data: Vec::new(),
                ts: None,
            },
        );
    }
    Ok(results)
}

/// Stable merge sort of `0..len`
///
/// The cross-side comparison is not a total order, so a sort that may panic
/// or loop on inconsistent comparisons cannot be used.
fn merge_sort_indices<F>(len: usize, mut cmp: F) -> Vec<usize>
where
    F: FnMut(usize, usize) -> Ordering,
{
    let mut v: Vec<usize> = (0..len).collect();
    let mut buf = v.clone();
    let mut width = 1;
    while width < len {
        let mut lo = 0;
        while lo < len {
            let mid = (lo + width).min(len);
            let hi = (lo + 2 * width).min(len);
            let (mut i, mut j, mut k) = (lo, mid, lo);
            while i < mid && j < hi {
                if cmp(v[j], v[i]) == Ordering::Less {
                    buf[k] = v[j];
                    j += 1;
                } else {
                    buf[k] = v[i];
                    i += 1;
                }
                k += 1;
            }
            buf[k..k + (mid - i)].copy_from_slice(&v[i..mid]);
            k += mid - i;
            buf[k..k + (hi - j)].copy_from_slice(&v[j..hi]);
            lo = hi;
        }
        std::mem::swap(&mut v, &mut buf);
        width *= 2;
    }
    v
}
