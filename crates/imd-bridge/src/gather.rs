// SPDX-License-Identifier: Apache-2.0
//! Cross-rank record exchange.
//!
//! Per-atom data moves between ranks as fixed-width 20-byte records: the
//! atom tag plus one float triple. Rank 0 drives every exchange with a
//! token-then-receive pattern: it posts its receives first, then sends a
//! zero-byte "ready" token so the sender can push its packed buffer without
//! an intermediate copy. Ranks are drained strictly in rank order, so the
//! exchange needs no per-message bookkeeping beyond the block tag.

use bytes::{Buf, BufMut};

use imd_comm::{Communicator, Wait};

/// Comm tag of the zero-byte ready token.
const TAG_TOKEN: u16 = 1;
/// Comm tag of the setup tag-list exchange.
const TAG_SETUP: u16 = 2;
/// Base comm tag of per-frame block payloads.
const TAG_BLOCK_BASE: u16 = 3;

/// One particle's contribution to an exchange: its tag plus a triple
/// (position, velocity, force, or a steering force).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    /// Global particle tag.
    pub tag: i64,
    /// The triple, meaning depends on the block.
    pub val: [f32; 3],
}

impl Record {
    /// Encoded size: i64 tag + three f32.
    pub const SIZE: usize = 20;

    /// Appends the little-endian encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.put_i64_le(self.tag);
        out.put_f32_le(self.val[0]);
        out.put_f32_le(self.val[1]);
        out.put_f32_le(self.val[2]);
    }
}

/// Encodes a record run into one contiguous buffer.
#[must_use]
pub fn encode_records(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * Record::SIZE);
    for rec in records {
        rec.encode_into(&mut out);
    }
    out
}

/// Decodes every whole record in `bytes`; a trailing partial record is
/// ignored, matching the byte-count division on the receive side.
#[must_use]
pub fn decode_records(bytes: &[u8]) -> Vec<Record> {
    bytes
        .chunks_exact(Record::SIZE)
        .map(|chunk| {
            let mut buf = chunk;
            Record {
                tag: buf.get_i64_le(),
                val: [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()],
            }
        })
        .collect()
}

/// Collects every rank's in-group tags onto rank 0.
///
/// Returns `Some(all_tags)` on rank 0 (its own tags first, then each remote
/// rank's in rank order) and `None` elsewhere. `maxbuf` is the posted
/// receive size in bytes, `max-over-ranks(nme) * Record::SIZE`.
pub fn collect_tags<C: Communicator>(
    comm: &C,
    local_tags: &[i64],
    maxbuf: usize,
) -> Option<Vec<i64>> {
    if comm.rank() == 0 {
        let mut all = local_tags.to_vec();
        for peer in 1..comm.size() {
            let recv = comm.irecv(peer, TAG_SETUP, maxbuf);
            let _ = comm.isend(peer, TAG_TOKEN, &[]).wait();
            if let Some(data) = recv.wait() {
                all.extend(decode_records(&data).iter().map(|r| r.tag));
            }
        }
        Some(all)
    } else {
        let records: Vec<Record> = local_tags
            .iter()
            .map(|&tag| Record {
                tag,
                val: [0.0; 3],
            })
            .collect();
        let _ = comm.irecv(0, TAG_TOKEN, 0).wait();
        let _ = comm.isend(0, TAG_SETUP, &encode_records(&records)).wait();
        None
    }
}

/// Rank-0 side of one rank's per-frame exchange: posts `nblocks` receives,
/// releases the token, and returns the block payloads in block order.
pub fn gather_rank_blocks<C: Communicator>(
    comm: &C,
    peer: usize,
    nblocks: usize,
    maxbuf: usize,
) -> Vec<Vec<u8>> {
    let recvs: Vec<_> = (0..nblocks)
        .map(|b| comm.irecv(peer, TAG_BLOCK_BASE + b as u16, maxbuf))
        .collect();
    let _ = comm.isend(peer, TAG_TOKEN, &[]).wait();
    recvs
        .into_iter()
        .map(|recv| recv.wait().unwrap_or_default())
        .collect()
}

/// Non-root side of the per-frame exchange: blocks on the token, then sends
/// each packed block.
pub fn send_rank_blocks<C: Communicator>(comm: &C, blocks: &[Vec<u8>]) {
    let _ = comm.irecv(0, TAG_TOKEN, 0).wait();
    for (b, block) in blocks.iter().enumerate() {
        let _ = comm.isend(0, TAG_BLOCK_BASE + b as u16, block).wait();
    }
}

/// Rank-0 control state distributed to every rank each `post_force`.
///
/// Bundles the four per-step broadcast values into one fixed-width message;
/// the force record buffer follows in a second broadcast when `nforces` is
/// positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ctrl {
    /// Current transmission rate.
    pub trate: u64,
    /// Number of pending steering force records.
    pub nforces: u32,
    /// No client is attached.
    pub inactive: bool,
    /// Fatal: the run must stop on this tick.
    pub terminate: bool,
}

impl Ctrl {
    /// Encoded size.
    pub const SIZE: usize = 14;

    /// Fixed-width little-endian encoding.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.trate.to_le_bytes());
        buf[8..12].copy_from_slice(&self.nforces.to_le_bytes());
        buf[12] = u8::from(self.inactive);
        buf[13] = u8::from(self.terminate);
        buf
    }

    /// Inverse of [`encode`](Self::encode).
    #[must_use]
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            trate: u64::from_le_bytes(buf[..8].try_into().expect("8 bytes")),
            nforces: u32::from_le_bytes(buf[8..12].try_into().expect("4 bytes")),
            inactive: buf[12] != 0,
            terminate: buf[13] != 0,
        }
    }

    /// Broadcasts rank 0's control state; every rank returns the same value.
    #[must_use]
    pub fn exchange<C: Communicator>(self, comm: &C) -> Self {
        let mut buf = self.encode();
        comm.broadcast(0, &mut buf);
        Self::decode(&buf)
    }
}

/// Broadcasts the steering force records from rank 0.
///
/// `nforces` must come from an already-exchanged [`Ctrl`]; non-root ranks
/// size their receive buffer from it.
pub fn broadcast_forces<C: Communicator>(
    comm: &C,
    nforces: usize,
    records: &mut Vec<Record>,
) {
    if nforces == 0 {
        return;
    }
    let mut buf = if comm.rank() == 0 {
        encode_records(records)
    } else {
        vec![0u8; nforces * Record::SIZE]
    };
    comm.broadcast(0, &mut buf);
    if comm.rank() != 0 {
        *records = decode_records(&buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imd_comm::{SoloComm, ThreadWorld};
    use std::thread;

    #[test]
    fn records_roundtrip() {
        let records = vec![
            Record {
                tag: 42,
                val: [1.0, -2.0, 3.5],
            },
            Record {
                tag: -7,
                val: [0.0, 0.25, -8.0],
            },
        ];
        let bytes = encode_records(&records);
        assert_eq!(bytes.len(), 2 * Record::SIZE);
        assert_eq!(decode_records(&bytes), records);
    }

    #[test]
    fn ctrl_roundtrip() {
        let ctrl = Ctrl {
            trate: 10,
            nforces: 3,
            inactive: true,
            terminate: false,
        };
        assert_eq!(Ctrl::decode(&ctrl.encode()), ctrl);
    }

    #[test]
    fn solo_collect_returns_local_tags() {
        let tags = vec![10, 3, 7];
        let all = collect_tags(&SoloComm, &tags, 0).expect("rank 0 gets the list");
        assert_eq!(all, tags);
    }

    #[test]
    fn multi_rank_collect_orders_by_rank() {
        let comms = ThreadWorld::new(3);
        let mut handles = Vec::new();
        for (rank, comm) in comms.into_iter().enumerate() {
            handles.push(thread::spawn(move || {
                let local: Vec<i64> = match rank {
                    0 => vec![5, 1],
                    1 => vec![9],
                    _ => vec![2, 8],
                };
                collect_tags(&comm, &local, 3 * Record::SIZE)
            }));
        }
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect();
        assert_eq!(results[0], Some(vec![5, 1, 9, 2, 8]));
        assert_eq!(results[1], None);
        assert_eq!(results[2], None);
    }

    #[test]
    fn block_exchange_keeps_block_order() {
        let comms = ThreadWorld::new(2);
        let root = comms[0].clone();
        let worker = comms[1].clone();

        let sender = thread::spawn(move || {
            let blocks = vec![
                encode_records(&[Record {
                    tag: 1,
                    val: [1.0; 3],
                }]),
                encode_records(&[Record {
                    tag: 2,
                    val: [2.0; 3],
                }]),
            ];
            send_rank_blocks(&worker, &blocks);
        });

        let blocks = gather_rank_blocks(&root, 1, 2, 4 * Record::SIZE);
        sender.join().expect("sender panicked");

        assert_eq!(decode_records(&blocks[0])[0].tag, 1);
        assert_eq!(decode_records(&blocks[1])[0].tag, 2);
    }

    #[test]
    fn force_broadcast_reaches_all_ranks() {
        let comms = ThreadWorld::new(2);
        let mut handles = Vec::new();
        for (rank, comm) in comms.into_iter().enumerate() {
            handles.push(thread::spawn(move || {
                let mut records = if rank == 0 {
                    vec![Record {
                        tag: 3,
                        val: [1.0, 2.0, 4.0],
                    }]
                } else {
                    Vec::new()
                };
                let ctrl = Ctrl {
                    trate: 1,
                    nforces: if rank == 0 { records.len() as u32 } else { 0 },
                    inactive: false,
                    terminate: false,
                }
                .exchange(&comm);
                broadcast_forces(&comm, ctrl.nforces as usize, &mut records);
                records
            }));
        }
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1][0].tag, 3);
    }
}
