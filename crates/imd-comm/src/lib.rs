// SPDX-License-Identifier: Apache-2.0
//! Process-group communication seam for the bridge's collectives.
//!
//! The bridge runs SPMD: one process ("rank") per particle subset, rank 0
//! doubling as the network endpoint. All cross-rank traffic goes through
//! [`Communicator`], which models the MPI subset the bridge needs:
//! non-blocking point-to-point sends/receives with waitable handles, a
//! broadcast, and a max-reduction.
//!
//! Two transports ship here: [`SoloComm`] for single-rank runs and
//! [`ThreadWorld`]/[`ThreadComm`], a mailbox transport that runs a whole
//! rank group inside one process on threads. An MPI-backed implementation
//! can slot in behind the same trait without touching the bridge.
//!
//! Wire conventions for higher layers: records are fixed-width
//! little-endian; receivers post a maximum length and the delivered message
//! reports its true length, so variable-count buffers need no separate size
//! exchange.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

/// Anything that can be waited on for completion.
pub trait Wait {
    /// Blocks until the operation completes. Receives return the delivered
    /// bytes; sends return `None`.
    fn wait(self) -> Option<Vec<u8>>;
}

/// Rank-addressed message passing plus the collectives the bridge uses.
///
/// Collectives are synchronization points: every rank must call them in the
/// same order with matching roots.
pub trait Communicator: Send + Sync {
    /// Handle returned by [`isend`](Self::isend).
    type SendHandle: Wait;
    /// Handle returned by [`irecv`](Self::irecv).
    type RecvHandle: Wait;

    /// Starts a non-blocking send of `buf` to `peer`.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;

    /// Posts a non-blocking receive from `peer` of at most `max_len` bytes.
    fn irecv(&self, peer: usize, tag: u16, max_len: usize) -> Self::RecvHandle;

    /// Rank of this process, in `0..size`.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn size(&self) -> usize;

    /// Broadcasts `buf` from `root` to every rank.
    fn broadcast(&self, root: usize, buf: &mut [u8]) {
        if self.size() <= 1 {
            return;
        }
        if self.rank() == root {
            let sends: Vec<_> = (0..self.size())
                .filter(|&peer| peer != root)
                .map(|peer| self.isend(peer, TAG_BROADCAST, buf))
                .collect();
            for send in sends {
                let _ = send.wait();
            }
        } else if let Some(data) = self.irecv(root, TAG_BROADCAST, buf.len()).wait() {
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
        }
    }

    /// Max-reduction over one `u64` per rank; every rank gets the result.
    fn allreduce_max(&self, value: u64) -> u64 {
        if self.size() <= 1 {
            return value;
        }
        let mut result = value;
        if self.rank() == 0 {
            let recvs: Vec<_> = (1..self.size())
                .map(|peer| self.irecv(peer, TAG_REDUCE, 8))
                .collect();
            for recv in recvs {
                if let Some(data) = recv.wait() {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&data[..8]);
                    result = result.max(u64::from_le_bytes(raw));
                }
            }
        } else {
            let _ = self.isend(0, TAG_REDUCE, &value.to_le_bytes()).wait();
        }
        let mut out = result.to_le_bytes();
        self.broadcast(0, &mut out);
        u64::from_le_bytes(out)
    }
}

const TAG_BROADCAST: u16 = u16::MAX - 1;
const TAG_REDUCE: u16 = u16::MAX - 2;

/// Completed-at-issue handle used by [`SoloComm`].
impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Single-rank communicator: rank 0 of a world of one.
///
/// Point-to-point operations are unreachable in a world of one; they are
/// no-ops rather than panics so generic code needs no special casing.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoloComm;

impl Communicator for SoloComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _max_len: usize) {}

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }
}

// --- In-process multi-rank transport -------------------------------------

type Key = (usize, usize, u16); // (src, dst, tag)
type Cell = Arc<(Mutex<VecDeque<Vec<u8>>>, Condvar)>;

#[derive(Default)]
struct Mailbox {
    cells: Mutex<HashMap<Key, Cell>>,
}

impl Mailbox {
    fn cell(&self, key: Key) -> Cell {
        let mut cells = self.cells.lock().expect("mailbox poisoned");
        cells.entry(key).or_default().clone()
    }
}

/// A rank group living inside one process.
///
/// Each rank runs on its own thread and talks through a shared mailbox, so
/// collective call sequences can be exercised without an MPI launcher.
pub struct ThreadWorld;

impl ThreadWorld {
    /// Creates communicators for a world of `size` ranks.
    #[must_use]
    pub fn new(size: usize) -> Vec<ThreadComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| ThreadComm {
                mailbox: Arc::clone(&mailbox),
                rank,
                size,
            })
            .collect()
    }
}

/// One rank's endpoint of a [`ThreadWorld`].
#[derive(Clone)]
pub struct ThreadComm {
    mailbox: Arc<Mailbox>,
    rank: usize,
    size: usize,
}

/// Send side completes at enqueue time.
pub struct ThreadSendHandle;

impl Wait for ThreadSendHandle {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Blocks on the mailbox cell until a matching message arrives.
pub struct ThreadRecvHandle {
    cell: Cell,
    max_len: usize,
}

impl Wait for ThreadRecvHandle {
    fn wait(self) -> Option<Vec<u8>> {
        let (queue, cond) = &*self.cell;
        let mut q = queue.lock().expect("mailbox cell poisoned");
        while q.is_empty() {
            q = cond.wait(q).expect("mailbox cell poisoned");
        }
        let mut msg = q.pop_front().expect("queue checked non-empty");
        msg.truncate(self.max_len.min(msg.len()));
        Some(msg)
    }
}

impl Communicator for ThreadComm {
    type SendHandle = ThreadSendHandle;
    type RecvHandle = ThreadRecvHandle;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> ThreadSendHandle {
        let cell = self.mailbox.cell((self.rank, peer, tag));
        let (queue, cond) = &*cell;
        queue
            .lock()
            .expect("mailbox cell poisoned")
            .push_back(buf.to_vec());
        cond.notify_all();
        ThreadSendHandle
    }

    fn irecv(&self, peer: usize, tag: u16, max_len: usize) -> ThreadRecvHandle {
        ThreadRecvHandle {
            cell: self.mailbox.cell((peer, self.rank, tag)),
            max_len,
        }
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}
