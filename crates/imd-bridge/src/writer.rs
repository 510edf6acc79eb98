// SPDX-License-Identifier: Apache-2.0
//! Asynchronous frame writer.
//!
//! One worker thread on rank 0 ships assembled frames so the MD step never
//! waits on the network. The handoff is a single slot guarded by a mutex
//! and condvar: the producer blocks only while a previous frame is still
//! unclaimed; the consumer gates each send on an instantaneous `selwrite`
//! probe and drops the frame when the client is not ready to take it.
//! There is no queue: a stalled client costs frames, never memory.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::socket::Stream;

enum Slot {
    Idle,
    Ready { frame: Vec<u8>, stream: Stream },
    Shutdown,
}

struct Shared {
    slot: Mutex<Slot>,
    cond: Condvar,
}

/// Handle to the rank-0 writer thread.
///
/// Dropping the handle signals shutdown and joins the worker; a frame still
/// in the slot at that point is discarded.
pub struct FrameWriter {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl FrameWriter {
    /// Spawns the writer thread.
    pub fn spawn() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Idle),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("imd-io".into())
            .spawn(move || run(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Hands one assembled frame and a duplicated client endpoint to the
    /// worker. Blocks while the previous frame is still unclaimed.
    pub fn submit(&self, frame: Vec<u8>, stream: Stream) {
        let mut slot = self.shared.slot.lock().expect("writer slot poisoned");
        loop {
            match &*slot {
                Slot::Idle => break,
                Slot::Shutdown => return,
                Slot::Ready { .. } => {
                    slot = self.shared.cond.wait(slot).expect("writer slot poisoned");
                }
            }
        }
        *slot = Slot::Ready { frame, stream };
        self.shared.cond.notify_all();
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.slot.lock().expect("writer slot poisoned");
            *slot = Slot::Shutdown;
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("IMD I/O worker exited abnormally");
            }
        }
    }
}

fn run(shared: &Shared) {
    let mut slot = shared.slot.lock().expect("writer slot poisoned");
    loop {
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Idle => {
                slot = shared.cond.wait(slot).expect("writer slot poisoned");
            }
            Slot::Shutdown => {
                debug!("IMD I/O worker exiting");
                return;
            }
            Slot::Ready { frame, stream } => {
                shared.cond.notify_all();
                drop(slot);
                ship(&frame, &stream);
                slot = shared.slot.lock().expect("writer slot poisoned");
            }
        }
    }
}

/// Sends one frame if the client can take it right now; drops it otherwise.
fn ship(frame: &[u8], stream: &Stream) {
    match stream.selwrite(0) {
        Ok(true) => {
            if let Err(err) = stream.write_all(frame) {
                warn!("IMD frame send failed: {err}");
            }
        }
        Ok(false) => debug!("IMD client not ready, dropping frame"),
        Err(err) => warn!("IMD write-readiness probe failed: {err}"),
    }
}
