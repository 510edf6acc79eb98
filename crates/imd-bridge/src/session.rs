// SPDX-License-Identifier: Apache-2.0
//! Connection lifecycle and the per-tick message drain.
//!
//! Only rank 0 owns a `Session`. The lifecycle: listen, accept (blocking
//! with a 60-second retry window, or a zero-timeout poll under `nowait`),
//! handshake, wait for GO, then drain pending client messages every host
//! tick. A disconnect returns the session to listening; a kill or a failed
//! handshake is fatal and reported to the caller for collective
//! propagation.
//!
//! Pausing is held *inside* the drain: while paused the drain keeps
//! blocking on client readiness instead of returning, so the host's
//! integrator cannot advance until the client releases it.

use std::io;

use tracing::{info, warn};

use imd_proto::wire::{Header, HEADER_SIZE};
use imd_proto::{MsgType, SessionInfo, SESSION_INFO_LEN};

use crate::gather::Record;
use crate::socket::{Listener, Stream};

/// Outcome of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connect {
    /// A client is attached and has sent GO.
    Connected,
    /// No client; the simulation continues without one.
    Inactive,
    /// Accept or handshake failed; the run must terminate.
    Failed,
}

/// What one drain pass observed.
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// The client requested termination, or a reconnect failed fatally.
    pub kill: bool,
    /// The client went away with no replacement attached.
    pub inactive: bool,
    /// Wholesale replacement for the steering force buffer; an empty vec
    /// clears it.
    pub forces: Option<Vec<Record>>,
}

enum Step {
    /// Nothing pending.
    Quiet,
    /// One complete header read.
    Message(Header),
    /// The stream failed mid-read.
    Broken(String),
}

/// Rank 0's network endpoint state.
pub struct Session {
    listener: Listener,
    client: Option<Stream>,
    connect_msg: bool,
    version: u8,
    sinfo: SessionInfo,
    nowait: bool,
}

impl Session {
    /// Opens the listening socket.
    pub fn open(port: u16, version: u8, sinfo: SessionInfo, nowait: bool) -> io::Result<Self> {
        Ok(Self {
            listener: Listener::bind(port)?,
            client: None,
            connect_msg: true,
            version,
            sinfo,
            nowait,
        })
    }

    /// The bound port.
    pub fn local_port(&self) -> io::Result<u16> {
        self.listener.local_port()
    }

    /// The attached client, if any.
    #[must_use]
    pub fn client(&self) -> Option<&Stream> {
        self.client.as_ref()
    }

    /// Re-arms the connection banner for the next attempt.
    pub fn mark_reconnect(&mut self) {
        self.connect_msg = true;
    }

    /// (Re-)connects a client: accept, handshake, GO.
    ///
    /// Returns immediately when a client is already attached. Under
    /// `nowait` a missing connection yields [`Connect::Inactive`];
    /// otherwise the accept blocks, retrying in 60-second windows.
    pub fn reconnect(&mut self, trate: u64) -> Connect {
        if self.client.is_some() {
            return Connect::Connected;
        }
        let port = self.local_port().unwrap_or(0);
        if self.connect_msg {
            if self.nowait {
                info!("Listening for IMD connection on port {port}. Transfer rate {trate}.");
            } else {
                info!("Waiting for IMD connection on port {port}. Transfer rate {trate}.");
            }
        }
        self.connect_msg = false;

        if self.nowait {
            if !matches!(self.listener.selread(0), Ok(true)) {
                return Connect::Inactive;
            }
        } else {
            loop {
                if matches!(self.listener.selread(60), Ok(true)) {
                    break;
                }
            }
        }

        let stream = match self.listener.accept() {
            Ok(stream) => stream,
            Err(err) => {
                warn!("IMD socket accept error ({err}). Dropping connection.");
                return Connect::Failed;
            }
        };
        if self.handshake(&stream).is_err() {
            warn!("IMD handshake error. Dropping connection.");
            return Connect::Failed;
        }
        if !self.await_go(&stream) {
            warn!("Incompatible IMD client version? Dropping connection.");
            return Connect::Failed;
        }
        self.client = Some(stream);
        Connect::Connected
    }

    /// Sends the version header (length in native order) and, under v3, the
    /// session-info block.
    fn handshake(&self, stream: &Stream) -> io::Result<()> {
        stream.write_all(&Header::encode_handshake(i32::from(self.version)))?;
        if self.version == 3 {
            stream.write_all(&Header::new(MsgType::SessionInfo, SESSION_INFO_LEN as i32).encode())?;
            stream.write_all(&self.sinfo.encode_body())?;
        }
        Ok(())
    }

    /// Waits up to one second for the client's GO.
    fn await_go(&self, stream: &Stream) -> bool {
        if !matches!(stream.selread(1), Ok(true)) {
            return false;
        }
        matches!(read_header(stream), Ok(header) if header.msg_type() == Some(MsgType::Go))
    }

    /// Processes every pending client message.
    ///
    /// `trate` is updated in place on a TRATE message; steering forces are
    /// reported through the outcome for broadcast by the caller. The drain
    /// does not return while the session is paused.
    pub fn drain(&mut self, trate: &mut u64, rev_idmap: &[i64]) -> DrainOutcome {
        let mut out = DrainOutcome::default();
        let mut paused = false;

        loop {
            if self.client.is_none() {
                break;
            }
            let header = match self.poll_message(paused) {
                Step::Quiet => {
                    if paused {
                        continue;
                    }
                    break;
                }
                Step::Broken(why) => {
                    warn!("IMD connection lost ({why}). Run continues.");
                    paused = false;
                    self.detach(&mut out, *trate);
                    continue;
                }
                Step::Message(header) => header,
            };

            match (header.msg_type(), self.version) {
                (Some(MsgType::Disconnect), _) => {
                    info!("IMD client detached. Run continues.");
                    paused = false;
                    self.detach(&mut out, *trate);
                }
                (Some(MsgType::Kill), _) => {
                    info!("IMD client requested termination of run.");
                    paused = false;
                    out.kill = true;
                    out.inactive = true;
                    self.client = None;
                }
                (Some(MsgType::Pause), 2) => {
                    if paused {
                        info!("Continuing run on IMD client request.");
                        paused = false;
                    } else {
                        info!("Pausing run on IMD client request.");
                        paused = true;
                    }
                }
                (Some(MsgType::Pause), _) => {
                    // v3 pause is idempotent
                    if !paused {
                        info!("Pausing run on IMD client request.");
                        paused = true;
                    }
                }
                (Some(MsgType::Resume), 3) => {
                    // v3 resume is idempotent
                    if paused {
                        info!("Continuing run on IMD client request.");
                        paused = false;
                    }
                }
                (Some(MsgType::Trate), _) => {
                    if header.length > 0 {
                        *trate = header.length as u64;
                    }
                    info!(
                        "IMD client requested change of transfer rate. Now it is {}.",
                        *trate
                    );
                }
                (Some(MsgType::MdComm), _) => match self.read_mdcomm(header.length) {
                    Ok(records) => {
                        out.forces = Some(map_steering(&records, rev_idmap));
                    }
                    Err(err) => {
                        warn!("IMD connection lost ({err}). Run continues.");
                        paused = false;
                        self.detach(&mut out, *trate);
                    }
                },
                _ => {
                    warn!(
                        "Unhandled incoming IMD message #{}, length={}.",
                        header.type_raw, header.length
                    );
                }
            }
        }
        out
    }

    /// Checks readiness and reads one header. While paused the probe blocks
    /// for up to a second so the pause does not spin.
    fn poll_message(&self, paused: bool) -> Step {
        let Some(client) = &self.client else {
            return Step::Quiet;
        };
        match client.selread(if paused { 1 } else { 0 }) {
            Ok(false) => Step::Quiet,
            Ok(true) => match read_header(client) {
                Ok(header) => Step::Message(header),
                Err(err) => Step::Broken(err.to_string()),
            },
            Err(err) => Step::Broken(err.to_string()),
        }
    }

    /// Drops the client, clears pending steering forces, and immediately
    /// tries to attach a replacement.
    fn detach(&mut self, out: &mut DrainOutcome, trate: u64) {
        out.forces = Some(Vec::new());
        self.client = None;
        self.connect_msg = true;
        match self.reconnect(trate) {
            Connect::Connected => {}
            Connect::Inactive => out.inactive = true,
            Connect::Failed => {
                out.kill = true;
                out.inactive = true;
            }
        }
    }

    /// Reads one MDComm payload: `n` client indices then `n` force triples.
    fn read_mdcomm(&self, length: i32) -> io::Result<Vec<(i32, [f32; 3])>> {
        let Some(client) = &self.client else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no client"));
        };
        let n = usize::try_from(length)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative MDComm length"))?;

        let mut index_bytes = vec![0u8; imd_proto::wire::mdcomm_index_len(n)];
        client.read_exact(&mut index_bytes)?;
        let mut force_bytes = vec![0u8; imd_proto::wire::mdcomm_force_len(n)];
        client.read_exact(&mut force_bytes)?;

        let indices =
            imd_proto::wire::decode_indices(&index_bytes, n).map_err(io::Error::other)?;
        let forces = imd_proto::wire::decode_triples(&force_bytes, n).map_err(io::Error::other)?;
        Ok(indices.into_iter().zip(forces).collect())
    }
}

/// Translates client indices into tagged force records, skipping indices
/// outside the reporting group.
fn map_steering(pairs: &[(i32, [f32; 3])], rev_idmap: &[i64]) -> Vec<Record> {
    let mut records = Vec::with_capacity(pairs.len());
    for &(index, val) in pairs {
        match usize::try_from(index).ok().and_then(|i| rev_idmap.get(i)) {
            Some(&tag) => records.push(Record { tag, val }),
            None => warn!("IMD steering index {index} out of range, ignored."),
        }
    }
    records
}

/// Reads one 8-byte header.
fn read_header(stream: &Stream) -> io::Result<Header> {
    let mut buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut buf)?;
    Ok(Header::decode(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steering_map_translates_and_bounds_checks() {
        let rev = vec![3i64, 7, 10];
        let records = map_steering(
            &[(0, [1.0, 2.0, 3.0]), (2, [4.0, 5.0, 6.0]), (7, [0.0; 3]), (-1, [0.0; 3])],
            &rev,
        );
        assert_eq!(records.len(), 2, "out-of-range indices are dropped");
        assert_eq!(records[0].tag, 3);
        assert_eq!(records[1].tag, 10);
    }
}
