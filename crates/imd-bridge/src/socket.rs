// SPDX-License-Identifier: Apache-2.0
//! Thin stream-socket endpoint with bounded readiness probes.
//!
//! The session layer never blocks on a bare `read` or `accept` without first
//! probing readiness through `selread`/`selwrite`, which poll the descriptor
//! with a whole-second timeout (0 = poll and return immediately). `EINTR` is
//! retried transparently at both the probe and the transfer level (`std`'s
//! `read_exact`/`write_all` already loop on `Interrupted`).

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// Polls `fd` for the given event set, retrying on `EINTR`.
///
/// Returns `true` when the descriptor is ready before the timeout elapses.
fn poll_fd(fd: RawFd, events: libc::c_short, seconds: u32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = i32::try_from(u64::from(seconds) * 1000).unwrap_or(i32::MAX);
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Ok(rc > 0);
    }
}

/// The listening endpoint, held by rank 0 for the lifetime of the bridge.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Binds and listens on all interfaces at `port` (0 = ephemeral).
    pub fn bind(port: u16) -> io::Result<Self> {
        let inner = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        Ok(Self { inner })
    }

    /// The bound port; differs from the requested one only for port 0.
    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.inner.local_addr()?.port())
    }

    /// Probes accept readiness for up to `seconds` (0 = poll).
    pub fn selread(&self, seconds: u32) -> io::Result<bool> {
        poll_fd(self.inner.as_raw_fd(), libc::POLLIN, seconds)
    }

    /// Accepts one pending connection.
    pub fn accept(&self) -> io::Result<Stream> {
        let (stream, _addr) = self.inner.accept()?;
        Ok(Stream { inner: stream })
    }
}

/// A connected client endpoint.
#[derive(Debug)]
pub struct Stream {
    inner: TcpStream,
}

impl Stream {
    /// Probes read readiness for up to `seconds` (0 = poll).
    pub fn selread(&self, seconds: u32) -> io::Result<bool> {
        poll_fd(self.inner.as_raw_fd(), libc::POLLIN, seconds)
    }

    /// Probes write readiness for up to `seconds` (0 = poll).
    pub fn selwrite(&self, seconds: u32) -> io::Result<bool> {
        poll_fd(self.inner.as_raw_fd(), libc::POLLOUT, seconds)
    }

    /// Reads exactly `buf.len()` bytes. EOF mid-message surfaces as
    /// `UnexpectedEof`, which the session treats as a stream error.
    pub fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        (&self.inner).read_exact(buf)
    }

    /// Writes the whole buffer.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.inner).write_all(buf)
    }

    /// Duplicates the endpoint for the async writer thread.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
        })
    }

    /// Completes pending sends and sends FIN.
    pub fn shutdown_write(&self) {
        let _ = self.inner.shutdown(Shutdown::Write);
    }
}
