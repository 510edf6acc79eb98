// SPDX-License-Identifier: Apache-2.0
//! Shared fixtures: an in-memory particle system and a scripted IMD client.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use imd_bridge::{DomainBox, ImageFlags, StepClock, SystemView};
use imd_proto::wire::{Header, HEADER_SIZE};
use imd_proto::MsgType;

/// A step clock anchored at time zero.
pub fn clock(step: u64) -> StepClock {
    StepClock {
        dt: 1.0,
        atime: 0.0,
        atimestep: 0,
        ntimestep: step,
    }
}

/// Owned particle arrays standing in for the host integrator.
pub struct TestSystem {
    pub tags: Vec<i64>,
    pub mask: Vec<u32>,
    pub x: Vec<[f64; 3]>,
    pub v: Vec<[f64; 3]>,
    pub f: Vec<[f64; 3]>,
    pub image: Vec<ImageFlags>,
    pub domain: DomainBox,
}

impl TestSystem {
    /// A system with every particle in group bit 1 and zeroed dynamics.
    pub fn new(tags: &[i64], x: &[[f64; 3]]) -> Self {
        assert_eq!(tags.len(), x.len());
        let n = tags.len();
        Self {
            tags: tags.to_vec(),
            mask: vec![1; n],
            x: x.to_vec(),
            v: vec![[0.0; 3]; n],
            f: vec![[0.0; 3]; n],
            image: vec![ImageFlags::default(); n],
            domain: DomainBox::orthogonal(100.0, 100.0, 100.0),
        }
    }

    pub fn view(&mut self) -> SystemView<'_> {
        SystemView {
            tags: &self.tags,
            mask: &self.mask,
            x: &self.x,
            v: &self.v,
            f: &mut self.f,
            image: &self.image,
            domain: &self.domain,
        }
    }
}

/// A scripted viewer client driving the bridge over loopback TCP.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("client connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("read timeout");
        Self { stream }
    }

    /// Reads the handshake header and asserts the advertised version.
    ///
    /// The length field is in the server's native order; reading it back
    /// with native endianness must yield the version.
    pub fn expect_handshake(&mut self, version: i32) {
        let raw = self.read_bytes(HEADER_SIZE);
        let ty = i32::from_be_bytes(raw[..4].try_into().unwrap());
        assert_eq!(ty, MsgType::Handshake.raw(), "first message is the handshake");
        let advertised = i32::from_ne_bytes(raw[4..].try_into().unwrap());
        assert_eq!(advertised, version, "native-order version check");
    }

    /// Reads the v3 session-info block and returns its seven booleans.
    pub fn expect_session_info(&mut self) -> [u8; 7] {
        let header = self.read_header();
        assert_eq!(header.msg_type(), Some(MsgType::SessionInfo));
        assert_eq!(header.length, 7);
        let body = self.read_bytes(7);
        body.try_into().unwrap()
    }

    pub fn send_go(&mut self) {
        self.send_msg(MsgType::Go, 0);
    }

    pub fn send_msg(&mut self, ty: MsgType, length: i32) {
        self.stream
            .write_all(&Header::new(ty, length).encode())
            .expect("client send");
    }

    /// Sends an MDComm steering message.
    pub fn send_mdcomm(&mut self, indices: &[i32], forces: &[[f32; 3]]) {
        assert_eq!(indices.len(), forces.len());
        self.send_msg(MsgType::MdComm, indices.len() as i32);
        let mut body = Vec::new();
        for &i in indices {
            body.extend_from_slice(&i.to_ne_bytes());
        }
        for f in forces {
            for c in f {
                body.extend_from_slice(&c.to_le_bytes());
            }
        }
        self.stream.write_all(&body).expect("mdcomm body");
    }

    pub fn read_header(&mut self) -> Header {
        let raw = self.read_bytes(HEADER_SIZE);
        Header::decode(&raw.try_into().unwrap())
    }

    pub fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).expect("client read");
        buf
    }

    /// Reads one per-atom block, asserting its type and count.
    pub fn read_atom_block(&mut self, ty: MsgType, n: usize) -> Vec<[f32; 3]> {
        let header = self.read_header();
        assert_eq!(header.msg_type(), Some(ty));
        assert_eq!(header.length, n as i32);
        let body = self.read_bytes(12 * n);
        imd_proto::wire::decode_triples(&body, n).expect("block body")
    }

    /// True when no server byte arrives within `wait`.
    pub fn is_quiet(&mut self, wait: Duration) -> bool {
        self.stream.set_read_timeout(Some(wait)).expect("timeout");
        let mut one = [0u8; 1];
        let quiet = match self.stream.peek(&mut one) {
            Ok(0) => false, // EOF is not quiet: the server hung up
            Ok(_) => false,
            Err(err) => {
                err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut
            }
        };
        self.stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("timeout");
        quiet
    }

    /// Reads and discards server data until EOF or a read timeout.
    pub fn drain_until_eof(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
