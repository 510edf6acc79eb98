// SPDX-License-Identifier: Apache-2.0
//! Wire schema for the Interactive Molecular Dynamics (IMD) protocol,
//! versions 2 and 3.
//!
//! Every message starts with an 8-byte header: a signed 32-bit message type
//! followed by a signed 32-bit length, both big-endian on the wire. The one
//! deliberate exception is the handshake, whose length field is written in
//! the server's *native* byte order so the client can detect server
//! endianness by comparing the raw value against the known protocol version
//! (see [`wire::Header::encode_handshake`]).
//!
//! Payload bodies (coordinate/velocity/force triples, the TIME and BOX
//! blocks) are little-endian; the server is assumed to run on a
//! little-endian host and never byte-swaps float data.

use thiserror::Error;

pub mod wire;

pub use wire::{Header, HEADER_SIZE};

/// Errors produced while decoding protocol data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    /// A message type outside the known 0..=15 range where a known type was
    /// required (e.g. during the handshake exchange).
    #[error("unknown IMD message type {0}")]
    UnknownType(i32),
    /// A payload whose byte length does not match what its header promised.
    #[error("payload length mismatch: got {got} bytes, expected {expected}")]
    LengthMismatch { got: usize, expected: usize },
}

/// IMD message types.
///
/// Values 0..=9 are the historical v2 protocol; 10..=15 were added in v3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MsgType {
    /// Close the connection, leaving the simulation running.
    Disconnect = 0,
    /// Energy data block (unused by this server; type reserved).
    Energies = 1,
    /// Atom coordinates.
    FCoords = 2,
    /// Client is ready; start streaming.
    Go = 3,
    /// Endianness and version check message.
    Handshake = 4,
    /// Kill the simulation job and shut down.
    Kill = 5,
    /// MDComm-style steering force data.
    MdComm = 6,
    /// Pause the running simulation.
    Pause = 7,
    /// Set the frame transmission rate.
    Trate = 8,
    /// Synthetic type returned when the stream errors out.
    IoError = 9,
    /// Session configuration block (v3).
    SessionInfo = 10,
    /// Resume a paused simulation (v3).
    Resume = 11,
    /// Timestep block (v3).
    Time = 12,
    /// Periodic cell block (v3).
    Box = 13,
    /// Atom velocities (v3).
    Velocities = 14,
    /// Atom forces (v3).
    Forces = 15,
}

impl MsgType {
    /// Maps a raw header type to a known message type.
    ///
    /// Returns `None` for values outside 0..=15 so callers can log-and-ignore
    /// unknown messages instead of failing the session.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => Self::Disconnect,
            1 => Self::Energies,
            2 => Self::FCoords,
            3 => Self::Go,
            4 => Self::Handshake,
            5 => Self::Kill,
            6 => Self::MdComm,
            7 => Self::Pause,
            8 => Self::Trate,
            9 => Self::IoError,
            10 => Self::SessionInfo,
            11 => Self::Resume,
            12 => Self::Time,
            13 => Self::Box,
            14 => Self::Velocities,
            15 => Self::Forces,
            _ => return None,
        })
    }

    /// The raw wire value of this type.
    #[inline]
    #[must_use]
    pub fn raw(self) -> i32 {
        self as i32
    }
}

/// The seven per-session booleans negotiated at handshake time.
///
/// Under v3 the server echoes this block to the client right after the
/// handshake header so the client knows which sub-blocks every frame will
/// carry. Under v2 the block never goes on the wire but the same struct
/// still drives frame layout on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// Frames carry a TIME block.
    pub time: bool,
    /// Frames carry a BOX block.
    pub box_: bool,
    /// Frames carry coordinates.
    pub coords: bool,
    /// Coordinates are wrapped into the periodic cell (false = unwrapped).
    pub wrap: bool,
    /// Frames carry velocities.
    pub velocities: bool,
    /// Frames carry forces.
    pub forces: bool,
    /// Frames carry an energy block (never set by this server).
    pub energies: bool,
}

/// Byte length of the encoded [`SessionInfo`] body.
pub const SESSION_INFO_LEN: usize = 7;

impl SessionInfo {
    /// The fixed v2 session: coordinates only.
    #[must_use]
    pub fn v2(unwrap: bool) -> Self {
        Self {
            time: false,
            box_: false,
            coords: true,
            wrap: !unwrap,
            velocities: false,
            forces: false,
            energies: false,
        }
    }

    /// A v3 session with the given block selection.
    #[must_use]
    pub fn v3(time: bool, box_: bool, coords: bool, unwrap: bool, velocities: bool, forces: bool) -> Self {
        Self {
            time,
            box_,
            coords,
            wrap: !unwrap,
            velocities,
            forces,
            energies: false,
        }
    }

    /// Encodes the block body: one byte per boolean, in wire order
    /// `{time, box, coords, wrap, velocities, forces, energies}`.
    #[must_use]
    pub fn encode_body(&self) -> [u8; SESSION_INFO_LEN] {
        [
            u8::from(self.time),
            u8::from(self.box_),
            u8::from(self.coords),
            u8::from(self.wrap),
            u8::from(self.velocities),
            u8::from(self.forces),
            u8::from(self.energies),
        ]
    }

    /// Number of per-atom sub-blocks (coords, velocities, forces) enabled.
    #[must_use]
    pub fn atom_block_count(&self) -> usize {
        usize::from(self.coords) + usize::from(self.velocities) + usize::from(self.forces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_roundtrip() {
        for raw in 0..16 {
            let ty = MsgType::from_raw(raw).expect("0..=15 are all known types");
            assert_eq!(ty.raw(), raw);
        }
        assert_eq!(MsgType::from_raw(16), None);
        assert_eq!(MsgType::from_raw(-1), None);
    }

    #[test]
    fn session_info_body_order() {
        let info = SessionInfo {
            time: true,
            box_: false,
            coords: true,
            wrap: false,
            velocities: true,
            forces: false,
            energies: false,
        };
        assert_eq!(info.encode_body(), [1, 0, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn v2_session_is_coords_only() {
        let info = SessionInfo::v2(false);
        assert_eq!(info.encode_body(), [0, 0, 1, 1, 0, 0, 0]);
        assert_eq!(info.atom_block_count(), 1);

        // unwrap on clears the wrap flag
        assert!(!SessionInfo::v2(true).wrap);
    }
}
