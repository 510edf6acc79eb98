// SPDX-License-Identifier: Apache-2.0
//! Header framing and payload codecs.
//!
//! Wire layout:
//!
//! ```text
//! Header (8 bytes):
//!   type[4]    = message type, signed, big-endian
//!   length[4]  = type-dependent count, signed, big-endian
//!               (handshake only: *native* order, see below)
//!
//! TIME body (24 bytes, little-endian):
//!   dt[8] f64 || current_time[8] f64 || step[8] u64
//!
//! BOX body (36 bytes, little-endian):
//!   9 f32: box-edge vectors a, b, c row-major, zero upper triangle
//!
//! FCOORDS / VELOCITIES / FORCES body (12 * n bytes):
//!   n f32 triples [x0,y0,z0, x1,y1,z1, ...] in dense index order
//!
//! MDCOMM body (16 * n bytes):
//!   n i32 atom indices (not byte-swapped) || n f32 force triples
//! ```

use bytes::{Buf, BufMut};

use crate::{MsgType, ProtoError};

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 8;

/// Byte length of the TIME block body.
pub const TIME_BODY_LEN: usize = 24;

/// Byte length of the BOX block body.
pub const BOX_BODY_LEN: usize = 36;

/// An 8-byte IMD message header.
///
/// The type field is kept raw so unknown messages survive decoding; use
/// [`Header::msg_type`] to classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw message type value.
    pub type_raw: i32,
    /// Type-dependent length field (an element count, not a byte count).
    pub length: i32,
}

impl Header {
    /// Creates a header for a known message type.
    #[must_use]
    pub fn new(ty: MsgType, length: i32) -> Self {
        Self {
            type_raw: ty.raw(),
            length,
        }
    }

    /// Classifies the raw type field.
    #[must_use]
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_raw(self.type_raw)
    }

    /// Encodes both fields big-endian (the normal path).
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&self.type_raw.to_be_bytes());
        buf[4..].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Encodes the handshake header: type big-endian, length in *native*
    /// byte order carrying the protocol version.
    ///
    /// The client reads the length field raw and compares it against the
    /// versions it knows; whichever byte order makes the value come out as
    /// 2 or 3 is the server's. Swapping this field would defeat the check.
    #[must_use]
    pub fn encode_handshake(version: i32) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&MsgType::Handshake.raw().to_be_bytes());
        buf[4..].copy_from_slice(&version.to_ne_bytes());
        buf
    }

    /// Decodes a header from its 8 wire bytes.
    #[must_use]
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let type_raw = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let length = i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { type_raw, length }
    }

    /// Writes the encoded header into the first 8 bytes of `out`.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than [`HEADER_SIZE`].
    pub fn write_to(&self, out: &mut [u8]) {
        out[..HEADER_SIZE].copy_from_slice(&self.encode());
    }
}

/// Encodes a TIME block body.
///
/// `current_time` is the accumulated simulation time at `step`.
#[must_use]
pub fn encode_time(dt: f64, current_time: f64, step: u64) -> [u8; TIME_BODY_LEN] {
    let mut buf = [0u8; TIME_BODY_LEN];
    buf[..8].copy_from_slice(&dt.to_le_bytes());
    buf[8..16].copy_from_slice(&current_time.to_le_bytes());
    buf[16..].copy_from_slice(&step.to_le_bytes());
    buf
}

/// Encodes a BOX block body from the domain's `h` vector
/// `[xprd, yprd, zprd, yz, xz, xy]`.
///
/// Output is the three box-edge vectors row-major with a zero upper
/// triangle: `a = (h0, 0, 0)`, `b = (h5, h1, 0)`, `c = (h4, h3, h2)`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_box(h: &[f64; 6]) -> [u8; BOX_BODY_LEN] {
    let cells: [f32; 9] = [
        h[0] as f32,
        0.0,
        0.0,
        h[5] as f32,
        h[1] as f32,
        0.0,
        h[4] as f32,
        h[3] as f32,
        h[2] as f32,
    ];
    let mut buf = [0u8; BOX_BODY_LEN];
    for (chunk, cell) in buf.chunks_exact_mut(4).zip(cells) {
        chunk.copy_from_slice(&cell.to_le_bytes());
    }
    buf
}

/// Writes one float triple at dense position `index` of a per-atom block
/// body (the region *after* the block header).
///
/// # Panics
///
/// Panics if `index` is out of range for `body`.
pub fn put_triple(body: &mut [u8], index: usize, xyz: [f32; 3]) {
    let off = index * 12;
    let mut slot = &mut body[off..off + 12];
    slot.put_f32_le(xyz[0]);
    slot.put_f32_le(xyz[1]);
    slot.put_f32_le(xyz[2]);
}

/// Byte length of the index half of an MDCOMM body with `n` records.
#[must_use]
pub fn mdcomm_index_len(n: usize) -> usize {
    n * 4
}

/// Byte length of the force half of an MDCOMM body with `n` records.
#[must_use]
pub fn mdcomm_force_len(n: usize) -> usize {
    n * 12
}

/// Decodes the MDCOMM index list.
///
/// Indices arrive in the client's byte order, which the handshake has
/// already established matches ours; no swap is applied.
pub fn decode_indices(bytes: &[u8], n: usize) -> Result<Vec<i32>, ProtoError> {
    if bytes.len() != mdcomm_index_len(n) {
        return Err(ProtoError::LengthMismatch {
            got: bytes.len(),
            expected: mdcomm_index_len(n),
        });
    }
    let mut buf = bytes;
    Ok((0..n).map(|_| buf.get_i32_ne()).collect())
}

/// Decodes a run of float triples (MDCOMM forces, or frame payloads in a
/// client).
pub fn decode_triples(bytes: &[u8], n: usize) -> Result<Vec<[f32; 3]>, ProtoError> {
    if bytes.len() != mdcomm_force_len(n) {
        return Err(ProtoError::LengthMismatch {
            got: bytes.len(),
            expected: mdcomm_force_len(n),
        });
    }
    let mut buf = bytes;
    Ok((0..n)
        .map(|_| {
            [
                buf.get_f32_le(),
                buf.get_f32_le(),
                buf.get_f32_le(),
            ]
        })
        .collect())
}
