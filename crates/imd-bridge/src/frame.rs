// SPDX-License-Identifier: Apache-2.0
//! Outbound frame assembly.
//!
//! One buffer is allocated at construction to the worst-case frame size for
//! the negotiated session and never reallocated. Each emission rewrites the
//! enabled block headers in fixed order (TIME, BOX, coordinates,
//! velocities, forces), then scatters per-atom triples into the dense
//! regions at `12 * index` offsets. Disabled blocks occupy no bytes.

use imd_proto::wire::{
    self, encode_box, encode_time, Header, BOX_BODY_LEN, HEADER_SIZE, TIME_BODY_LEN,
};
use imd_proto::{MsgType, SessionInfo};

use crate::host::{DomainBox, StepClock};

/// Byte offsets of the enabled blocks within the frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    time: Option<usize>,
    box_: Option<usize>,
    coords: Option<usize>,
    velocities: Option<usize>,
    forces: Option<usize>,
    len: usize,
}

impl FrameLayout {
    /// Computes block offsets for a session over `num_coords` atoms.
    #[must_use]
    pub fn new(info: &SessionInfo, num_coords: usize) -> Self {
        let atom_block = HEADER_SIZE + 12 * num_coords;
        let mut off = 0;
        let mut claim = |enabled: bool, size: usize| {
            if enabled {
                let at = off;
                off += size;
                Some(at)
            } else {
                None
            }
        };
        let time = claim(info.time, HEADER_SIZE + TIME_BODY_LEN);
        let box_ = claim(info.box_, HEADER_SIZE + BOX_BODY_LEN);
        let coords = claim(info.coords, atom_block);
        let velocities = claim(info.velocities, atom_block);
        let forces = claim(info.forces, atom_block);
        Self {
            time,
            box_,
            coords,
            velocities,
            forces,
            len: off,
        }
    }

    /// Total frame size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no block is enabled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The single pre-sized outbound message buffer.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    layout: FrameLayout,
    num_coords: usize,
}

impl FrameBuffer {
    /// Allocates the buffer for `info` over `num_coords` atoms.
    #[must_use]
    pub fn new(info: SessionInfo, num_coords: usize) -> Self {
        let layout = FrameLayout::new(&info, num_coords);
        Self {
            data: vec![0; layout.len()],
            layout,
            num_coords,
        }
    }

    /// Frame size in bytes; equals the sum of the enabled block sizes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layout.len()
    }

    /// True when the session enables no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    /// Writes every enabled block header plus the TIME and BOX bodies.
    ///
    /// Per-atom regions keep their previous contents until scattered into;
    /// every index in `0..num_coords` is filled by the gather before the
    /// frame is shipped.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn begin(&mut self, clock: &StepClock, domain: &DomainBox) {
        let n = self.num_coords as i32;
        if let Some(off) = self.layout.time {
            Header::new(MsgType::Time, 1).write_to(&mut self.data[off..]);
            self.data[off + HEADER_SIZE..off + HEADER_SIZE + TIME_BODY_LEN].copy_from_slice(
                &encode_time(clock.dt, clock.current_time(), clock.ntimestep),
            );
        }
        if let Some(off) = self.layout.box_ {
            Header::new(MsgType::Box, 1).write_to(&mut self.data[off..]);
            self.data[off + HEADER_SIZE..off + HEADER_SIZE + BOX_BODY_LEN]
                .copy_from_slice(&encode_box(&domain.h()));
        }
        if let Some(off) = self.layout.coords {
            Header::new(MsgType::FCoords, n).write_to(&mut self.data[off..]);
        }
        if let Some(off) = self.layout.velocities {
            Header::new(MsgType::Velocities, n).write_to(&mut self.data[off..]);
        }
        if let Some(off) = self.layout.forces {
            Header::new(MsgType::Forces, n).write_to(&mut self.data[off..]);
        }
    }

    fn put(&mut self, block: Option<usize>, index: usize, xyz: [f32; 3]) {
        debug_assert!(index < self.num_coords);
        if let Some(off) = block {
            let body = &mut self.data[off + HEADER_SIZE..off + HEADER_SIZE + 12 * self.num_coords];
            wire::put_triple(body, index, xyz);
        }
    }

    /// Scatters one coordinate triple at dense position `index`.
    pub fn put_coord(&mut self, index: usize, xyz: [f32; 3]) {
        self.put(self.layout.coords, index, xyz);
    }

    /// Scatters one velocity triple.
    pub fn put_velocity(&mut self, index: usize, xyz: [f32; 3]) {
        self.put(self.layout.velocities, index, xyz);
    }

    /// Scatters one force triple.
    pub fn put_force(&mut self, index: usize, xyz: [f32; 3]) {
        self.put(self.layout.forces, index, xyz);
    }

    /// The assembled frame bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// A copy of the frame for handoff to the writer thread.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }
}
