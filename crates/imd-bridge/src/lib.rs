// SPDX-License-Identifier: Apache-2.0
//! Interactive MD bridge: stream a running simulation to a viewer client
//! and steer it by force injection.
//!
//! The bridge embeds in a parallel MD host. Rank 0 serves one TCP client
//! speaking the IMD protocol (v2 or v3); all ranks cooperate through an
//! [`imd_comm::Communicator`] to gather per-particle data into dense,
//! tag-ordered frames and to distribute steering forces.
//!
//! The host drives three hooks on [`ImdBridge`]: `setup` once at run start,
//! `post_force` every step after force computation, and `end_of_step` after
//! integration. See the module docs for the individual pieces: wire
//! handling lives in `imd-proto`, connection state in [`session`], frame
//! assembly in [`frame`], the cross-rank exchange in [`gather`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod frame;
pub mod gather;
pub mod host;
pub mod session;
pub mod socket;
pub mod steer;
pub mod tagmap;
pub mod writer;

pub use bridge::ImdBridge;
pub use config::BridgeOptions;
pub use error::{BridgeError, Result};
pub use host::{DomainBox, ImageFlags, StepClock, SystemView};
