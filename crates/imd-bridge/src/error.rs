// SPDX-License-Identifier: Apache-2.0
//! Bridge error taxonomy.
//!
//! Fatal conditions surface as `Err` from the host hooks; the host is
//! expected to fail all ranks together. Recoverable conditions (a client
//! dropping mid-run) never reach this type: they are logged and the bridge
//! returns to listening.

use thiserror::Error;

/// Errors surfaced to the host through the hook entry points.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An invalid construction argument; raised before the run begins.
    #[error("illegal IMD bridge parameter: {0}")]
    InvalidOption(String),
    /// Setting up the listening socket or the first client failed. Raised
    /// collectively: every rank returns this on the same tick.
    #[error("error in setting up IMD connection")]
    SetupFailed,
    /// The client requested termination (KILL) or the session failed
    /// fatally mid-run. Raised collectively.
    #[error("run terminated on IMD request")]
    Terminated,
    /// An unrecoverable socket error on rank 0.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;
