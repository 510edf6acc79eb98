// SPDX-License-Identifier: Apache-2.0
//! Bridge options and the host-script argument surface.
//!
//! Options arrive as a required port followed by keyword/value pairs, with
//! booleans spelled `on`/`off` (also `yes`/`no`, `true`/`false`, `1`/`0`).
//! Validation happens here, before the run begins; a violation is an
//! argument error, never a mid-run surprise.

use imd_proto::SessionInfo;

use crate::error::{BridgeError, Result};

/// Configuration of one bridge instance.
///
/// Constructing the struct directly (e.g. from a test) bypasses the
/// argument-layer port check; `port` 0 then means "pick an ephemeral port".
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeOptions {
    /// TCP port to listen on. The argument layer requires ≥ 1024.
    pub port: u16,
    /// Protocol version to negotiate, 2 or 3.
    pub version: u8,
    /// Unwrap coordinates through image flags before emission.
    pub unwrap: bool,
    /// Do not block waiting for the first client.
    pub nowait: bool,
    /// Multiplier applied to every received steering force.
    pub fscale: f64,
    /// Emit one frame every `trate` steps.
    pub trate: u64,
    /// Ship frames from a dedicated writer thread on rank 0.
    pub async_io: bool,
    /// Include the TIME block (v3).
    pub time: bool,
    /// Include the BOX block (v3).
    pub box_: bool,
    /// Include coordinates (v3; v2 always sends them).
    pub coordinates: bool,
    /// Include velocities (v3).
    pub velocities: bool,
    /// Include forces (v3).
    pub forces: bool,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            port: 0,
            version: 2,
            unwrap: false,
            nowait: false,
            fscale: 1.0,
            trate: 1,
            async_io: false,
            time: true,
            box_: true,
            coordinates: true,
            velocities: true,
            forces: true,
        }
    }
}

impl BridgeOptions {
    /// Parses the host-script argument list: `<port> [keyword value]...`.
    pub fn from_args(args: &[&str]) -> Result<Self> {
        let Some((port_arg, rest)) = args.split_first() else {
            return Err(BridgeError::InvalidOption("missing port".into()));
        };
        let port: u32 = port_arg
            .parse()
            .map_err(|_| BridgeError::InvalidOption(format!("bad port '{port_arg}'")))?;
        if !(1024..=u32::from(u16::MAX)).contains(&port) {
            return Err(BridgeError::InvalidOption(format!(
                "port {port} out of range (1024..=65535)"
            )));
        }

        let mut opts = Self {
            port: port as u16,
            ..Self::default()
        };

        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            let (key, value) = (pair[0], pair[1]);
            match key {
                "unwrap" => opts.unwrap = parse_logical(value)?,
                "nowait" => opts.nowait = parse_logical(value)?,
                "async" => opts.async_io = parse_logical(value)?,
                "fscale" => {
                    opts.fscale = value
                        .parse()
                        .map_err(|_| BridgeError::InvalidOption(format!("bad fscale '{value}'")))?;
                }
                "trate" => {
                    opts.trate = value
                        .parse()
                        .map_err(|_| BridgeError::InvalidOption(format!("bad trate '{value}'")))?;
                }
                "version" => {
                    opts.version = value
                        .parse()
                        .map_err(|_| BridgeError::InvalidOption(format!("bad version '{value}'")))?;
                }
                "time" => opts.time = parse_logical(value)?,
                "box" => opts.box_ = parse_logical(value)?,
                "coordinates" => opts.coordinates = parse_logical(value)?,
                "velocities" => opts.velocities = parse_logical(value)?,
                "forces" => opts.forces = parse_logical(value)?,
                other => {
                    return Err(BridgeError::InvalidOption(format!(
                        "unknown keyword '{other}'"
                    )))
                }
            }
        }
        if !pairs.remainder().is_empty() {
            return Err(BridgeError::InvalidOption(format!(
                "keyword '{}' is missing a value",
                pairs.remainder()[0]
            )));
        }

        opts.validate()?;
        Ok(opts)
    }

    /// Checks the cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.trate < 1 {
            return Err(BridgeError::InvalidOption("trate < 1".into()));
        }
        if self.version != 2 && self.version != 3 {
            return Err(BridgeError::InvalidOption(format!(
                "version {} (must be 2 or 3)",
                self.version
            )));
        }
        Ok(())
    }

    /// The session block selection this configuration produces.
    ///
    /// Under v2 only coordinates go on the wire regardless of the block
    /// flags; under v3 the flags select the blocks.
    #[must_use]
    pub fn session_info(&self) -> SessionInfo {
        if self.version == 2 {
            SessionInfo::v2(self.unwrap)
        } else {
            SessionInfo::v3(
                self.time,
                self.box_,
                self.coordinates,
                self.unwrap,
                self.velocities,
                self.forces,
            )
        }
    }
}

/// Parses an `on`/`off`-style boolean.
fn parse_logical(value: &str) -> Result<bool> {
    match value {
        "on" | "yes" | "true" | "1" => Ok(true),
        "off" | "no" | "false" | "0" => Ok(false),
        other => Err(BridgeError::InvalidOption(format!(
            "expected on/off, got '{other}'"
        ))),
    }
}
