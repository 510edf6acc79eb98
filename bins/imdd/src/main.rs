// SPDX-License-Identifier: Apache-2.0
//! imdd: a toy MD daemon wrapping the IMD bridge.
//!
//! Runs a small harmonic-lattice "simulation" and serves it over the IMD
//! protocol so a molecular viewer (or netcat) can watch and steer it. One
//! rank only; the point is to exercise the whole bridge path end to end:
//! options, setup, handshake, frames, steering.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use imd_bridge::{BridgeOptions, DomainBox, ImageFlags, ImdBridge, StepClock, SystemView};
use imd_comm::SoloComm;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// TCP port for the IMD listener
    #[clap(short, long, default_value_t = 5678)]
    port: u16,

    /// Protocol version to negotiate (2 or 3)
    #[clap(long, default_value_t = 3)]
    version: u8,

    /// Frame transmission period in MD steps
    #[clap(long, default_value_t = 10)]
    trate: u64,

    /// Particles per lattice edge (total is the cube)
    #[clap(short = 'n', long, default_value_t = 4)]
    edge: usize,

    /// Wall-clock milliseconds per MD step
    #[clap(long, default_value_t = 20)]
    step_ms: u64,

    /// Steps to run (0 = until killed)
    #[clap(long, default_value_t = 0)]
    steps: u64,

    /// Do not wait for a viewer before starting
    #[clap(long)]
    nowait: bool,

    /// Ship frames from a dedicated writer thread
    #[clap(long = "async")]
    async_io: bool,

    /// Multiplier for received steering forces
    #[clap(long, default_value_t = 1.0)]
    fscale: f64,
}

/// Particles tethered to lattice sites by harmonic springs.
struct Lattice {
    tags: Vec<i64>,
    mask: Vec<u32>,
    sites: Vec<[f64; 3]>,
    x: Vec<[f64; 3]>,
    v: Vec<[f64; 3]>,
    f: Vec<[f64; 3]>,
    image: Vec<ImageFlags>,
    domain: DomainBox,
}

const SPACING: f64 = 3.0;
const SPRING_K: f64 = 5.0;
const DT: f64 = 0.01;

impl Lattice {
    fn new(edge: usize) -> Self {
        let mut tags = Vec::new();
        let mut sites = Vec::new();
        for ix in 0..edge {
            for iy in 0..edge {
                for iz in 0..edge {
                    tags.push(tags.len() as i64 + 1);
                    sites.push([
                        (ix as f64 + 0.5) * SPACING,
                        (iy as f64 + 0.5) * SPACING,
                        (iz as f64 + 0.5) * SPACING,
                    ]);
                }
            }
        }
        let n = tags.len();
        let side = edge as f64 * SPACING;
        // start slightly off-site so there is visible motion
        let x: Vec<[f64; 3]> = sites
            .iter()
            .enumerate()
            .map(|(i, s)| [s[0] + 0.3 * ((i % 3) as f64 - 1.0), s[1], s[2]])
            .collect();
        Self {
            tags,
            mask: vec![1; n],
            sites,
            x,
            v: vec![[0.0; 3]; n],
            f: vec![[0.0; 3]; n],
            image: vec![ImageFlags::default(); n],
            domain: DomainBox::orthogonal(side, side, side),
        }
    }

    fn len(&self) -> usize {
        self.tags.len()
    }

    /// Zeroes forces and accumulates the spring pull toward each site.
    fn compute_forces(&mut self) {
        for i in 0..self.len() {
            for d in 0..3 {
                self.f[i][d] = -SPRING_K * (self.x[i][d] - self.sites[i][d]);
            }
        }
    }

    /// Euler half-kick integration; accurate enough for a demo.
    fn integrate(&mut self) {
        for i in 0..self.len() {
            for d in 0..3 {
                self.v[i][d] += self.f[i][d] * DT;
                self.x[i][d] += self.v[i][d] * DT;
            }
        }
    }

    fn view(&mut self) -> SystemView<'_> {
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

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut lattice = Lattice::new(args.edge);
    info!(
        "imdd: {} particles, IMD v{} on port {}, trate {}",
        lattice.len(),
        args.version,
        args.port,
        args.trate
    );

    let opts = BridgeOptions {
        port: args.port,
        version: args.version,
        trate: args.trate,
        nowait: args.nowait,
        async_io: args.async_io,
        fscale: args.fscale,
        ..BridgeOptions::default()
    };
    opts.validate()?;

    let mut bridge = ImdBridge::new(opts, SoloComm, 1, lattice.len() as u64)?;
    bridge.setup(&lattice.view())?;
    info!("simulation running");

    let mut step: u64 = 0;
    loop {
        step += 1;
        let clock = StepClock {
            dt: DT,
            atime: 0.0,
            atimestep: 0,
            ntimestep: step,
        };

        lattice.compute_forces();
        if let Err(err) = bridge.post_force(&mut lattice.view(), &clock) {
            error!("bridge stopped the run: {err}");
            return Err(err.into());
        }
        lattice.integrate();
        if let Err(err) = bridge.end_of_step(&lattice.view(), &clock) {
            error!("bridge stopped the run: {err}");
            return Err(err.into());
        }

        if args.steps != 0 && step >= args.steps {
            info!("completed {step} steps");
            return Ok(());
        }
        std::thread::sleep(std::time::Duration::from_millis(args.step_ms));
    }
}
