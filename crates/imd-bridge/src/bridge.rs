// SPDX-License-Identifier: Apache-2.0
//! The bridge proper: host hooks and per-step orchestration.
//!
//! Rank 0 talks to the client; every other rank only packs its particle
//! subset and participates in the collectives. All rank-0 decisions that
//! the group must agree on (transfer rate, inactivity, termination, the
//! steering force count) travel in one control broadcast per `post_force`,
//! so the ranks stay in lockstep at well-defined synchronization points.
//!
//! Hook map: `setup` builds the tag index and attaches the first client;
//! `post_force` drains client input and applies steering; `end_of_step`
//! emits frames (v3; v2 emits from its combined `post_force` path).

use tracing::{info, warn};

use imd_comm::Communicator;
use imd_proto::SessionInfo;

use crate::config::BridgeOptions;
use crate::error::{BridgeError, Result};
use crate::frame::FrameBuffer;
use crate::gather::{
    broadcast_forces, collect_tags, decode_records, encode_records, gather_rank_blocks,
    send_rank_blocks, Ctrl, Record,
};
use crate::host::{StepClock, SystemView};
use crate::session::{Connect, Session};
use crate::steer::apply_steering;
use crate::tagmap::{id_sort, TagIndex};
use crate::writer::FrameWriter;

/// Per-atom sub-blocks in their fixed frame order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Coords,
    Velocities,
    Forces,
}

/// One IMD bridge instance embedded in the host integrator.
pub struct ImdBridge<C: Communicator> {
    comm: C,
    opts: BridgeOptions,
    sinfo: SessionInfo,
    groupbit: u32,
    num_coords: usize,
    trate: u64,
    inactive: bool,
    session: Option<Session>,
    idmap: TagIndex,
    rev_idmap: Vec<i64>,
    recv_forces: Vec<Record>,
    frame: FrameBuffer,
    maxbuf: usize,
    writer: Option<FrameWriter>,
}

impl<C: Communicator> ImdBridge<C> {
    /// Creates the bridge: validates arguments, sizes the outbound buffer,
    /// and opens the listening socket on rank 0.
    ///
    /// `group_count` is the host's count of particles in the reporting
    /// group across all ranks; it is fixed for the bridge's lifetime.
    pub fn new(opts: BridgeOptions, comm: C, groupbit: u32, group_count: u64) -> Result<Self> {
        opts.validate()?;
        if group_count > i32::MAX as u64 {
            return Err(BridgeError::InvalidOption(
                "too many atoms in reporting group".into(),
            ));
        }
        let num_coords = group_count as usize;
        let sinfo = opts.session_info();
        let frame = FrameBuffer::new(sinfo, num_coords);

        let mut session = None;
        let mut bind_failed = false;
        if comm.rank() == 0 {
            match Session::open(opts.port, opts.version, sinfo, opts.nowait) {
                Ok(s) => session = Some(s),
                Err(err) => {
                    warn!("IMD bind to port {} failed: {err}", opts.port);
                    bind_failed = true;
                }
            }
        }
        let mut flag = [u8::from(bind_failed)];
        comm.broadcast(0, &mut flag);
        if flag[0] != 0 {
            return Err(BridgeError::SetupFailed);
        }

        let writer = if opts.async_io && comm.rank() == 0 {
            info!("Using IMD bridge with asynchronous I/O.");
            Some(FrameWriter::spawn()?)
        } else {
            None
        };

        Ok(Self {
            trate: opts.trate,
            inactive: false,
            session,
            idmap: TagIndex::with_capacity(0),
            rev_idmap: Vec::new(),
            recv_forces: Vec::new(),
            frame,
            maxbuf: 0,
            writer,
            comm,
            opts,
            sinfo,
            groupbit,
            num_coords,
        })
    }

    /// Builds the tag index, attaches the first client, and performs the
    /// handshake. Called once at host simulation setup.
    pub fn setup(&mut self, view: &SystemView<'_>) -> Result<()> {
        let local_tags = self.local_tags(view);
        let nmax = self.comm.allreduce_max(local_tags.len() as u64) as usize;
        self.maxbuf = nmax * Record::SIZE;

        let mut inactive = false;
        let mut terminate = false;
        if let Some(session) = &mut self.session {
            session.mark_reconnect();
            match session.reconnect(self.trate) {
                Connect::Connected => {}
                Connect::Inactive => inactive = true,
                Connect::Failed => terminate = true,
            }
        }
        let ctrl = Ctrl {
            trate: self.trate,
            nforces: 0,
            inactive,
            terminate,
        }
        .exchange(&self.comm);
        self.inactive = ctrl.inactive;
        if ctrl.terminate {
            return Err(BridgeError::SetupFailed);
        }

        if let Some(mut taglist) = collect_tags(&self.comm, &local_tags, self.maxbuf) {
            if taglist.len() != self.num_coords {
                return Err(BridgeError::InvalidOption(format!(
                    "reporting group changed: expected {} tags, gathered {}",
                    self.num_coords,
                    taglist.len()
                )));
            }
            id_sort(&mut taglist);
            let mut idmap = TagIndex::with_capacity(self.num_coords);
            for (i, &tag) in taglist.iter().enumerate() {
                idmap.insert(tag, i as i64);
            }
            self.rev_idmap = idmap.keys();
            self.idmap = idmap;
        }
        Ok(())
    }

    /// Per-step hook, invoked after the host computed potential forces and
    /// before integration.
    ///
    /// v2 runs the combined drain / steer / emit path; v3 only drains
    /// client input and applies steering (emission happens in
    /// [`end_of_step`](Self::end_of_step)).
    pub fn post_force(&mut self, view: &mut SystemView<'_>, clock: &StepClock) -> Result<()> {
        if self.inactive && !self.try_reactivate()? {
            return Ok(());
        }
        if self.opts.version == 2 {
            self.step_v2(view, clock)
        } else {
            self.client_input_v3(view)
        }
    }

    /// RESPA gate: the bridge runs only on the outermost sub-step.
    pub fn post_force_respa(
        &mut self,
        view: &mut SystemView<'_>,
        clock: &StepClock,
        ilevel: usize,
        nlevels: usize,
    ) -> Result<()> {
        if ilevel + 1 == nlevels {
            self.post_force(view, clock)
        } else {
            Ok(())
        }
    }

    /// End-of-step hook: under v3, emits a frame every `trate` steps.
    pub fn end_of_step(&mut self, view: &SystemView<'_>, clock: &StepClock) -> Result<()> {
        if self.opts.version == 3 && clock.ntimestep % self.trate == 0 {
            self.emit_frame(view, clock)?;
        }
        Ok(())
    }

    /// The bound port on rank 0 (useful when constructed with port 0).
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.session.as_ref().and_then(|s| s.local_port().ok())
    }

    /// Current transfer rate (identical on every rank after `post_force`).
    #[must_use]
    pub fn trate(&self) -> u64 {
        self.trate
    }

    /// True while no client is attached.
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        self.inactive
    }

    /// Number of steering force records currently pending re-application.
    #[must_use]
    pub fn pending_forces(&self) -> usize {
        self.recv_forces.len()
    }

    /// Approximate bytes owned by the bridge.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.frame.len()
            + self.maxbuf
            + self.recv_forces.len() * Record::SIZE
            + self.rev_idmap.len() * std::mem::size_of::<i64>()
    }

    /// Tags of this rank's in-group particles, in local order.
    fn local_tags(&self, view: &SystemView<'_>) -> Vec<i64> {
        (0..view.nlocal())
            .filter(|&i| view.in_group(i, self.groupbit))
            .map(|i| view.tags[i])
            .collect()
    }

    /// Reconnect attempt while inactive. Returns whether a client is now
    /// attached (collectively agreed).
    fn try_reactivate(&mut self) -> Result<bool> {
        let mut inactive = false;
        let mut terminate = false;
        if let Some(session) = &mut self.session {
            match session.reconnect(self.trate) {
                Connect::Connected => {}
                Connect::Inactive => inactive = true,
                Connect::Failed => terminate = true,
            }
        }
        let ctrl = Ctrl {
            trate: self.trate,
            nforces: 0,
            inactive,
            terminate,
        }
        .exchange(&self.comm);
        if ctrl.terminate {
            return Err(BridgeError::SetupFailed);
        }
        self.inactive = ctrl.inactive;
        Ok(!self.inactive)
    }

    /// Drains client messages on rank 0, then synchronizes control state
    /// and steering forces across the rank group.
    fn drain_and_sync(&mut self) -> Result<()> {
        let mut inactive = self.inactive;
        let mut terminate = false;
        if let Some(session) = &mut self.session {
            let out = session.drain(&mut self.trate, &self.rev_idmap);
            if let Some(forces) = out.forces {
                self.recv_forces = forces;
            }
            terminate = out.kill;
            inactive = inactive || out.inactive;
        }

        let ctrl = Ctrl {
            trate: self.trate,
            nforces: self.recv_forces.len() as u32,
            inactive,
            terminate,
        }
        .exchange(&self.comm);
        self.trate = ctrl.trate;
        self.inactive = ctrl.inactive;
        if ctrl.terminate {
            return Err(BridgeError::Terminated);
        }

        if ctrl.nforces == 0 {
            self.recv_forces.clear();
        } else {
            broadcast_forces(&self.comm, ctrl.nforces as usize, &mut self.recv_forces);
        }
        Ok(())
    }

    /// v2 combined path: drain, then either steer (off-rate steps) or emit.
    fn step_v2(&mut self, view: &mut SystemView<'_>, clock: &StepClock) -> Result<()> {
        self.drain_and_sync()?;
        if clock.ntimestep % self.trate != 0 {
            if !self.recv_forces.is_empty() {
                apply_steering(&self.recv_forces, self.opts.fscale, self.groupbit, view);
            }
            return Ok(());
        }
        self.emit_frame(view, clock)
    }

    /// v3 input path: drain, then steer every step.
    fn client_input_v3(&mut self, view: &mut SystemView<'_>) -> Result<()> {
        self.drain_and_sync()?;
        if !self.recv_forces.is_empty() {
            apply_steering(&self.recv_forces, self.opts.fscale, self.groupbit, view);
        }
        Ok(())
    }

    /// The per-atom blocks this session carries, in frame order.
    fn enabled_blocks(&self) -> Vec<BlockKind> {
        let mut kinds = Vec::with_capacity(3);
        if self.sinfo.coords {
            kinds.push(BlockKind::Coords);
        }
        if self.sinfo.velocities {
            kinds.push(BlockKind::Velocities);
        }
        if self.sinfo.forces {
            kinds.push(BlockKind::Forces);
        }
        kinds
    }

    /// One particle's triple for a block, with coordinate unwrapping
    /// applied when the session reports unbounded positions.
    fn block_value(&self, view: &SystemView<'_>, kind: BlockKind, i: usize) -> [f32; 3] {
        match kind {
            BlockKind::Coords => {
                if self.sinfo.wrap {
                    to_f32(view.x[i])
                } else {
                    to_f32(view.domain.unwrap(view.x[i], view.image[i]))
                }
            }
            BlockKind::Velocities => to_f32(view.v[i]),
            BlockKind::Forces => to_f32(view.f[i]),
        }
    }

    /// Assembles one frame from every rank's particle data and ships it.
    ///
    /// Collective: all ranks must call this on the same step. The send is
    /// skipped (frame dropped) when no client is attached or the client is
    /// not ready to receive.
    fn emit_frame(&mut self, view: &SystemView<'_>, clock: &StepClock) -> Result<()> {
        let nme = view.count_group(self.groupbit);
        let nmax = self.comm.allreduce_max(nme as u64) as usize;
        self.maxbuf = self.maxbuf.max(nmax * Record::SIZE);

        let kinds = self.enabled_blocks();
        if self.comm.rank() == 0 {
            self.frame.begin(clock, view.domain);

            // local contributions, scattered by dense index
            for i in 0..view.nlocal() {
                if !view.in_group(i, self.groupbit) {
                    continue;
                }
                let Some(index) = self.idmap.lookup(view.tags[i]) else {
                    continue;
                };
                let index = index as usize;
                for &kind in &kinds {
                    let val = self.block_value(view, kind, i);
                    self.put_block(kind, index, val);
                }
            }

            // remote contributions, one rank at a time
            for peer in 1..self.comm.size() {
                let blocks = gather_rank_blocks(&self.comm, peer, kinds.len(), self.maxbuf);
                for (&kind, bytes) in kinds.iter().zip(&blocks) {
                    for rec in decode_records(bytes) {
                        if let Some(index) = self.idmap.lookup(rec.tag) {
                            self.put_block(kind, index as usize, rec.val);
                        }
                    }
                }
            }

            self.ship_frame();
        } else {
            let blocks: Vec<Vec<u8>> = kinds
                .iter()
                .map(|&kind| {
                    let records: Vec<Record> = (0..view.nlocal())
                        .filter(|&i| view.in_group(i, self.groupbit))
                        .map(|i| Record {
                            tag: view.tags[i],
                            val: self.block_value(view, kind, i),
                        })
                        .collect();
                    encode_records(&records)
                })
                .collect();
            send_rank_blocks(&self.comm, &blocks);
        }
        Ok(())
    }

    fn put_block(&mut self, kind: BlockKind, index: usize, val: [f32; 3]) {
        match kind {
            BlockKind::Coords => self.frame.put_coord(index, val),
            BlockKind::Velocities => self.frame.put_velocity(index, val),
            BlockKind::Forces => self.frame.put_force(index, val),
        }
    }

    /// Hands the assembled frame to the writer thread, or sends it inline
    /// gated on instantaneous write readiness.
    fn ship_frame(&self) {
        let Some(client) = self.session.as_ref().and_then(Session::client) else {
            return;
        };
        if let Some(writer) = &self.writer {
            match client.try_clone() {
                Ok(endpoint) => writer.submit(self.frame.to_vec(), endpoint),
                Err(err) => warn!("IMD could not hand frame to I/O worker: {err}"),
            }
            return;
        }
        match client.selwrite(0) {
            Ok(true) => {
                if let Err(err) = client.write_all(self.frame.bytes()) {
                    warn!("IMD frame send failed: {err}");
                }
            }
            Ok(false) => {}
            Err(err) => warn!("IMD write-readiness probe failed: {err}"),
        }
    }
}

impl<C: Communicator> Drop for ImdBridge<C> {
    fn drop(&mut self) {
        // stop the writer before tearing down the socket it may still hold
        self.writer.take();
        if let Some(client) = self.session.as_ref().and_then(Session::client) {
            client.shutdown_write();
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_f32(v: [f64; 3]) -> [f32; 3] {
    [v[0] as f32, v[1] as f32, v[2] as f32]
}
