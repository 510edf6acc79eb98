// SPDX-License-Identifier: Apache-2.0
//! End-to-end sessions over loopback TCP, one rank.
//!
//! Each test drives a real client against a bridge running on `SoloComm`:
//! connect, handshake, GO, then the scripted exchange for the scenario.

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use common::{clock, Client, TestSystem};
use imd_bridge::{BridgeError, BridgeOptions, DomainBox, ImageFlags, ImdBridge};
use imd_comm::SoloComm;
use imd_proto::MsgType;

fn v2_opts() -> BridgeOptions {
    BridgeOptions {
        version: 2,
        ..BridgeOptions::default()
    }
}

fn v3_opts() -> BridgeOptions {
    BridgeOptions {
        version: 3,
        ..BridgeOptions::default()
    }
}

/// Coordinates stream in sorted-tag order regardless of local order, and
/// the handshake length reads back as the version in native byte order.
#[test]
fn v2_connect_streams_sorted_coords() {
    let mut sys = TestSystem::new(
        &[10, 3, 7],
        &[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]],
    );
    let mut bridge = ImdBridge::new(v2_opts(), SoloComm, 1, 3).expect("bridge");
    let port = bridge.local_port().expect("rank 0 has a listener");

    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(2);
        c.send_go();
        c.read_atom_block(MsgType::FCoords, 3)
    });

    bridge.setup(&sys.view()).expect("setup");
    bridge.post_force(&mut sys.view(), &clock(1)).expect("step");

    let coords = client.join().expect("client");
    assert_eq!(
        coords,
        vec![[2.0, 2.0, 2.0], [3.0, 3.0, 3.0], [1.0, 1.0, 1.0]],
        "dense order is tag order: 3, 7, 10"
    );
}

/// Unwrapping applies the triclinic tilt terms before emission.
#[test]
fn v2_unwrap_reconstructs_triclinic_position() {
    let mut sys = TestSystem::new(&[1], &[[0.1, 0.2, 0.3]]);
    sys.domain = DomainBox::triclinic(10.0, 10.0, 10.0, 1.0, 2.0, 3.0);
    sys.image[0] = ImageFlags::pack(1, -1, 2);

    let opts = BridgeOptions {
        unwrap: true,
        ..v2_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 1).expect("bridge");
    let port = bridge.local_port().expect("port");

    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(2);
        c.send_go();
        c.read_atom_block(MsgType::FCoords, 1)
    });

    bridge.setup(&sys.view()).expect("setup");
    bridge.post_force(&mut sys.view(), &clock(1)).expect("step");

    let coords = client.join().expect("client");
    assert!((coords[0][0] - 13.1).abs() < 1e-4);
    assert!((coords[0][1] - -3.8).abs() < 1e-4);
    assert!((coords[0][2] - 20.3).abs() < 1e-4);
}

/// v3 handshake carries the session-info block, and frames carry every
/// enabled sub-block in fixed order with the negotiated payloads.
#[test]
fn v3_full_frame_carries_all_blocks() {
    let mut sys = TestSystem::new(&[2, 1], &[[5.0, 6.0, 7.0], [8.0, 9.0, 10.0]]);
    sys.v = vec![[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]];
    sys.f = vec![[-1.0, -2.0, -3.0], [-4.0, -5.0, -6.0]];

    let mut bridge = ImdBridge::new(v3_opts(), SoloComm, 1, 2).expect("bridge");
    let port = bridge.local_port().expect("port");

    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(3);
        let info = c.expect_session_info();
        assert_eq!(info, [1, 1, 1, 1, 1, 1, 0], "time box coords wrap v f e");
        c.send_go();

        let time_header = c.read_header();
        assert_eq!(time_header.msg_type(), Some(MsgType::Time));
        assert_eq!(time_header.length, 1);
        let time = c.read_bytes(24);
        assert_eq!(f64::from_le_bytes(time[..8].try_into().unwrap()), 1.0);
        assert_eq!(u64::from_le_bytes(time[16..].try_into().unwrap()), 1);

        let box_header = c.read_header();
        assert_eq!(box_header.msg_type(), Some(MsgType::Box));
        let cells: Vec<f32> = c
            .read_bytes(36)
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(
            cells,
            vec![100.0, 0.0, 0.0, 0.0, 100.0, 0.0, 0.0, 0.0, 100.0]
        );

        // tag order: 1 first, then 2
        let coords = c.read_atom_block(MsgType::FCoords, 2);
        assert_eq!(coords, vec![[8.0, 9.0, 10.0], [5.0, 6.0, 7.0]]);
        let vels = c.read_atom_block(MsgType::Velocities, 2);
        assert_eq!(vels, vec![[0.4, 0.5, 0.6], [0.1, 0.2, 0.3]]);
        let forces = c.read_atom_block(MsgType::Forces, 2);
        assert_eq!(forces, vec![[-4.0, -5.0, -6.0], [-1.0, -2.0, -3.0]]);
    });

    bridge.setup(&sys.view()).expect("setup");
    bridge.post_force(&mut sys.view(), &clock(1)).expect("post_force");
    bridge.end_of_step(&sys.view(), &clock(1)).expect("end_of_step");

    client.join().expect("client");
}

/// MDComm forces are scaled by fscale and re-applied every step until
/// replaced.
#[test]
fn v3_steering_applies_scaled_forces_each_step() {
    let mut sys = TestSystem::new(&[3, 7], &[[0.0; 3]; 2]);
    let opts = BridgeOptions {
        fscale: 2.0,
        ..v3_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 2).expect("bridge");
    let port = bridge.local_port().expect("port");

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(3);
        c.expect_session_info();
        c.send_go();
        // dense index 0 is tag 3
        c.send_mdcomm(&[0], &[[1.0, 2.0, 3.0]]);
        done_rx.recv().expect("hold until the bridge is done");
    });

    bridge.setup(&sys.view()).expect("setup");

    let mut applied = false;
    for _ in 0..500 {
        bridge.post_force(&mut sys.view(), &clock(1)).expect("step");
        if sys.f[0][0] != 0.0 {
            applied = true;
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(applied, "steering message never arrived");
    assert_eq!(sys.f[0], [2.0, 4.0, 6.0], "exactly once in the first step");
    assert_eq!(sys.f[1], [0.0; 3], "tag 7 was not steered");

    bridge.post_force(&mut sys.view(), &clock(2)).expect("step");
    assert_eq!(sys.f[0], [4.0, 8.0, 12.0], "re-applied on the next step");

    done_tx.send(()).expect("release client");
    client.join().expect("client");
}

/// A TRATE message changes the emission cadence immediately.
#[test]
fn v3_trate_change_stretches_emission_cadence() {
    let mut sys = TestSystem::new(&[1], &[[0.0; 3]]);
    let opts = BridgeOptions {
        time: false,
        box_: false,
        velocities: false,
        forces: false,
        ..v3_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 1).expect("bridge");
    let port = bridge.local_port().expect("port");

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(3);
        c.expect_session_info();
        c.send_go();
        c.send_msg(MsgType::Trate, 4);

        // steps 101..=108 emit at 104 and 108 only
        for _ in 0..2 {
            c.read_atom_block(MsgType::FCoords, 1);
        }
        assert!(
            c.is_quiet(Duration::from_millis(300)),
            "no third frame within the step range"
        );
        done_rx.recv().expect("hold until the bridge is done");
    });

    bridge.setup(&sys.view()).expect("setup");

    let mut synced = false;
    for _ in 0..500 {
        bridge.post_force(&mut sys.view(), &clock(100)).expect("step");
        if bridge.trate() == 4 {
            synced = true;
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(synced, "trate change never arrived");

    for step in 101..=108 {
        bridge.post_force(&mut sys.view(), &clock(step)).expect("step");
        bridge.end_of_step(&sys.view(), &clock(step)).expect("eos");
    }

    done_tx.send(()).expect("release client");
    client.join().expect("client");
}

/// Disconnect clears pending steering forces, returns the session to
/// listening, and a reconnecting client sees the same tag ordering.
#[test]
fn v2_disconnect_then_reconnect_preserves_ordering() {
    let mut sys = TestSystem::new(
        &[10, 3, 7],
        &[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]],
    );
    // trate 2 so odd steps exercise the force-application path
    let opts = BridgeOptions {
        trate: 2,
        ..v2_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 3).expect("bridge");
    let port = bridge.local_port().expect("port");

    let (seen_tx, seen_rx) = mpsc::channel::<()>();
    let first = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(2);
        c.send_go();
        let coords = c.read_atom_block(MsgType::FCoords, 3);
        c.send_mdcomm(&[0], &[[1.0, 0.0, 0.0]]);
        seen_rx.recv().expect("wait for the bridge to record forces");
        c.send_msg(MsgType::Disconnect, 0);
        coords
    });

    bridge.setup(&sys.view()).expect("setup");
    bridge.post_force(&mut sys.view(), &clock(2)).expect("emit step");

    let mut step = 3;
    for _ in 0..500 {
        if bridge.pending_forces() > 0 {
            break;
        }
        bridge.post_force(&mut sys.view(), &clock(step)).expect("step");
        step += 1;
        thread::sleep(Duration::from_millis(2));
    }
    assert!(bridge.pending_forces() > 0, "steering message never arrived");
    seen_tx.send(()).expect("client is waiting");

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let second = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(2);
        c.send_go();
        let coords = c.read_atom_block(MsgType::FCoords, 3);
        done_rx.recv().expect("hold until the bridge is done");
        coords
    });

    // keep stepping: the drain picks up the disconnect, attaches the second
    // client, and emission resumes on even steps
    for _ in 0..200 {
        bridge.post_force(&mut sys.view(), &clock(step)).expect("step");
        step += 1;
        if bridge.pending_forces() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(bridge.pending_forces(), 0, "disconnect clears the buffer");

    // a few more emission steps so the second client is guaranteed a frame
    for s in [1000u64, 1002, 1004, 1006] {
        bridge.post_force(&mut sys.view(), &clock(s)).expect("step");
    }

    let coords_first = first.join().expect("first client");
    done_tx.send(()).expect("release client");
    let coords_second = second.join().expect("second client");
    assert_eq!(
        coords_first, coords_second,
        "tag ordering survives the reconnect"
    );
}

/// KILL terminates the run on the next synchronization point.
#[test]
fn v2_kill_terminates_the_run() {
    let mut sys = TestSystem::new(&[1], &[[0.0; 3]]);
    let mut bridge = ImdBridge::new(v2_opts(), SoloComm, 1, 1).expect("bridge");
    let port = bridge.local_port().expect("port");

    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(2);
        c.send_go();
        c.send_msg(MsgType::Kill, 0);
    });

    bridge.setup(&sys.view()).expect("setup");

    let mut result = Ok(());
    for step in 1..=500 {
        result = bridge.post_force(&mut sys.view(), &clock(step));
        if result.is_err() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(
        matches!(result, Err(BridgeError::Terminated)),
        "kill must surface as a terminate error"
    );
    client.join().expect("client");
}

/// Pause holds the integrator without wedging the state machine; repeated
/// PAUSE and RESUME are idempotent and frames flow again after resume.
#[test]
fn v3_pause_and_resume_are_idempotent() {
    let mut sys = TestSystem::new(&[1], &[[0.0; 3]]);
    let opts = BridgeOptions {
        time: false,
        box_: false,
        velocities: false,
        forces: false,
        ..v3_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 1).expect("bridge");
    let port = bridge.local_port().expect("port");

    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(3);
        c.expect_session_info();
        c.send_go();

        c.send_msg(MsgType::Pause, 0);
        c.send_msg(MsgType::Pause, 0); // idempotent
        assert!(
            c.is_quiet(Duration::from_millis(400)),
            "no frames while paused"
        );
        c.send_msg(MsgType::Resume, 0);
        c.send_msg(MsgType::Resume, 0); // idempotent
        c.send_msg(MsgType::Trate, 7); // fence: all of the above processed

        // frames flow again after resume
        c.read_atom_block(MsgType::FCoords, 1);
    });

    bridge.setup(&sys.view()).expect("setup");

    let mut synced = false;
    for _ in 0..500 {
        bridge.post_force(&mut sys.view(), &clock(1)).expect("step");
        if bridge.trate() == 7 {
            synced = true;
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(synced, "session wedged in pause handling");

    bridge.post_force(&mut sys.view(), &clock(7)).expect("step");
    bridge.end_of_step(&sys.view(), &clock(7)).expect("emit");

    client.join().expect("client");
}

/// Under nowait the run proceeds without a client, and a late client is
/// picked up by the per-step poll.
#[test]
fn nowait_runs_without_client_and_attaches_late() {
    let mut sys = TestSystem::new(&[4, 2], &[[1.0, 0.0, 0.0], [2.0, 0.0, 0.0]]);
    let opts = BridgeOptions {
        nowait: true,
        ..v2_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 2).expect("bridge");
    let port = bridge.local_port().expect("port");

    bridge.setup(&sys.view()).expect("setup");
    assert!(bridge.is_inactive(), "no client yet");

    for step in 1..=5 {
        bridge.post_force(&mut sys.view(), &clock(step)).expect("step");
    }
    assert!(bridge.is_inactive());

    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(2);
        c.send_go();
        c.read_atom_block(MsgType::FCoords, 2)
    });

    let mut step = 6;
    for _ in 0..500 {
        bridge.post_force(&mut sys.view(), &clock(step)).expect("step");
        step += 1;
        if !bridge.is_inactive() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(!bridge.is_inactive(), "late client never attached");

    bridge.post_force(&mut sys.view(), &clock(step)).expect("emit");

    let coords = client.join().expect("client");
    assert_eq!(coords, vec![[2.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
}

/// The RESPA gate forwards only the outermost sub-step.
#[test]
fn respa_gate_runs_only_outermost_level() {
    let mut sys = TestSystem::new(&[1], &[[0.0; 3]]);
    let opts = BridgeOptions {
        nowait: true,
        ..v2_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 1).expect("bridge");
    bridge.setup(&sys.view()).expect("setup");
    assert!(bridge.is_inactive());

    // inner levels are no-ops; the outermost polls for a client
    for level in 0..3 {
        bridge
            .post_force_respa(&mut sys.view(), &clock(1), level, 3)
            .expect("respa step");
    }
    assert!(bridge.is_inactive(), "no client ever appeared");
}

/// v2 emission cadence follows trate from the options.
#[test]
fn v2_trate_gates_emission() {
    let mut sys = TestSystem::new(&[1], &[[0.0; 3]]);
    let opts = BridgeOptions {
        trate: 3,
        ..v2_opts()
    };
    let mut bridge = ImdBridge::new(opts, SoloComm, 1, 1).expect("bridge");
    let port = bridge.local_port().expect("port");

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let client = thread::spawn(move || {
        let mut c = Client::connect(port);
        c.expect_handshake(2);
        c.send_go();
        for _ in 0..2 {
            c.read_atom_block(MsgType::FCoords, 1);
        }
        assert!(
            c.is_quiet(Duration::from_millis(300)),
            "exactly two frames in six steps at trate 3"
        );
        done_rx.recv().expect("hold until the bridge is done");
    });

    bridge.setup(&sys.view()).expect("setup");
    for step in 1..=6 {
        bridge.post_force(&mut sys.view(), &clock(step)).expect("step");
    }

    done_tx.send(()).expect("release client");
    client.join().expect("client");
}
