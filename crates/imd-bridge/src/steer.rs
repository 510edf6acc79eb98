// SPDX-License-Identifier: Apache-2.0
//! Steering force application.
//!
//! After the force broadcast, every rank scans its owned particles for each
//! received record and adds the scaled force to matching in-group atoms.
//! The scan is O(records * nlocal); the steered set is expected to be tiny
//! next to the system, and the received buffer persists unchanged between
//! MDComm messages so the same forces keep being applied every step.

use crate::gather::Record;
use crate::host::SystemView;

/// Adds `fscale * record.val` to every owned, in-group particle whose tag
/// matches a record. Each record touches a given particle at most once per
/// call.
pub fn apply_steering(
    records: &[Record],
    fscale: f64,
    groupbit: u32,
    view: &mut SystemView<'_>,
) {
    for rec in records {
        for i in 0..view.nlocal() {
            if view.in_group(i, groupbit) && view.tags[i] == rec.tag {
                view.f[i][0] += fscale * f64::from(rec.val[0]);
                view.f[i][1] += fscale * f64::from(rec.val[1]);
                view.f[i][2] += fscale * f64::from(rec.val[2]);
            }
        }
    }
}
