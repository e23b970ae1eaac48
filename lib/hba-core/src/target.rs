// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Targets, ports, and per-phy link state. A target is one remote device
//! behind the adapter; it holds a DDB while live and owns the freeze
//! counter that suspends its queue during recovery.

use crate::ddb::DdbIndex;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TargetId(pub u16);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortId(pub u8);

/// Transport protocol spoken to the target. Ladder eligibility depends on
/// it: a logical-unit reset is meaningful only for SSP (SCSI) targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum Transport {
    /// Serial SCSI protocol.
    Ssp,
    /// SATA tunneled over STP.
    Stp,
    /// Management protocol (expanders).
    Smp,
}

pub const MAX_PHYS: usize = 8;

/// Out-of-band state of one phy, updated by control-link completions.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LinkState {
    pub online: bool,
    pub device_present: bool,
    /// Set when the last requested link reset has been confirmed.
    pub reset_done: bool,
}

pub struct Port {
    pub id: PortId,
    /// Bitmask of phys forming this (possibly wide) port.
    pub conn_mask: u8,
}

impl Port {
    pub fn phys(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MAX_PHYS as u8).filter(move |p| self.conn_mask & (1 << p) != 0)
    }

    pub fn width(&self) -> u32 {
        self.conn_mask.count_ones()
    }
}

pub struct Target {
    pub id: TargetId,
    pub ddb: DdbIndex,
    pub port: PortId,
    pub transport: Transport,
    /// Reached through an expander rather than directly attached; the
    /// device-reset rung then goes through SMP phy control.
    pub behind_expander: bool,
    /// Expander phy the target hangs off of (meaningful only when
    /// `behind_expander`).
    pub expander_phy: u8,
    /// Queue suspended while non-zero. Every increment from entering a
    /// recovery attempt is paired with exactly one decrement.
    pub freeze_count: u32,
    /// At most one recovery attempt per target runs at a time.
    pub in_recovery: bool,
}

impl Target {
    pub fn frozen(&self) -> bool {
        self.freeze_count > 0
    }

    pub fn freeze(&mut self) {
        self.freeze_count += 1;
    }

    pub fn unfreeze(&mut self) {
        assert!(self.freeze_count > 0, "freeze counter underflow");
        self.freeze_count -= 1;
    }
}
