// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command descriptors (SCBs): identity, flags, and the fixed-depth
//! continuation stack that chains recovery steps over a single descriptor.

use crate::bits::HW_SCB_PAYLOAD;
use crate::recovery::{LadderLevel, Resume};
use crate::target::TargetId;
use crate::timer::TimerId;

/// Dense descriptor identity. While a descriptor is posted, this index is
/// the hardware's name for it: Done List entries echo it back and the pool
/// resolves it with a direct arena lookup.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ScbId(pub u16);

impl ScbId {
    pub fn idx(&self) -> usize {
        self.0 as usize
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct ScbFlags: u8 {
        /// Posted to hardware and indexed for completion lookup.
        const ACTIVE = 1 << 0;
        /// The command has reached the device and awaits its response.
        const PENDING = 1 << 1;
        /// Issued by the core itself rather than on behalf of a caller.
        const INTERNAL = 1 << 2;
        /// Carries a step of an in-flight recovery attempt.
        const IN_RECOVERY = 1 << 3;
        /// Drawn from (and returned to) the reserved free list.
        const RESERVED = 1 << 4;
        /// Expired without a completion and queued for escalation.
        const TIMED_OUT = 1 << 5;
        /// A real completion arrived after the timeout had already queued
        /// this descriptor for recovery.
        const COMPLETED_LATE = 1 << 6;
    }
}

/// Which collection currently holds a descriptor. At most one holds it at
/// any time; `Detached` covers the window between acquire and post.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Owner {
    Free,
    ReservedFree,
    Detached,
    Active,
    TimedOut,
}

/// The continuation resumed when a completion record arrives for a
/// descriptor. Recovery chains push one of these per posted step, so the
/// right handler resumes no matter how deep the chain has grown.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Continuation {
    /// Terminal completion of an ordinary I/O command.
    Io,
    /// Resume an escalation attempt at the given step.
    Recovery(Resume),
}

/// Maximum continuation depth per descriptor. A chain deeper than this is a
/// programming error, not a runtime condition.
pub const MAX_STACK_DEPTH: usize = 5;

/// Fixed-depth continuation stack. Overflow aborts; underflow is reported
/// to the caller (`pop` returning `None`), who logs and drops the
/// completion: it means the owning chain was already torn down by a
/// timeout.
#[derive(Debug, Default)]
pub struct CallbackStack {
    slots: [Option<Continuation>; MAX_STACK_DEPTH],
    depth: usize,
}

impl CallbackStack {
    pub fn push(&mut self, cont: Continuation) {
        assert!(
            self.depth < MAX_STACK_DEPTH,
            "callback stack overflow (depth {})",
            self.depth
        );
        self.slots[self.depth] = Some(cont);
        self.depth += 1;
    }

    pub fn pop(&mut self) -> Option<Continuation> {
        if self.depth == 0 {
            return None;
        }
        self.depth -= 1;
        self.slots[self.depth].take()
    }

    /// The continuation a naive dispatcher would invoke next.
    pub fn current(&self) -> Option<&Continuation> {
        self.depth.checked_sub(1).and_then(|d| self.slots[d].as_ref())
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn clear(&mut self) {
        self.slots = Default::default();
        self.depth = 0;
    }
}

/// One command descriptor. Allocated at pool-growth time and reused for the
/// life of the controller; never deallocated except at teardown.
pub struct Scb {
    pub id: ScbId,
    pub opcode: u8,
    pub target: Option<TargetId>,
    pub lun: [u8; 8],
    pub tag: u16,
    /// Hardware connection-context slot of the addressed target, copied
    /// into the record at post time.
    pub conn_handle: u16,
    pub flags: ScbFlags,
    /// Ladder level the next recovery attempt on this descriptor will use.
    pub level: LadderLevel,
    /// Attempt state while this descriptor carries a recovery chain.
    pub recovery: Option<crate::recovery::RecoveryCtx>,
    pub stack: CallbackStack,
    pub timer: Option<TimerId>,
    /// Index of the DMA mirror record currently bound to this descriptor.
    pub mirror: usize,
    /// Free-list link (index-based; see the pool's intrusive lists).
    pub link: Option<ScbId>,
    pub owner: Owner,
    /// Opaque platform per-command bookkeeping handle.
    pub platform_ctx: u64,
    /// Protocol-specific command block copied into the hardware record.
    pub payload: [u8; HW_SCB_PAYLOAD],
    /// The task's data transmission was suspended by the firmware; an abort
    /// that open-rejects must resume the send queue before failing.
    pub xfer_suspended: bool,
}

impl Scb {
    pub fn new(id: ScbId, mirror: usize) -> Self {
        Self {
            id,
            opcode: 0,
            target: None,
            lun: [0; 8],
            tag: 0,
            conn_handle: 0,
            flags: ScbFlags::empty(),
            level: LadderLevel::AbortTask,
            recovery: None,
            stack: CallbackStack::default(),
            timer: None,
            mirror,
            link: None,
            owner: Owner::Free,
            platform_ctx: 0,
            payload: [0; HW_SCB_PAYLOAD],
            xfer_suspended: false,
        }
    }

    /// Clear all per-use state ahead of returning to a free list. The
    /// RESERVED flag survives: it decides which list takes the descriptor
    /// back.
    pub fn reset_for_release(&mut self) {
        let reserved = self.flags.contains(ScbFlags::RESERVED);
        self.opcode = 0;
        self.target = None;
        self.lun = [0; 8];
        self.tag = 0;
        self.conn_handle = 0;
        self.flags =
            if reserved { ScbFlags::RESERVED } else { ScbFlags::empty() };
        self.level = LadderLevel::AbortTask;
        self.recovery = None;
        self.stack.clear();
        self.timer = None;
        self.platform_ctx = 0;
        self.payload = [0; HW_SCB_PAYLOAD];
        self.xfer_suspended = false;
    }
}
