// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The escalation ladder: abort-task, logical-unit reset, device reset,
//! port reset. A worker drains the timed-out queue and runs at most one
//! attempt per target; each attempt chains its steps over a single reserved
//! descriptor, posting the next step from the completion of the previous
//! one. All transitions are explicit in [`CoreState::recovery_step_complete`];
//! a finished attempt either reports the original command's disposition
//! upstream or promotes it one rung and requeues it.

use slog::{info, warn};

use crate::bits::{
    DlOpcode, CLEAR_NEXUS_I_T, CLEAR_NEXUS_I_T_L, HW_SCB_PAYLOAD,
    NEXUS_RESUME, PHY_HARD_RESET, PHY_NO_OP, PHY_REPORT, SCB_ABORT_TASK,
    SCB_CLEAR_NEXUS, SCB_CONTROL_PHY, SCB_INITIATE_SMP_TASK,
    SCB_INITIATE_SSP_TMF, TMF_LU_RESET,
};
use crate::controller::CoreState;
use crate::hal::{CmdOutcome, FailReason};
use crate::scb::{Continuation, Owner, ScbFlags, ScbId};
use crate::target::{TargetId, Transport};
use crate::timer::TimerKind;

/// Escalation rungs in order of increasing blast radius.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
pub enum LadderLevel {
    AbortTask,
    LuReset,
    DeviceReset,
    PortReset,
}

impl LadderLevel {
    /// The rung a failed attempt promotes to, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::AbortTask => Some(Self::LuReset),
            Self::LuReset => Some(Self::DeviceReset),
            Self::DeviceReset => Some(Self::PortReset),
            Self::PortReset => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttemptResult {
    Success,
    Failure,
}

/// Where a recovery chain resumes when its posted step completes. One of
/// these is pushed onto the descriptor's continuation stack per posted
/// step.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Abort-task TMF outstanding.
    Abort,
    /// Logical-unit reset TMF outstanding.
    LuReset,
    /// Device reset (local phy control or expander SMP) outstanding.
    DevReset,
    /// Post-reset expander error-log report outstanding.
    PhyReport,
    /// Expander liveness probe outstanding.
    PhyNoOp,
    /// Hard reset of one port phy outstanding.
    PortReset,
    /// Firmware queue flush outstanding; the level records who asked.
    ClearNexus(LadderLevel),
    /// Send-queue resume after a rejected abort. Always lands in Done as a
    /// failure so the ladder promotes.
    ResumeSendQ,
}

/// Per-attempt state hung off the recovery descriptor.
#[derive(Debug)]
pub struct RecoveryCtx {
    /// The timed-out command this attempt is recovering.
    pub original: ScbId,
    pub level: LadderLevel,
    pub target: TargetId,
    /// Phys still awaiting a hard reset (port-reset rung only).
    pub phys_left: Vec<u8>,
    /// Targets frozen at attempt entry; each is unfrozen exactly once when
    /// the attempt leaves, by whichever exit path runs.
    pub frozen: Vec<TargetId>,
}

/// Completion window, in ticks, for one posted recovery step.
fn step_timeout(resume: Resume) -> u64 {
    match resume {
        Resume::LuReset | Resume::DevReset => 6,
        Resume::PortReset => 8,
        Resume::Abort
        | Resume::PhyReport
        | Resume::PhyNoOp
        | Resume::ClearNexus(_)
        | Resume::ResumeSendQ => 4,
    }
}

enum Next {
    Step(Resume),
    Done(AttemptResult),
}

impl CoreState {
    /// Move a freshly-expired command onto the escalation queue and wake
    /// the worker.
    pub(crate) fn escalate(&mut self, id: ScbId) {
        warn!(self.log, "command timed out; queued for recovery";
            "scb" => id.0);
        self.pool.mark_timed_out(id);
        self.timed_out.push_back(id);
        self.worker_pending += 1;
    }

    /// A command-expiry timer fired. The completion path cancels the timer
    /// under the same lock, so a still-armed expiry always names an active
    /// descriptor; the owner check is for the queue-drain ordering where
    /// the descriptor was already escalated by an asynchronous request.
    pub(crate) fn command_timed_out(&mut self, id: ScbId) {
        if self.pool.scb(id).owner != Owner::Active {
            return;
        }
        self.pool.scb_mut(id).timer = None;
        self.escalate(id);
    }

    /// One worker pass over the escalation queue. Entries whose target is
    /// already mid-recovery go back on the queue for the pass that runs
    /// when that attempt finishes.
    pub(crate) fn recover_timed_out(&mut self) {
        let n = self.timed_out.len();
        for _ in 0..n {
            let Some(id) = self.timed_out.pop_front() else { break };
            self.start_attempt(id);
        }
    }

    fn ladder_eligible(level: LadderLevel, transport: Transport) -> bool {
        match level {
            LadderLevel::AbortTask => {
                matches!(transport, Transport::Ssp | Transport::Stp)
            }
            // A logical unit is a SCSI notion.
            LadderLevel::LuReset => matches!(transport, Transport::Ssp),
            LadderLevel::DeviceReset | LadderLevel::PortReset => true,
        }
    }

    fn start_attempt(&mut self, orig: ScbId) {
        let (tid, level) = {
            let scb = self.pool.scb(orig);
            match scb.target {
                Some(t) => (t, scb.level),
                None => {
                    self.fail_original(orig, FailReason::NexusGone);
                    return;
                }
            }
        };
        let Some((transport, port, in_recovery)) = self
            .target(tid)
            .map(|t| (t.transport, t.port, t.in_recovery))
        else {
            self.fail_original(orig, FailReason::NexusGone);
            return;
        };

        if in_recovery {
            self.timed_out.push_back(orig);
            return;
        }

        if !Self::ladder_eligible(level, transport) {
            // This rung is meaningless for the transport; the attempt is a
            // synthesized failure that goes straight to promotion.
            info!(self.log, "rung not applicable to transport";
                "level" => %level, "transport" => %transport);
            self.promote_or_fail(orig, level);
            return;
        }

        let dma = self.hal.dma.clone();
        let Some(rscb) = self.pool.acquire(true, dma.as_ref()) else {
            warn!(self.log, "reserved descriptors exhausted; attempt deferred";
                "scb" => orig.0);
            self.timed_out.push_back(orig);
            return;
        };

        // Freeze discipline: the target's queue (and, for a port reset,
        // every queue sharing the port) is frozen before the first step is
        // posted and unfrozen exactly once at attempt exit.
        let mut frozen = vec![tid];
        let mut phys_left = Vec::new();
        if level == LadderLevel::PortReset {
            phys_left = self.ports[port.0 as usize].phys().collect();
            for t in self.targets.iter().flatten() {
                if t.port == port && t.id != tid {
                    frozen.push(t.id);
                }
            }
        }
        for t in &frozen {
            if let Some(t) = self.target_mut(*t) {
                t.freeze();
            }
        }
        if let Some(t) = self.target_mut(tid) {
            t.in_recovery = true;
        }
        self.pool.scb_mut(orig).flags.insert(ScbFlags::IN_RECOVERY);

        let conn = self.target(tid).map(|t| t.ddb.0).unwrap_or(0);
        let r = self.pool.scb_mut(rscb);
        r.flags.insert(ScbFlags::INTERNAL | ScbFlags::IN_RECOVERY);
        r.target = Some(tid);
        r.conn_handle = conn;
        r.recovery = Some(RecoveryCtx {
            original: orig,
            level,
            target: tid,
            phys_left,
            frozen,
        });
        info!(self.log, "recovery attempt started";
            "level" => %level, "target" => tid.0, "scb" => orig.0);

        let first = match level {
            LadderLevel::AbortTask => Resume::Abort,
            LadderLevel::LuReset => Resume::LuReset,
            LadderLevel::DeviceReset => Resume::DevReset,
            LadderLevel::PortReset => Resume::PortReset,
        };
        self.post_recovery_step(rscb, first);
    }

    /// Build and post one ladder step on the attempt's descriptor. The
    /// step's continuation and expiry timer are armed before the doorbell
    /// rings.
    fn post_recovery_step(&mut self, rscb: ScbId, resume: Resume) {
        let (orig, tid) = {
            let ctx = self.pool.scb(rscb).recovery.as_ref();
            match ctx {
                Some(c) => (c.original, c.target),
                None => return,
            }
        };
        let (tag, lun) = {
            let o = self.pool.scb(orig);
            (o.tag, o.lun)
        };
        let Some((behind_expander, expander_phy, port)) = self
            .target(tid)
            .map(|t| (t.behind_expander, t.expander_phy, t.port))
        else {
            // The target went away mid-attempt; nothing left to post at.
            if let Some(ctx) = self.pool.scb_mut(rscb).recovery.take() {
                self.finish_attempt(Some(rscb), ctx, AttemptResult::Failure);
            }
            return;
        };

        let mut payload = [0u8; HW_SCB_PAYLOAD];
        let opcode = match resume {
            Resume::Abort => {
                payload[0..2].copy_from_slice(&tag.to_le_bytes());
                payload[2..10].copy_from_slice(&lun);
                SCB_ABORT_TASK
            }
            Resume::LuReset => {
                payload[0] = TMF_LU_RESET;
                payload[1..9].copy_from_slice(&lun);
                SCB_INITIATE_SSP_TMF
            }
            Resume::DevReset => {
                if behind_expander {
                    payload[0] = expander_phy;
                    payload[1] = PHY_HARD_RESET;
                    SCB_INITIATE_SMP_TASK
                } else {
                    // Direct-attached: hard-reset the local phy the device
                    // hangs off of.
                    let phy = self.ports[port.0 as usize]
                        .phys()
                        .next()
                        .unwrap_or(0);
                    payload[0] = phy;
                    payload[1] = PHY_HARD_RESET;
                    SCB_CONTROL_PHY
                }
            }
            Resume::PhyReport => {
                payload[0] = expander_phy;
                payload[1] = PHY_REPORT;
                SCB_INITIATE_SMP_TASK
            }
            Resume::PhyNoOp => {
                payload[0] = expander_phy;
                payload[1] = PHY_NO_OP;
                SCB_INITIATE_SMP_TASK
            }
            Resume::PortReset => {
                let phy = self
                    .pool
                    .scb_mut(rscb)
                    .recovery
                    .as_mut()
                    .and_then(|c| c.phys_left.pop())
                    .unwrap_or(0);
                payload[0] = phy;
                payload[1] = PHY_HARD_RESET;
                SCB_CONTROL_PHY
            }
            Resume::ClearNexus(from) => {
                match from {
                    LadderLevel::LuReset => {
                        payload[0] = CLEAR_NEXUS_I_T_L;
                        payload[2..10].copy_from_slice(&lun);
                    }
                    _ => payload[0] = CLEAR_NEXUS_I_T,
                }
                payload[1] = NEXUS_RESUME;
                SCB_CLEAR_NEXUS
            }
            Resume::ResumeSendQ => {
                payload[0] = CLEAR_NEXUS_I_T;
                payload[1] = NEXUS_RESUME;
                SCB_CLEAR_NEXUS
            }
        };

        let scb = self.pool.scb_mut(rscb);
        scb.opcode = opcode;
        scb.payload = payload;
        scb.stack.push(Continuation::Recovery(resume));
        let timer = self
            .timers
            .arm(step_timeout(resume), TimerKind::RecoveryExpiry(rscb));
        self.pool.scb_mut(rscb).timer = Some(timer);

        let regs = self.hal.regs.clone();
        self.pool.post(rscb, regs.as_ref());
    }

    /// A posted recovery step completed; decide the next transition.
    pub(crate) fn recovery_step_complete(
        &mut self,
        rscb: ScbId,
        resume: Resume,
        op: DlOpcode,
    ) {
        if let Some(t) = self.pool.scb_mut(rscb).timer.take() {
            self.timers.cancel(t);
        }
        let (orig, more_phys) = {
            let scb = self.pool.scb(rscb);
            let Some(ctx) = scb.recovery.as_ref() else {
                // Chain already torn down by a step timeout.
                return;
            };
            (ctx.original, !ctx.phys_left.is_empty())
        };

        let next = match resume {
            Resume::Abort => match op {
                DlOpcode::TmfComplete | DlOpcode::TaskCleared => {
                    Next::Done(AttemptResult::Success)
                }
                DlOpcode::TmfTaskDone => {
                    // "No such task" can mean the task simply finished. For
                    // SCSI the response frame settles it; otherwise only a
                    // completion we have already seen does.
                    let tid = self.pool.scb(rscb).target;
                    let ssp = tid
                        .and_then(|t| self.target(t))
                        .map(|t| t.transport == Transport::Ssp)
                        .unwrap_or(false);
                    let o = self.pool.scb(orig).flags;
                    let confirmed = o.contains(ScbFlags::COMPLETED_LATE)
                        || !o.contains(ScbFlags::PENDING);
                    if ssp || confirmed {
                        Next::Done(AttemptResult::Success)
                    } else {
                        Next::Done(AttemptResult::Failure)
                    }
                }
                DlOpcode::TmfNoTask => Next::Done(AttemptResult::Failure),
                DlOpcode::OpenReject
                | DlOpcode::OpenTimeout
                | DlOpcode::Nak
                | DlOpcode::AckNakTimeout => {
                    if self.pool.scb(orig).xfer_suspended {
                        // The firmware parked the send queue under the
                        // failed task; resume it before giving up.
                        Next::Step(Resume::ResumeSendQ)
                    } else {
                        Next::Done(AttemptResult::Failure)
                    }
                }
                _ => Next::Done(AttemptResult::Failure),
            },
            Resume::LuReset => match op {
                DlOpcode::TmfComplete => {
                    Next::Step(Resume::ClearNexus(LadderLevel::LuReset))
                }
                _ => Next::Done(AttemptResult::Failure),
            },
            Resume::DevReset => match op {
                // Expander-attached resets confirm the expander afterwards.
                DlOpcode::SmpComplete => Next::Step(Resume::PhyReport),
                DlOpcode::ControlPhy | DlOpcode::NoError => {
                    Next::Step(Resume::ClearNexus(LadderLevel::DeviceReset))
                }
                _ => Next::Done(AttemptResult::Failure),
            },
            Resume::PhyReport => match op {
                DlOpcode::SmpComplete => Next::Step(Resume::PhyNoOp),
                _ => Next::Done(AttemptResult::Failure),
            },
            Resume::PhyNoOp => match op {
                DlOpcode::SmpComplete => {
                    Next::Step(Resume::ClearNexus(LadderLevel::DeviceReset))
                }
                _ => Next::Done(AttemptResult::Failure),
            },
            Resume::PortReset => match op {
                DlOpcode::ControlPhy => {
                    if more_phys {
                        Next::Step(Resume::PortReset)
                    } else {
                        Next::Step(Resume::ClearNexus(LadderLevel::PortReset))
                    }
                }
                _ => Next::Done(AttemptResult::Failure),
            },
            Resume::ClearNexus(_) => match op {
                DlOpcode::NexusCleared => Next::Done(AttemptResult::Success),
                _ => Next::Done(AttemptResult::Failure),
            },
            Resume::ResumeSendQ => Next::Done(AttemptResult::Failure),
        };

        match next {
            Next::Step(r) => self.post_recovery_step(rscb, r),
            Next::Done(result) => {
                if let Some(ctx) = self.pool.scb_mut(rscb).recovery.take() {
                    self.finish_attempt(Some(rscb), ctx, result);
                }
            }
        }
    }

    /// Attempt exit. Unfreezes what the attempt froze, releases the
    /// reserved descriptor, and settles the original: report upstream on
    /// success, promote a rung (or fail terminally) otherwise.
    fn finish_attempt(
        &mut self,
        rscb: Option<ScbId>,
        ctx: RecoveryCtx,
        result: AttemptResult,
    ) {
        for tid in &ctx.frozen {
            if let Some(t) = self.target_mut(*tid) {
                t.unfreeze();
            }
        }
        if let Some(t) = self.target_mut(ctx.target) {
            t.in_recovery = false;
        }
        if let Some(r) = rscb {
            self.release_scb(r);
        }

        info!(self.log, "recovery attempt finished";
            "level" => %ctx.level, "result" => ?result,
            "scb" => ctx.original.0);

        let orig = ctx.original;
        self.pool.scb_mut(orig).flags.remove(ScbFlags::IN_RECOVERY);
        if self.pool.scb(orig).flags.contains(ScbFlags::COMPLETED_LATE) {
            // The real completion already reported this command upstream.
            self.release_scb(orig);
        } else {
            match result {
                AttemptResult::Success => {
                    let outcome = match ctx.level {
                        LadderLevel::AbortTask => CmdOutcome::Aborted,
                        _ => CmdOutcome::ResetCleared,
                    };
                    let pctx = self.pool.scb(orig).platform_ctx;
                    self.hal.upstream.command_done(pctx, outcome);
                    self.release_scb(orig);
                }
                AttemptResult::Failure => self.promote_or_fail(orig, ctx.level),
            }
        }

        if !self.timed_out.is_empty() {
            self.worker_pending += 1;
        }
    }

    /// A recovery step's expiry fired. The chain is torn down in place:
    /// the stack is cleared so any late completion routes to the
    /// drop-and-release path, freezes are undone exactly once, and the
    /// original is promoted without passing through Done.
    pub(crate) fn recovery_timed_out(&mut self, rscb: ScbId) {
        let Some(ctx) = self.pool.scb_mut(rscb).recovery.take() else {
            return;
        };
        warn!(self.log, "recovery step timed out; tearing down attempt";
            "level" => %ctx.level, "scb" => ctx.original.0);
        {
            let scb = self.pool.scb_mut(rscb);
            scb.stack.clear();
            scb.timer = None;
            scb.flags.remove(ScbFlags::IN_RECOVERY);
            // The descriptor stays Active: the hardware may still complete
            // it, and the empty stack routes that completion to release.
        }
        for tid in &ctx.frozen {
            if let Some(t) = self.target_mut(*tid) {
                t.unfreeze();
            }
        }
        if let Some(t) = self.target_mut(ctx.target) {
            t.in_recovery = false;
        }

        let orig = ctx.original;
        self.pool.scb_mut(orig).flags.remove(ScbFlags::IN_RECOVERY);
        if self.pool.scb(orig).flags.contains(ScbFlags::COMPLETED_LATE) {
            self.release_scb(orig);
        } else {
            self.promote_or_fail(orig, ctx.level);
        }

        // Teardown is also an attempt exit: entries deferred behind this
        // attempt get no other wakeup.
        if !self.timed_out.is_empty() {
            self.worker_pending += 1;
        }
    }

    /// Requeue the original one rung up, or fail it terminally off the top
    /// of the ladder.
    fn promote_or_fail(&mut self, orig: ScbId, from: LadderLevel) {
        if self.pool.scb(orig).flags.contains(ScbFlags::COMPLETED_LATE) {
            self.release_scb(orig);
            return;
        }
        match from.next() {
            Some(next) => {
                self.pool.scb_mut(orig).level = next;
                self.timed_out.push_back(orig);
                self.worker_pending += 1;
            }
            None => {
                self.fail_original(orig, FailReason::RecoveryExhausted)
            }
        }
    }

    /// Terminal failure: every applicable rung was tried (or there was no
    /// nexus to try them against).
    fn fail_original(&mut self, orig: ScbId, reason: FailReason) {
        warn!(self.log, "recovery exhausted; failing command";
            "scb" => orig.0, "reason" => ?reason);
        let late = {
            let scb = self.pool.scb_mut(orig);
            scb.flags.remove(ScbFlags::IN_RECOVERY);
            scb.flags.contains(ScbFlags::COMPLETED_LATE)
        };
        if !late {
            let pctx = self.pool.scb(orig).platform_ctx;
            self.hal.upstream.command_done(pctx, CmdOutcome::Failed(reason));
        }
        self.release_scb(orig);
    }
}
