// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fake collaborators and end-to-end exercises of the command and
//! recovery paths. The fakes stand in for the register window, DMA
//! memory, and the platform layer; completions are deposited into the
//! real Done List ring exactly as hardware would.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use slog::{o, Discard, Logger};

use crate::hal::{
    CmdOutcome, DmaAllocator, DmaChunk, DmaError, Hal, PhysAddr, RegIo,
    Upstream,
};

pub(crate) fn test_log() -> Logger {
    Logger::root(Discard, o!())
}

/// Register window backed by a map; every 32-bit write is logged so tests
/// can assert on doorbell traffic.
#[derive(Default)]
pub(crate) struct FakeRegs {
    regs: Mutex<HashMap<u32, u32>>,
    writes32: Mutex<Vec<(u32, u32)>>,
}

impl FakeRegs {
    pub fn last_write32(&self, off: u32) -> Option<u32> {
        self.writes32
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(o, _)| *o == off)
            .map(|(_, v)| *v)
    }
}

impl RegIo for FakeRegs {
    fn read8(&self, off: u32) -> u8 {
        self.read32(off) as u8
    }
    fn read16(&self, off: u32) -> u16 {
        self.read32(off) as u16
    }
    fn read32(&self, off: u32) -> u32 {
        *self.regs.lock().unwrap().get(&off).unwrap_or(&0)
    }
    fn write8(&self, off: u32, val: u8) {
        self.write32(off, val as u32);
    }
    fn write16(&self, off: u32, val: u16) {
        self.write32(off, val as u32);
    }
    fn write32(&self, off: u32, val: u32) {
        self.regs.lock().unwrap().insert(off, val);
        self.writes32.lock().unwrap().push((off, val));
    }
}

/// Unbounded DMA allocator handing out monotonically increasing physical
/// addresses. Tracks live allocations so teardown tests can prove every
/// page came back.
#[derive(Default)]
pub(crate) struct FakeDma {
    state: Mutex<FakeDmaState>,
}

struct FakeDmaState {
    next_pa: u64,
    live: usize,
}

impl Default for FakeDmaState {
    fn default() -> Self {
        Self { next_pa: 0x10_0000, live: 0 }
    }
}

impl FakeDma {
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live
    }
}

impl DmaAllocator for FakeDma {
    fn alloc(&self, size: usize) -> Result<DmaChunk, DmaError> {
        let mut state = self.state.lock().unwrap();
        let pa = PhysAddr(state.next_pa);
        state.next_pa += size.next_multiple_of(4096) as u64;
        state.live += 1;
        Ok(DmaChunk::new(vec![0u8; size].into_boxed_slice(), pa))
    }

    fn free(&self, chunk: DmaChunk) {
        let mut state = self.state.lock().unwrap();
        assert!(state.live > 0, "freeing more chunks than were allocated");
        state.live -= 1;
        drop(chunk);
    }
}

/// Platform layer that records every reported outcome and audits context
/// handle balance.
#[derive(Default)]
pub(crate) struct SinkUpstream {
    state: Mutex<SinkState>,
}

#[derive(Default)]
struct SinkState {
    next_ctx: u64,
    live: HashSet<u64>,
    done: Vec<(u64, CmdOutcome)>,
}

impl SinkUpstream {
    pub fn done(&self) -> Vec<(u64, CmdOutcome)> {
        self.state.lock().unwrap().done.clone()
    }

    pub fn outcomes(&self) -> Vec<CmdOutcome> {
        self.state.lock().unwrap().done.iter().map(|(_, o)| *o).collect()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }
}

impl Upstream for SinkUpstream {
    fn alloc_cmd_context(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.next_ctx += 1;
        let ctx = state.next_ctx;
        state.live.insert(ctx);
        ctx
    }

    fn free_cmd_context(&self, ctx: u64) {
        let mut state = self.state.lock().unwrap();
        assert!(state.live.remove(&ctx), "double free of context {ctx}");
    }

    fn command_done(&self, ctx: u64, outcome: CmdOutcome) {
        self.state.lock().unwrap().done.push((ctx, outcome));
    }
}

pub(crate) struct TestEnv {
    pub regs: Arc<FakeRegs>,
    pub dma: Arc<FakeDma>,
    pub upstream: Arc<SinkUpstream>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            regs: Arc::new(FakeRegs::default()),
            dma: Arc::new(FakeDma::default()),
            upstream: Arc::new(SinkUpstream::default()),
        }
    }

    pub fn hal(&self) -> Hal {
        Hal {
            regs: self.regs.clone(),
            dma: self.dma.clone(),
            upstream: self.upstream.clone(),
        }
    }
}

pub(crate) fn test_hal() -> (Hal, Arc<SinkUpstream>) {
    let env = TestEnv::new();
    let upstream = env.upstream.clone();
    (env.hal(), upstream)
}

mod scenarios {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use crate::bits::{
        DlOpcode, DoneListEntry, EdbSubOpcode, LINK_ONLINE, LINK_RESET_DONE,
        SCB_ABORT_TASK, SCB_CLEAR_NEXUS, SCB_CONTROL_PHY,
        SCB_INITIATE_SMP_TASK, SCB_INITIATE_SSP_TMF, TMF_LU_RESET,
    };
    use crate::controller::{Config, Controller};
    use crate::hal::{CmdOutcome, FailReason};
    use crate::recovery::LadderLevel;
    use crate::scb::{Owner, ScbFlags, ScbId};
    use crate::target::{TargetId, Transport};
    use crate::timer::Ticks;

    fn small_config() -> Config {
        Config { max_scbs: 32, reserved_scbs: 2, num_edbs: 2, max_ddbs: 16 }
    }

    fn setup() -> (Arc<Controller>, TestEnv, TargetId) {
        let env = TestEnv::new();
        let ctrl =
            Controller::new(env.hal(), small_config(), test_log()).unwrap();
        let port = ctrl.create_port(0b01);
        let tid =
            ctrl.register_target(Transport::Ssp, port, false, 0).unwrap();
        (ctrl, env, tid)
    }

    fn submit(
        ctrl: &Controller,
        tid: TargetId,
        tag: u16,
        timeout: Option<u64>,
    ) -> ScbId {
        let id = ctrl.acquire_descriptor().unwrap();
        ctrl.prepare_io(id, tid, [0u8; 8], tag).unwrap();
        match timeout {
            Some(t) => ctrl.post_with_timeout(id, t),
            None => ctrl.post(id),
        }
        id
    }

    fn complete(
        ctrl: &Controller,
        id: ScbId,
        opcode: u8,
        status: [u8; 12],
    ) {
        let mut entry = DoneListEntry::new(id.0, opcode);
        entry.status_block = status;
        ctrl.hw_produce(entry);
        ctrl.process_completions();
    }

    /// The single in-flight recovery descriptor, if an attempt has a step
    /// posted.
    fn recovery_scb(ctrl: &Controller) -> Option<(ScbId, u8)> {
        let state = ctrl.state.lock().unwrap();
        state
            .pool
            .pending()
            .iter()
            .copied()
            .find(|id| {
                state.pool.scb(*id).flags.contains(ScbFlags::IN_RECOVERY)
                    && state.pool.scb(*id).flags.contains(ScbFlags::INTERNAL)
            })
            .map(|id| (id, state.pool.scb(id).opcode))
    }

    fn edb_conn(ctrl: &Controller, tid: TargetId) -> u16 {
        ctrl.state.lock().unwrap().target(tid).unwrap().ddb.0
    }

    #[test]
    fn ordinary_completion_reports_success() {
        let (ctrl, env, tid) = setup();
        let before = ctrl.census();
        let id = submit(&ctrl, tid, 1, None);
        assert_eq!(ctrl.census().active, before.active + 1);

        complete(&ctrl, id, DlOpcode::NoError as u8, [0; 12]);
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Success]);
        assert_eq!(ctrl.census(), before);
        assert_eq!(env.upstream.live_contexts(), 0);
    }

    #[test]
    fn underrun_reports_residual() {
        let (ctrl, env, tid) = setup();
        let id = submit(&ctrl, tid, 1, None);
        let mut status = [0u8; 12];
        status[0..4].copy_from_slice(&4096u32.to_le_bytes());
        complete(&ctrl, id, DlOpcode::Underrun as u8, status);
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Underrun(4096)]);
    }

    #[test]
    fn timeout_abort_succeeds() {
        let (ctrl, env, tid) = setup();
        let before = ctrl.census();
        let id = submit(&ctrl, tid, 42, Some(5));

        ctrl.advance_time(Ticks(6));
        assert_eq!(ctrl.census().timed_out, 1);
        assert!(!ctrl.target_frozen(tid));

        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_ABORT_TASK);
        // The target's queue stays frozen for the life of the attempt.
        assert!(ctrl.target_frozen(tid));
        assert_eq!(ctrl.census().reserved_free, 1);

        complete(&ctrl, rscb, DlOpcode::TmfComplete as u8, [0; 12]);
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Aborted]);
        assert!(!ctrl.target_frozen(tid));
        assert_eq!(ctrl.census(), before);
        let _ = id;
    }

    #[test]
    fn abort_no_task_promotes_to_lu_reset() {
        let (ctrl, env, tid) = setup();
        let id = submit(&ctrl, tid, 7, Some(5));
        ctrl.advance_time(Ticks(6));

        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_ABORT_TASK);
        complete(&ctrl, rscb, DlOpcode::TmfNoTask as u8, [0; 12]);

        // The failed abort promoted the command one rung.
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.pool.scb(id).level, LadderLevel::LuReset);
            assert_eq!(state.timed_out.len(), 1);
        }
        assert!(!ctrl.target_frozen(tid));

        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_INITIATE_SSP_TMF);
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.pool.scb(rscb).payload[0], TMF_LU_RESET);
        }
        complete(&ctrl, rscb, DlOpcode::TmfComplete as u8, [0; 12]);

        // A successful reset flushes the firmware queue before Done.
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CLEAR_NEXUS);
        complete(&ctrl, rscb, DlOpcode::NexusCleared as u8, [0; 12]);

        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::ResetCleared]);
        assert_eq!(ctrl.census().reserved_free, 2);
        assert!(!ctrl.target_frozen(tid));
    }

    #[test]
    fn ladder_exhaustion_fails_command() {
        let (ctrl, env, tid) = setup();
        let before = ctrl.census();
        let _id = submit(&ctrl, tid, 9, Some(5));
        ctrl.advance_time(Ticks(6));

        // Fail every rung in turn: abort, LU reset, device reset (direct
        // attached, so phy control), port reset.
        let failures = [
            (SCB_ABORT_TASK, DlOpcode::TmfNoTask),
            (SCB_INITIATE_SSP_TMF, DlOpcode::OpenReject),
            (SCB_CONTROL_PHY, DlOpcode::Break),
            (SCB_CONTROL_PHY, DlOpcode::Break),
        ];
        for (scb_op, dl_op) in failures {
            ctrl.recover_timed_out_commands();
            let (rscb, op) = recovery_scb(&ctrl).unwrap();
            assert_eq!(op, scb_op);
            complete(&ctrl, rscb, dl_op as u8, [0; 12]);
        }

        assert_eq!(
            env.upstream.outcomes(),
            vec![CmdOutcome::Failed(FailReason::RecoveryExhausted)]
        );
        assert!(!ctrl.target_frozen(tid));
        assert_eq!(ctrl.census(), before);
        assert_eq!(env.upstream.live_contexts(), 0);
    }

    #[test]
    fn wide_port_reset_freezes_port_mates() {
        let env = TestEnv::new();
        let ctrl =
            Controller::new(env.hal(), small_config(), test_log()).unwrap();
        let port = ctrl.create_port(0b111);
        let a = ctrl.register_target(Transport::Ssp, port, false, 0).unwrap();
        let b = ctrl.register_target(Transport::Ssp, port, false, 0).unwrap();

        let _id = submit(&ctrl, a, 3, Some(5));
        ctrl.advance_time(Ticks(6));
        {
            // Jump straight to the top rung.
            let mut state = ctrl.state.lock().unwrap();
            let id = state.timed_out[0];
            state.pool.scb_mut(id).level = LadderLevel::PortReset;
        }

        ctrl.recover_timed_out_commands();
        assert!(ctrl.target_frozen(a));
        assert!(ctrl.target_frozen(b));

        // Exactly one hard reset per phy of the wide port, in sequence.
        let mut phys_reset = Vec::new();
        for _ in 0..3 {
            let (rscb, op) = recovery_scb(&ctrl).unwrap();
            assert_eq!(op, SCB_CONTROL_PHY);
            let phy = {
                let state = ctrl.state.lock().unwrap();
                state.pool.scb(rscb).payload[0]
            };
            phys_reset.push(phy);
            let mut status = [0u8; 12];
            status[0] = phy;
            status[1] = LINK_RESET_DONE | LINK_ONLINE;
            complete(&ctrl, rscb, DlOpcode::ControlPhy as u8, status);
            assert!(ctrl.link_state(phy as usize).reset_done);
        }
        phys_reset.sort_unstable();
        assert_eq!(phys_reset, vec![0, 1, 2]);

        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CLEAR_NEXUS);
        complete(&ctrl, rscb, DlOpcode::NexusCleared as u8, [0; 12]);

        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::ResetCleared]);
        assert!(!ctrl.target_frozen(a));
        assert!(!ctrl.target_frozen(b));
    }

    #[test]
    fn recovery_step_timeout_promotes_without_done() {
        let (ctrl, env, tid) = setup();
        let id = submit(&ctrl, tid, 5, Some(5));
        ctrl.advance_time(Ticks(6));
        {
            // Start the ladder at device reset.
            let mut state = ctrl.state.lock().unwrap();
            state.pool.scb_mut(id).level = LadderLevel::DeviceReset;
        }
        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CONTROL_PHY);

        // Let the reset step itself expire.
        ctrl.advance_time(Ticks(13));
        {
            let state = ctrl.state.lock().unwrap();
            // Forced promotion: the original moved up a rung without the
            // attempt ever reaching Done.
            assert_eq!(state.pool.scb(id).level, LadderLevel::PortReset);
            assert_eq!(state.timed_out.len(), 1);
            // The torn-down chain keeps its descriptor until the hardware
            // lets go of it.
            assert_eq!(state.pool.scb(rscb).owner, Owner::Active);
            assert_eq!(state.pool.census().reserved_free, 1);
        }
        // Unfrozen exactly once by the teardown.
        assert!(!ctrl.target_frozen(tid));

        // The step's completion straggles in afterwards: logged, dropped,
        // and the descriptor returns to the reserved list.
        complete(&ctrl, rscb, DlOpcode::ControlPhy as u8, [0; 12]);
        assert_eq!(ctrl.census().reserved_free, 2);
        assert!(env.upstream.outcomes().is_empty());

        // The promoted port-reset attempt then runs to success.
        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CONTROL_PHY);
        complete(&ctrl, rscb, DlOpcode::ControlPhy as u8, [0; 12]);
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CLEAR_NEXUS);
        complete(&ctrl, rscb, DlOpcode::NexusCleared as u8, [0; 12]);
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::ResetCleared]);
    }

    #[test]
    fn second_timeout_waits_for_running_attempt() {
        let (ctrl, env, tid) = setup();
        let _a = submit(&ctrl, tid, 1, Some(5));
        let b = submit(&ctrl, tid, 2, Some(5));
        ctrl.advance_time(Ticks(6));

        // One attempt per target: the second command stays queued while
        // the first's attempt is in flight.
        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_ABORT_TASK);
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.timed_out.len(), 1);
            assert_eq!(state.timed_out[0], b);
            assert_eq!(state.pool.census().reserved_free, 1);
        }

        // Further passes must not start a second attempt on the target.
        ctrl.recover_timed_out_commands();
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.timed_out.len(), 1);
            assert_eq!(state.pool.census().reserved_free, 1);
        }

        complete(&ctrl, rscb, DlOpcode::TmfComplete as u8, [0; 12]);
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Aborted]);
        // The attempt's exit left a wakeup for the waiting entry.
        assert!(ctrl.state.lock().unwrap().worker_pending > 0);

        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_ABORT_TASK);
        complete(&ctrl, rscb, DlOpcode::TmfComplete as u8, [0; 12]);
        assert_eq!(
            env.upstream.outcomes(),
            vec![CmdOutcome::Aborted, CmdOutcome::Aborted]
        );
        assert!(!ctrl.target_frozen(tid));
        assert_eq!(env.upstream.live_contexts(), 0);
    }

    #[test]
    fn step_timeout_wakes_deferred_attempt() {
        let (ctrl, env, tid) = setup();
        let a = submit(&ctrl, tid, 1, Some(5));
        let b = submit(&ctrl, tid, 2, Some(5));
        ctrl.advance_time(Ticks(6));
        {
            // Put the first command at the top rung so its teardown has no
            // next level to promote to.
            let mut state = ctrl.state.lock().unwrap();
            state.pool.scb_mut(a).level = LadderLevel::PortReset;
        }

        ctrl.recover_timed_out_commands();
        let (stale, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CONTROL_PHY);
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.timed_out.len(), 1);
        }

        // The port-reset step expires. The first command fails terminally
        // off the top of the ladder, and the teardown must still leave a
        // wakeup behind, or the deferred command would hang with a parked
        // worker.
        ctrl.advance_time(Ticks(15));
        assert_eq!(
            env.upstream.outcomes(),
            vec![CmdOutcome::Failed(FailReason::RecoveryExhausted)]
        );
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.timed_out.len(), 1);
            assert!(state.worker_pending > 0);
        }

        // The next pass services the deferred command.
        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_ABORT_TASK);
        complete(&ctrl, rscb, DlOpcode::TmfComplete as u8, [0; 12]);
        assert_eq!(
            env.upstream.outcomes(),
            vec![
                CmdOutcome::Failed(FailReason::RecoveryExhausted),
                CmdOutcome::Aborted,
            ]
        );

        // The torn-down step's completion straggles in; its descriptor
        // returns to the reserved list and the books balance.
        complete(&ctrl, stale, DlOpcode::ControlPhy as u8, [0; 12]);
        assert_eq!(ctrl.census().reserved_free, 2);
        assert_eq!(ctrl.census().timed_out, 0);
        let _ = b;
    }

    #[test]
    fn rejected_abort_resumes_send_queue_before_failing() {
        let (ctrl, env, tid) = setup();
        let id = submit(&ctrl, tid, 11, Some(5));
        {
            // The firmware parked this task's data transmission.
            let mut state = ctrl.state.lock().unwrap();
            state.pool.scb_mut(id).xfer_suspended = true;
        }
        ctrl.advance_time(Ticks(6));
        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_ABORT_TASK);

        // The rejected abort must resume the send queue before it is
        // allowed to fail.
        complete(&ctrl, rscb, DlOpcode::OpenReject as u8, [0; 12]);
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CLEAR_NEXUS);
        complete(&ctrl, rscb, DlOpcode::NexusCleared as u8, [0; 12]);

        // ...and the attempt still counts as a failure: promoted.
        let state = ctrl.state.lock().unwrap();
        assert_eq!(state.pool.scb(id).level, LadderLevel::LuReset);
        assert_eq!(state.timed_out.len(), 1);
        drop(state);
        assert!(env.upstream.outcomes().is_empty());
    }

    #[test]
    fn ineligible_rungs_promote_without_posting() {
        let env = TestEnv::new();
        let ctrl =
            Controller::new(env.hal(), small_config(), test_log()).unwrap();
        let port = ctrl.create_port(0b01);
        let tid =
            ctrl.register_target(Transport::Smp, port, true, 3).unwrap();
        let id = submit(&ctrl, tid, 2, Some(5));
        ctrl.advance_time(Ticks(6));

        // Abort and LU reset are meaningless for an SMP target; each pass
        // promotes synthetically without posting anything.
        ctrl.recover_timed_out_commands();
        assert!(recovery_scb(&ctrl).is_none());
        ctrl.recover_timed_out_commands();
        assert!(recovery_scb(&ctrl).is_none());
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.pool.scb(id).level, LadderLevel::DeviceReset);
        }

        // Device reset goes through the expander.
        ctrl.recover_timed_out_commands();
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_INITIATE_SMP_TASK);
        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.pool.scb(rscb).payload[0], 3);
        }
        complete(&ctrl, rscb, DlOpcode::SmpComplete as u8, [0; 12]);
        // Error-log report, then a no-op to confirm the expander is alive.
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_INITIATE_SMP_TASK);
        complete(&ctrl, rscb, DlOpcode::SmpComplete as u8, [0; 12]);
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_INITIATE_SMP_TASK);
        complete(&ctrl, rscb, DlOpcode::SmpComplete as u8, [0; 12]);
        let (rscb, op) = recovery_scb(&ctrl).unwrap();
        assert_eq!(op, SCB_CLEAR_NEXUS);
        complete(&ctrl, rscb, DlOpcode::NexusCleared as u8, [0; 12]);

        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::ResetCleared]);
    }

    #[test]
    fn device_requested_abort_queues_escalation() {
        let (ctrl, _env, tid) = setup();
        let id = submit(&ctrl, tid, 77, None);
        let active_before = ctrl.census().active;

        let edb = {
            let state = ctrl.state.lock().unwrap();
            // Find a posted empty buffer.
            (0..state.pool.total() as u16)
                .map(ScbId)
                .find(|s| {
                    let scb = state.pool.scb(*s);
                    scb.flags.contains(ScbFlags::INTERNAL)
                        && scb.opcode == crate::bits::SCB_EMPTY
                })
                .unwrap()
        };
        let conn = edb_conn(&ctrl, tid);

        let mut entry =
            DoneListEntry::new(edb.0, EdbSubOpcode::ReqTaskAbort as u8);
        entry.status_block[0..2].copy_from_slice(&conn.to_le_bytes());
        entry.status_block[2..4].copy_from_slice(&77u16.to_le_bytes());
        ctrl.hw_produce(entry);
        ctrl.process_completions();

        {
            let state = ctrl.state.lock().unwrap();
            assert_eq!(state.timed_out.len(), 1);
            assert_eq!(state.pool.scb(id).owner, Owner::TimedOut);
            // The consumed buffer went straight back down.
            assert_eq!(state.pool.scb(edb).owner, Owner::Active);
        }
        assert_eq!(ctrl.census().active, active_before - 1);
    }

    #[test]
    fn device_requested_reset_skips_lower_rungs() {
        let (ctrl, _env, tid) = setup();
        let id = submit(&ctrl, tid, 8, None);
        let edb = {
            let state = ctrl.state.lock().unwrap();
            (0..state.pool.total() as u16)
                .map(ScbId)
                .find(|s| {
                    state.pool.scb(*s).flags.contains(ScbFlags::INTERNAL)
                })
                .unwrap()
        };
        let conn = edb_conn(&ctrl, tid);
        let mut entry =
            DoneListEntry::new(edb.0, EdbSubOpcode::ReqDeviceReset as u8);
        entry.status_block[0..2].copy_from_slice(&conn.to_le_bytes());
        ctrl.hw_produce(entry);
        ctrl.process_completions();

        let state = ctrl.state.lock().unwrap();
        assert_eq!(state.pool.scb(id).level, LadderLevel::DeviceReset);
        assert_eq!(state.pool.scb(id).owner, Owner::TimedOut);
    }

    #[test]
    fn unknown_opcode_consumes_slot_only() {
        let (ctrl, env, tid) = setup();
        let id = submit(&ctrl, tid, 1, None);

        ctrl.hw_produce(DoneListEntry::new(id.0, 0x7f));
        ctrl.hw_produce(DoneListEntry::new(id.0, DlOpcode::NoError as u8));
        ctrl.process_completions();

        // The bogus entry was skipped; the real one behind it landed.
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Success]);
    }

    #[test]
    fn completion_racing_timeout_reports_once() {
        let (ctrl, env, tid) = setup();
        let before = ctrl.census();
        let id = submit(&ctrl, tid, 6, Some(5));
        ctrl.advance_time(Ticks(6));

        // The real completion lands after the expiry queued the command
        // but before the worker ran.
        complete(&ctrl, id, DlOpcode::NoError as u8, [0; 12]);
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Success]);
        {
            let state = ctrl.state.lock().unwrap();
            assert!(state
                .pool
                .scb(id)
                .flags
                .contains(ScbFlags::COMPLETED_LATE));
        }

        // The attempt still runs; the device confirms the task is gone and
        // the descriptor is quietly retired with no second report.
        ctrl.recover_timed_out_commands();
        let (rscb, _) = recovery_scb(&ctrl).unwrap();
        complete(&ctrl, rscb, DlOpcode::TmfTaskDone as u8, [0; 12]);

        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Success]);
        assert_eq!(ctrl.census(), before);
        assert_eq!(env.upstream.live_contexts(), 0);
    }

    #[test]
    fn teardown_returns_every_dma_page() {
        let (ctrl, env, tid) = setup();
        let id = submit(&ctrl, tid, 1, None);
        complete(&ctrl, id, DlOpcode::NoError as u8, [0; 12]);
        assert!(env.dma.live() > 0);
        ctrl.teardown();
        assert_eq!(env.dma.live(), 0);
    }

    #[test]
    fn conservation_under_random_load() {
        let (ctrl, env, tid) = setup();
        let total = ctrl.census().total();
        let mut rng = StdRng::seed_from_u64(0x5a5a_1d0e);
        let mut inflight: Vec<ScbId> = Vec::new();
        let mut now = 0u64;
        let mut submitted = 0usize;
        let mut tag = 0u16;

        for _ in 0..40 {
            for _ in 0..rng.gen_range(0..3) {
                if let Some(id) = ctrl.acquire_descriptor() {
                    tag += 1;
                    ctrl.prepare_io(id, tid, [0; 8], tag).unwrap();
                    ctrl.post_with_timeout(id, 5);
                    inflight.push(id);
                    submitted += 1;
                }
            }
            while !inflight.is_empty() && rng.gen_bool(0.5) {
                let idx = rng.gen_range(0..inflight.len());
                let id = inflight.swap_remove(idx);
                complete(&ctrl, id, DlOpcode::NoError as u8, [0; 12]);
            }
            if rng.gen_bool(0.4) {
                // Push everything still outstanding past its deadline and
                // recover it, one attempt per target at a time.
                now += 10;
                ctrl.advance_time(Ticks(now));
                loop {
                    ctrl.recover_timed_out_commands();
                    match recovery_scb(&ctrl) {
                        Some((rscb, _)) => complete(
                            &ctrl,
                            rscb,
                            DlOpcode::TmfComplete as u8,
                            [0; 12],
                        ),
                        None => break,
                    }
                }
                inflight.clear();
            } else {
                now += 1;
                ctrl.advance_time(Ticks(now));
            }
            assert_eq!(ctrl.census().total(), total);
        }

        // Settle the stragglers.
        now += 10;
        ctrl.advance_time(Ticks(now));
        loop {
            ctrl.recover_timed_out_commands();
            match recovery_scb(&ctrl) {
                Some((rscb, _)) => complete(
                    &ctrl,
                    rscb,
                    DlOpcode::TmfComplete as u8,
                    [0; 12],
                ),
                None => break,
            }
        }

        // Exactly one upstream report per submission, and every context
        // handle came back.
        assert_eq!(env.upstream.done().len(), submitted);
        assert_eq!(env.upstream.live_contexts(), 0);
        assert_eq!(ctrl.census().total(), total);
        assert_eq!(ctrl.census().timed_out, 0);
        assert_eq!(ctrl.census().reserved_free, 2);
    }

    #[test]
    fn worker_thread_runs_attempts() {
        let (ctrl, env, tid) = setup();
        let worker = {
            let ctrl = ctrl.clone();
            std::thread::spawn(move || ctrl.run_recovery_worker())
        };

        let _id = submit(&ctrl, tid, 4, Some(2));
        ctrl.advance_time(Ticks(3));

        let rscb = loop {
            if let Some((rscb, op)) = recovery_scb(&ctrl) {
                assert_eq!(op, SCB_ABORT_TASK);
                break rscb;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        complete(&ctrl, rscb, DlOpcode::TmfComplete as u8, [0; 12]);
        assert_eq!(env.upstream.outcomes(), vec![CmdOutcome::Aborted]);

        ctrl.shutdown();
        worker.join().unwrap();
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let env = TestEnv::new();
        let config =
            Config { max_scbs: 16, reserved_scbs: 0, num_edbs: 0, max_ddbs: 8 };
        let ctrl = Controller::new(env.hal(), config, test_log()).unwrap();

        let mut held = Vec::new();
        while let Some(id) = ctrl.acquire_descriptor() {
            held.push(id);
        }
        assert_eq!(held.len(), 16);

        let waiter = {
            let ctrl = ctrl.clone();
            std::thread::spawn(move || ctrl.acquire_descriptor_blocking())
        };
        std::thread::sleep(Duration::from_millis(5));
        ctrl.release_descriptor(held.pop().unwrap());
        assert!(waiter.join().unwrap().is_some());
    }
}
