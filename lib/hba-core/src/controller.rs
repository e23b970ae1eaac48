// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller: one lock over all command-execution state, condvars for
//! descriptor availability and the recovery worker, and the public surface
//! the platform drives. Completions, timer expirations, and escalation all
//! mutate state under the same lock, so there is a single arbiter of every
//! descriptor transition.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use slog::{info, o, Logger};
use thiserror::Error;

use crate::bits::{
    done_ring_size, DoneListEntry, SCB_EMPTY, SCB_INITIATE_ATA_TASK,
    SCB_INITIATE_SMP_TASK, SCB_INITIATE_SSP_TASK,
};
use crate::ddb::{DdbAllocator, DdbError, DdbIndex};
use crate::done::DoneRing;
use crate::hal::{DmaError, Hal};
use crate::pool::{Census, PoolError, ScbPool};
use crate::scb::{Continuation, ScbFlags, ScbId};
use crate::target::{
    LinkState, Port, PortId, Target, TargetId, Transport, MAX_PHYS,
};
use crate::timer::{Ticks, TimerKind, TimerWheel};

#[derive(Debug, Error)]
pub enum HbaError {
    #[error("no such target {0}")]
    UnknownTarget(u16),
    #[error("target {0} has a recovery attempt in progress")]
    TargetBusy(u16),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Ddb(#[from] DdbError),
    #[error(transparent)]
    Dma(#[from] DmaError),
}

#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Ceiling on pool growth.
    pub max_scbs: usize,
    /// Descriptors set aside for recovery chains.
    pub reserved_scbs: usize,
    /// Empty buffers kept posted for asynchronous events.
    pub num_edbs: usize,
    /// Hardware connection-context slots.
    pub max_ddbs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { max_scbs: 512, reserved_scbs: 4, num_edbs: 7, max_ddbs: 128 }
    }
}

pub(crate) struct CoreState {
    pub(crate) pool: ScbPool,
    pub(crate) ring: DoneRing,
    pub(crate) ddb: DdbAllocator,
    pub(crate) targets: Vec<Option<Target>>,
    pub(crate) ports: Vec<Port>,
    pub(crate) phys: [LinkState; MAX_PHYS],
    /// Commands awaiting a recovery attempt, oldest first.
    pub(crate) timed_out: VecDeque<ScbId>,
    pub(crate) timers: TimerWheel,
    /// Wakeup count for the recovery worker; reset to zero per pass.
    pub(crate) worker_pending: u32,
    pub(crate) shutdown: bool,
    pub(crate) in_drain: bool,
    pub(crate) hal: Hal,
    pub(crate) log: Logger,
}

impl CoreState {
    pub(crate) fn target(&self, tid: TargetId) -> Option<&Target> {
        self.targets.get(tid.0 as usize).and_then(|t| t.as_ref())
    }

    pub(crate) fn target_mut(&mut self, tid: TargetId) -> Option<&mut Target> {
        self.targets.get_mut(tid.0 as usize).and_then(|t| t.as_mut())
    }

    /// Return a descriptor to its free list, first giving back any platform
    /// context and cancelling a still-armed timer.
    pub(crate) fn release_scb(&mut self, id: ScbId) {
        if let Some(t) = self.pool.scb_mut(id).timer.take() {
            self.timers.cancel(t);
        }
        let pctx = std::mem::take(&mut self.pool.scb_mut(id).platform_ctx);
        if pctx != 0 {
            self.hal.upstream.free_cmd_context(pctx);
        }
        self.pool.release(id);
    }
}

pub struct Controller {
    pub(crate) state: Mutex<CoreState>,
    worker_cv: Condvar,
    pool_cv: Condvar,
}

impl Controller {
    pub fn new(
        hal: Hal,
        config: Config,
        log: Logger,
    ) -> Result<Arc<Self>, HbaError> {
        let mut pool = ScbPool::new(
            hal.dma.as_ref(),
            config.max_scbs,
            config.reserved_scbs,
            log.new(o!("unit" => "pool")),
        )?;
        // A warm restart must not desynchronize the doorbell protocol.
        pool.resync_producer(hal.regs.as_ref());

        let ring = DoneRing::new(
            hal.dma.as_ref(),
            done_ring_size(config.max_scbs, config.num_edbs),
        )?;

        let mut state = CoreState {
            pool,
            ring,
            ddb: DdbAllocator::new(config.max_ddbs),
            targets: Vec::new(),
            ports: Vec::new(),
            phys: [LinkState::default(); MAX_PHYS],
            timed_out: VecDeque::new(),
            timers: TimerWheel::default(),
            worker_pending: 0,
            shutdown: false,
            in_drain: false,
            hal,
            log,
        };

        // Keep a standing supply of empty buffers posted for asynchronous
        // events. These stay active for the life of the controller and are
        // re-posted in place as the hardware consumes them.
        for _ in 0..config.num_edbs {
            let dma = state.hal.dma.clone();
            let id = state
                .pool
                .acquire(false, dma.as_ref())
                .ok_or(PoolError::Full)?;
            let scb = state.pool.scb_mut(id);
            scb.opcode = SCB_EMPTY;
            scb.flags.insert(ScbFlags::INTERNAL);
            let regs = state.hal.regs.clone();
            state.pool.post(id, regs.as_ref());
        }

        info!(state.log, "controller initialized";
            "scbs" => state.pool.total(),
            "ring_entries" => state.ring.size(),
            "edbs" => config.num_edbs);

        Ok(Arc::new(Self {
            state: Mutex::new(state),
            worker_cv: Condvar::new(),
            pool_cv: Condvar::new(),
        }))
    }

    /// Take a descriptor from the general pool, growing it if needed.
    /// `None` is transient exhaustion; see
    /// [`Controller::acquire_descriptor_blocking`] for the waiting variant.
    pub fn acquire_descriptor(&self) -> Option<ScbId> {
        let mut state = self.state.lock().unwrap();
        let dma = state.hal.dma.clone();
        let id = state.pool.acquire(false, dma.as_ref())?;
        let pctx = state.hal.upstream.alloc_cmd_context();
        state.pool.scb_mut(id).platform_ctx = pctx;
        Some(id)
    }

    /// As [`Controller::acquire_descriptor`], but block until one frees up.
    /// Returns `None` only at shutdown.
    pub fn acquire_descriptor_blocking(&self) -> Option<ScbId> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return None;
            }
            let dma = state.hal.dma.clone();
            if let Some(id) = state.pool.acquire(false, dma.as_ref()) {
                let pctx = state.hal.upstream.alloc_cmd_context();
                state.pool.scb_mut(id).platform_ctx = pctx;
                return Some(id);
            }
            state = self.pool_cv.wait(state).unwrap();
        }
    }

    /// Return an unposted descriptor.
    pub fn release_descriptor(&self, id: ScbId) {
        self.state.lock().unwrap().release_scb(id);
        self.pool_cv.notify_all();
    }

    /// Fill in an acquired descriptor as an ordinary task for `target` and
    /// arm its terminal continuation. The opcode follows the target's
    /// transport.
    pub fn prepare_io(
        &self,
        id: ScbId,
        target: TargetId,
        lun: [u8; 8],
        tag: u16,
    ) -> Result<(), HbaError> {
        let mut state = self.state.lock().unwrap();
        let (conn, transport) = state
            .target(target)
            .map(|t| (t.ddb.0, t.transport))
            .ok_or(HbaError::UnknownTarget(target.0))?;
        let scb = state.pool.scb_mut(id);
        scb.target = Some(target);
        scb.lun = lun;
        scb.tag = tag;
        scb.conn_handle = conn;
        scb.opcode = match transport {
            Transport::Ssp => SCB_INITIATE_SSP_TASK,
            Transport::Stp => SCB_INITIATE_ATA_TASK,
            Transport::Smp => SCB_INITIATE_SMP_TASK,
        };
        scb.stack.push(Continuation::Io);
        Ok(())
    }

    /// Post a prepared descriptor to the hardware.
    pub fn post(&self, id: ScbId) {
        let mut state = self.state.lock().unwrap();
        let regs = state.hal.regs.clone();
        state.pool.post(id, regs.as_ref());
    }

    /// Post with a completion deadline; expiry queues the command for
    /// escalation.
    pub fn post_with_timeout(&self, id: ScbId, ticks: u64) {
        let mut state = self.state.lock().unwrap();
        let timer = state.timers.arm(ticks, TimerKind::CommandExpiry(id));
        state.pool.scb_mut(id).timer = Some(timer);
        let regs = state.hal.regs.clone();
        state.pool.post(id, regs.as_ref());
    }

    /// Drain the Done List to quiescence.
    pub fn process_completions(&self) {
        self.state.lock().unwrap().drain_done_ring();
        self.worker_cv.notify_all();
        self.pool_cv.notify_all();
    }

    /// Deposit a completion as the hardware would. Register-level device
    /// models and tests drive the ring through this.
    pub fn hw_produce(&self, entry: DoneListEntry) {
        self.state.lock().unwrap().ring.hw_produce(entry);
    }

    /// Advance logical time, folding every expiry that fired into the same
    /// serialized boundary completions use.
    pub fn advance_time(&self, to: Ticks) {
        let mut state = self.state.lock().unwrap();
        let fired = state.timers.advance(to);
        for kind in fired {
            match kind {
                TimerKind::CommandExpiry(id) => state.command_timed_out(id),
                TimerKind::RecoveryExpiry(id) => state.recovery_timed_out(id),
            }
        }
        drop(state);
        self.worker_cv.notify_all();
        self.pool_cv.notify_all();
    }

    /// One synchronous recovery pass over the escalation queue. The
    /// blocking equivalent is [`Controller::run_recovery_worker`].
    pub fn recover_timed_out_commands(&self) {
        let mut state = self.state.lock().unwrap();
        state.worker_pending = 0;
        state.recover_timed_out();
        drop(state);
        self.pool_cv.notify_all();
    }

    /// Recovery worker loop: park until something lands on the escalation
    /// queue, run a pass, repeat until shutdown. Intended to be the body of
    /// a dedicated thread.
    pub fn run_recovery_worker(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            while state.worker_pending == 0 && !state.shutdown {
                state = self.worker_cv.wait(state).unwrap();
            }
            if state.shutdown {
                return;
            }
            state.worker_pending = 0;
            state.recover_timed_out();
        }
    }

    pub fn shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.worker_cv.notify_all();
        self.pool_cv.notify_all();
    }

    pub fn allocate_ddb(&self) -> Result<DdbIndex, HbaError> {
        Ok(self.state.lock().unwrap().ddb.alloc()?)
    }

    pub fn free_ddb(&self, ddb: DdbIndex) -> Result<(), HbaError> {
        Ok(self.state.lock().unwrap().ddb.free(ddb)?)
    }

    /// Declare a port built from the given phy mask.
    pub fn create_port(&self, conn_mask: u8) -> PortId {
        let mut state = self.state.lock().unwrap();
        let id = PortId(state.ports.len() as u8);
        state.ports.push(Port { id, conn_mask });
        id
    }

    /// Bring a target under management, binding it a connection-context
    /// slot.
    pub fn register_target(
        &self,
        transport: Transport,
        port: PortId,
        behind_expander: bool,
        expander_phy: u8,
    ) -> Result<TargetId, HbaError> {
        let mut state = self.state.lock().unwrap();
        let ddb = state.ddb.alloc()?;
        let slot = match state.targets.iter().position(|t| t.is_none()) {
            Some(slot) => slot,
            None => {
                state.targets.push(None);
                state.targets.len() - 1
            }
        };
        let id = TargetId(slot as u16);
        state.targets[slot] = Some(Target {
            id,
            ddb,
            port,
            transport,
            behind_expander,
            expander_phy,
            freeze_count: 0,
            in_recovery: false,
        });
        info!(state.log, "target registered"; "target" => id.0,
            "transport" => %transport, "ddb" => ddb.0);
        Ok(id)
    }

    /// Tear a target down and recycle its connection-context slot. Refused
    /// while a recovery attempt holds the target.
    pub fn remove_target(&self, tid: TargetId) -> Result<(), HbaError> {
        let mut state = self.state.lock().unwrap();
        let target = state
            .target(tid)
            .ok_or(HbaError::UnknownTarget(tid.0))?;
        if target.in_recovery {
            return Err(HbaError::TargetBusy(tid.0));
        }
        let ddb = target.ddb;
        state.ddb.free(ddb)?;
        state.targets[tid.0 as usize] = None;
        info!(state.log, "target removed"; "target" => tid.0);
        Ok(())
    }

    pub fn census(&self) -> Census {
        self.state.lock().unwrap().pool.census()
    }

    pub fn link_state(&self, phy: usize) -> LinkState {
        self.state.lock().unwrap().phys[phy]
    }

    pub fn target_frozen(&self, tid: TargetId) -> bool {
        self.state
            .lock()
            .unwrap()
            .target(tid)
            .map(|t| t.frozen())
            .unwrap_or(false)
    }

    /// Final teardown: verify descriptor conservation and hand every DMA
    /// page back to the allocator.
    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        assert_eq!(
            state.pool.census().total(),
            state.pool.total(),
            "descriptor census out of balance at teardown"
        );
        let dma = state.hal.dma.clone();
        for chunk in state.pool.drain_dma_chunks() {
            dma.free(chunk);
        }
        dma.free(state.ring.take_chunk());
        drop(state);
        self.worker_cv.notify_all();
        self.pool_cv.notify_all();
    }
}
