// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Done List: a fixed ring of completion records written by hardware
//! and consumed by the core. Validity is a single toggle bit that the
//! producer writes and the consumer expects; both flip their expectation
//! once per full traversal, so no read or write of a count is needed to
//! tell new entries from stale ones.

use slog::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::bits::{
    DlOpcode, DoneListEntry, EdbSubOpcode, DL_ENTRY_SIZE, DL_TOGGLE_INIT,
    EDB_OPCODE_FIRST, EDB_OPCODE_LAST, LINK_DEVICE_PRESENT, LINK_ONLINE,
    LINK_RESET_DONE,
};
use crate::controller::CoreState;
use crate::hal::{CmdOutcome, DmaAllocator, DmaChunk, DmaError, FailReason};
use crate::recovery::LadderLevel;
use crate::scb::{Continuation, Owner, ScbFlags, ScbId};
use crate::target::MAX_PHYS;

pub struct DoneRing {
    chunk: DmaChunk,
    size: usize,
    /// Consumer cursor and expected toggle value.
    next: usize,
    toggle: u8,
    /// Producer cursor, driven by the register-level device model.
    hw_next: usize,
    hw_toggle: u8,
}

impl DoneRing {
    pub fn new(
        dma: &dyn DmaAllocator,
        entries: usize,
    ) -> Result<Self, DmaError> {
        let chunk = dma.alloc(entries * DL_ENTRY_SIZE)?;
        Ok(Self {
            chunk,
            size: entries,
            next: 0,
            toggle: DL_TOGGLE_INIT,
            hw_next: 0,
            hw_toggle: DL_TOGGLE_INIT,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Consume the next entry if its toggle marks it valid. The cursor
    /// advances past consumed entries only; the expected toggle flips on
    /// wrap.
    pub fn consume(&mut self) -> Option<DoneListEntry> {
        let off = self.next * DL_ENTRY_SIZE;
        let entry = DoneListEntry::read_from_bytes(
            &self.chunk.bytes()[off..off + DL_ENTRY_SIZE],
        )
        .ok()?;
        if entry.toggle & 1 != self.toggle {
            return None;
        }
        self.next = (self.next + 1) % self.size;
        if self.next == 0 {
            self.toggle ^= 1;
        }
        Some(entry)
    }

    /// Deposit a completion the way the hardware would. The producer owns
    /// the toggle value it writes; callers never set it.
    pub fn hw_produce(&mut self, mut entry: DoneListEntry) {
        entry.toggle = self.hw_toggle;
        let off = self.hw_next * DL_ENTRY_SIZE;
        self.chunk.bytes_mut()[off..off + DL_ENTRY_SIZE]
            .copy_from_slice(entry.as_bytes());
        self.hw_next = (self.hw_next + 1) % self.size;
        if self.hw_next == 0 {
            self.hw_toggle ^= 1;
        }
    }

    /// Surrender the backing DMA page at teardown.
    pub fn take_chunk(&mut self) -> DmaChunk {
        self.size = 0;
        std::mem::replace(
            &mut self.chunk,
            DmaChunk::new(Box::new([]), crate::hal::PhysAddr(0)),
        )
    }
}

impl CoreState {
    /// Drain every valid entry from the ring. Runs to quiescence under the
    /// state lock; the guard catches any path that would re-enter it from
    /// inside a dispatch.
    pub(crate) fn drain_done_ring(&mut self) {
        assert!(!self.in_drain, "re-entered completion drain");
        self.in_drain = true;
        while let Some(entry) = self.ring.consume() {
            self.dispatch_entry(entry);
        }
        self.in_drain = false;
    }

    fn dispatch_entry(&mut self, entry: DoneListEntry) {
        let index = { entry.index };
        if (EDB_OPCODE_FIRST..=EDB_OPCODE_LAST).contains(&entry.opcode) {
            self.handle_edb_event(&entry);
            return;
        }
        let Some(op) = DlOpcode::from_repr(entry.opcode) else {
            // Unknown opcodes consume their ring slot and nothing else.
            warn!(self.log, "unrecognized completion opcode; skipping";
                "opcode" => entry.opcode, "index" => index);
            return;
        };

        let id = match self.pool.lookup(index) {
            Some(scb) => match scb.owner {
                Owner::Active | Owner::TimedOut => scb.id,
                other => panic!(
                    "completion for descriptor {index} in state {other:?}"
                ),
            },
            None => {
                panic!("completion names nonexistent descriptor {index}")
            }
        };
        self.pool.scb_mut(id).flags.remove(ScbFlags::PENDING);

        if op == DlOpcode::ControlPhy {
            self.handle_link_event(&entry);
            // Link bookkeeping always runs; the continuation fires only
            // for descriptors the core posted for itself.
            let flags = self.pool.scb(id).flags;
            if !flags
                .intersects(ScbFlags::IN_RECOVERY | ScbFlags::INTERNAL)
            {
                return;
            }
        }

        match self.pool.scb_mut(id).stack.pop() {
            None => {
                // The owning chain was torn down by a timeout before this
                // completion arrived.
                warn!(self.log, "completion after chain teardown; dropped";
                    "scb" => id.0, "opcode" => %op);
                self.pool.remove_pending(id);
                self.release_scb(id);
            }
            Some(Continuation::Io) => self.finish_io(id, &entry, op),
            Some(Continuation::Recovery(resume)) => {
                self.recovery_step_complete(id, resume, op)
            }
        }
    }

    /// Terminal completion of an ordinary command.
    fn finish_io(&mut self, id: ScbId, entry: &DoneListEntry, op: DlOpcode) {
        if let Some(t) = self.pool.scb_mut(id).timer.take() {
            self.timers.cancel(t);
        }
        self.pool.remove_pending(id);
        let outcome = outcome_of(op, &entry.status_block);
        let (owner, in_recovery, pctx) = {
            let scb = self.pool.scb_mut(id);
            scb.flags.remove(ScbFlags::ACTIVE);
            (
                scb.owner,
                scb.flags.contains(ScbFlags::IN_RECOVERY),
                scb.platform_ctx,
            )
        };
        if owner == Owner::TimedOut {
            // The completion raced the timeout. Report it now; the
            // descriptor itself stays owned until the recovery attempt
            // already chasing it observes the flag and lets go.
            debug!(self.log, "completion raced a timeout";
                "scb" => id.0, "in_recovery" => in_recovery);
            self.pool.scb_mut(id).flags.insert(ScbFlags::COMPLETED_LATE);
            self.hal.upstream.command_done(pctx, outcome);
        } else {
            self.hal.upstream.command_done(pctx, outcome);
            self.release_scb(id);
        }
    }

    /// An empty-buffer event: the hardware consumed one of the posted
    /// buffers to announce something asynchronous. The buffer goes back
    /// down immediately so the supply never shrinks.
    fn handle_edb_event(&mut self, entry: &DoneListEntry) {
        let Some(sub) = EdbSubOpcode::from_repr(entry.opcode) else {
            return;
        };
        match sub {
            EdbSubOpcode::ReqTaskAbort => {
                let conn = u16::from_le_bytes([
                    entry.status_block[0],
                    entry.status_block[1],
                ]);
                let tag = u16::from_le_bytes([
                    entry.status_block[2],
                    entry.status_block[3],
                ]);
                match self.pending_match(conn, Some(tag)) {
                    Some(id) => {
                        warn!(self.log, "device requested task abort";
                            "conn" => conn, "tag" => tag);
                        if let Some(t) = self.pool.scb_mut(id).timer.take() {
                            self.timers.cancel(t);
                        }
                        self.escalate(id);
                    }
                    None => warn!(self.log,
                        "task-abort request matched no pending command";
                        "conn" => conn, "tag" => tag),
                }
            }
            EdbSubOpcode::ReqDeviceReset => {
                let conn = u16::from_le_bytes([
                    entry.status_block[0],
                    entry.status_block[1],
                ]);
                match self.pending_match(conn, None) {
                    Some(id) => {
                        warn!(self.log, "device requested reset";
                            "conn" => conn);
                        if let Some(t) = self.pool.scb_mut(id).timer.take() {
                            self.timers.cancel(t);
                        }
                        // The request skips the ladder's lower rungs.
                        self.pool.scb_mut(id).level =
                            LadderLevel::DeviceReset;
                        self.escalate(id);
                    }
                    None => warn!(self.log,
                        "device-reset request matched no pending command";
                        "conn" => conn),
                }
            }
            other => {
                debug!(self.log, "asynchronous event"; "kind" => %other);
            }
        }

        // Hand the buffer back to the hardware in place.
        let edb = ScbId(entry.index);
        let regs = self.hal.regs.clone();
        self.pool.post(edb, regs.as_ref());
    }

    fn pending_match(&self, conn: u16, tag: Option<u16>) -> Option<ScbId> {
        self.pool
            .pending()
            .iter()
            .copied()
            .find(|id| {
                let scb = self.pool.scb(*id);
                scb.conn_handle == conn
                    && tag.map(|t| scb.tag == t).unwrap_or(true)
            })
    }

    fn handle_link_event(&mut self, entry: &DoneListEntry) {
        let phy = entry.status_block[0] as usize;
        let bits = entry.status_block[1];
        if phy >= MAX_PHYS {
            warn!(self.log, "link event for out-of-range phy";
                "phy" => phy);
            return;
        }
        let state = &mut self.phys[phy];
        if bits & LINK_RESET_DONE != 0 {
            state.reset_done = true;
        }
        state.online = bits & LINK_ONLINE != 0;
        state.device_present = bits & LINK_DEVICE_PRESENT != 0;
        debug!(self.log, "link state updated"; "phy" => phy,
            "online" => state.online,
            "device_present" => state.device_present);
    }
}

/// Map a completion opcode (and its status sub-block) to the disposition
/// reported upstream.
fn outcome_of(op: DlOpcode, status: &[u8]) -> CmdOutcome {
    match op {
        DlOpcode::NoError | DlOpcode::SspResp | DlOpcode::AtaResp => {
            CmdOutcome::Success
        }
        DlOpcode::Underrun => {
            let residual =
                u32::from_le_bytes([status[0], status[1], status[2], status[3]]);
            CmdOutcome::Underrun(residual)
        }
        DlOpcode::Overrun => CmdOutcome::Overrun,
        DlOpcode::TaskCleared | DlOpcode::NexusCleared => {
            CmdOutcome::ResetCleared
        }
        DlOpcode::OpenReject => CmdOutcome::Failed(FailReason::OpenReject),
        DlOpcode::OpenTimeout => CmdOutcome::Failed(FailReason::OpenTimeout),
        DlOpcode::Nak => CmdOutcome::Failed(FailReason::Nak),
        DlOpcode::AckNakTimeout | DlOpcode::UnitAckNakTimeout => {
            CmdOutcome::Failed(FailReason::AckNakTimeout)
        }
        DlOpcode::Break => CmdOutcome::Failed(FailReason::Break),
        DlOpcode::ProtoErr => CmdOutcome::Failed(FailReason::ProtocolError),
        DlOpcode::SmpRespTimeout => {
            CmdOutcome::Failed(FailReason::SmpTimeout)
        }
        DlOpcode::TmfNoConn => CmdOutcome::Failed(FailReason::NexusGone),
        _ => CmdOutcome::Failed(FailReason::ProtocolError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::FakeDma;

    #[test]
    fn empty_ring_yields_nothing() {
        let dma = FakeDma::default();
        let mut ring = DoneRing::new(&dma, 4).unwrap();
        assert!(ring.consume().is_none());
    }

    #[test]
    fn produce_then_consume_in_order() {
        let dma = FakeDma::default();
        let mut ring = DoneRing::new(&dma, 4).unwrap();
        ring.hw_produce(DoneListEntry::new(7, 0x00));
        ring.hw_produce(DoneListEntry::new(9, 0x14));
        let a = ring.consume().unwrap();
        let b = ring.consume().unwrap();
        assert_eq!(({ a.index }, a.opcode), (7, 0x00));
        assert_eq!(({ b.index }, b.opcode), (9, 0x14));
        assert!(ring.consume().is_none());
    }

    #[test]
    fn toggle_flips_across_wraps() {
        let dma = FakeDma::default();
        let mut ring = DoneRing::new(&dma, 4).unwrap();
        // Three full traversals: stale entries from the previous lap must
        // never be mistaken for fresh ones.
        for lap in 0..3u16 {
            for i in 0..4u16 {
                ring.hw_produce(DoneListEntry::new(lap * 4 + i, 0x00));
            }
            for i in 0..4u16 {
                let e = ring.consume().unwrap();
                assert_eq!({ e.index }, lap * 4 + i);
            }
            assert!(ring.consume().is_none());
        }
    }

    #[test]
    fn partial_lap_consumption() {
        let dma = FakeDma::default();
        let mut ring = DoneRing::new(&dma, 8).unwrap();
        ring.hw_produce(DoneListEntry::new(1, 0x00));
        assert!(ring.consume().is_some());
        assert!(ring.consume().is_none());
        ring.hw_produce(DoneListEntry::new(2, 0x00));
        ring.hw_produce(DoneListEntry::new(3, 0x00));
        assert_eq!(ring.consume().map(|e| { e.index }), Some(2));
        assert_eq!(ring.consume().map(|e| { e.index }), Some(3));
        assert!(ring.consume().is_none());
    }

    #[test]
    fn outcome_mapping() {
        let mut status = [0u8; 12];
        status[0..4].copy_from_slice(&512u32.to_le_bytes());
        assert_eq!(
            outcome_of(DlOpcode::Underrun, &status),
            CmdOutcome::Underrun(512)
        );
        assert_eq!(
            outcome_of(DlOpcode::TaskCleared, &status),
            CmdOutcome::ResetCleared
        );
        assert_eq!(
            outcome_of(DlOpcode::OpenReject, &status),
            CmdOutcome::Failed(FailReason::OpenReject)
        );
    }
}
