// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborator interfaces. The core consumes the host bus, DMA memory,
//! and the platform command layer only through these seams; everything
//! behind them (PCI enumeration, IOMMU mappings, the generic SCSI layer)
//! is out of scope.

use std::sync::Arc;

use thiserror::Error;

/// A physical address as the hardware sees it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    pub fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("DMA allocation of {0} bytes failed")]
    Exhausted(usize),
}

/// One allocation of hardware-visible memory: the CPU-side bytes together
/// with the physical address the hardware will use to reach them.
pub struct DmaChunk {
    bytes: Box<[u8]>,
    pa: PhysAddr,
}

impl DmaChunk {
    pub fn new(bytes: Box<[u8]>, pa: PhysAddr) -> Self {
        Self { bytes, pa }
    }
    pub fn pa(&self) -> PhysAddr {
        self.pa
    }
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Byte/word/dword access to the device register window.
pub trait RegIo: Send + Sync {
    fn read8(&self, off: u32) -> u8;
    fn read16(&self, off: u32) -> u16;
    fn read32(&self, off: u32) -> u32;
    fn write8(&self, off: u32, val: u8);
    fn write16(&self, off: u32, val: u16);
    fn write32(&self, off: u32, val: u32);
}

/// Allocation of DMA-visible memory, page-granular for this core.
pub trait DmaAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> Result<DmaChunk, DmaError>;
    fn free(&self, chunk: DmaChunk);
}

/// Terminal disposition of a command, reported upstream exactly once.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CmdOutcome {
    Success,
    /// Transfer shorter than requested; carries the residual byte count.
    Underrun(u32),
    Overrun,
    /// The command was aborted by the recovery ladder.
    Aborted,
    /// A reset cleared the command before it could run to completion.
    ResetCleared,
    Failed(FailReason),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailReason {
    OpenReject,
    OpenTimeout,
    Nak,
    AckNakTimeout,
    Break,
    ProtocolError,
    SmpTimeout,
    NexusGone,
    /// Every rung of the escalation ladder failed.
    RecoveryExhausted,
}

/// Upcalls into the platform layer that owns command lifetimes above this
/// core. The opaque context mirrors the per-OS per-command bookkeeping the
/// platform attaches to each descriptor.
pub trait Upstream: Send + Sync {
    fn alloc_cmd_context(&self) -> u64;
    fn free_cmd_context(&self, ctx: u64);
    fn command_done(&self, ctx: u64, outcome: CmdOutcome);
}

/// The bundle of collaborator handles threaded through the controller.
#[derive(Clone)]
pub struct Hal {
    pub regs: Arc<dyn RegIo>,
    pub dma: Arc<dyn DmaAllocator>,
    pub upstream: Arc<dyn Upstream>,
}
