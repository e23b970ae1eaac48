// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-format constants shared with the hardware command processor: SCB
//! opcodes, Done List completion opcodes, register offsets, and the
//! DMA-visible record layouts.

use strum::FromRepr;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of one hardware command record (SCB) in DMA-visible memory.
pub const SCB_RECORD_SIZE: usize = 128;

/// Payload bytes available in a hardware record after the fixed header.
pub const HW_SCB_PAYLOAD: usize = SCB_RECORD_SIZE - 16;

/// Size of one Done List entry.
pub const DL_ENTRY_SIZE: usize = 16;

/// Bytes of status sub-block carried by a Done List entry.
pub const DL_STATUS_BLOCK_SIZE: usize = 12;

/// One scatter/gather element.
pub const SG_ELEMENT_SIZE: usize = 16;

/// Scatter/gather elements reserved per descriptor.
pub const SG_TABLE_ENTRIES: usize = 16;

/// Bytes of scatter/gather storage per descriptor.
pub const SG_TABLE_SIZE: usize = SG_ELEMENT_SIZE * SG_TABLE_ENTRIES;

/// Size of one page of hardware-visible memory. Pool growth is performed in
/// whole pages for both the record array and the scatter/gather storage.
pub const PAGE_SIZE: usize = 4096;

/// Hardware records per page of DMA memory.
pub const RECORDS_PER_PAGE: usize = PAGE_SIZE / SCB_RECORD_SIZE;

/// Scatter/gather tables per page of DMA memory.
pub const SG_TABLES_PER_PAGE: usize = PAGE_SIZE / SG_TABLE_SIZE;

/// Initial value of the Done List toggle bit after controller reset. It
/// flips exactly once per full traversal of the ring.
pub const DL_TOGGLE_INIT: u8 = 1;

/// Register window offsets (dword-aligned).
///
/// The producer count is written after every post; the consumer count is
/// read back once at initialization to resynchronize the producer (the low
/// 16 bits are significant).
pub const REG_SCB_PRODUCER: u32 = 0xb0;
pub const REG_SCB_CONSUMER: u32 = 0xb4;

/// SCB opcodes accepted by the command processor.
pub const SCB_INITIATE_SSP_TASK: u8 = 0x00;
pub const SCB_INITIATE_LONG_SSP_TASK: u8 = 0x01;
pub const SCB_ABORT_TASK: u8 = 0x03;
pub const SCB_INITIATE_SSP_TMF: u8 = 0x04;
pub const SCB_QUERY_SSP_TASK: u8 = 0x08;
pub const SCB_INITIATE_ATA_TASK: u8 = 0x09;
pub const SCB_CONTROL_ATA_DEV: u8 = 0x0b;
pub const SCB_INITIATE_SMP_TASK: u8 = 0x0c;
pub const SCB_CONTROL_PHY: u8 = 0x0e;
pub const SCB_CLEAR_NEXUS: u8 = 0x0f;

/// Buffer-supply opcode: posts of this opcode hand an empty data buffer to
/// the hardware and do not join the pending set.
pub const SCB_EMPTY: u8 = 0xc0;

/// Task-management function codes carried in an `INITIATE_SSP_TMF` payload.
pub const TMF_ABORT_TASK: u8 = 0x01;
pub const TMF_LU_RESET: u8 = 0x08;

/// Clear-nexus granularity selectors.
pub const CLEAR_NEXUS_I_T: u8 = 0x00;
pub const CLEAR_NEXUS_I_T_L: u8 = 0x01;

/// Clear-nexus directive bits (payload byte 1).
pub const NEXUS_RESUME: u8 = 0x01;
pub const NEXUS_SUSPEND: u8 = 0x02;

/// Phy-control sub-operations (payload byte 1 of `CONTROL_PHY`).
pub const PHY_HARD_RESET: u8 = 0x01;
pub const PHY_LINK_RESET: u8 = 0x02;
pub const PHY_NO_OP: u8 = 0x03;
pub const PHY_REPORT: u8 = 0x04;

/// Link-state bits reported in the status sub-block of a `ControlPhy`
/// completion (byte 1; byte 0 carries the phy identifier).
pub const LINK_RESET_DONE: u8 = 0x01;
pub const LINK_ONLINE: u8 = 0x02;
pub const LINK_DEVICE_PRESENT: u8 = 0x04;

/// Done List completion opcodes.
///
/// `Tc*` are task completions, `Tf*` transport-level failures, `Ti*`
/// transport interruptions, and `Tu*` unit-level timeouts. The
/// 0xc1..=0xc7 sub-range is reserved for empty-buffer (EDB) events and is
/// represented separately by [`EdbSubOpcode`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromRepr, strum::Display)]
#[repr(u8)]
pub enum DlOpcode {
    NoError = 0x00,
    Underrun = 0x01,
    Overrun = 0x02,
    OpenTimeout = 0x03,
    OpenReject = 0x04,
    Break = 0x05,
    ProtoErr = 0x06,
    SspResp = 0x07,
    Nak = 0x08,
    Resume = 0x09,
    AckNakTimeout = 0x0a,
    SmpRespTimeout = 0x0b,
    AtaResp = 0x0d,
    UnitAckNakTimeout = 0x0e,
    TaskCleared = 0x10,
    /// Abort/query found no such task on the device.
    TmfNoTask = 0x11,
    /// The task had already run to completion when the abort arrived.
    TmfTaskDone = 0x12,
    /// The nexus addressed by a task-management command is gone.
    TmfNoConn = 0x13,
    /// Task-management function completed successfully.
    TmfComplete = 0x14,
    /// Clear-nexus command finished flushing the firmware queue.
    NexusCleared = 0x15,
    /// SMP request/response exchange finished.
    SmpComplete = 0x16,
    /// Control-link (phy) command completion.
    ControlPhy = 0x40,
}

/// Sub-opcodes of the reserved empty-buffer completion range. Each one
/// announces an asynchronous event whose payload was deposited into the
/// posted empty buffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromRepr, strum::Display)]
#[repr(u8)]
pub enum EdbSubOpcode {
    DataBytes = 0xc1,
    PrimitiveReceived = 0xc2,
    PhyEvent = 0xc3,
    LinkResetError = 0xc4,
    TimerEvent = 0xc5,
    ReqTaskAbort = 0xc6,
    ReqDeviceReset = 0xc7,
}

/// First and last opcode of the EDB sub-range.
pub const EDB_OPCODE_FIRST: u8 = 0xc1;
pub const EDB_OPCODE_LAST: u8 = 0xc7;

/// A command record as laid out in hardware-visible memory.
///
/// The hardware fetches the record at the physical address it was last told
/// about and follows `next_pa` to find the one after that; the pool
/// maintains a sentinel record outside the normal rotation so this
/// expectation is always satisfiable (see `pool::ScbPool::post`).
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct HwScbRecord {
    /// Physical address of the next record the hardware should fetch.
    pub next_pa: u64,

    /// Dense descriptor identity; echoed back in the Done List entry.
    pub index: u16,

    /// SCB opcode.
    pub opcode: u8,

    /// Record-level flags (currently unused by the core).
    pub flags: u8,

    /// Hardware connection-context slot (DDB index) of the addressed
    /// target, or 0 for commands with no nexus.
    pub conn_handle: u16,

    pub rsvd: u16,

    /// Protocol-specific command block.
    pub payload: [u8; HW_SCB_PAYLOAD],
}

/// A completion record as written by hardware into the Done List ring.
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct DoneListEntry {
    /// Identity of the descriptor this completion belongs to.
    pub index: u16,

    /// Completion opcode; see [`DlOpcode`] and [`EdbSubOpcode`].
    pub opcode: u8,

    /// Opaque status sub-block, interpreted per opcode.
    pub status_block: [u8; DL_STATUS_BLOCK_SIZE],

    /// Validity toggle (bit 0). An entry is consumable only while this
    /// matches the consumer's expected value.
    pub toggle: u8,
}

impl DoneListEntry {
    pub fn new(index: u16, opcode: u8) -> Self {
        Self {
            index,
            opcode,
            status_block: [0; DL_STATUS_BLOCK_SIZE],
            toggle: 0,
        }
    }
}

/// Number of entries in the Done List ring: every descriptor and every
/// empty-buffer event must be representable simultaneously, rounded up to a
/// power of two no smaller than 4.
pub fn done_ring_size(max_scbs: usize, max_edbs: usize) -> usize {
    (max_scbs + 2 * max_edbs).next_power_of_two().max(4)
}
