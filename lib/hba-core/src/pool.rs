// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The descriptor pool: a growable arena of SCBs, their DMA-visible mirror
//! records, and the single posting path by which any command reaches the
//! hardware.
//!
//! Free membership is tracked with index links inside the arena rather
//! than pointer-linked nodes, so moving a descriptor between the free,
//! reserved, active, and timed-out sets is O(1) with no aliasing.

use slog::{debug, Logger};
use thiserror::Error;
use zerocopy::IntoBytes;

use crate::bits::{
    HwScbRecord, REG_SCB_PRODUCER, RECORDS_PER_PAGE, PAGE_SIZE, SCB_EMPTY,
    SCB_RECORD_SIZE, SG_TABLES_PER_PAGE,
};
use crate::hal::{DmaAllocator, DmaChunk, DmaError, PhysAddr, RegIo};
use crate::scb::{Owner, Scb, ScbFlags, ScbId};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("descriptor pool is at its configured maximum")]
    Full,
    #[error(transparent)]
    Dma(#[from] DmaError),
}

/// Location of one mirror record within the pool's DMA pages.
#[derive(Copy, Clone, Debug)]
struct MirrorRef {
    page: usize,
    offset: usize,
}

/// Occupancy counts across every set that can hold a descriptor. Their sum
/// equals the total allocated at all times.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Census {
    pub free: usize,
    pub reserved_free: usize,
    pub active: usize,
    pub timed_out: usize,
    pub detached: usize,
}

impl Census {
    pub fn total(&self) -> usize {
        self.free
            + self.reserved_free
            + self.active
            + self.timed_out
            + self.detached
    }
}

pub struct ScbPool {
    scbs: Vec<Scb>,
    record_pages: Vec<DmaChunk>,
    sg_pages: Vec<DmaChunk>,
    mirrors: Vec<MirrorRef>,
    /// Mirror slots not bound to any descriptor (spares from record pages
    /// that out-sized their scatter/gather page).
    mirror_free: Vec<usize>,
    /// The distinguished record the hardware expects to fetch next. Swapped
    /// with the posted descriptor's record on every post.
    sentinel: usize,
    free_head: Option<ScbId>,
    reserved_head: Option<ScbId>,
    census: Census,
    /// Posted, non-buffer-supply descriptors awaiting completion.
    pending: Vec<ScbId>,
    max_scbs: usize,
    /// Monotonic producer count mirrored to the hardware doorbell.
    produced: u16,
    log: Logger,
}

impl ScbPool {
    /// Build the pool and perform the initial growth. `reserved` descriptors
    /// are set aside on the reserved free list for recovery use.
    pub fn new(
        dma: &dyn DmaAllocator,
        max_scbs: usize,
        reserved: usize,
        log: Logger,
    ) -> Result<Self, PoolError> {
        let mut pool = Self {
            scbs: Vec::new(),
            record_pages: Vec::new(),
            sg_pages: Vec::new(),
            mirrors: Vec::new(),
            mirror_free: Vec::new(),
            sentinel: usize::MAX,
            free_head: None,
            reserved_head: None,
            census: Census::default(),
            pending: Vec::new(),
            max_scbs,
            produced: 0,
            log,
        };
        pool.grow(dma)?;
        // The sentinel comes from the spare record slots of the first page.
        pool.sentinel =
            pool.mirror_free.pop().expect("first growth leaves spare records");

        for _ in 0..reserved {
            let id = pool
                .pop_free()
                .expect("initial growth covers the reserved set");
            let scb = &mut pool.scbs[id.idx()];
            scb.flags.insert(ScbFlags::RESERVED);
            scb.link = pool.reserved_head;
            scb.owner = Owner::ReservedFree;
            pool.reserved_head = Some(id);
            pool.census.detached -= 1;
            pool.census.reserved_free += 1;
        }
        Ok(pool)
    }

    /// Seed the producer count from the hardware's consumer count so a warm
    /// restart does not desynchronize the doorbell protocol.
    pub fn resync_producer(&mut self, regs: &dyn RegIo) {
        self.produced = regs.read32(crate::bits::REG_SCB_CONSUMER) as u16;
    }

    pub fn produced(&self) -> u16 {
        self.produced
    }

    pub fn total(&self) -> usize {
        self.scbs.len()
    }

    pub fn census(&self) -> Census {
        self.census
    }

    pub fn pending(&self) -> &[ScbId] {
        &self.pending
    }

    pub fn scb(&self, id: ScbId) -> &Scb {
        &self.scbs[id.idx()]
    }

    pub fn scb_mut(&mut self, id: ScbId) -> &mut Scb {
        &mut self.scbs[id.idx()]
    }

    /// Resolve a Done List index field to a descriptor, if it names one.
    pub fn lookup(&self, index: u16) -> Option<&Scb> {
        self.scbs.get(index as usize)
    }

    /// Pop from the requested free list. A general acquire grows the pool
    /// before giving up; `None` is transient resource exhaustion, retried
    /// on the next release.
    pub fn acquire(
        &mut self,
        reserved: bool,
        dma: &dyn DmaAllocator,
    ) -> Option<ScbId> {
        let id = if reserved {
            self.pop_reserved()
        } else {
            match self.pop_free() {
                Some(id) => Some(id),
                None => {
                    if self.grow(dma).is_ok() {
                        self.pop_free()
                    } else {
                        None
                    }
                }
            }
        }?;
        Some(id)
    }

    /// Clear per-use state and return the descriptor to its free list.
    pub fn release(&mut self, id: ScbId) {
        self.remove_pending(id);
        let scb = &mut self.scbs[id.idx()];
        match scb.owner {
            Owner::Free | Owner::ReservedFree => {
                panic!("double release of {:?}", id)
            }
            Owner::Detached => self.census.detached -= 1,
            Owner::Active => self.census.active -= 1,
            Owner::TimedOut => self.census.timed_out -= 1,
        }
        scb.reset_for_release();
        if scb.flags.contains(ScbFlags::RESERVED) {
            scb.link = self.reserved_head;
            scb.owner = Owner::ReservedFree;
            self.reserved_head = Some(id);
            self.census.reserved_free += 1;
        } else {
            scb.link = self.free_head;
            scb.owner = Owner::Free;
            self.free_head = Some(id);
            self.census.free += 1;
        }
    }

    /// Bind the descriptor's content into the currently-pending mirror
    /// record, swap it with the sentinel, and ring the doorbell. This is
    /// the single path to hardware for ordinary and recovery commands
    /// alike; once a descriptor is owned there is no partial-post failure.
    pub fn post(&mut self, id: ScbId, regs: &dyn RegIo) {
        let (mirror, record) = {
            let scb = &self.scbs[id.idx()];
            match scb.owner {
                Owner::Detached => {}
                // Buffer-supply descriptors are re-posted in place after
                // each consumed event, and a recovery chain re-posts its
                // one descriptor for every ladder step.
                Owner::Active
                    if scb.opcode == SCB_EMPTY
                        || scb.flags.contains(ScbFlags::IN_RECOVERY) => {}
                other => panic!("posting {:?} from {:?}", id, other),
            }
            (
                scb.mirror,
                HwScbRecord {
                    // The descriptor's own record becomes the new sentinel,
                    // so its address is what the hardware must fetch next.
                    next_pa: self.mirror_pa(scb.mirror).0,
                    index: scb.id.0,
                    opcode: scb.opcode,
                    flags: 0,
                    conn_handle: scb.conn_handle,
                    rsvd: 0,
                    payload: scb.payload,
                },
            )
        };

        // Fill the sentinel record and swap bindings.
        let slot = self.mirrors[self.sentinel];
        self.record_pages[slot.page].bytes_mut()
            [slot.offset..slot.offset + SCB_RECORD_SIZE]
            .copy_from_slice(record.as_bytes());
        let scb = &mut self.scbs[id.idx()];
        scb.mirror = self.sentinel;
        self.sentinel = mirror;

        if scb.owner == Owner::Detached {
            scb.owner = Owner::Active;
            self.census.detached -= 1;
            self.census.active += 1;
        }
        scb.flags.insert(ScbFlags::ACTIVE);
        if scb.opcode != SCB_EMPTY {
            scb.flags.insert(ScbFlags::PENDING);
            if !self.pending.contains(&id) {
                self.pending.push(id);
            }
        }

        self.produced = self.produced.wrapping_add(1);
        regs.write32(REG_SCB_PRODUCER, self.produced as u32);
    }

    /// Move an active descriptor to the timed-out set (ownership only; the
    /// escalation queue itself lives on the controller).
    pub fn mark_timed_out(&mut self, id: ScbId) {
        let scb = &mut self.scbs[id.idx()];
        assert_eq!(scb.owner, Owner::Active, "timeout of inactive {:?}", id);
        scb.owner = Owner::TimedOut;
        scb.flags.insert(ScbFlags::TIMED_OUT);
        self.census.active -= 1;
        self.census.timed_out += 1;
        self.remove_pending(id);
    }

    pub fn remove_pending(&mut self, id: ScbId) {
        self.pending.retain(|p| *p != id);
    }

    /// Physical address of a mirror record.
    fn mirror_pa(&self, mirror: usize) -> PhysAddr {
        let slot = self.mirrors[mirror];
        self.record_pages[slot.page].pa().offset(slot.offset)
    }

    /// Raw bytes of the record currently bound to a descriptor.
    pub fn record_bytes(&self, id: ScbId) -> &[u8] {
        let slot = self.mirrors[self.scbs[id.idx()].mirror];
        &self.record_pages[slot.page].bytes()
            [slot.offset..slot.offset + SCB_RECORD_SIZE]
    }

    /// Grow by one page of records and one page of scatter/gather storage,
    /// creating only as many descriptors as both pages support.
    fn grow(&mut self, dma: &dyn DmaAllocator) -> Result<(), PoolError> {
        if self.scbs.len() >= self.max_scbs {
            return Err(PoolError::Full);
        }
        let batch = RECORDS_PER_PAGE
            .min(SG_TABLES_PER_PAGE)
            .min(self.max_scbs - self.scbs.len());

        let record_page = dma.alloc(PAGE_SIZE)?;
        let sg_page = dma.alloc(PAGE_SIZE)?;
        let page_idx = self.record_pages.len();
        self.record_pages.push(record_page);
        self.sg_pages.push(sg_page);

        let first_mirror = self.mirrors.len();
        for rec in 0..RECORDS_PER_PAGE {
            self.mirrors.push(MirrorRef {
                page: page_idx,
                offset: rec * SCB_RECORD_SIZE,
            });
        }

        for n in 0..batch {
            let id = ScbId(self.scbs.len() as u16);
            let mut scb = Scb::new(id, first_mirror + n);
            scb.link = self.free_head;
            self.scbs.push(scb);
            self.free_head = Some(id);
            self.census.free += 1;
        }
        for spare in (first_mirror + batch)..(first_mirror + RECORDS_PER_PAGE)
        {
            self.mirror_free.push(spare);
        }

        debug!(self.log, "descriptor pool grown";
            "batch" => batch, "total" => self.scbs.len());
        Ok(())
    }

    fn pop_free(&mut self) -> Option<ScbId> {
        let id = self.free_head?;
        let scb = &mut self.scbs[id.idx()];
        self.free_head = scb.link.take();
        scb.owner = Owner::Detached;
        self.census.free -= 1;
        self.census.detached += 1;
        Some(id)
    }

    fn pop_reserved(&mut self) -> Option<ScbId> {
        let id = self.reserved_head?;
        let scb = &mut self.scbs[id.idx()];
        self.reserved_head = scb.link.take();
        scb.owner = Owner::Detached;
        self.census.reserved_free -= 1;
        self.census.detached += 1;
        Some(id)
    }

    /// Hand every DMA page back for the allocator to free at teardown.
    pub fn drain_dma_chunks(&mut self) -> Vec<DmaChunk> {
        let mut chunks = std::mem::take(&mut self.record_pages);
        chunks.extend(std::mem::take(&mut self.sg_pages));
        chunks
    }
}
