// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device Descriptor Block (DDB) allocation. DDBs are fixed hardware
//! connection-context slots; a live target holds exactly one, and slots 0
//! and 1 belong to the firmware and are never handed out.

use bitvec::prelude::*;
use thiserror::Error;

/// Index of a hardware connection-context slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DdbIndex(pub u16);

/// Slots below this index are reserved for firmware use.
pub const DDB_FIRST_ALLOCATABLE: u16 = 2;

#[derive(Debug, Error)]
pub enum DdbError {
    #[error("no free DDB slot (capacity {0})")]
    Exhausted(usize),
    #[error("DDB slot {0} is not allocated")]
    NotAllocated(u16),
    #[error("DDB slot {0} is reserved")]
    Reserved(u16),
}

/// Bitmap allocator over the DDB slot space.
pub struct DdbAllocator {
    used: BitVec,
}

impl DdbAllocator {
    pub fn new(max_ddbs: usize) -> Self {
        assert!(max_ddbs > DDB_FIRST_ALLOCATABLE as usize);
        let mut used = bitvec![0; max_ddbs];
        for slot in 0..DDB_FIRST_ALLOCATABLE {
            used.set(slot as usize, true);
        }
        Self { used }
    }

    /// Hand out the lowest free slot. Exhaustion is a transient condition:
    /// the caller retries after some target is torn down.
    pub fn alloc(&mut self) -> Result<DdbIndex, DdbError> {
        match self.used.first_zero() {
            Some(slot) => {
                self.used.set(slot, true);
                Ok(DdbIndex(slot as u16))
            }
            None => Err(DdbError::Exhausted(self.used.len())),
        }
    }

    pub fn free(&mut self, ddb: DdbIndex) -> Result<(), DdbError> {
        let slot = ddb.0 as usize;
        if ddb.0 < DDB_FIRST_ALLOCATABLE {
            return Err(DdbError::Reserved(ddb.0));
        }
        if slot >= self.used.len() || !self.used[slot] {
            return Err(DdbError::NotAllocated(ddb.0));
        }
        self.used.set(slot, false);
        Ok(())
    }

    pub fn allocated(&self) -> usize {
        self.used.count_ones() - DDB_FIRST_ALLOCATABLE as usize
    }
}
