// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command execution and fault recovery core for a SAS host bus adapter.
//!
//! The core owns the descriptor pool and its DMA mirror records, consumes
//! the hardware's Done List completion ring, and runs the timeout
//! escalation ladder (abort, logical-unit reset, device reset, port
//! reset). The host bus, DMA memory, and the platform command layer are
//! reached only through the traits in [`hal`].

pub mod bits;
pub mod controller;
pub mod ddb;
pub mod done;
pub mod hal;
pub mod pool;
pub mod recovery;
pub mod scb;
pub mod target;
pub mod timer;

#[cfg(test)]
pub(crate) mod test;

pub use controller::{Config, Controller, HbaError};
