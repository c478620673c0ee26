// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! GPU FIFO scheduler service.
//!
//! Tracks which channels (grouped into time-slice groups) are runnable on
//! each runlist, turns that into the runlist format the GPU front end
//! consumes and manages the lifecycle of the groups. The hardware, DMA
//! memory, engine topology and recovery are reached through the traits in
//! cantrip-fifo-interface.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use cantrip_fifo_interface::*;
use core::ops::Deref;
use spin::{RwLock, RwLockReadGuard};

mod fifo;
pub use fifo::*;

/// Process-wide holder for the scheduler. Most operations only need
/// shared access; each runlist and TSG does its own locking.
pub struct CantripFifoService {
    fifo: RwLock<Option<Fifo>>,
}
impl CantripFifoService {
    pub const fn empty() -> CantripFifoService {
        CantripFifoService {
            fifo: RwLock::new(None),
        }
    }

    pub fn is_empty(&self) -> bool { self.fifo.read().is_none() }

    pub fn init(
        &self,
        config: FifoConfig,
        hw: Box<dyn HardwareFifo + Send + Sync>,
        dma: Box<dyn DmaAllocator + Send + Sync>,
        engines: Box<dyn EngineInfo + Send + Sync>,
        recovery: Box<dyn RecoveryHandler + Send + Sync>,
    ) -> Result<(), FifoError> {
        let mut fifo = self.fifo.write();
        assert!(fifo.is_none(), "fifo service already initialized");
        *fifo = Some(Fifo::setup(config, hw, dma, engines, recovery)?);
        Ok(())
    }

    pub fn get(&self) -> Guard<'_> {
        Guard {
            fifo: self.fifo.read(),
        }
    }

    /// Tears the scheduler down; a later init starts afresh.
    pub fn cleanup(&self) {
        if let Some(mut fifo) = self.fifo.write().take() {
            fifo.cleanup();
        }
    }
}

pub struct Guard<'a> {
    fifo: RwLockReadGuard<'a, Option<Fifo>>,
}
impl<'a> Guard<'a> {
    pub fn is_empty(&self) -> bool { self.fifo.is_none() }
}
impl<'a> Deref for Guard<'a> {
    type Target = Fifo;
    fn deref(&self) -> &Fifo {
        match self.fifo.as_ref() {
            Some(fifo) => fifo,
            None => panic!("fifo service not initialized"),
        }
    }
}
