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

//! CairnOS global memory management support

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::boxed::Box;
use cairn_memory_interface::MemRegion;
use cairn_memory_interface::MemRequestFlags;
use cairn_memory_interface::MemoryManagerError;
use cairn_memory_interface::MemoryManagerInterface;
use cairn_memory_interface::MemoryManagerStats;
use cairn_memory_interface::MopId;
use cairn_memory_interface::PhysRegion;
use cairn_nano_interface::NanoKernelInterface;
use cairn_nano_interface::ResHandle;
use spin::Mutex;
use spin::MutexGuard;

mod memory_manager;
pub use memory_manager::MemoryManager;

#[cfg(test)]
mod fake_nano;

// CairnMemoryManager bundles an instance of the MemoryManager that operates
// on the nano kernel interface and synchronizes public use with a Mutex.
// There is a two-step dance to setup an instance because we want
// CAIRN_MEMORY static and MemoryManager is incapable of supplying a const
// fn due to its use of heap-backed state.
pub struct CairnMemoryManager {
    state: Mutex<Option<ManagerState>>,
}

struct ManagerState {
    nano: Box<dyn NanoKernelInterface + Send>,
    manager: MemoryManager,
}

impl CairnMemoryManager {
    // Constructs a partially-initialized instance; to complete call init().
    pub const fn empty() -> CairnMemoryManager {
        CairnMemoryManager {
            state: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Guard {
        Guard {
            state: self.state.lock(),
        }
    }
}
pub struct Guard<'a> {
    state: MutexGuard<'a, Option<ManagerState>>,
}
impl Guard<'_> {
    pub fn is_empty(&self) -> bool { self.state.is_none() }

    // Finishes the setup started by empty():
    pub fn init(&mut self, mut nano: Box<dyn NanoKernelInterface + Send>) {
        assert!(self.state.is_none());
        let manager = MemoryManager::new(&mut *nano);
        *self.state = Some(ManagerState { nano, manager });
    }

    /// The MOP at the root of the ownership hierarchy, for the init system.
    pub fn root_mop_id(&self) -> MopId {
        self.state.as_ref().unwrap().manager.root_mop_id()
    }

    /// Page-fault commit entry. Reached only from the fault trap, never
    /// from the request loop.
    pub fn commit_page(&mut self, vaddr: usize) -> Result<usize, MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.commit_page(&mut *state.nano, vaddr)
    }

    /// Sweep-completion notification from the nano kernel.
    pub fn revoke_finished(&mut self) -> Result<(), MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.revoke_finished(&mut *state.nano)
    }
}
impl MemoryManagerInterface for Guard<'_> {
    fn mem_request(
        &mut self,
        base: usize,
        length: usize,
        flags: MemRequestFlags,
        owner: MopId,
    ) -> Result<MemRegion, MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.mem_request(&mut *state.nano, base, length, flags, owner)
    }
    fn mem_claim(
        &mut self,
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    ) -> Result<(), MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.mem_claim(base, length, times, owner)
    }
    fn mem_release(
        &mut self,
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    ) -> Result<(), MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.mem_release(&mut *state.nano, base, length, times, owner)
    }
    fn mem_makemop(
        &mut self,
        space: ResHandle,
        parent: MopId,
        debug_label: &str,
    ) -> Result<MopId, MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.mem_makemop(&mut *state.nano, space, parent, debug_label)
    }
    fn mem_reclaim_mop(&mut self, owner: MopId) -> Result<(), MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.mem_reclaim_mop(&mut *state.nano, owner)
    }
    fn mem_virt_to_phys(&self, vaddr: usize) -> Result<usize, MemoryManagerError> {
        let state = self.state.as_ref().unwrap();
        state.manager.mem_virt_to_phys(&*state.nano, vaddr)
    }
    fn mem_phys_cap(
        &mut self,
        base: usize,
        length: usize,
        cached: bool,
        owner: MopId,
    ) -> Result<PhysRegion, MemoryManagerError> {
        let state = self.state.as_mut().unwrap();
        state.manager.mem_phys_cap(&mut *state.nano, base, length, cached, owner)
    }
    fn stats(&self) -> Result<MemoryManagerStats, MemoryManagerError> {
        Ok(self.state.as_ref().unwrap().manager.stats())
    }
    fn debug(&self) -> Result<(), MemoryManagerError> {
        self.state.as_ref().unwrap().manager.debug();
        Ok(())
    }
}
