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

//! In-memory stand-in for the nano kernel. Reservations are tracked as
//! extents with a live/split/dead state, translation tables as nested
//! entry arrays, and zeroing requests are recorded for inspection. Tests
//! drive the manager against it and then look inside.

use cairn_nano_interface::level_index;
use cairn_nano_interface::BootInfo;
use cairn_nano_interface::NanoError;
use cairn_nano_interface::NanoKernelInterface;
use cairn_nano_interface::PhysHandle;
use cairn_nano_interface::ResHandle;
use cairn_nano_interface::ResInfo;
use cairn_nano_interface::TableHandle;
use cairn_nano_interface::PAGE_BITS;
use cairn_nano_interface::TABLE_ENTRIES;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ResState {
    Live,
    /// Subdivided; the handle still names its extent and can be swept,
    /// but no further split or merge.
    Split,
    Dead,
}

#[derive(Clone, Copy, Debug)]
struct FakeRes {
    base: usize,
    length: usize,
    state: ResState,
}

#[derive(Clone, Copy, Debug)]
enum FakeEntry {
    Table(TableHandle),
    Page(usize),
}

struct FakeTable {
    pfn: usize,
    entries: Box<[Option<FakeEntry>; TABLE_ENTRIES]>,
}

impl FakeTable {
    fn new(pfn: usize) -> FakeTable {
        FakeTable {
            pfn,
            entries: Box::new([None; TABLE_ENTRIES]),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(Option::is_none)
    }
}

pub struct FakeNano {
    phys_pages: usize,
    virt_base_page: usize,
    virt_pages: usize,
    seed: ResHandle,
    reservations: HashMap<u64, FakeRes>,
    next_res: u64,
    root: TableHandle,
    tables: HashMap<u64, FakeTable>,
    next_table: u64,
    pending: Option<ResHandle>,
    zeroed: Vec<(usize, usize)>,
    minted_phys: Vec<(usize, usize, bool)>,
    next_phys: u64,
}

impl FakeNano {
    pub fn new(phys_pages: usize, virt_base_page: usize, virt_pages: usize) -> FakeNano {
        let seed = ResHandle(1);
        let mut reservations = HashMap::new();
        reservations.insert(
            seed.0,
            FakeRes {
                base: virt_base_page << PAGE_BITS,
                length: virt_pages << PAGE_BITS,
                state: ResState::Live,
            },
        );
        let root = TableHandle(1);
        let mut tables = HashMap::new();
        tables.insert(root.0, FakeTable::new(usize::MAX));
        FakeNano {
            phys_pages,
            virt_base_page,
            virt_pages,
            seed,
            reservations,
            next_res: 2,
            root,
            tables,
            next_table: 2,
            pending: None,
            zeroed: Vec::new(),
            minted_phys: Vec::new(),
            next_phys: 1,
        }
    }

    fn res(&self, handle: ResHandle) -> Result<&FakeRes, NanoError> {
        match self.reservations.get(&handle.0) {
            Some(r) if r.state != ResState::Dead => Ok(r),
            _ => Err(NanoError::InvalidHandle),
        }
    }

    fn fresh_res(&mut self, base: usize, length: usize) -> ResHandle {
        let handle = ResHandle(self.next_res);
        self.next_res += 1;
        self.reservations.insert(
            handle.0,
            FakeRes {
                base,
                length,
                state: ResState::Live,
            },
        );
        handle
    }

    fn table(&self, handle: TableHandle) -> Result<&FakeTable, NanoError> {
        self.tables.get(&handle.0).ok_or(NanoError::InvalidHandle)
    }

    /// True when every page of [pfn, pfn + pages) was zeroed at some point.
    pub fn was_zeroed(&self, pfn: usize, pages: usize) -> bool {
        (pfn..pfn + pages).all(|p| self.zeroed.iter().any(|&(z, n)| z <= p && p < z + n))
    }

    /// (pfn, pages, cached) runs delegated through phys_cap, in mint order.
    pub fn minted_phys(&self) -> &[(usize, usize, bool)] {
        &self.minted_phys
    }

    /// Full three-level walk, the way the hardware would do it.
    pub fn lookup_vpage(&self, vpage: usize) -> Option<usize> {
        let l1 = self.sub_table(self.root, level_index(vpage, 0))?;
        let l2 = self.sub_table(l1, level_index(vpage, 1))?;
        self.mapping(l2, level_index(vpage, 2))
    }
}

impl NanoKernelInterface for FakeNano {
    fn boot_info(&self) -> BootInfo {
        BootInfo {
            phys_pages: self.phys_pages,
            virt_base_page: self.virt_base_page,
            virt_pages: self.virt_pages,
            seed: self.seed,
        }
    }

    fn res_split(
        &mut self,
        res: ResHandle,
        offset: usize,
    ) -> Result<(ResHandle, ResHandle), NanoError> {
        let r = *self.res(res)?;
        if r.state != ResState::Live {
            return Err(NanoError::InvalidHandle);
        }
        if offset == 0 || offset >= r.length {
            return Err(NanoError::InvalidAddress);
        }
        self.reservations.get_mut(&res.0).unwrap().state = ResState::Split;
        let left = self.fresh_res(r.base, offset);
        let right = self.fresh_res(r.base + offset, r.length - offset);
        Ok((left, right))
    }

    fn res_merge(&mut self, left: ResHandle, right: ResHandle) -> Result<ResHandle, NanoError> {
        let l = *self.res(left)?;
        let r = *self.res(right)?;
        if l.state != ResState::Live || r.state != ResState::Live {
            return Err(NanoError::InvalidHandle);
        }
        if l.base + l.length != r.base {
            return Err(NanoError::InvalidAddress);
        }
        self.reservations.get_mut(&left.0).unwrap().state = ResState::Dead;
        self.reservations.get_mut(&right.0).unwrap().state = ResState::Dead;
        Ok(self.fresh_res(l.base, l.length + r.length))
    }

    fn res_info(&self, res: ResHandle) -> Result<ResInfo, NanoError> {
        let r = self.res(res)?;
        Ok(ResInfo {
            base: r.base,
            length: r.length,
        })
    }

    fn revoke_start(&mut self, res: ResHandle) -> Result<(), NanoError> {
        self.res(res)?;
        if self.pending.is_some() {
            return Err(NanoError::SweepBusy);
        }
        self.pending = Some(res);
        Ok(())
    }

    fn revoke_finish(&mut self, res: ResHandle) -> Result<ResHandle, NanoError> {
        if self.pending != Some(res) {
            return Err(NanoError::SweepIncomplete);
        }
        self.pending = None;
        let extent = *self.res(res)?;
        // Everything derived inside the swept extent dies with it.
        for r in self.reservations.values_mut() {
            if r.base >= extent.base && r.base + r.length <= extent.base + extent.length {
                r.state = ResState::Dead;
            }
        }
        Ok(self.fresh_res(extent.base, extent.length))
    }

    fn root_table(&self) -> TableHandle {
        self.root
    }

    fn create_table(
        &mut self,
        pfn: usize,
        parent: TableHandle,
        index: usize,
    ) -> Result<TableHandle, NanoError> {
        if index >= TABLE_ENTRIES {
            return Err(NanoError::InvalidAddress);
        }
        if self.table(parent)?.entries[index].is_some() {
            return Err(NanoError::SlotOccupied);
        }
        let handle = TableHandle(self.next_table);
        self.next_table += 1;
        self.tables.insert(handle.0, FakeTable::new(pfn));
        self.tables.get_mut(&parent.0).unwrap().entries[index] = Some(FakeEntry::Table(handle));
        Ok(handle)
    }

    fn create_mapping(
        &mut self,
        pfn: usize,
        table: TableHandle,
        index: usize,
    ) -> Result<(), NanoError> {
        if index >= TABLE_ENTRIES {
            return Err(NanoError::InvalidAddress);
        }
        if self.table(table)?.entries[index].is_some() {
            return Err(NanoError::SlotOccupied);
        }
        self.tables.get_mut(&table.0).unwrap().entries[index] = Some(FakeEntry::Page(pfn));
        Ok(())
    }

    fn free_mapping(&mut self, table: TableHandle, index: usize) -> Result<usize, NanoError> {
        if index >= TABLE_ENTRIES {
            return Err(NanoError::InvalidAddress);
        }
        match self.table(table)?.entries[index] {
            Some(FakeEntry::Page(pfn)) => {
                self.tables.get_mut(&table.0).unwrap().entries[index] = None;
                Ok(pfn)
            }
            _ => Err(NanoError::MappingMissing),
        }
    }

    fn free_table(&mut self, parent: TableHandle, index: usize) -> Result<usize, NanoError> {
        if index >= TABLE_ENTRIES {
            return Err(NanoError::InvalidAddress);
        }
        let child = match self.table(parent)?.entries[index] {
            Some(FakeEntry::Table(child)) => child,
            _ => return Err(NanoError::MappingMissing),
        };
        if !self.table(child)?.is_empty() {
            return Err(NanoError::TableBusy);
        }
        let pfn = self.table(child)?.pfn;
        self.tables.remove(&child.0);
        self.tables.get_mut(&parent.0).unwrap().entries[index] = None;
        Ok(pfn)
    }

    fn sub_table(&self, table: TableHandle, index: usize) -> Option<TableHandle> {
        match self.tables.get(&table.0)?.entries[index] {
            Some(FakeEntry::Table(handle)) => Some(handle),
            _ => None,
        }
    }

    fn mapping(&self, table: TableHandle, index: usize) -> Option<usize> {
        match self.tables.get(&table.0)?.entries[index] {
            Some(FakeEntry::Page(pfn)) => Some(pfn),
            _ => None,
        }
    }

    fn zero_pages(&mut self, pfn: usize, pages: usize) {
        self.zeroed.push((pfn, pages));
    }

    fn phys_cap(&mut self, pfn: usize, pages: usize, cached: bool) -> Result<PhysHandle, NanoError> {
        if pages == 0 || pfn + pages > self.phys_pages {
            return Err(NanoError::InvalidAddress);
        }
        self.minted_phys.push((pfn, pages, cached));
        let handle = PhysHandle(self.next_phys);
        self.next_phys += 1;
        Ok(handle)
    }
}
