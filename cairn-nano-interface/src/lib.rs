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

//! CairnOS nano layer interface.
//!
//! The nano layer is the small privileged kernel underneath every CairnOS
//! service. It implements the primitives the MemoryManager cannot: sealed
//! reservation capabilities over the virtual address space, the hardware
//! page tables, the capability revocation sweep, and raw access to physical
//! pages. Everything here is an opaque handle; the nano layer performs all
//! validity checks and the MemoryManager never holds a raw pointer into
//! another protection domain.

#![cfg_attr(not(test), no_std)]

use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use static_assertions as sa;

/// Hardware paging geometry: 4 KiB pages translated through three levels
/// of 512-entry tables. Every table-shaped structure in the MemoryManager
/// mirrors this radix.
pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;
pub const TABLE_BITS: usize = 9;
pub const TABLE_ENTRIES: usize = 1 << TABLE_BITS;
pub const TRANSLATION_LEVELS: usize = 3;

/// Pages of virtual address space resolved by the root table.
pub const VIRT_SPAN_PAGES: usize = 1 << (TRANSLATION_LEVELS * TABLE_BITS);

/// Bytes of in-band metadata at the start of every reservation. The first
/// page of a reservation is therefore never handed to DMA engines.
pub const RES_META_SIZE: usize = 16;

/// Mantissa bits available to the capability bounds encoding. Capabilities
/// over runs larger than 2^CAP_MANTISSA_BITS bytes are only representable
/// when the run base is aligned accordingly.
pub const CAP_MANTISSA_BITS: usize = 14;

sa::const_assert_eq!(TABLE_ENTRIES, 512);
sa::const_assert!(RES_META_SIZE < PAGE_SIZE);

/// Pages spanned by one slot of a table at |level| (level 0 is the root).
pub const fn level_span_pages(level: usize) -> usize {
    1 << (TABLE_BITS * (TRANSLATION_LEVELS - 1 - level))
}

/// Slot index of |page| within a table at |level|.
pub const fn level_index(page: usize, level: usize) -> usize {
    (page >> (TABLE_BITS * (TRANSLATION_LEVELS - 1 - level))) & (TABLE_ENTRIES - 1)
}

/// Page alignment required for a capability covering |pages| contiguous
/// pages to have exactly representable bounds.
pub fn representable_align_pages(pages: usize) -> usize {
    let bytes = pages << PAGE_BITS;
    let bits = usize::BITS as usize - (bytes - 1).leading_zeros() as usize;
    if bits <= CAP_MANTISSA_BITS + PAGE_BITS {
        1
    } else {
        1 << (bits - CAP_MANTISSA_BITS - PAGE_BITS)
    }
}

/// Opaque handle to a reservation capability parked in the nano layer.
/// Through the gates below a reservation can be split, merged, or revoked;
/// redeeming one for usable memory happens in the client that holds it,
/// never here. The handle itself carries no authority until presented back
/// to the nano layer.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResHandle(pub u64);

/// Opaque handle to a capability over a run of physical pages, minted for
/// a client that drives a device or DMA engine against fixed addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PhysHandle(pub u64);

/// Opaque handle to a live hardware page table.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TableHandle(pub u64);

/// Extent described by a reservation, in bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResInfo {
    pub base: usize,
    pub length: usize,
}

/// Seed state handed to the MemoryManager at boot: the size of the physical
/// page book and one reservation covering all revocable virtual memory.
/// Nothing is persisted; the entire map is rebuilt from this every boot.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BootInfo {
    pub phys_pages: usize,
    pub virt_base_page: usize,
    pub virt_pages: usize,
    pub seed: ResHandle,
}

#[repr(usize)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum NanoError {
    Success = 0,
    InvalidHandle,
    InvalidAddress,
    SlotOccupied,
    MappingMissing,
    TableBusy,
    SweepBusy,
    SweepIncomplete,
    #[default]
    UnknownError,
}
impl From<NanoError> for Result<(), NanoError> {
    fn from(err: NanoError) -> Result<(), NanoError> {
        if err == NanoError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Nano layer operations the MemoryManager depends on. On hardware these are
/// trampolines into the privileged layer; tests supply a scripted fake.
pub trait NanoKernelInterface {
    fn boot_info(&self) -> BootInfo;

    // Reservation capabilities.

    /// Splits |res| at |offset| bytes from its base. |res| is invalidated
    /// and two fresh handles covering [base, base+offset) and
    /// [base+offset, end) are returned.
    fn res_split(&mut self, res: ResHandle, offset: usize)
        -> Result<(ResHandle, ResHandle), NanoError>;

    /// Merges two reservations over exactly adjacent extents. Both inputs
    /// are invalidated.
    fn res_merge(&mut self, left: ResHandle, right: ResHandle)
        -> Result<ResHandle, NanoError>;

    fn res_info(&self, res: ResHandle) -> Result<ResInfo, NanoError>;

    /// Starts the capability revocation sweep for |res|. At most one sweep
    /// runs at a time; completion is delivered asynchronously to the
    /// MemoryManager's message loop.
    fn revoke_start(&mut self, res: ResHandle) -> Result<(), NanoError>;

    /// Retires a swept reservation. Every capability derived from |res| is
    /// now provably destroyed; the returned handle is a fresh open
    /// reservation over the same extent, safe to hand out again.
    fn revoke_finish(&mut self, res: ResHandle) -> Result<ResHandle, NanoError>;

    // Hardware page tables.

    fn root_table(&self) -> TableHandle;

    /// Turns physical page |pfn| into a page table installed at
    /// |parent|[|index|].
    fn create_table(&mut self, pfn: usize, parent: TableHandle, index: usize)
        -> Result<TableHandle, NanoError>;

    /// Maps physical page |pfn| at |table|[|index|].
    fn create_mapping(&mut self, pfn: usize, table: TableHandle, index: usize)
        -> Result<(), NanoError>;

    /// Unmaps |table|[|index|], returning the physical page that backed it.
    fn free_mapping(&mut self, table: TableHandle, index: usize)
        -> Result<usize, NanoError>;

    /// Retires the empty table at |parent|[|index|], returning the physical
    /// page that backed the table itself. Fails with TableBusy if any entry
    /// is still live.
    fn free_table(&mut self, parent: TableHandle, index: usize)
        -> Result<usize, NanoError>;

    /// Read-only walk: the sub-table installed at |table|[|index|], if any.
    fn sub_table(&self, table: TableHandle, index: usize) -> Option<TableHandle>;

    /// Read-only walk: the physical page mapped at |table|[|index|], if any.
    fn mapping(&self, table: TableHandle, index: usize) -> Option<usize>;

    // Physical pages.

    /// Zeroes |pages| physical pages starting at |pfn|.
    fn zero_pages(&mut self, pfn: usize, pages: usize);

    /// Mints a capability over |pages| physical pages starting at |pfn|,
    /// with |cached| selecting the cacheability of accesses made through
    /// it. The nano layer does not track delegation; the caller must never
    /// hand out the same run twice.
    fn phys_cap(&mut self, pfn: usize, pages: usize, cached: bool)
        -> Result<PhysHandle, NanoError>;
}

// Client-side bindings. The externs are provided by the call-gate glue
// that connects a component to the nano layer; tests never construct a
// NanoClient and use a scripted fake instead.

extern "C" {
    fn nano_boot_info(c_info: *mut BootInfo);
    fn nano_res_split(
        res: ResHandle,
        offset: usize,
        c_left: *mut ResHandle,
        c_right: *mut ResHandle,
    ) -> NanoError;
    fn nano_res_merge(left: ResHandle, right: ResHandle, c_merged: *mut ResHandle) -> NanoError;
    fn nano_res_info(res: ResHandle, c_info: *mut ResInfo) -> NanoError;
    fn nano_revoke_start(res: ResHandle) -> NanoError;
    fn nano_revoke_finish(res: ResHandle, c_fresh: *mut ResHandle) -> NanoError;
    fn nano_root_table() -> TableHandle;
    fn nano_create_table(
        pfn: usize,
        parent: TableHandle,
        index: usize,
        c_table: *mut TableHandle,
    ) -> NanoError;
    fn nano_create_mapping(pfn: usize, table: TableHandle, index: usize) -> NanoError;
    fn nano_free_mapping(table: TableHandle, index: usize, c_pfn: *mut usize) -> NanoError;
    fn nano_free_table(parent: TableHandle, index: usize, c_pfn: *mut usize) -> NanoError;
    fn nano_sub_table(table: TableHandle, index: usize, c_sub: *mut TableHandle) -> NanoError;
    fn nano_mapping(table: TableHandle, index: usize, c_pfn: *mut usize) -> NanoError;
    fn nano_zero_pages(pfn: usize, pages: usize);
    fn nano_phys_cap(pfn: usize, pages: usize, cached: bool, c_phys: *mut PhysHandle) -> NanoError;
}

/// NanoKernelInterface bound to the real privileged layer.
pub struct NanoClient;

impl NanoKernelInterface for NanoClient {
    fn boot_info(&self) -> BootInfo {
        let mut info = BootInfo {
            phys_pages: 0,
            virt_base_page: 0,
            virt_pages: 0,
            seed: ResHandle(0),
        };
        unsafe { nano_boot_info(&mut info) };
        info
    }

    fn res_split(
        &mut self,
        res: ResHandle,
        offset: usize,
    ) -> Result<(ResHandle, ResHandle), NanoError> {
        let mut left = ResHandle(0);
        let mut right = ResHandle(0);
        match unsafe { nano_res_split(res, offset, &mut left, &mut right) } {
            NanoError::Success => Ok((left, right)),
            err => Err(err),
        }
    }

    fn res_merge(&mut self, left: ResHandle, right: ResHandle) -> Result<ResHandle, NanoError> {
        let mut merged = ResHandle(0);
        match unsafe { nano_res_merge(left, right, &mut merged) } {
            NanoError::Success => Ok(merged),
            err => Err(err),
        }
    }

    fn res_info(&self, res: ResHandle) -> Result<ResInfo, NanoError> {
        let mut info = ResInfo { base: 0, length: 0 };
        match unsafe { nano_res_info(res, &mut info) } {
            NanoError::Success => Ok(info),
            err => Err(err),
        }
    }

    fn revoke_start(&mut self, res: ResHandle) -> Result<(), NanoError> {
        unsafe { nano_revoke_start(res) }.into()
    }

    fn revoke_finish(&mut self, res: ResHandle) -> Result<ResHandle, NanoError> {
        let mut fresh = ResHandle(0);
        match unsafe { nano_revoke_finish(res, &mut fresh) } {
            NanoError::Success => Ok(fresh),
            err => Err(err),
        }
    }

    fn root_table(&self) -> TableHandle { unsafe { nano_root_table() } }

    fn create_table(
        &mut self,
        pfn: usize,
        parent: TableHandle,
        index: usize,
    ) -> Result<TableHandle, NanoError> {
        let mut table = TableHandle(0);
        match unsafe { nano_create_table(pfn, parent, index, &mut table) } {
            NanoError::Success => Ok(table),
            err => Err(err),
        }
    }

    fn create_mapping(
        &mut self,
        pfn: usize,
        table: TableHandle,
        index: usize,
    ) -> Result<(), NanoError> {
        unsafe { nano_create_mapping(pfn, table, index) }.into()
    }

    fn free_mapping(&mut self, table: TableHandle, index: usize) -> Result<usize, NanoError> {
        let mut pfn = 0;
        match unsafe { nano_free_mapping(table, index, &mut pfn) } {
            NanoError::Success => Ok(pfn),
            err => Err(err),
        }
    }

    fn free_table(&mut self, parent: TableHandle, index: usize) -> Result<usize, NanoError> {
        let mut pfn = 0;
        match unsafe { nano_free_table(parent, index, &mut pfn) } {
            NanoError::Success => Ok(pfn),
            err => Err(err),
        }
    }

    fn sub_table(&self, table: TableHandle, index: usize) -> Option<TableHandle> {
        let mut sub = TableHandle(0);
        match unsafe { nano_sub_table(table, index, &mut sub) } {
            NanoError::Success => Some(sub),
            _ => None,
        }
    }

    fn mapping(&self, table: TableHandle, index: usize) -> Option<usize> {
        let mut pfn = 0;
        match unsafe { nano_mapping(table, index, &mut pfn) } {
            NanoError::Success => Some(pfn),
            _ => None,
        }
    }

    fn zero_pages(&mut self, pfn: usize, pages: usize) {
        unsafe { nano_zero_pages(pfn, pages) }
    }

    fn phys_cap(&mut self, pfn: usize, pages: usize, cached: bool) -> Result<PhysHandle, NanoError> {
        let mut phys = PhysHandle(0);
        match unsafe { nano_phys_cap(pfn, pages, cached, &mut phys) } {
            NanoError::Success => Ok(phys),
            err => Err(err),
        }
    }
}
