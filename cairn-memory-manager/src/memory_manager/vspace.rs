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

//! Virtual mapping layer: builds and tears down the three-level hardware
//! page tables on demand. This module (together with the book) is the whole
//! of the fast commit path; it must stay reachable without touching the
//! descriptor tree or MOP state, because it runs while any of those callers
//! may themselves be blocked on a fault.

use crate::memory_manager::book::PageBook;
use crate::memory_manager::book::PageStatus;
use cairn_memory_interface::MemoryManagerError;
use cairn_nano_interface::level_index;
use cairn_nano_interface::level_span_pages;
use cairn_nano_interface::representable_align_pages;
use cairn_nano_interface::NanoKernelInterface;
use cairn_nano_interface::TableHandle;
use cairn_nano_interface::PAGE_BITS;
use cairn_nano_interface::PAGE_SIZE;
use cairn_nano_interface::TABLE_ENTRIES;
use hashbrown::HashMap;
use log::trace;

struct TableInfo {
    /// Physical page backing the table itself.
    pfn: usize,
    /// Entries currently live (mappings or sub-tables).
    live: usize,
}

pub struct VSpace {
    root: TableHandle,
    /// Shadow of every table we created, keyed by handle. The root is
    /// nano-owned and absent.
    tables: HashMap<TableHandle, TableInfo>,
}

impl VSpace {
    pub fn new(root: TableHandle) -> VSpace {
        VSpace {
            root,
            tables: HashMap::new(),
        }
    }

    /// Tables currently live, counting the root.
    pub fn table_count(&self) -> usize { self.tables.len() + 1 }

    /// Resolves |parent|[|index|] to a sub-table, building one from a clean
    /// page if the slot is empty.
    fn ensure_table(
        &mut self,
        book: &mut PageBook,
        nano: &mut dyn NanoKernelInterface,
        parent: TableHandle,
        index: usize,
    ) -> Result<TableHandle, MemoryManagerError> {
        if let Some(table) = nano.sub_table(parent, index) {
            return Ok(table);
        }
        let pfn = book
            .take_clean(1, 1, nano)
            .ok_or(MemoryManagerError::RequestNoneFound)?;
        book.set_range_status(pfn, 1, PageStatus::Ptable);
        let table = nano
            .create_table(pfn, parent, index)
            .expect("create_table on empty slot");
        if let Some(info) = self.tables.get_mut(&parent) {
            info.live += 1;
        }
        self.tables.insert(table, TableInfo { pfn, live: 0 });
        trace!("new table {:?} at [{:?}][{}] pfn {:#x}", table, parent, index, pfn);
        Ok(table)
    }

    /// Commits one faulting page: walks (and lazily creates) the tables
    /// down to |vpage|, takes a clean physical page, and installs the
    /// mapping. Re-committing an already mapped page is benign; racing
    /// faulters both come through here.
    pub fn commit_page(
        &mut self,
        book: &mut PageBook,
        nano: &mut dyn NanoKernelInterface,
        vpage: usize,
    ) -> Result<usize, MemoryManagerError> {
        let l1 = self.ensure_table(book, nano, self.root, level_index(vpage, 0))?;
        let l2 = self.ensure_table(book, nano, l1, level_index(vpage, 1))?;
        let index = level_index(vpage, 2);
        if let Some(pfn) = nano.mapping(l2, index) {
            return Ok(pfn);
        }
        let pfn = book
            .take_clean(1, 1, nano)
            .ok_or(MemoryManagerError::RequestNoneFound)?;
        book.set_range_status(pfn, 1, PageStatus::Mapped);
        nano.create_mapping(pfn, l2, index).expect("create_mapping on empty slot");
        self.tables.get_mut(&l2).expect("vspace shadow missing table").live += 1;
        #[cfg(feature = "CONFIG_NOISY_COMMIT")]
        trace!("commit vpage {:#x} -> pfn {:#x}", vpage, pfn);
        Ok(pfn)
    }

    /// Commits |pages| pages starting at |start_page| in one pass,
    /// re-resolving the L1/L2 tables only when the walk crosses a table
    /// boundary. With |contiguous| the whole span is backed by a single
    /// physical run placed at capability-representable alignment.
    pub fn commit_range(
        &mut self,
        book: &mut PageBook,
        nano: &mut dyn NanoKernelInterface,
        start_page: usize,
        pages: usize,
        contiguous: bool,
    ) -> Result<(), MemoryManagerError> {
        assert!(pages > 0);
        let end = start_page + pages;
        // Tables before backing: a run taken from the book must not be
        // stranded half-installed by a failed table allocation.
        let mut vpage = start_page;
        while vpage < end {
            let l1 = self.ensure_table(book, nano, self.root, level_index(vpage, 0))?;
            self.ensure_table(book, nano, l1, level_index(vpage, 1))?;
            let span = level_span_pages(1);
            vpage = (vpage / span + 1) * span;
        }
        let backing = if contiguous {
            let align = representable_align_pages(pages);
            let head = book
                .take_clean(pages, align, nano)
                .ok_or(MemoryManagerError::RequestNoneFound)?;
            book.set_range_status(head, pages, PageStatus::Mapped);
            Some(head)
        } else {
            None
        };
        let mut l1 = TableHandle(0);
        let mut l2 = TableHandle(0);
        for i in 0..pages {
            let vpage = start_page + i;
            if i == 0 || vpage & (level_span_pages(0) - 1) == 0 {
                l1 = self.ensure_table(book, nano, self.root, level_index(vpage, 0))?;
            }
            if i == 0 || vpage & (level_span_pages(1) - 1) == 0 {
                l2 = self.ensure_table(book, nano, l1, level_index(vpage, 1))?;
            }
            let index = level_index(vpage, 2);
            assert!(
                nano.mapping(l2, index).is_none(),
                "commit_range over live mapping at vpage {:#x}",
                vpage
            );
            let pfn = match backing {
                Some(head) => head + i,
                None => {
                    let pfn = book
                        .take_clean(1, 1, nano)
                        .ok_or(MemoryManagerError::RequestNoneFound)?;
                    book.set_range_status(pfn, 1, PageStatus::Mapped);
                    pfn
                }
            };
            nano.create_mapping(pfn, l2, index).expect("create_mapping on empty slot");
            self.tables.get_mut(&l2).expect("vspace shadow missing table").live += 1;
        }
        Ok(())
    }

    /// Unmaps [start_page, start_page + pages), returning backing pages to
    /// the book as Dirty and tearing down page tables bottom-up as they
    /// empty. |keep_first|/|keep_last| preserve the sentinel pages: the
    /// first holds reservation metadata, the last pins the enclosing
    /// tables until revocation. Returns the pages handed back to the book.
    pub fn free_range(
        &mut self,
        book: &mut PageBook,
        nano: &mut dyn NanoKernelInterface,
        start_page: usize,
        pages: usize,
        keep_first: bool,
        keep_last: bool,
    ) -> usize {
        assert!(pages > 0);
        let end = start_page + pages;
        let sentinels = (
            if keep_first { Some(start_page) } else { None },
            if keep_last { Some(end - 1) } else { None },
        );
        self.free_walk(book, nano, self.root, 0, 0, start_page, end, sentinels)
    }

    #[allow(clippy::too_many_arguments)]
    fn free_walk(
        &mut self,
        book: &mut PageBook,
        nano: &mut dyn NanoKernelInterface,
        table: TableHandle,
        level: usize,
        table_base: usize,
        lo: usize,
        hi: usize,
        sentinels: (Option<usize>, Option<usize>),
    ) -> usize {
        let span = level_span_pages(level);
        let mut freed = 0;
        let first_slot = level_index(lo, level);
        let last_slot = level_index(hi - 1, level);
        for slot in first_slot..=last_slot {
            let slot_base = table_base + slot * span;
            if level == 2 {
                if sentinels.0 == Some(slot_base) || sentinels.1 == Some(slot_base) {
                    continue;
                }
                if nano.mapping(table, slot).is_some() {
                    let pfn = nano.free_mapping(table, slot).expect("free_mapping");
                    book.set_range_status(pfn, 1, PageStatus::Dirty);
                    self.tables.get_mut(&table).expect("vspace shadow missing table").live -= 1;
                    freed += 1;
                }
            } else if let Some(sub) = nano.sub_table(table, slot) {
                let sub_lo = lo.max(slot_base);
                let sub_hi = hi.min(slot_base + span);
                freed += self.free_walk(book, nano, sub, level + 1, slot_base, sub_lo, sub_hi, sentinels);
                if self.tables.get(&sub).expect("vspace shadow missing table").live == 0 {
                    let pfn = nano.free_table(table, slot).expect("free_table");
                    self.tables.remove(&sub);
                    book.set_range_status(pfn, 1, PageStatus::Dirty);
                    if let Some(info) = self.tables.get_mut(&table) {
                        info.live -= 1;
                    }
                    trace!("freed table {:?} at [{:?}][{}] pfn {:#x}", sub, table, slot, pfn);
                }
            }
        }
        freed
    }

    /// Read-only translation of |vaddr|. None when any level is unmapped.
    pub fn virt_to_phys(&self, nano: &dyn NanoKernelInterface, vaddr: usize) -> Option<usize> {
        let vpage = vaddr >> PAGE_BITS;
        let l1 = nano.sub_table(self.root, level_index(vpage, 0))?;
        let l2 = nano.sub_table(l1, level_index(vpage, 1))?;
        let pfn = nano.mapping(l2, level_index(vpage, 2))?;
        Some((pfn << PAGE_BITS) | (vaddr & (PAGE_SIZE - 1)))
    }
}

// free_walk derives slot indices from absolute page numbers; that only
// works while sub-tables cover radix-aligned spans.
static_assertions::const_assert!(TABLE_ENTRIES.is_power_of_two());
