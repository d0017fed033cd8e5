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

//! Physical page book: a run-length record of the state of every physical
//! page. Only run heads carry data; an entry with len == 0 is interior to
//! the run of the nearest head before it. The book starts life as one giant
//! Dirty run and is split and re-merged as pages move between states.

use alloc::vec;
use alloc::vec::Vec;
use cairn_nano_interface::NanoKernelInterface;
use log::info;

/// Coarse state of a physical page run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageStatus {
    /// Zeroed, ready to map.
    Free,
    /// Contents stale; must be zeroed before it may back a mapping.
    Dirty,
    /// Backing a live mapping.
    Mapped,
    /// Backing a hardware page table.
    Ptable,
    /// Part of a range whose revocation sweep is in flight.
    Tombstone,
}

#[derive(Clone, Copy, Debug)]
struct BookEntry {
    status: PageStatus,
    /// Run length in pages; nonzero only at run heads.
    len: usize,
    /// Head of the preceding run; valid at heads (0 has no predecessor).
    prev: usize,
}

/// Tallies for the Stats request, in pages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BookCounts {
    pub free: usize,
    pub dirty: usize,
    pub mapped: usize,
    pub ptable: usize,
    pub tombstone: usize,
}

pub struct PageBook {
    entries: Vec<BookEntry>,
}

impl PageBook {
    pub fn new(total_pages: usize) -> PageBook {
        assert!(total_pages > 0);
        let mut entries = vec![
            BookEntry {
                status: PageStatus::Dirty,
                len: 0,
                prev: 0,
            };
            total_pages
        ];
        entries[0].len = total_pages;
        PageBook { entries }
    }

    pub fn total_pages(&self) -> usize { self.entries.len() }

    pub fn status_of(&self, head: usize) -> PageStatus {
        assert_ne!(self.entries[head].len, 0, "page {:#x} is not a run head", head);
        self.entries[head].status
    }

    pub fn len_of(&self, head: usize) -> usize {
        assert_ne!(self.entries[head].len, 0, "page {:#x} is not a run head", head);
        self.entries[head].len
    }

    /// Head of the run covering |pfn|, found by walking the run chain from
    /// the bottom of memory.
    fn head_of(&self, pfn: usize) -> usize {
        if self.entries[pfn].len != 0 {
            return pfn;
        }
        let mut head = 0;
        while head + self.entries[head].len <= pfn {
            head += self.entries[head].len;
        }
        head
    }

    /// Makes |pfn| a run head, splitting the covering run if needed.
    pub fn page_entry(&mut self, pfn: usize) -> usize {
        assert!(pfn < self.entries.len());
        if self.entries[pfn].len != 0 {
            return pfn;
        }
        let head = self.head_of(pfn);
        self.split_run(head, pfn - head);
        pfn
    }

    /// Splits the run at |head| so its first |len| pages form their own
    /// run. No-op when the run is already exactly |len| long.
    pub fn split_run(&mut self, head: usize, len: usize) {
        let run_len = self.entries[head].len;
        if run_len == len {
            return;
        }
        assert!(
            len > 0 && len < run_len,
            "split of run {:#x} (len {:#x}) at bad offset {:#x}",
            head,
            run_len,
            len
        );
        let tail = head + len;
        self.entries[tail] = BookEntry {
            status: self.entries[head].status,
            len: run_len - len,
            prev: head,
        };
        self.entries[head].len = len;
        let next = head + run_len;
        if next != self.entries.len() {
            self.entries[next].prev = tail;
        }
        self.check_entry(head);
        self.check_entry(tail);
    }

    /// Absorbs the run after |head| if it has the same status.
    pub fn try_merge_after(&mut self, head: usize) -> bool {
        let after = head + self.entries[head].len;
        if after == self.entries.len() || self.entries[head].status != self.entries[after].status {
            return false;
        }
        let after_len = self.entries[after].len;
        self.entries[head].len += after_len;
        self.entries[after].len = 0;
        let next = head + self.entries[head].len;
        if next != self.entries.len() {
            self.entries[next].prev = head;
        }
        self.check_entry(head);
        true
    }

    /// Coalesces |head| with equal-status neighbors on both sides and
    /// returns the head of the (possibly grown) run.
    pub fn try_merge(&mut self, mut head: usize) -> usize {
        if head != 0 {
            let before = self.entries[head].prev;
            if self.entries[before].status == self.entries[head].status {
                assert_eq!(
                    before + self.entries[before].len,
                    head,
                    "book prev chain broken at {:#x}",
                    head
                );
                self.entries[before].len += self.entries[head].len;
                self.entries[head].len = 0;
                head = before;
                let next = head + self.entries[head].len;
                if next != self.entries.len() {
                    self.entries[next].prev = head;
                }
            }
        }
        self.try_merge_after(head);
        self.check_entry(head);
        head
    }

    /// First-fit search for a run of |status| at least |pages| long whose
    /// (alignment-rounded) start fits |pages| pages. The matched extent is
    /// split to exactly |pages| and its head returned. None means
    /// exhaustion, which callers report as an error, never panic over.
    pub fn find_page_type(
        &mut self,
        pages: usize,
        status: PageStatus,
        align: usize,
    ) -> Option<usize> {
        assert!(pages > 0);
        assert!(align.is_power_of_two());
        let end = self.entries.len();
        let mut head = 0;
        while head != end {
            let entry = self.entries[head];
            if entry.status == status {
                let aligned = (head + align - 1) & !(align - 1);
                if aligned + pages <= head + entry.len {
                    if aligned != head {
                        self.split_run(head, aligned - head);
                    }
                    self.split_run(aligned, pages);
                    return Some(aligned);
                }
            }
            head += entry.len;
        }
        None
    }

    /// Rewrites [pfn, pfn + pages) to |status|, carving runs as needed and
    /// re-merging afterwards. Returns the head of the covering run.
    pub fn set_range_status(&mut self, pfn: usize, pages: usize, status: PageStatus) -> usize {
        assert!(pages > 0 && pfn + pages <= self.entries.len());
        let mut at = pfn;
        let mut remaining = pages;
        while remaining > 0 {
            let head = self.page_entry(at);
            let run = self.entries[head].len.min(remaining);
            self.split_run(head, run);
            self.entries[head].status = status;
            at += run;
            remaining -= run;
        }
        // The carved runs are adjacent and equal-status; fold them back
        // into one, then coalesce with the outside neighbors.
        let head = self.page_entry(pfn);
        while head + self.entries[head].len < pfn + pages {
            let merged = self.try_merge_after(head);
            assert!(merged, "range carve left a hole at {:#x}", head);
        }
        self.try_merge(head)
    }

    /// Takes an exact |pages|-long run of clean pages, zeroing dirty ones
    /// through the nano layer when no clean run is big enough. The returned
    /// run is left Free; the caller marks its eventual state.
    pub fn take_clean(
        &mut self,
        pages: usize,
        align: usize,
        nano: &mut dyn NanoKernelInterface,
    ) -> Option<usize> {
        if let Some(head) = self.find_page_type(pages, PageStatus::Free, align) {
            return Some(head);
        }
        if let Some(head) = self.find_page_type(pages, PageStatus::Dirty, align) {
            nano.zero_pages(head, pages);
            self.entries[head].status = PageStatus::Free;
            return Some(head);
        }
        // Clean pages may be fragmented across dirty runs; zero the backlog
        // and retry once.
        self.clean_backlog(nano);
        self.find_page_type(pages, PageStatus::Free, align)
    }

    /// Zeroes every dirty run and condenses the book.
    pub fn clean_backlog(&mut self, nano: &mut dyn NanoKernelInterface) {
        let end = self.entries.len();
        let mut head = 0;
        while head != end {
            let len = self.entries[head].len;
            if self.entries[head].status == PageStatus::Dirty {
                nano.zero_pages(head, len);
                self.entries[head].status = PageStatus::Free;
            }
            head += len;
        }
        self.condense();
    }

    /// Full merge pass over the whole book.
    pub fn condense(&mut self) {
        let end = self.entries.len();
        let mut head = 0;
        while head != end {
            while self.try_merge_after(head) {}
            head += self.entries[head].len;
        }
    }

    pub fn check_entry(&self, head: usize) {
        if head != 0 {
            let prev = self.entries[head].prev;
            assert_eq!(
                prev + self.entries[prev].len,
                head,
                "book prev chain broken at {:#x}",
                head
            );
        }
        let next = head + self.entries[head].len;
        assert!(next <= self.entries.len());
        if next != self.entries.len() {
            assert_eq!(self.entries[next].prev, head, "book next link broken at {:#x}", head);
        }
    }

    /// Walks every run and asserts the book exactly tiles physical memory.
    pub fn check_book(&self) {
        let end = self.entries.len();
        let mut head = 0;
        let mut last: Option<usize> = None;
        while head < end {
            let entry = &self.entries[head];
            assert_ne!(entry.len, 0, "zero length run at {:#x}", head);
            if let Some(prev) = last {
                assert_eq!(entry.prev, prev, "book prev chain broken at {:#x}", head);
            }
            last = Some(head);
            head += entry.len;
        }
        assert_eq!(head, end, "book runs do not tile physical memory");
    }

    pub fn counts(&self) -> BookCounts {
        let mut counts = BookCounts::default();
        let end = self.entries.len();
        let mut head = 0;
        while head != end {
            let entry = &self.entries[head];
            match entry.status {
                PageStatus::Free => counts.free += entry.len,
                PageStatus::Dirty => counts.dirty += entry.len,
                PageStatus::Mapped => counts.mapped += entry.len,
                PageStatus::Ptable => counts.ptable += entry.len,
                PageStatus::Tombstone => counts.tombstone += entry.len,
            }
            head += entry.len;
        }
        counts
    }

    /// Logs every run; the Debug request's book half.
    pub fn dump(&self) {
        let end = self.entries.len();
        let mut head = 0;
        while head != end {
            let entry = &self.entries[head];
            info!(
                "book: page {:#x} len {:#x} prev {:#x} {:?}",
                head, entry.len, entry.prev, entry.status
            );
            head += entry.len;
        }
    }
}
