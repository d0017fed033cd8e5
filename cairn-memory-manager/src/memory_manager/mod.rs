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

//! CairnOS memory manager service implementation.
//!
//! Virtual memory is tracked in a descriptor tree mirroring the page table
//! radix (tree), physical pages in a run-length book (book), and live
//! mappings in the paging layer (vspace). MOPs (mops) account ownership of
//! allocated ranges through claim lists. Freed ranges become tombs and sit
//! out of the free pools until a revocation sweep proves no capability
//! minted over them survives; only then do they reopen for reuse.
//!
//! The page-fault commit path goes straight to the book and the paging
//! layer. The tree and the MOP table stay out of it, which the module
//! split below enforces: vspace cannot name either.

mod book;
mod mops;
mod tree;
mod vspace;

#[cfg(test)]
mod tests_prop;

use crate::memory_manager::book::PageBook;
use crate::memory_manager::book::PageStatus;
use crate::memory_manager::mops::MopState;
use crate::memory_manager::mops::MopTable;
use crate::memory_manager::tree::ClaimLink;
use crate::memory_manager::tree::DescId;
use crate::memory_manager::tree::RangeTree;
use crate::memory_manager::vspace::VSpace;
use cairn_memory_interface::MemRegion;
use cairn_memory_interface::MemRequestFlags;
use cairn_memory_interface::MemoryManagerError;
use cairn_memory_interface::MemoryManagerStats;
use cairn_memory_interface::MopId;
use cairn_memory_interface::PhysRegion;
use cairn_memory_interface::MOP_REQUIRED_SPACE;
use cairn_nano_interface::representable_align_pages;
use cairn_nano_interface::NanoKernelInterface;
use cairn_nano_interface::ResHandle;
use cairn_nano_interface::PAGE_BITS;
use cairn_nano_interface::PAGE_SIZE;
use log::info;
use log::trace;
use log::warn;
use smallvec::SmallVec;

/// Tombs shorter than this are left to merge with future neighbors before
/// a sweep is spent on them. A pool miss overrides the threshold.
const REVOKE_MIN_PAGES: usize = 4;

/// The one sweep the nano kernel runs at a time.
struct RevokeSession {
    res: ResHandle,
    desc: DescId,
    /// Frames still backing the range's first and last pages. They hold
    /// reservation metadata the sweep reads, so they sit quarantined in
    /// the book until the sweep completes.
    sentinels: SmallVec<[usize; 2]>,
}

pub struct MemoryManager {
    book: PageBook,
    vspace: VSpace,
    tree: RangeTree,
    mops: MopTable,
    revoke: Option<RevokeSession>,
    root_mop: u16,

    requests: usize,
    committed_pages: usize,
    revocations: usize,
}

impl MemoryManager {
    pub fn new(nano: &mut dyn NanoKernelInterface) -> MemoryManager {
        let boot = nano.boot_info();
        let mut mops = MopTable::new();
        let root_mop = mops.create(None, "memmgt").expect("mop table full at boot");
        info!(
            "managing {} phys pages, virt [{:#x},{:#x})",
            boot.phys_pages,
            boot.virt_base_page << PAGE_BITS,
            (boot.virt_base_page + boot.virt_pages) << PAGE_BITS
        );
        MemoryManager {
            book: PageBook::new(boot.phys_pages),
            vspace: VSpace::new(nano.root_table()),
            tree: RangeTree::new(boot.virt_base_page, boot.virt_pages, boot.seed),
            mops,
            revoke: None,
            root_mop,
            requests: 0,
            committed_pages: 0,
            revocations: 0,
        }
    }

    /// The MOP owning the manager's own claims; handed to the init system
    /// as the root of the ownership hierarchy.
    pub fn root_mop_id(&self) -> MopId {
        self.mops.id_for(self.root_mop)
    }

    pub fn mem_request(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        base: usize,
        length: usize,
        flags: MemRequestFlags,
        owner: MopId,
    ) -> Result<MemRegion, MemoryManagerError> {
        self.requests += 1;
        let owner_slot = self
            .mops
            .lookup(owner)
            .ok_or(MemoryManagerError::BadMop)?;
        if length == 0 {
            return Err(MemoryManagerError::BadBase);
        }
        let payload_pages = length
            .checked_add(PAGE_SIZE - 1)
            .ok_or(MemoryManagerError::RequestNoneFound)?
            >> PAGE_BITS;
        let dma = flags.contains(MemRequestFlags::COMMIT_DMA);
        let commit = dma || flags.contains(MemRequestFlags::COMMIT_NOW);
        // DMA ranges reserve one extra page up front: the reservation's
        // first page carries its metadata and is skipped.
        let mut alloc_pages = payload_pages + dma as usize;

        let (mut id, target) = if base != 0 {
            if base & (PAGE_SIZE - 1) != 0 {
                return Err(MemoryManagerError::BadBase);
            }
            let page = base >> PAGE_BITS;
            let id = self
                .tree
                .try_find_leaf(page)
                .ok_or(MemoryManagerError::BadBase)?;
            if !matches!(self.tree.desc(id).state, tree::NodeState::Open { .. }) {
                return Err(MemoryManagerError::RequestUnavailable);
            }
            if page + alloc_pages > self.tree.desc(id).end()
                || !self.tree.representable(id, page, alloc_pages)
            {
                return Err(MemoryManagerError::RequestUnavailable);
            }
            (id, page)
        } else {
            let align = if flags.contains(MemRequestFlags::ALIGN_TOP) {
                // The payload sits at the top of a naturally aligned
                // power-of-two block; reserve the whole block.
                alloc_pages = alloc_pages.next_power_of_two();
                alloc_pages
            } else {
                1
            };
            match self.tree.find_open(alloc_pages, align) {
                Some(hit) => hit,
                None => {
                    // Nothing open fits. Press any eligible tomb into a
                    // sweep; the caller retries once it completes.
                    self.maybe_start_revoke(nano, /*urgent=*/ true);
                    return Err(MemoryManagerError::RequestNoneFound);
                }
            }
        };

        // Carve [target, target + alloc_pages) out of the open leaf. The
        // head cut goes first; representability of the target means the
        // piece right of it comes out whole, and the tail cut then leaves
        // the target as the uncut left piece.
        if target != self.tree.desc(id).start {
            let (_, right) = self.tree.split_leaf(nano, &mut self.mops, id, target);
            id = right;
        }
        if target + alloc_pages < self.tree.desc(id).end() {
            let (left, _) = self.tree.split_leaf(nano, &mut self.mops, id, target + alloc_pages);
            id = left;
        }
        let d = self.tree.desc(id);
        assert_eq!((d.start, d.length), (target, alloc_pages));
        let res = self.tree.reservation(id);
        self.tree.allocate(id);
        self.mops
            .link_claim(&mut self.tree, owner_slot, ClaimLink { desc: id, index: 0 }, 1);

        if commit {
            let (commit_start, commit_pages) = if dma {
                (target + 1, alloc_pages - 1)
            } else {
                (target, alloc_pages)
            };
            if let Err(err) =
                self.vspace
                    .commit_range(&mut self.book, nano, commit_start, commit_pages, dma)
            {
                // Back out the carve. The range tombs and waits for a
                // sweep like any other free.
                warn!("commit of [{:#x},{:#x}) failed", commit_start, commit_start + commit_pages);
                self.mops
                    .unlink_claim(&mut self.tree, ClaimLink { desc: id, index: 0 });
                self.free_desc(nano, id);
                return Err(err);
            }
            self.committed_pages += commit_pages;
        }

        let base_page = if flags.contains(MemRequestFlags::ALIGN_TOP) && base == 0 {
            target + alloc_pages - payload_pages
        } else if dma {
            target + 1
        } else {
            target
        };
        trace!(
            "request {} pages -> [{:#x},{:#x}) for {}",
            alloc_pages,
            target << PAGE_BITS,
            (target + alloc_pages) << PAGE_BITS,
            self.mops.mop(owner_slot).debug_label
        );
        Ok(MemRegion {
            base: base_page << PAGE_BITS,
            length,
            reservation: res,
        })
    }

    pub fn mem_claim(
        &mut self,
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    ) -> Result<(), MemoryManagerError> {
        let slot = self
            .mops
            .lookup(owner)
            .ok_or(MemoryManagerError::BadMop)?;
        if times == 0 || length == 0 {
            return Ok(());
        }
        self.claim_range(slot, base, length, times)
    }

    /// Adds |times| claims for |slot| on every leaf intersecting the byte
    /// range. Two passes keep the operation all-or-nothing: the first
    /// proves every leaf will take the claim, the second applies it.
    fn claim_range(
        &mut self,
        slot: u16,
        base: usize,
        length: usize,
        times: usize,
    ) -> Result<(), MemoryManagerError> {
        let first = base >> PAGE_BITS;
        let last = base
            .checked_add(length - 1)
            .ok_or(MemoryManagerError::ClaimNotInUse)?
            >> PAGE_BITS;

        let mut page = first;
        while page <= last {
            let id = self
                .tree
                .try_find_leaf(page)
                .ok_or(MemoryManagerError::ClaimNotInUse)?;
            let d = self.tree.desc(id);
            match d.state {
                tree::NodeState::Allocated { .. } => {}
                tree::NodeState::Tomb { .. } => return Err(MemoryManagerError::ClaimFreed),
                _ => return Err(MemoryManagerError::ClaimNotInUse),
            }
            match self.tree.find_claimer(id, slot) {
                Some(index) => {
                    let held = self.tree.claimer(ClaimLink { desc: id, index }).times;
                    if held.checked_add(times).is_none() {
                        return Err(MemoryManagerError::ClaimOverflow);
                    }
                }
                None => {
                    if self.tree.spare_claimer_slot(id).is_none() {
                        return Err(MemoryManagerError::ClaimLimit);
                    }
                }
            }
            page = d.end();
        }

        let mut page = first;
        while page <= last {
            let id = self.tree.find_leaf(page);
            let end = self.tree.desc(id).end();
            match self.tree.find_claimer(id, slot) {
                Some(index) => {
                    self.tree.claimer_mut(ClaimLink { desc: id, index }).times += times
                }
                None => {
                    let index = self.tree.spare_claimer_slot(id).expect("claim slot vanished");
                    self.mops
                        .link_claim(&mut self.tree, slot, ClaimLink { desc: id, index }, times);
                }
            }
            page = end;
        }
        Ok(())
    }

    pub fn mem_release(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    ) -> Result<(), MemoryManagerError> {
        let slot = self
            .mops
            .lookup(owner)
            .ok_or(MemoryManagerError::BadMop)?;
        if times == 0 || length == 0 {
            return Ok(());
        }
        let first = base >> PAGE_BITS;
        let last = base
            .checked_add(length - 1)
            .ok_or(MemoryManagerError::ClaimNotInUse)?
            >> PAGE_BITS;

        // Pass one: every touched leaf must hold at least |times| claims
        // from |slot|.
        let mut page = first;
        while page <= last {
            let id = self
                .tree
                .try_find_leaf(page)
                .ok_or(MemoryManagerError::ClaimNotInUse)?;
            let d = self.tree.desc(id);
            match d.state {
                tree::NodeState::Allocated { .. } => {}
                tree::NodeState::Tomb { .. } => return Err(MemoryManagerError::ClaimFreed),
                _ => return Err(MemoryManagerError::ClaimNotInUse),
            }
            let index = self
                .tree
                .find_claimer(id, slot)
                .ok_or(MemoryManagerError::ClaimNotInUse)?;
            if self.tree.claimer(ClaimLink { desc: id, index }).times < times {
                return Err(MemoryManagerError::ClaimNotInUse);
            }
            page = d.end();
        }

        // Pass two: drop the claims. A leaf losing its last claim is
        // freed; later iterations re-find by page, so tree restructuring
        // under the freed leaf cannot strand the walk.
        let mut page = first;
        while page <= last {
            let id = self.tree.find_leaf(page);
            let end = self.tree.desc(id).end();
            let index = self.tree.find_claimer(id, slot).expect("claimer vanished");
            let link = ClaimLink { desc: id, index };
            let remaining = {
                let c = self.tree.claimer_mut(link);
                c.times -= times;
                c.times
            };
            if remaining == 0 {
                self.mops.unlink_claim(&mut self.tree, link);
                if self.tree.claimer_count(id) == 0 {
                    self.free_desc(nano, id);
                }
            }
            page = end;
        }
        Ok(())
    }

    pub fn mem_makemop(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        space: ResHandle,
        parent: MopId,
        debug_label: &str,
    ) -> Result<MopId, MemoryManagerError> {
        let parent_slot = self
            .mops
            .lookup(parent)
            .ok_or(MemoryManagerError::BadMop)?;
        let space_info = nano
            .res_info(space)
            .map_err(|_| MemoryManagerError::MakeMopBadSpace)?;
        if space_info.length < MOP_REQUIRED_SPACE {
            return Err(MemoryManagerError::MakeMopBadSpace);
        }
        let slot = self
            .mops
            .create(Some(parent_slot), debug_label)
            .ok_or(MemoryManagerError::MakeMopMaxMops)?;
        // The new MOP claims its own metadata backing. Linked first, the
        // claim sits at the head of the list and reclaim releases it last.
        if self
            .claim_range(slot, space_info.base, space_info.length, 1)
            .is_err()
        {
            self.mops.detach(slot);
            self.mops.mop_mut(slot).state = MopState::Dead;
            self.mops.release_slot(slot);
            return Err(MemoryManagerError::MakeMopBadSpace);
        }
        trace!("makemop '{}' under '{}'", debug_label, self.mops.mop(parent_slot).debug_label);
        Ok(self.mops.id_for(slot))
    }

    pub fn mem_reclaim_mop(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        owner: MopId,
    ) -> Result<(), MemoryManagerError> {
        let slot = self
            .mops
            .lookup(owner)
            .ok_or(MemoryManagerError::BadMop)?;
        if slot == self.root_mop {
            return Err(MemoryManagerError::BadMop);
        }
        self.reclaim_slot(nano, slot);
        Ok(())
    }

    fn reclaim_slot(&mut self, nano: &mut dyn NanoKernelInterface, slot: u16) {
        trace!("reclaiming mop '{}'", self.mops.mop(slot).debug_label);
        self.mops.mop_mut(slot).state = MopState::Reclaiming;
        // Children go first. Each reclaim unhooks the child, so keep
        // draining the chain head.
        while let Some(child) = self.mops.mop(slot).first_child {
            self.reclaim_slot(nano, child);
        }
        // Drop claims from the tail, re-reading the list each time:
        // freeing a leaf can restructure the tree and relocate links,
        // and the list ends are refreshed on relocation. The mop's own
        // backing claim was linked first and so sits at the head; it
        // stays behind until the mop is off the sibling chain.
        loop {
            let mop = self.mops.mop(slot);
            let link = match mop.last_claim {
                Some(link) if mop.first_claim != mop.last_claim => link,
                _ => break,
            };
            let id = link.desc;
            self.mops.unlink_claim(&mut self.tree, link);
            if self.tree.claimer_count(id) == 0 {
                self.free_desc(nano, id);
            }
        }
        self.mops.detach(slot);
        self.mops.mop_mut(slot).state = MopState::Dead;
        while let Some(link) = self.mops.mop(slot).first_claim {
            let id = link.desc;
            self.mops.unlink_claim(&mut self.tree, link);
            if self.tree.claimer_count(id) == 0 {
                self.free_desc(nano, id);
            }
        }
        self.mops.release_slot(slot);
    }

    pub fn mem_virt_to_phys(
        &self,
        nano: &dyn NanoKernelInterface,
        vaddr: usize,
    ) -> Result<usize, MemoryManagerError> {
        self.vspace
            .virt_to_phys(nano, vaddr)
            .ok_or(MemoryManagerError::RequestUnavailable)
    }

    /// Delegates physical pages to |owner| for device or DMA access. A
    /// nonzero |base| names the exact byte range to hand over, contents
    /// and all; base 0 finds any |length|-byte run and zeroes it first.
    /// No claim is taken: the granted run is marked mapped and never
    /// rejoins the free pools.
    pub fn mem_phys_cap(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        base: usize,
        length: usize,
        cached: bool,
        owner: MopId,
    ) -> Result<PhysRegion, MemoryManagerError> {
        let owner_slot = self
            .mops
            .lookup(owner)
            .ok_or(MemoryManagerError::BadMop)?;
        if length == 0 {
            return Err(MemoryManagerError::BadBase);
        }
        let (head, pages) = if base != 0 {
            let first = base >> PAGE_BITS;
            let last = base
                .checked_add(length - 1)
                .ok_or(MemoryManagerError::BadBase)?
                >> PAGE_BITS;
            if last >= self.book.total_pages() {
                return Err(MemoryManagerError::BadBase);
            }
            let pages = last - first + 1;
            // Every covered page must be free or dirty. Frames backing
            // mappings, tables, or an in-flight sweep stay where they are.
            let mut at = self.book.page_entry(first);
            while at < first + pages {
                match self.book.status_of(at) {
                    PageStatus::Free | PageStatus::Dirty => {}
                    _ => return Err(MemoryManagerError::RequestUnavailable),
                }
                at += self.book.len_of(at);
            }
            (first, pages)
        } else {
            let pages = length
                .checked_add(PAGE_SIZE - 1)
                .ok_or(MemoryManagerError::RequestNoneFound)?
                >> PAGE_BITS;
            let align = representable_align_pages(pages);
            let head = self
                .book
                .take_clean(pages, align, nano)
                .ok_or(MemoryManagerError::RequestNoneFound)?;
            (head, pages)
        };
        let phys = nano
            .phys_cap(head, pages, cached)
            .map_err(|_| MemoryManagerError::RequestUnavailable)?;
        self.book.set_range_status(head, pages, PageStatus::Mapped);
        trace!(
            "phys grant {} pages -> [{:#x},{:#x}) for {}",
            pages,
            head << PAGE_BITS,
            (head + pages) << PAGE_BITS,
            self.mops.mop(owner_slot).debug_label
        );
        Ok(PhysRegion {
            base: if base != 0 { base } else { head << PAGE_BITS },
            length,
            phys,
        })
    }

    /// Privileged fault entry: backs the faulting page with a clean frame.
    /// Touches only the book and the paging layer.
    pub fn commit_page(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        vaddr: usize,
    ) -> Result<usize, MemoryManagerError> {
        let pfn = self
            .vspace
            .commit_page(&mut self.book, nano, vaddr >> PAGE_BITS)?;
        self.committed_pages += 1;
        Ok(pfn)
    }

    /// Vacates a fully released leaf and parks it as a tomb. All pages but
    /// the first and last are unmapped; those two stay for the eventual
    /// sweep to read reservation metadata from.
    fn free_desc(&mut self, nano: &mut dyn NanoKernelInterface, id: DescId) {
        let d = self.tree.desc(id);
        let (start, pages) = (d.start, d.length);
        trace!("free [{:#x},{:#x})", start << PAGE_BITS, (start + pages) << PAGE_BITS);
        self.vspace.free_range(
            &mut self.book,
            nano,
            start,
            pages,
            /*keep_first=*/ true,
            /*keep_last=*/ true,
        );
        self.tree.entomb(id);
        let pinned = self.revoke.as_ref().map(|s| s.desc);
        self.tree.merge_leaf(nano, &mut self.mops, id, pinned);
        self.maybe_start_revoke(nano, /*urgent=*/ false);
    }

    /// Opens a sweep on the best eligible tomb, if the slot is free.
    /// |urgent| waives the size threshold after a failed request.
    fn maybe_start_revoke(&mut self, nano: &mut dyn NanoKernelInterface, urgent: bool) {
        if self.revoke.is_some() {
            return;
        }
        let min = if urgent { 1 } else { REVOKE_MIN_PAGES };
        let Some(id) = self.tree.best_revoke_candidate(min) else {
            return;
        };
        let d = self.tree.desc(id);
        let (start, pages) = (d.start, d.length);
        let res = self.tree.reservation(id);

        // Capture the frames behind the sentinel pages before they are
        // unmapped, then quarantine them for the duration of the sweep.
        let mut sentinels: SmallVec<[usize; 2]> = SmallVec::new();
        let mut sentinel_vpages: SmallVec<[usize; 2]> = SmallVec::new();
        sentinel_vpages.push(start);
        if pages > 1 {
            sentinel_vpages.push(start + pages - 1);
        }
        for vpage in sentinel_vpages {
            if let Some(paddr) = self.vspace.virt_to_phys(nano, vpage << PAGE_BITS) {
                sentinels.push(paddr >> PAGE_BITS);
            }
        }
        self.vspace.free_range(
            &mut self.book,
            nano,
            start,
            pages,
            /*keep_first=*/ false,
            /*keep_last=*/ false,
        );
        for &pfn in &sentinels {
            self.book.set_range_status(pfn, 1, PageStatus::Tombstone);
        }
        nano.revoke_start(res).expect("revoke_start refused");
        info!(
            "sweep started over [{:#x},{:#x})",
            start << PAGE_BITS,
            (start + pages) << PAGE_BITS
        );
        self.revoke = Some(RevokeSession { res, desc: id, sentinels });
        self.revocations += 1;
    }

    /// Completion notification for the in-flight sweep. The reissued
    /// reservation reopens the range, which rejoins its free pool, and the
    /// next eligible tomb is swept in turn.
    pub fn revoke_finished(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
    ) -> Result<(), MemoryManagerError> {
        let Some(session) = self.revoke.take() else {
            warn!("sweep completion with none in flight");
            return Err(MemoryManagerError::UnknownError);
        };
        let fresh = nano
            .revoke_finish(session.res)
            .expect("revoke_finish refused");
        for &pfn in &session.sentinels {
            self.book.set_range_status(pfn, 1, PageStatus::Dirty);
        }
        self.tree.reopen(session.desc, fresh);
        self.tree.merge_leaf(nano, &mut self.mops, session.desc, None);
        self.maybe_start_revoke(nano, /*urgent=*/ false);
        Ok(())
    }

    pub fn stats(&self) -> MemoryManagerStats {
        let counts = self.book.counts();
        let (open_ranges, allocated_ranges, tomb_ranges, desc_tables) = self.tree.range_counts();
        MemoryManagerStats {
            total_pages: self.book.total_pages(),
            free_pages: counts.free,
            dirty_pages: counts.dirty,
            mapped_pages: counts.mapped,
            ptable_pages: counts.ptable,
            tombstone_pages: counts.tombstone,
            open_ranges,
            allocated_ranges,
            tomb_ranges,
            desc_tables,
            mops_live: self.mops.live_count(),
            requests: self.requests,
            commits: self.committed_pages,
            revocations: self.revocations,
        }
    }

    pub fn debug(&self) {
        self.book.dump();
        self.tree.dump();
        self.mops.dump();
    }

    /// Full consistency audit; fatal on any violation.
    pub fn check(&self) {
        self.book.check_book();
        self.tree.check_tiling();
        self.tree.check_prev_chain();
        self.mops.check_claims(&self.tree);
    }
}
