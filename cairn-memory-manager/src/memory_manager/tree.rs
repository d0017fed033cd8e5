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

//! Range descriptor tree: a three-level radix tree over the managed virtual
//! window, mirroring the shape of the hardware page tables. Each leaf
//! records one contiguous range and owns its reservation; internal nodes
//! summarise a sub-table whose children exactly tile the node's range.
//!
//! Descriptors are addressed as (table, slot) pairs. A descriptor sits in
//! the slot selected by its start page's index bits for the table's level;
//! a range longer than one slot span leaves the following slots free. Two
//! ranges whose starts share a slot cannot coexist in one table, so splits
//! push descriptors down into child tables until the starts separate.

use crate::memory_manager::mops::MopTable;
use alloc::vec;
use alloc::vec::Vec;
use cairn_nano_interface::level_index;
use cairn_nano_interface::level_span_pages;
use cairn_nano_interface::NanoKernelInterface;
use cairn_nano_interface::ResHandle;
use cairn_nano_interface::PAGE_SIZE;
use cairn_nano_interface::TABLE_ENTRIES;
use cairn_nano_interface::TRANSLATION_LEVELS;
use log::info;
use log::trace;

/// Claimer slots per allocated leaf.
pub const MAX_CLAIMERS: usize = 4;

/// Open ranges at least this long are filed in the large free pool.
pub const LARGE_RANGE_PAGES: usize = 16384;

/// Stable address of a descriptor. Descriptors move between tables during
/// restructuring, so holders of a DescId may only keep it across operations
/// that promise not to relocate the descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DescId {
    pub table: u16,
    pub slot: u16,
}

/// Position of one claimer inside one descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClaimLink {
    pub desc: DescId,
    pub index: u8,
}

/// One MOP's hold on an allocated leaf. `prev`/`next` thread the owning
/// MOP's claim list through other descriptors.
#[derive(Clone, Copy, Debug)]
pub struct Claimer {
    pub mop: u16,
    pub times: usize,
    pub prev: Option<ClaimLink>,
    pub next: Option<ClaimLink>,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct PoolLink {
    prev: Option<DescId>,
    next: Option<DescId>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolId {
    SmallFree = 0,
    LargeFree = 1,
    Tomb = 2,
}
const POOL_COUNT: usize = 3;

#[derive(Clone, Debug)]
pub enum NodeState {
    /// Slot unoccupied; the pages are covered by a preceding descriptor
    /// (or lie outside the managed window, at the root).
    Free,
    /// Unallocated range holding an open reservation, filed in a free pool.
    Open { res: ResHandle, link: PoolLink },
    /// Range handed out to one or more claimers.
    Allocated {
        res: ResHandle,
        claimers: [Option<Claimer>; MAX_CLAIMERS],
    },
    /// Freed range awaiting revocation, filed in the tomb pool.
    Tomb { res: ResHandle, link: PoolLink },
    /// Summary of a child table tiling this node's range.
    Internal { table: u16 },
}

#[derive(Clone, Debug)]
pub struct RangeDesc {
    pub start: usize,
    pub length: usize,
    /// Start page of the leaf immediately preceding this one in address
    /// order; None for the first leaf of the window.
    pub prev: Option<usize>,
    /// Pages of a tomb released so far; a tomb is swept only once this
    /// covers the whole range.
    pub allocated_length: usize,
    pub state: NodeState,
}

impl RangeDesc {
    const FREE: RangeDesc = RangeDesc {
        start: 0,
        length: 0,
        prev: None,
        allocated_length: 0,
        state: NodeState::Free,
    };

    pub fn end(&self) -> usize { self.start + self.length }

    pub fn is_leaf(&self) -> bool {
        !matches!(self.state, NodeState::Free | NodeState::Internal { .. })
    }
}

struct DescTable {
    level: usize,
    /// Internal descriptor this table hangs off; None for the root.
    parent: Option<DescId>,
    /// Occupied (non-free) slots.
    ranges_allocated: usize,
    descs: Vec<RangeDesc>,
}

impl DescTable {
    fn new(level: usize, parent: Option<DescId>) -> DescTable {
        DescTable {
            level,
            parent,
            ranges_allocated: 0,
            descs: vec![RangeDesc::FREE; TABLE_ENTRIES],
        }
    }
}

#[derive(Default)]
struct Pool {
    head: Option<DescId>,
    count: usize,
}

pub struct RangeTree {
    tables: Vec<Option<DescTable>>,
    table_pool: Vec<u16>,
    pools: [Pool; POOL_COUNT],
    window_base: usize,
    window_pages: usize,
}

/// First page past the natural slot span containing |page| at |level|.
fn span_bound(page: usize, level: usize) -> usize {
    let span = level_span_pages(level);
    (page / span + 1) * span
}

fn round_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

impl RangeTree {
    /// Builds the tree over [window_base, window_base + window_pages) with
    /// a single open leaf owning the seed reservation.
    pub fn new(window_base: usize, window_pages: usize, seed: ResHandle) -> RangeTree {
        assert!(window_pages > 0);
        let mut tree = RangeTree {
            tables: vec![Some(DescTable::new(0, None))],
            table_pool: Vec::new(),
            pools: Default::default(),
            window_base,
            window_pages,
        };
        let slot = level_index(window_base, 0) as u16;
        let id = DescId { table: 0, slot };
        let table = tree.table_mut(0);
        table.descs[slot as usize] = RangeDesc {
            start: window_base,
            length: window_pages,
            prev: None,
            allocated_length: 0,
            state: NodeState::Open {
                res: seed,
                link: PoolLink::default(),
            },
        };
        table.ranges_allocated = 1;
        tree.pool_push(id);
        tree
    }

    pub fn window(&self) -> (usize, usize) { (self.window_base, self.window_pages) }

    fn table(&self, index: u16) -> &DescTable {
        self.tables[index as usize].as_ref().expect("dead desc table")
    }

    fn table_mut(&mut self, index: u16) -> &mut DescTable {
        self.tables[index as usize].as_mut().expect("dead desc table")
    }

    pub fn desc(&self, id: DescId) -> &RangeDesc {
        &self.table(id.table).descs[id.slot as usize]
    }

    fn desc_mut(&mut self, id: DescId) -> &mut RangeDesc {
        &mut self.table_mut(id.table).descs[id.slot as usize]
    }

    fn alloc_table(&mut self, level: usize, parent: DescId) -> u16 {
        assert!(level < TRANSLATION_LEVELS);
        let table = DescTable::new(level, Some(parent));
        match self.table_pool.pop() {
            Some(index) => {
                self.tables[index as usize] = Some(table);
                index
            }
            None => {
                self.tables.push(Some(table));
                (self.tables.len() - 1) as u16
            }
        }
    }

    fn free_table(&mut self, index: u16) {
        assert_eq!(self.table(index).ranges_allocated, 0);
        self.tables[index as usize] = None;
        self.table_pool.push(index);
    }

    /// Finds the leaf covering |page|, or None when the page lies outside
    /// the managed window.
    pub fn try_find_leaf(&self, page: usize) -> Option<DescId> {
        if page < self.window_base || page >= self.window_base + self.window_pages {
            return None;
        }
        let mut table = 0u16;
        loop {
            let t = self.table(table);
            let mut slot = level_index(page, t.level);
            // Walk back over free slots and over descriptors that start
            // past |page| (a neighbor may spill into this slot's span).
            let found = loop {
                let d = &t.descs[slot];
                if !matches!(d.state, NodeState::Free) && d.start <= page {
                    break d;
                }
                assert!(slot > 0, "page {:#x} uncovered in table {}", page, table);
                slot -= 1;
            };
            assert!(
                page < found.end(),
                "page {:#x} in gap after {:#x}+{:#x}",
                page,
                found.start,
                found.length
            );
            match found.state {
                NodeState::Internal { table: sub } => table = sub,
                _ => {
                    return Some(DescId {
                        table,
                        slot: slot as u16,
                    })
                }
            }
        }
    }

    pub fn find_leaf(&self, page: usize) -> DescId {
        self.try_find_leaf(page).expect("page outside managed window")
    }

    /// Leaf whose range starts exactly at |page|, if the page is covered.
    pub fn leaf_starting_at(&self, page: usize) -> Option<DescId> {
        let id = self.try_find_leaf(page)?;
        assert_eq!(self.desc(id).start, page, "leaf boundary mismatch");
        Some(id)
    }

    // Free pool management. An open descriptor is filed by length, a tomb
    // in the tomb pool. Every length change goes through remove/push so the
    // small/large segregation never goes stale.

    fn pool_of(&self, id: DescId) -> PoolId {
        let d = self.desc(id);
        match d.state {
            NodeState::Open { .. } => {
                if d.length >= LARGE_RANGE_PAGES {
                    PoolId::LargeFree
                } else {
                    PoolId::SmallFree
                }
            }
            NodeState::Tomb { .. } => PoolId::Tomb,
            _ => panic!("descriptor not poolable"),
        }
    }

    fn link_mut(&mut self, id: DescId) -> &mut PoolLink {
        match &mut self.desc_mut(id).state {
            NodeState::Open { link, .. } | NodeState::Tomb { link, .. } => link,
            _ => panic!("descriptor has no pool link"),
        }
    }

    fn pool_push(&mut self, id: DescId) {
        let pool = self.pool_of(id);
        let head = self.pools[pool as usize].head;
        *self.link_mut(id) = PoolLink {
            prev: None,
            next: head,
        };
        if let Some(h) = head {
            self.link_mut(h).prev = Some(id);
        }
        self.pools[pool as usize].head = Some(id);
        self.pools[pool as usize].count += 1;
    }

    fn pool_remove(&mut self, id: DescId) {
        let pool = self.pool_of(id);
        let link = *self.link_mut(id);
        match link.prev {
            Some(p) => self.link_mut(p).next = link.next,
            None => {
                assert_eq!(self.pools[pool as usize].head, Some(id));
                self.pools[pool as usize].head = link.next;
            }
        }
        if let Some(n) = link.next {
            self.link_mut(n).prev = link.prev;
        }
        *self.link_mut(id) = PoolLink::default();
        self.pools[pool as usize].count -= 1;
    }

    pub fn pool_count(&self, pool: PoolId) -> usize { self.pools[pool as usize].count }

    /// True when |id| sits at the head of the pool it belongs to. Test aid.
    #[cfg(test)]
    pub fn pool_holds(&self, pool: PoolId, id: DescId) -> bool {
        let mut cur = self.pools[pool as usize].head;
        while let Some(c) = cur {
            if c == id {
                return true;
            }
            cur = match &self.desc(c).state {
                NodeState::Open { link, .. } | NodeState::Tomb { link, .. } => link.next,
                _ => panic!("non-poolable descriptor on pool list"),
            };
        }
        false
    }

    // Restructuring. Descriptors move by value, so every move re-links the
    // pool chain or claim list that points at the old position.

    fn fix_moved_links(&mut self, mops: &mut MopTable, old: DescId, new: DescId) {
        match self.desc(new).state.clone() {
            NodeState::Open { link, .. } | NodeState::Tomb { link, .. } => {
                let pooled = link.prev.is_some()
                    || link.next.is_some()
                    || self.pools[self.pool_of(new) as usize].head == Some(old);
                if !pooled {
                    return;
                }
                match link.prev {
                    Some(p) => self.link_mut(p).next = Some(new),
                    None => {
                        let pool = self.pool_of(new);
                        self.pools[pool as usize].head = Some(new);
                    }
                }
                if let Some(n) = link.next {
                    self.link_mut(n).prev = Some(new);
                }
            }
            NodeState::Allocated { claimers, .. } => {
                for (index, claimer) in claimers.iter().enumerate() {
                    let Some(c) = claimer else { continue };
                    let new_link = ClaimLink {
                        desc: new,
                        index: index as u8,
                    };
                    match c.prev {
                        Some(l) => {
                            assert!(l.desc != old);
                            self.claimer_mut(l).next = Some(new_link);
                        }
                        None => {}
                    }
                    match c.next {
                        Some(l) => {
                            assert!(l.desc != old);
                            self.claimer_mut(l).prev = Some(new_link);
                        }
                        None => {}
                    }
                    let old_link = ClaimLink {
                        desc: old,
                        index: index as u8,
                    };
                    mops.note_claim_moved(c.mop, old_link, new_link);
                }
            }
            NodeState::Free | NodeState::Internal { .. } => {}
        }
    }

    /// Pushes the leaf at |id| down into a fresh child table, leaving an
    /// internal summary in its place. The leaf must fit inside its slot's
    /// natural span. Returns the leaf's new position.
    fn internalize(&mut self, mops: &mut MopTable, id: DescId) -> DescId {
        let level = self.table(id.table).level;
        let d = self.desc(id).clone();
        assert!(d.is_leaf());
        assert!(d.end() <= span_bound(d.start, level), "leaf spills its slot span");

        let child = self.alloc_table(level + 1, id);
        let child_slot = level_index(d.start, level + 1) as u16;
        let new = DescId {
            table: child,
            slot: child_slot,
        };
        {
            let t = self.table_mut(child);
            t.descs[child_slot as usize] = d.clone();
            t.ranges_allocated = 1;
        }
        *self.desc_mut(id) = RangeDesc {
            start: d.start,
            length: d.length,
            prev: None,
            allocated_length: 0,
            state: NodeState::Internal { table: child },
        };
        self.fix_moved_links(mops, id, new);
        trace!("internalize [{:#x},{:#x}) into table {}", d.start, d.end(), child);
        new
    }

    /// Cuts an open leaf at |cut|, with the right piece landing directly in
    /// its own slot of the same table. Caller guarantees the slots differ.
    fn cut_leaf(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        id: DescId,
        cut: usize,
    ) -> (DescId, DescId) {
        let level = self.table(id.table).level;
        let (start, end, res) = {
            let d = self.desc(id);
            match d.state {
                NodeState::Open { res, .. } => (d.start, d.end(), res),
                _ => panic!("cut of a non-open descriptor"),
            }
        };
        assert!(start < cut && cut < end);
        let right_slot = level_index(cut, level);
        assert_ne!(right_slot, id.slot as usize);
        assert!(matches!(
            self.table(id.table).descs[right_slot].state,
            NodeState::Free
        ));

        self.pool_remove(id);
        let (res_left, res_right) = nano
            .res_split(res, (cut - start) * PAGE_SIZE)
            .expect("reservation split");
        {
            let d = self.desc_mut(id);
            d.length = cut - start;
            d.state = NodeState::Open {
                res: res_left,
                link: PoolLink::default(),
            };
        }
        let right = DescId {
            table: id.table,
            slot: right_slot as u16,
        };
        let t = self.table_mut(id.table);
        t.descs[right_slot] = RangeDesc {
            start: cut,
            length: end - cut,
            prev: Some(start),
            allocated_length: 0,
            state: NodeState::Open {
                res: res_right,
                link: PoolLink::default(),
            },
        };
        t.ranges_allocated += 1;
        if let Some(succ) = self.leaf_starting_at_checked(end) {
            self.desc_mut(succ).prev = Some(cut);
        }
        self.pool_push(id);
        self.pool_push(right);
        (id, right)
    }

    fn leaf_starting_at_checked(&self, page: usize) -> Option<DescId> {
        if page >= self.window_base + self.window_pages {
            return None;
        }
        self.leaf_starting_at(page)
    }

    /// Splits the open leaf at |id| so that a leaf boundary exists at page
    /// |at|. When both halves' starts share a slot the leaf is pushed down
    /// until they separate; a half spilling past the slot span is first cut
    /// at the span boundary, so the piece right of |at| may emerge as
    /// several leaves. Returns the leaf ending at |at| and the leaf
    /// starting at |at|.
    pub fn split_leaf(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        mops: &mut MopTable,
        mut id: DescId,
        at: usize,
    ) -> (DescId, DescId) {
        loop {
            let level = self.table(id.table).level;
            let d = self.desc(id);
            assert!(d.start < at && at < d.end());
            if level_index(at, level) != id.slot as usize {
                return self.cut_leaf(nano, id, at);
            }
            let bound = span_bound(d.start, level);
            if d.end() > bound {
                let (left, _) = self.cut_leaf(nano, id, bound);
                id = left;
            }
            id = self.internalize(mops, id);
        }
    }

    /// True when carving [at, at + pages) out of the open leaf |id| leaves
    /// both the carved range and the head remainder representable.
    pub fn representable(&self, id: DescId, at: usize, pages: usize) -> bool {
        let d = self.desc(id);
        let start = d.start;
        if at == start {
            return true;
        }
        let mut level = self.table(id.table).level;
        while level < TRANSLATION_LEVELS {
            if level_index(at, level) != level_index(start, level) {
                break;
            }
            if at + pages > span_bound(at, level) {
                return false;
            }
            level += 1;
        }
        true
    }

    /// Lowest carve point >= the leaf start, aligned to |align| pages, from
    /// which [t, t + pages) fits in the leaf and stays representable. The
    /// point is bumped past a slot-span boundary when the head remainder
    /// would otherwise share a slot with a range crossing that boundary.
    pub fn carve_point(&self, id: DescId, pages: usize, align: usize) -> Option<usize> {
        let d = self.desc(id);
        let (start, end) = (d.start, d.end());
        let mut at = round_up(start, align);
        let base_level = self.table(id.table).level;
        let mut level = base_level;
        while at != start && level < TRANSLATION_LEVELS {
            if level_index(at, level) != level_index(start, level) {
                break;
            }
            let bound = span_bound(at, level);
            if at + pages > bound {
                at = round_up(bound, align);
                level = base_level;
                if at >= end {
                    return None;
                }
                continue;
            }
            level += 1;
        }
        if at + pages <= end {
            Some(at)
        } else {
            None
        }
    }

    /// First-fit search of the size-segregated free pools.
    pub fn find_open(&self, pages: usize, align: usize) -> Option<(DescId, usize)> {
        let pools: &[PoolId] = if pages < LARGE_RANGE_PAGES {
            &[PoolId::SmallFree, PoolId::LargeFree]
        } else {
            &[PoolId::LargeFree]
        };
        for &pool in pools {
            let mut cur = self.pools[pool as usize].head;
            while let Some(id) = cur {
                if let Some(at) = self.carve_point(id, pages, align) {
                    return Some((id, at));
                }
                cur = match &self.desc(id).state {
                    NodeState::Open { link, .. } => link.next,
                    _ => panic!("non-open descriptor on free pool"),
                };
            }
        }
        None
    }

    // Leaf state transitions.

    /// Open -> Allocated. The caller registers claimers afterwards.
    pub fn allocate(&mut self, id: DescId) {
        self.pool_remove(id);
        let d = self.desc_mut(id);
        match d.state {
            NodeState::Open { res, .. } => {
                d.allocated_length = 0;
                d.state = NodeState::Allocated {
                    res,
                    claimers: [None; MAX_CLAIMERS],
                };
            }
            _ => panic!("allocate of a non-open descriptor"),
        }
    }

    /// Allocated (with no remaining claimers) -> Tomb.
    pub fn entomb(&mut self, id: DescId) {
        let d = self.desc_mut(id);
        match &d.state {
            NodeState::Allocated { res, claimers } => {
                assert!(claimers.iter().all(Option::is_none));
                let res = *res;
                d.allocated_length = d.length;
                d.state = NodeState::Tomb {
                    res,
                    link: PoolLink::default(),
                };
            }
            _ => panic!("entomb of a non-allocated descriptor"),
        }
        self.pool_push(id);
    }

    /// Tomb -> Open with the reservation reissued by revocation.
    pub fn reopen(&mut self, id: DescId, fresh: ResHandle) {
        self.pool_remove(id);
        let d = self.desc_mut(id);
        match d.state {
            NodeState::Tomb { .. } => {
                d.allocated_length = 0;
                d.state = NodeState::Open {
                    res: fresh,
                    link: PoolLink::default(),
                };
            }
            _ => panic!("reopen of a non-tomb descriptor"),
        }
        self.pool_push(id);
    }

    pub fn reservation(&self, id: DescId) -> ResHandle {
        match self.desc(id).state {
            NodeState::Open { res, .. }
            | NodeState::Allocated { res, .. }
            | NodeState::Tomb { res, .. } => res,
            _ => panic!("descriptor holds no reservation"),
        }
    }

    // Claimer slot access; list threading lives with the MOP table.

    pub fn claimer(&self, link: ClaimLink) -> &Claimer {
        match &self.desc(link.desc).state {
            NodeState::Allocated { claimers, .. } => {
                claimers[link.index as usize].as_ref().expect("empty claimer slot")
            }
            _ => panic!("claim link into a non-allocated descriptor"),
        }
    }

    pub(crate) fn claimer_mut(&mut self, link: ClaimLink) -> &mut Claimer {
        match &mut self.desc_mut(link.desc).state {
            NodeState::Allocated { claimers, .. } => {
                claimers[link.index as usize].as_mut().expect("empty claimer slot")
            }
            _ => panic!("claim link into a non-allocated descriptor"),
        }
    }

    pub fn find_claimer(&self, id: DescId, mop: u16) -> Option<u8> {
        match &self.desc(id).state {
            NodeState::Allocated { claimers, .. } => claimers
                .iter()
                .position(|c| c.map_or(false, |c| c.mop == mop))
                .map(|i| i as u8),
            _ => None,
        }
    }

    pub fn spare_claimer_slot(&self, id: DescId) -> Option<u8> {
        match &self.desc(id).state {
            NodeState::Allocated { claimers, .. } => {
                claimers.iter().position(Option::is_none).map(|i| i as u8)
            }
            _ => None,
        }
    }

    pub fn claimer_count(&self, id: DescId) -> usize {
        match &self.desc(id).state {
            NodeState::Allocated { claimers, .. } => claimers.iter().flatten().count(),
            _ => 0,
        }
    }

    pub(crate) fn set_claimer(&mut self, link: ClaimLink, claimer: Option<Claimer>) {
        match &mut self.desc_mut(link.desc).state {
            NodeState::Allocated { claimers, .. } => claimers[link.index as usize] = claimer,
            _ => panic!("claim link into a non-allocated descriptor"),
        }
    }

    // Merging. Only same-state neighbors within one table coalesce; ranges
    // split across tables rejoin after a pull-up brings them together.

    fn same_kind(&self, a: DescId, b: DescId) -> bool {
        matches!(
            (&self.desc(a).state, &self.desc(b).state),
            (NodeState::Open { .. }, NodeState::Open { .. })
                | (NodeState::Tomb { .. }, NodeState::Tomb { .. })
        )
    }

    /// Absorbs the leaf starting at |eater|'s end, when present, same-state
    /// and in the same table.
    fn try_merge_right(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        eater: DescId,
        pinned: Option<DescId>,
    ) -> bool {
        let end = self.desc(eater).end();
        let Some(right) = self.leaf_starting_at_checked(end) else {
            return false;
        };
        if right.table != eater.table
            || !self.same_kind(eater, right)
            || pinned == Some(right)
            || pinned == Some(eater)
        {
            return false;
        }
        self.pool_remove(eater);
        self.pool_remove(right);
        // A tomb's reservation may have been subdivided by its former
        // holder; such handles refuse to merge and the ranges then sweep
        // separately.
        let merged = match nano.res_merge(self.reservation(eater), self.reservation(right)) {
            Ok(merged) => merged,
            Err(_) => {
                self.pool_push(eater);
                self.pool_push(right);
                return false;
            }
        };
        let rd = self.desc(right).clone();
        {
            let t = self.table_mut(eater.table);
            t.descs[right.slot as usize] = RangeDesc::FREE;
            t.ranges_allocated -= 1;
        }
        {
            let d = self.desc_mut(eater);
            d.length += rd.length;
            d.allocated_length += rd.allocated_length;
            match &mut d.state {
                NodeState::Open { res, .. } | NodeState::Tomb { res, .. } => *res = merged,
                _ => unreachable!(),
            }
        }
        let start = self.desc(eater).start;
        if let Some(succ) = self.leaf_starting_at_checked(end + rd.length) {
            self.desc_mut(succ).prev = Some(start);
        }
        self.pool_push(eater);
        true
    }

    /// Merges the leaf at |id| with same-state neighbors in its table, then
    /// collapses any table left with a single full-range leaf into its
    /// parent, repeating at the parent level. |pinned| names a descriptor
    /// that must not move or merge (the range mid-revocation). Returns the
    /// surviving position of |id|'s range.
    pub fn merge_leaf(
        &mut self,
        nano: &mut dyn NanoKernelInterface,
        mops: &mut MopTable,
        mut id: DescId,
        pinned: Option<DescId>,
    ) -> DescId {
        loop {
            while self.try_merge_right(nano, id, pinned) {}
            // Fold into the left neighbor, then keep merging from there.
            loop {
                let prev = self.desc(id).prev;
                let Some(p) = prev else { break };
                let left = self.find_leaf(p);
                assert_eq!(self.desc(left).end(), self.desc(id).start);
                if left.table != id.table
                    || !self.same_kind(left, id)
                    || pinned == Some(left)
                    || pinned == Some(id)
                    || !self.try_merge_right(nano, left, pinned)
                {
                    break;
                }
                id = left;
            }
            match self.maybe_collapse(mops, id, pinned) {
                Some(up) => id = up,
                None => return id,
            }
        }
    }

    /// Pulls the sole leaf of |id|'s table up into the parent slot when it
    /// covers the parent's whole range, freeing the table.
    fn maybe_collapse(&mut self, mops: &mut MopTable, id: DescId, pinned: Option<DescId>) -> Option<DescId> {
        let t = self.table(id.table);
        let parent = t.parent?;
        if t.ranges_allocated != 1 || pinned == Some(id) {
            return None;
        }
        let d = self.desc(id).clone();
        if !d.is_leaf() {
            return None;
        }
        let pd = self.desc(parent);
        assert!(matches!(pd.state, NodeState::Internal { table } if table == id.table));
        assert_eq!(d.start, pd.start, "sole child does not tile its parent");
        assert_eq!(d.length, pd.length, "sole child does not tile its parent");

        let table = id.table;
        {
            let t = self.table_mut(table);
            t.descs[id.slot as usize] = RangeDesc::FREE;
            t.ranges_allocated -= 1;
        }
        self.free_table(table);
        *self.desc_mut(parent) = d;
        self.fix_moved_links(mops, id, parent);
        trace!("pulled [{:#x},{:#x}) up to table {}", self.desc(parent).start, self.desc(parent).end(), parent.table);
        Some(parent)
    }

    /// Largest fully released tomb at least |min_pages| long.
    pub fn best_revoke_candidate(&self, min_pages: usize) -> Option<DescId> {
        let mut best: Option<(DescId, usize)> = None;
        let mut cur = self.pools[PoolId::Tomb as usize].head;
        while let Some(id) = cur {
            let d = self.desc(id);
            if d.allocated_length == d.length
                && d.length >= min_pages
                && best.map_or(true, |(_, len)| d.length > len)
            {
                best = Some((id, d.length));
            }
            cur = match &d.state {
                NodeState::Tomb { link, .. } => link.next,
                _ => panic!("non-tomb descriptor on tomb pool"),
            };
        }
        best.map(|(id, _)| id)
    }

    // Accounting and consistency checks.

    pub fn range_counts(&self) -> (usize, usize, usize, usize) {
        let mut open = 0;
        let mut allocated = 0;
        let mut tomb = 0;
        let mut tables = 0;
        for t in self.tables.iter().flatten() {
            tables += 1;
            for d in &t.descs {
                match d.state {
                    NodeState::Open { .. } => open += 1,
                    NodeState::Allocated { .. } => allocated += 1,
                    NodeState::Tomb { .. } => tomb += 1,
                    _ => {}
                }
            }
        }
        (open, allocated, tomb, tables)
    }

    /// Walks every table checking that children exactly tile their parent's
    /// range and occupancy counters agree. Fatal on violation.
    pub fn check_tiling(&self) {
        for (index, t) in self.tables.iter().enumerate() {
            let Some(t) = t else { continue };
            let (expect_start, expect_end) = match t.parent {
                Some(p) => {
                    let pd = self.desc(p);
                    (pd.start, pd.end())
                }
                None => (self.window_base, self.window_base + self.window_pages),
            };
            let mut cursor = expect_start;
            let mut occupied = 0;
            for (slot, d) in t.descs.iter().enumerate() {
                if matches!(d.state, NodeState::Free) {
                    continue;
                }
                occupied += 1;
                assert_eq!(
                    level_index(d.start, t.level),
                    slot,
                    "descriptor in table {} slot {} out of place",
                    index,
                    slot
                );
                assert_eq!(
                    d.start, cursor,
                    "coverage gap in table {} at {:#x}",
                    index, cursor
                );
                cursor = d.end();
                if let NodeState::Internal { table } = d.state {
                    assert_eq!(
                        self.table(table).parent,
                        Some(DescId {
                            table: index as u16,
                            slot: slot as u16
                        })
                    );
                }
            }
            assert_eq!(cursor, expect_end, "table {} does not tile its range", index);
            assert_eq!(occupied, t.ranges_allocated, "table {} occupancy count", index);
        }
    }

    /// Walks the leaves in address order checking the prev chain.
    pub fn check_prev_chain(&self) {
        let mut page = self.window_base;
        let end = self.window_base + self.window_pages;
        let mut prev: Option<usize> = None;
        while page < end {
            let id = self.find_leaf(page);
            let d = self.desc(id);
            assert_eq!(d.start, page, "leaf not aligned to walk cursor");
            assert_eq!(d.prev, prev, "prev chain broken at {:#x}", page);
            prev = Some(page);
            page = d.end();
        }
    }

    /// Leaves in address order, for diagnostics and tests.
    pub fn leaves(&self) -> Vec<DescId> {
        let mut out = Vec::new();
        let mut page = self.window_base;
        let end = self.window_base + self.window_pages;
        while page < end {
            let id = self.find_leaf(page);
            out.push(id);
            page = self.desc(id).end();
        }
        out
    }

    pub fn dump(&self) {
        info!(
            "range tree: window [{:#x},{:#x}) pools small={} large={} tomb={}",
            self.window_base,
            self.window_base + self.window_pages,
            self.pool_count(PoolId::SmallFree),
            self.pool_count(PoolId::LargeFree),
            self.pool_count(PoolId::Tomb),
        );
        for id in self.leaves() {
            let d = self.desc(id);
            let state = match d.state {
                NodeState::Open { .. } => "open",
                NodeState::Allocated { .. } => "allocated",
                NodeState::Tomb { .. } => "tomb",
                _ => "?",
            };
            info!(
                "  [{:#x},{:#x}) {} claims={} t{}:{}",
                d.start,
                d.end(),
                state,
                self.claimer_count(id),
                id.table,
                id.slot
            );
        }
    }
}
