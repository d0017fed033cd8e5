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

//! Memory ownership pools. A MOP is the unit of accountability for claimed
//! ranges: every allocated leaf carries claimers owned by MOPs, and each
//! MOP threads its claims into a doubly linked list so reclaiming the MOP
//! can release them all. MOPs form a parent/child hierarchy; reclaiming a
//! parent first reclaims every descendant.
//!
//! Clients refer to MOPs by MopId, a slot number paired with a generation
//! stamp. Freeing a slot bumps its stamp, so a retained id for a reclaimed
//! MOP fails validation instead of aliasing a later occupant.

use crate::memory_manager::tree::ClaimLink;
use crate::memory_manager::tree::Claimer;
use crate::memory_manager::tree::RangeTree;
use alloc::string::String;
use alloc::string::ToString;
use alloc::vec::Vec;
use cairn_memory_interface::MopId;
use log::info;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MopState {
    Active,
    Reclaiming,
    Dead,
}

#[derive(Debug)]
pub struct Mop {
    pub state: MopState,
    pub parent: Option<u16>,
    pub first_child: Option<u16>,
    pub next_sibling: Option<u16>,
    pub prev_sibling: Option<u16>,
    pub first_claim: Option<ClaimLink>,
    pub last_claim: Option<ClaimLink>,
    pub allocated_pages: usize,
    pub allocated_ranges: usize,
    pub debug_label: String,
}

impl Mop {
    fn new(parent: Option<u16>, debug_label: &str) -> Mop {
        Mop {
            state: MopState::Active,
            parent,
            first_child: None,
            next_sibling: None,
            prev_sibling: None,
            first_claim: None,
            last_claim: None,
            allocated_pages: 0,
            allocated_ranges: 0,
            debug_label: debug_label.to_string(),
        }
    }
}

pub struct MopTable {
    slots: Vec<Option<Mop>>,
    stamps: Vec<u32>,
    free_slots: Vec<u16>,
}

impl MopTable {
    pub fn new() -> MopTable {
        MopTable {
            slots: Vec::new(),
            stamps: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    pub fn mop(&self, slot: u16) -> &Mop {
        self.slots[slot as usize].as_ref().expect("dead mop slot")
    }

    pub fn mop_mut(&mut self, slot: u16) -> &mut Mop {
        self.slots[slot as usize].as_mut().expect("dead mop slot")
    }

    /// Resolves a client-supplied id to a live, active slot.
    pub fn lookup(&self, id: MopId) -> Option<u16> {
        let slot = id.slot();
        if slot >= self.slots.len() || self.stamps[slot] != id.stamp() {
            return None;
        }
        match &self.slots[slot] {
            Some(m) if m.state == MopState::Active => Some(slot as u16),
            _ => None,
        }
    }

    /// The wire id for a live slot.
    pub fn id_for(&self, slot: u16) -> MopId {
        MopId::new(slot as u32, self.stamps[slot as usize])
    }

    /// Allocates a MOP and links it under |parent|'s child chain. None
    /// once every slot a u16 id can name is live.
    pub fn create(&mut self, parent: Option<u16>, debug_label: &str) -> Option<u16> {
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(Mop::new(parent, debug_label));
                slot
            }
            None => {
                if self.slots.len() >= u16::MAX as usize {
                    return None;
                }
                self.slots.push(Some(Mop::new(parent, debug_label)));
                self.stamps.push(0);
                (self.slots.len() - 1) as u16
            }
        };
        if let Some(p) = parent {
            let old_head = self.mop(p).first_child;
            {
                let m = self.mop_mut(slot);
                m.next_sibling = old_head;
                m.prev_sibling = None;
            }
            if let Some(h) = old_head {
                self.mop_mut(h).prev_sibling = Some(slot);
            }
            self.mop_mut(p).first_child = Some(slot);
        }
        Some(slot)
    }

    /// Unhooks |slot| from its parent's child chain.
    pub fn detach(&mut self, slot: u16) {
        let (parent, prev, next) = {
            let m = self.mop(slot);
            (m.parent, m.prev_sibling, m.next_sibling)
        };
        match prev {
            Some(p) => self.mop_mut(p).next_sibling = next,
            None => {
                if let Some(p) = parent {
                    assert_eq!(self.mop(p).first_child, Some(slot));
                    self.mop_mut(p).first_child = next;
                }
            }
        }
        if let Some(n) = next {
            self.mop_mut(n).prev_sibling = prev;
        }
        let m = self.mop_mut(slot);
        m.parent = None;
        m.prev_sibling = None;
        m.next_sibling = None;
    }

    /// Retires a detached MOP with no remaining claims and bumps the slot
    /// stamp so outstanding ids go stale.
    pub fn release_slot(&mut self, slot: u16) {
        {
            let m = self.mop(slot);
            assert_eq!(m.state, MopState::Dead);
            assert!(m.first_claim.is_none() && m.first_child.is_none());
            assert_eq!(m.allocated_pages, 0);
        }
        self.slots[slot as usize] = None;
        self.stamps[slot as usize] = self.stamps[slot as usize].wrapping_add(1);
        self.free_slots.push(slot);
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    // Claim list surgery. Claimers live inside tree descriptors; the MOP
    // holds the list ends.

    /// Installs a claimer for |slot| at |link| and appends it to the MOP's
    /// claim list.
    pub fn link_claim(&mut self, tree: &mut RangeTree, slot: u16, link: ClaimLink, times: usize) {
        let pages = tree.desc(link.desc).length;
        let old_last = {
            let m = self.mop_mut(slot);
            let old_last = m.last_claim;
            m.last_claim = Some(link);
            if m.first_claim.is_none() {
                m.first_claim = Some(link);
            }
            m.allocated_pages += pages;
            m.allocated_ranges += 1;
            old_last
        };
        tree.set_claimer(
            link,
            Some(Claimer {
                mop: slot,
                times,
                prev: old_last,
                next: None,
            }),
        );
        if let Some(last) = old_last {
            tree.claimer_mut(last).next = Some(link);
        }
    }

    /// Removes the claimer at |link| from its descriptor and its owning
    /// MOP's claim list.
    pub fn unlink_claim(&mut self, tree: &mut RangeTree, link: ClaimLink) {
        let c = *tree.claimer(link);
        let pages = tree.desc(link.desc).length;
        match c.prev {
            Some(p) => tree.claimer_mut(p).next = c.next,
            None => self.mop_mut(c.mop).first_claim = c.next,
        }
        match c.next {
            Some(n) => tree.claimer_mut(n).prev = c.prev,
            None => self.mop_mut(c.mop).last_claim = c.prev,
        }
        tree.set_claimer(link, None);
        let m = self.mop_mut(c.mop);
        m.allocated_pages -= pages;
        m.allocated_ranges -= 1;
    }

    /// Repoints the list ends after tree restructuring moved a descriptor.
    pub(crate) fn note_claim_moved(&mut self, slot: u16, old: ClaimLink, new: ClaimLink) {
        let m = self.mop_mut(slot);
        if m.first_claim == Some(old) {
            m.first_claim = Some(new);
        }
        if m.last_claim == Some(old) {
            m.last_claim = Some(new);
        }
    }

    pub fn dump(&self) {
        info!("mops: {} live", self.live_count());
        for (slot, m) in self.slots.iter().enumerate() {
            let Some(m) = m else { continue };
            info!(
                "  {} '{}' {:?} parent={:?} pages={} ranges={}",
                slot, m.debug_label, m.state, m.parent, m.allocated_pages, m.allocated_ranges
            );
        }
    }

    /// Checks claim accounting against the tree: every list entry resolves
    /// to a claimer owned by the walking MOP, and the page/range sums
    /// match. Fatal on violation.
    pub fn check_claims(&self, tree: &RangeTree) {
        for (slot, m) in self.slots.iter().enumerate() {
            let Some(m) = m else { continue };
            let mut pages = 0;
            let mut ranges = 0;
            let mut cursor = m.first_claim;
            let mut prev: Option<ClaimLink> = None;
            while let Some(link) = cursor {
                let c = tree.claimer(link);
                assert_eq!(c.mop as usize, slot, "claim list crosses mops");
                assert!(c.times > 0, "zero-count claimer on list");
                assert_eq!(c.prev, prev, "claim list back link broken");
                pages += tree.desc(link.desc).length;
                ranges += 1;
                prev = cursor;
                cursor = c.next;
            }
            assert_eq!(m.last_claim, prev, "claim list tail stale");
            assert_eq!(m.allocated_pages, pages, "mop {} page count", slot);
            assert_eq!(m.allocated_ranges, ranges, "mop {} range count", slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_nano::FakeNano;
    use crate::memory_manager::tree::DescId;
    use cairn_nano_interface::NanoKernelInterface;

    fn claimed_tree() -> (FakeNano, MopTable, RangeTree, DescId, DescId) {
        let mut fake = FakeNano::new(64, 0, 1024);
        let seed = fake.boot_info().seed;
        let mut tree = RangeTree::new(0, 1024, seed);
        let mut mops = MopTable::new();
        let id = tree.find_leaf(0);
        let (_, a) = tree.split_leaf(&mut fake, &mut mops, id, 8);
        let (a, _) = tree.split_leaf(&mut fake, &mut mops, a, 12);
        let b = tree.find_leaf(12);
        let (b, _) = tree.split_leaf(&mut fake, &mut mops, b, 20);
        tree.allocate(a);
        tree.allocate(b);
        (fake, mops, tree, a, b)
    }

    #[test]
    fn test_create_and_lookup() {
        let mut mops = MopTable::new();
        let root = mops.create(None, "root").unwrap();
        let id = mops.id_for(root);
        assert_eq!(mops.lookup(id), Some(root));
        assert_eq!(mops.mop(root).debug_label, "root");
    }

    #[test]
    fn test_stale_id_fails_lookup() {
        let mut mops = MopTable::new();
        let root = mops.create(None, "root").unwrap();
        let child = mops.create(Some(root), "child").unwrap();
        let id = mops.id_for(child);
        mops.detach(child);
        mops.mop_mut(child).state = MopState::Dead;
        mops.release_slot(child);
        assert_eq!(mops.lookup(id), None);
        // The slot is recycled under a new stamp.
        let other = mops.create(Some(root), "other").unwrap();
        assert_eq!(other, child);
        assert_eq!(mops.lookup(id), None);
        assert_eq!(mops.lookup(mops.id_for(other)), Some(other));
    }

    #[test]
    fn test_create_exhaustion_returns_none() {
        let mut mops = MopTable::new();
        while mops.create(None, "fill").is_some() {}
        // Every slot a u16 id can name is live; further creates report
        // exhaustion instead of growing past the id space.
        assert_eq!(mops.live_count(), u16::MAX as usize);
        assert_eq!(mops.create(None, "extra"), None);
        // Releasing a slot makes create viable again.
        mops.mop_mut(7).state = MopState::Dead;
        mops.release_slot(7);
        assert_eq!(mops.create(None, "again"), Some(7));
    }

    #[test]
    fn test_child_chain_links() {
        let mut mops = MopTable::new();
        let root = mops.create(None, "root").unwrap();
        let a = mops.create(Some(root), "a").unwrap();
        let b = mops.create(Some(root), "b").unwrap();
        let c = mops.create(Some(root), "c").unwrap();
        // Children stack at the head.
        assert_eq!(mops.mop(root).first_child, Some(c));
        assert_eq!(mops.mop(c).next_sibling, Some(b));
        assert_eq!(mops.mop(b).next_sibling, Some(a));

        mops.detach(b);
        assert_eq!(mops.mop(c).next_sibling, Some(a));
        assert_eq!(mops.mop(a).prev_sibling, Some(c));
        mops.detach(c);
        assert_eq!(mops.mop(root).first_child, Some(a));
    }

    #[test]
    fn test_claim_list_threads_descriptors() {
        let (_, mut mops, mut tree, a, b) = claimed_tree();
        let owner = mops.create(None, "owner").unwrap();
        let la = ClaimLink { desc: a, index: 0 };
        let lb = ClaimLink { desc: b, index: 0 };
        mops.link_claim(&mut tree, owner, la, 1);
        mops.link_claim(&mut tree, owner, lb, 2);

        let m = mops.mop(owner);
        assert_eq!(m.first_claim, Some(la));
        assert_eq!(m.last_claim, Some(lb));
        assert_eq!(m.allocated_ranges, 2);
        assert_eq!(m.allocated_pages, 4 + 8);
        assert_eq!(tree.claimer(la).next, Some(lb));
        assert_eq!(tree.claimer(lb).prev, Some(la));
        mops.check_claims(&tree);

        mops.unlink_claim(&mut tree, la);
        let m = mops.mop(owner);
        assert_eq!(m.first_claim, Some(lb));
        assert_eq!(m.last_claim, Some(lb));
        assert_eq!(m.allocated_pages, 8);
        mops.check_claims(&tree);

        mops.unlink_claim(&mut tree, lb);
        let m = mops.mop(owner);
        assert_eq!(m.first_claim, None);
        assert_eq!(m.last_claim, None);
        assert_eq!(m.allocated_pages, 0);
        mops.check_claims(&tree);
    }

    #[test]
    fn test_two_owners_share_a_leaf() {
        let (_, mut mops, mut tree, a, _) = claimed_tree();
        let first = mops.create(None, "first").unwrap();
        let second = mops.create(None, "second").unwrap();
        mops.link_claim(&mut tree, first, ClaimLink { desc: a, index: 0 }, 1);
        mops.link_claim(&mut tree, second, ClaimLink { desc: a, index: 1 }, 1);
        assert_eq!(tree.claimer_count(a), 2);
        assert_eq!(tree.find_claimer(a, first), Some(0));
        assert_eq!(tree.find_claimer(a, second), Some(1));
        mops.check_claims(&tree);
    }
}
