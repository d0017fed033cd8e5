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

//! Property tests: random operation sequences against the manager with
//! the full consistency audit after every step, then a forced drain that
//! must put the tree back to a single open leaf.

use super::MemoryManager;
use crate::fake_nano::FakeNano;
use cairn_memory_interface::MemRequestFlags;
use cairn_memory_interface::MemoryManagerError;
use cairn_memory_interface::MOP_REQUIRED_SPACE;
use cairn_nano_interface::PAGE_SIZE;
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Op {
    /// First-fit request of this many pages.
    Request(usize),
    /// Request with all pages committed up front.
    Commit(usize),
    /// Release the n-th live region (modulo how many there are).
    Release(usize),
    /// Fault a page of the n-th live region.
    Fault(usize, usize),
    /// Deliver a sweep completion, if one is in flight.
    Finish,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..=8).prop_map(Op::Request),
        (1usize..=4).prop_map(Op::Commit),
        (0usize..16).prop_map(Op::Release),
        ((0usize..16), (0usize..8)).prop_map(|(region, page)| Op::Fault(region, page)),
        Just(Op::Finish),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_op_sequences_keep_the_tree_sound(
        ops in proptest::collection::vec(arb_op(), 1..48),
    ) {
        let mut fake = FakeNano::new(256, 16, 1024);
        let mut m = MemoryManager::new(&mut fake);
        let root = m.root_mop_id();
        let mut live: alloc::vec::Vec<(usize, usize)> = alloc::vec::Vec::new();

        for op in ops {
            match op {
                Op::Request(pages) | Op::Commit(pages) => {
                    let flags = if matches!(op, Op::Commit(_)) {
                        MemRequestFlags::COMMIT_NOW
                    } else {
                        MemRequestFlags::empty()
                    };
                    match m.mem_request(&mut fake, 0, pages * PAGE_SIZE, flags, root) {
                        Ok(region) => live.push((region.base, region.length)),
                        // Exhaustion is a legal answer; a sweep may have
                        // been pressed into service for the retry.
                        Err(MemoryManagerError::RequestNoneFound) => {}
                        Err(err) => prop_assert!(false, "request failed: {:?}", err),
                    }
                }
                Op::Release(index) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (base, length) = live.remove(index % live.len());
                    m.mem_release(&mut fake, base, length, 1, root).unwrap();
                }
                Op::Fault(index, page) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (base, length) = live[index % live.len()];
                    let pages = (length + PAGE_SIZE - 1) / PAGE_SIZE;
                    let vaddr = base + (page % pages) * PAGE_SIZE;
                    match m.commit_page(&mut fake, vaddr) {
                        Ok(_) => {}
                        Err(MemoryManagerError::RequestNoneFound) => {}
                        Err(err) => prop_assert!(false, "fault failed: {:?}", err),
                    }
                }
                Op::Finish => {
                    let _ = m.revoke_finished(&mut fake);
                }
            }
            m.check();
        }

        // Wind down: release everything, then force-sweep every tomb. The
        // merges along the way must fold the tree back to its boot shape.
        for (base, length) in live.drain(..) {
            m.mem_release(&mut fake, base, length, 1, root).unwrap();
        }
        loop {
            if m.revoke.is_none() {
                m.maybe_start_revoke(&mut fake, /*urgent=*/ true);
            }
            if m.revoke.is_none() {
                break;
            }
            m.revoke_finished(&mut fake).unwrap();
        }
        m.check();
        prop_assert_eq!(m.tree.range_counts(), (1, 0, 0, 1));
        let stats = m.stats();
        prop_assert_eq!(stats.allocated_ranges, 0);
        prop_assert_eq!(stats.mapped_pages, 0);
        prop_assert_eq!(stats.ptable_pages, 0);
        prop_assert_eq!(stats.tombstone_pages, 0);
    }

    #[test]
    fn claims_balance_across_owners(
        times_a in 1usize..5,
        times_b in 1usize..5,
        pages in 1usize..6,
    ) {
        let mut fake = FakeNano::new(256, 16, 1024);
        let mut m = MemoryManager::new(&mut fake);
        let root = m.root_mop_id();
        let region = m
            .mem_request(&mut fake, 0, pages * PAGE_SIZE, MemRequestFlags::empty(), root)
            .unwrap();
        let sa = m
            .mem_request(&mut fake, 0, MOP_REQUIRED_SPACE, MemRequestFlags::empty(), root)
            .unwrap();
        let sb = m
            .mem_request(&mut fake, 0, MOP_REQUIRED_SPACE, MemRequestFlags::empty(), root)
            .unwrap();
        let a = m.mem_makemop(&mut fake, sa.reservation, root, "a").unwrap();
        let b = m.mem_makemop(&mut fake, sb.reservation, root, "b").unwrap();

        m.mem_claim(region.base, region.length, times_a, a).unwrap();
        m.mem_claim(region.base, region.length, times_b, b).unwrap();
        m.check();

        // Claims drop in any order and the range only frees on the last.
        m.mem_release(&mut fake, region.base, region.length, times_a, a).unwrap();
        m.check();
        m.mem_release(&mut fake, region.base, region.length, 1, root).unwrap();
        m.check();
        let before = m.tree.range_counts().2;
        m.mem_release(&mut fake, region.base, region.length, times_b, b).unwrap();
        m.check();
        prop_assert!(m.tree.range_counts().2 > before || m.revoke.is_some());
    }
}
