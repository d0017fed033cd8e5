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

//! Global heap allocator, backed by a first-fit linked-list heap over
//! a static buffer handed in at bring-up.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, NonNull};
use linked_list_allocator::Heap;
use spin::Mutex;

pub struct CairnHeap(Mutex<Option<Heap>>);

#[cfg_attr(not(test), global_allocator)]
pub static ALLOCATOR: CairnHeap = CairnHeap::empty();

impl CairnHeap {
    pub const fn empty() -> CairnHeap { CairnHeap(Mutex::new(None)) }

    /// Installs the backing memory. Until this runs every allocation
    /// fails with a null return.
    pub unsafe fn init(&self, start: usize, size: usize) {
        let mut heap = self.0.lock();
        assert!(heap.is_none(), "heap already installed");
        *heap = Some(Heap::new(start, size));
    }

    pub fn used(&self) -> usize { self.0.lock().as_ref().map_or(0, |heap| heap.used()) }

    pub fn free(&self) -> usize { self.0.lock().as_ref().map_or(0, |heap| heap.free()) }
}

unsafe impl GlobalAlloc for CairnHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.0.lock().as_mut() {
            Some(heap) => heap
                .allocate_first_fit(layout)
                .map_or(null_mut(), |p| p.as_ptr()),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(heap) = self.0.lock().as_mut() {
            heap.deallocate(NonNull::new_unchecked(ptr), layout);
        }
    }
}
