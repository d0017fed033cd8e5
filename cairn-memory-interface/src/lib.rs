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

//! CairnOS MemoryManager service interface.
//!
//! The MemoryManager hands out reservations over virtual memory, tracks
//! which MOP (Memory Ownership Pool) is using each range, and recycles
//! freed ranges once the revocation sweep proves no stale capability can
//! still reach them. Clients talk to it through the request enum below,
//! postcard-encoded over the kernel's synchronous call transport.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::borrow::Cow;
use cairn_nano_interface::PhysHandle;
use cairn_nano_interface::ResHandle;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use bitflags::bitflags;

/// Serialized request/reply buffers are capped at this size; makemop debug
/// labels are the only variable-length payload and fit comfortably.
pub const MEMORY_REQUEST_DATA_SIZE: usize = 2048;
pub type MemoryRequestData = [u8; MEMORY_REQUEST_DATA_SIZE];

/// Bytes of backing a reservation donated to makemop must cover. The
/// MemoryManager claims this backing on behalf of the new MOP and releases
/// it last when the MOP is reclaimed.
pub const MOP_REQUIRED_SPACE: usize = 256;

/// Handle naming a Memory Ownership Pool. Slot and stamp are packed in one
/// word; a stale stamp is refused with BadMop so recycled slots never leak
/// authority to a previous holder.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MopId(pub u64);
impl MopId {
    pub fn new(slot: u32, stamp: u32) -> MopId { MopId(((stamp as u64) << 32) | (slot as u64)) }
    pub fn slot(&self) -> usize { (self.0 & 0xffff_ffff) as usize }
    pub fn stamp(&self) -> u32 { (self.0 >> 32) as u32 }
}

bitflags! {
    /// mem_request behavior flags.
    pub struct MemRequestFlags: usize {
        /// Place the range at the top of a naturally aligned power-of-two
        /// block (stacks grow down into it).
        const ALIGN_TOP  = 1 << 0;
        /// Commit all backing pages before replying instead of on fault.
        const COMMIT_NOW = 1 << 1;
        /// Back the range with one physically contiguous run. Implies
        /// COMMIT_NOW. One extra page is reserved and skipped: the first
        /// page of a reservation carries reservation metadata and is never
        /// DMA-eligible.
        const COMMIT_DMA = 1 << 2;
    }
}

/// A reservation handed back by mem_request. |base|/|length| are bytes;
/// for COMMIT_DMA requests |base| already points past the skipped
/// metadata page.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemRegion {
    pub base: usize,
    pub length: usize,
    pub reservation: ResHandle,
}

/// A run of physical memory delegated by mem_phys_cap for device or DMA
/// use. |base|/|length| are the bytes asked for; the capability behind
/// |phys| covers the whole page run containing them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PhysRegion {
    pub base: usize,
    pub length: usize,
    pub phys: PhysHandle,
}

#[repr(usize)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum MemoryManagerError {
    Success = 0,
    DeserializeFailed,
    SerializeFailed,
    // mem_request
    BadBase,
    RequestNoneFound,
    RequestUnavailable,
    // mop handles
    BadMop,
    // mem_claim
    ClaimNotInUse,
    ClaimFreed,
    ClaimLimit,
    ClaimOverflow,
    // mem_makemop
    MakeMopBadSpace,
    MakeMopMaxMops,
    #[default]
    UnknownError,
}
impl From<MemoryManagerError> for Result<(), MemoryManagerError> {
    fn from(err: MemoryManagerError) -> Result<(), MemoryManagerError> {
        if err == MemoryManagerError::Success {
            Ok(())
        } else {
            Err(err)
        }
    }
}

/// Counters reported by the Stats request. Page counts come from the
/// physical page book, range/table counts from the descriptor tree.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryManagerStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub dirty_pages: usize,
    pub mapped_pages: usize,
    pub ptable_pages: usize,
    pub tombstone_pages: usize,

    pub open_ranges: usize,
    pub allocated_ranges: usize,
    pub tomb_ranges: usize,
    pub desc_tables: usize,
    pub mops_live: usize,

    pub requests: usize,
    pub commits: usize,
    pub revocations: usize,
}

/// Operations the MemoryManager serves from its message loop. The
/// page-fault commit path is deliberately absent: it is a privileged
/// trap-only entry, not a request.
pub trait MemoryManagerInterface {
    fn mem_request(
        &mut self,
        base: usize,
        length: usize,
        flags: MemRequestFlags,
        owner: MopId,
    ) -> Result<MemRegion, MemoryManagerError>;
    fn mem_claim(
        &mut self,
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    ) -> Result<(), MemoryManagerError>;
    fn mem_release(
        &mut self,
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    ) -> Result<(), MemoryManagerError>;
    fn mem_makemop(
        &mut self,
        space: ResHandle,
        parent: MopId,
        debug_label: &str,
    ) -> Result<MopId, MemoryManagerError>;
    fn mem_reclaim_mop(&mut self, owner: MopId) -> Result<(), MemoryManagerError>;
    fn mem_virt_to_phys(&self, vaddr: usize) -> Result<usize, MemoryManagerError>;
    fn mem_phys_cap(
        &mut self,
        base: usize,
        length: usize,
        cached: bool,
        owner: MopId,
    ) -> Result<PhysRegion, MemoryManagerError>;
    fn stats(&self) -> Result<MemoryManagerStats, MemoryManagerError>;
    fn debug(&self) -> Result<(), MemoryManagerError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub enum MemoryManagerRequest<'a> {
    /// Reserve |length| bytes, at |base| exactly if nonzero. |flags| are
    /// MemRequestFlags bits.
    Request {
        base: usize,
        length: usize,
        flags: usize,
        owner: MopId,
    },
    /// Add |times| claims for |owner| on every leaf covering the range.
    Claim {
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    },
    /// Drop |times| claims; a leaf whose last claim drops becomes a tomb.
    Release {
        base: usize,
        length: usize,
        times: usize,
        owner: MopId,
    },
    /// Create a child pool of |parent| backed by the donated |space|
    /// reservation (at least MOP_REQUIRED_SPACE bytes).
    MakeMop {
        space: ResHandle,
        parent: MopId,
        debug_label: Cow<'a, str>,
    },
    /// Reclaim |owner| and, transitively, all of its children.
    ReclaimMop { owner: MopId },
    VirtToPhys { vaddr: usize },
    /// Delegate physical memory for device or DMA access: the pages
    /// covering [base, base+length) if |base| is nonzero, else any
    /// |length|-byte run, zeroed. |owner| only authenticates the caller;
    /// no claim is taken and the pages never return to the allocator.
    PhysCap {
        base: usize,
        length: usize,
        cached: bool,
        owner: MopId,
    },
    Stats,
    Debug,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestResponse {
    pub region: MemRegion,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MakeMopResponse {
    pub mop: MopId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VirtToPhysResponse {
    pub paddr: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PhysCapResponse {
    pub region: PhysRegion,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: MemoryManagerStats,
}

// Client-side stubs. The extern is provided by the transport glue that
// connects this component to the MemoryManager's endpoint.

fn cairn_memory_request<T: DeserializeOwned>(
    request: &MemoryManagerRequest,
) -> Result<T, MemoryManagerError> {
    extern "C" {
        fn memory_interface_request(
            c_request_buffer_len: u32,
            c_request_buffer: *const u8,
            c_reply_buffer: *mut MemoryRequestData,
        ) -> MemoryManagerError;
    }
    let mut request_buffer = [0u8; MEMORY_REQUEST_DATA_SIZE];
    let request_slice = postcard::to_slice(request, &mut request_buffer)
        .or(Err(MemoryManagerError::SerializeFailed))?;
    let mut reply_buffer = [0u8; MEMORY_REQUEST_DATA_SIZE];
    match unsafe {
        memory_interface_request(
            request_slice.len() as u32,
            request_slice.as_ptr(),
            &mut reply_buffer as *mut _,
        )
    } {
        MemoryManagerError::Success => postcard::from_bytes(&reply_buffer)
            .or(Err(MemoryManagerError::DeserializeFailed)),
        err => Err(err),
    }
}

#[inline]
pub fn cairn_mem_request(
    base: usize,
    length: usize,
    flags: MemRequestFlags,
    owner: MopId,
) -> Result<MemRegion, MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::Request {
        base,
        length,
        flags: flags.bits(),
        owner,
    })
    .map(|reply: RequestResponse| reply.region)
}

#[inline]
pub fn cairn_mem_claim(
    base: usize,
    length: usize,
    times: usize,
    owner: MopId,
) -> Result<(), MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::Claim {
        base,
        length,
        times,
        owner,
    })
}

#[inline]
pub fn cairn_mem_release(
    base: usize,
    length: usize,
    times: usize,
    owner: MopId,
) -> Result<(), MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::Release {
        base,
        length,
        times,
        owner,
    })
}

#[inline]
pub fn cairn_mem_makemop(
    space: ResHandle,
    parent: MopId,
    debug_label: &str,
) -> Result<MopId, MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::MakeMop {
        space,
        parent,
        debug_label: Cow::from(debug_label),
    })
    .map(|reply: MakeMopResponse| reply.mop)
}

#[inline]
pub fn cairn_mem_reclaim_mop(owner: MopId) -> Result<(), MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::ReclaimMop { owner })
}

#[inline]
pub fn cairn_mem_virt_to_phys(vaddr: usize) -> Result<usize, MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::VirtToPhys { vaddr })
        .map(|reply: VirtToPhysResponse| reply.paddr)
}

#[inline]
pub fn cairn_mem_phys_cap(
    base: usize,
    length: usize,
    cached: bool,
    owner: MopId,
) -> Result<PhysRegion, MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::PhysCap {
        base,
        length,
        cached,
        owner,
    })
    .map(|reply: PhysCapResponse| reply.region)
}

#[inline]
pub fn cairn_mem_stats() -> Result<MemoryManagerStats, MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::Stats).map(|reply: StatsResponse| reply.stats)
}

#[inline]
pub fn cairn_mem_debug() -> Result<(), MemoryManagerError> {
    cairn_memory_request(&MemoryManagerRequest::Debug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mop_id_packing() {
        let mop = MopId::new(17, 0xabcd);
        assert_eq!(mop.slot(), 17);
        assert_eq!(mop.stamp(), 0xabcd);
        assert_ne!(MopId::new(17, 1), MopId::new(17, 2));
    }

    #[test]
    fn test_flag_bits_survive_the_wire() {
        let flags = MemRequestFlags::COMMIT_NOW | MemRequestFlags::ALIGN_TOP;
        let bits = flags.bits();
        assert_eq!(MemRequestFlags::from_bits(bits), Some(flags));
        // Unknown bits from a newer client are dropped, not an error.
        assert_eq!(
            MemRequestFlags::from_bits_truncate(bits | (1 << 63)),
            flags
        );
    }

    #[test]
    fn test_error_to_result() {
        assert_eq!(Result::from(MemoryManagerError::Success), Ok(()));
        assert_eq!(
            Result::from(MemoryManagerError::BadMop),
            Err(MemoryManagerError::BadMop)
        );
        // Unrecognized wire values collapse to UnknownError.
        assert_eq!(
            MemoryManagerError::from(usize::MAX),
            MemoryManagerError::UnknownError
        );
    }
}
