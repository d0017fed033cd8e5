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

//! CairnOS MemoryManager component support.

// Code here binds the nano layer call gates to the rust code. Requests
// arrive postcard-encoded through memory_interface_request; page faults
// and sweep completions arrive through privileged entries that are not
// part of the request enum.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

mod allocator;
mod logger;

#[cfg(not(test))]
use alloc::boxed::Box;
use cairn_memory_interface::MakeMopResponse;
use cairn_memory_interface::MemRequestFlags;
use cairn_memory_interface::MemoryManagerError;
use cairn_memory_interface::MemoryManagerInterface;
use cairn_memory_interface::MemoryManagerRequest;
use cairn_memory_interface::MemoryRequestData;
use cairn_memory_interface::PhysCapResponse;
use cairn_memory_interface::RequestResponse;
use cairn_memory_interface::StatsResponse;
use cairn_memory_interface::VirtToPhysResponse;
#[cfg(not(test))]
use cairn_memory_manager::CairnMemoryManager;
#[cfg(not(test))]
use cairn_memory_manager::Guard;
#[cfg(not(test))]
use cairn_nano_interface::NanoClient;
#[cfg(not(test))]
use core::ptr;
#[cfg(not(test))]
use core::slice;
#[cfg(not(test))]
use log::{info, trace};

#[cfg(not(test))]
const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg(not(test))]
fn cairn_memory() -> Guard<'static> {
    static CAIRN_MEMORY: CairnMemoryManager = CairnMemoryManager::empty();
    let mut manager = CAIRN_MEMORY.get();
    if manager.is_empty() {
        manager.init(Box::new(NanoClient));
    }
    manager
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn pre_init() {
    static CAIRN_LOGGER: logger::CairnLogger = logger::CairnLogger;
    log::set_logger(&CAIRN_LOGGER).unwrap();
    // NB: set to max; release builds are capped at compile time.
    log::set_max_level(log::LevelFilter::Trace);

    static mut HEAP_MEMORY: [u8; HEAP_SIZE] = [0; HEAP_SIZE];
    allocator::ALLOCATOR.init(ptr::addr_of_mut!(HEAP_MEMORY) as usize, HEAP_SIZE);
    trace!("setup heap: {} bytes ({} free)", HEAP_SIZE, allocator::ALLOCATOR.free());

    // Bring the manager up now so the root MOP exists before the first
    // request and the fault path never takes the initialization hit.
    let mut manager = cairn_memory();
    if let Ok(stats) = manager.stats() {
        info!(
            "Physical memory: {} pages ({} dirty at boot); {} open virtual ranges",
            stats.total_pages, stats.dirty_pages, stats.open_ranges
        );
    }
    info!("root mop {:#x}", manager.root_mop_id().0);
    trace!("heap used after init: {} bytes", allocator::ALLOCATOR.used());
}

#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn memory_interface_request(
    c_request_buffer_len: u32,
    c_request_buffer: *const u8,
    c_reply_buffer: *mut MemoryRequestData,
) -> MemoryManagerError {
    let request_buffer = slice::from_raw_parts(c_request_buffer, c_request_buffer_len as usize);
    serve(&mut cairn_memory(), request_buffer, &mut *c_reply_buffer)
}

/// Page-fault commit entry. The nano layer vectors faults on pages inside
/// a live reservation here; anything but Success parks the faulting task.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn memory_fault(c_fault_vaddr: usize) -> MemoryManagerError {
    match cairn_memory().commit_page(c_fault_vaddr) {
        Ok(_pfn) => MemoryManagerError::Success,
        Err(e) => {
            log::error!("commit of {:#x} failed: {:?}", c_fault_vaddr, e);
            e
        }
    }
}

/// Revocation sweep completion, delivered once per revoke_start.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn memory_revoke_finished() -> MemoryManagerError {
    cairn_memory()
        .revoke_finished()
        .map_or_else(|e| e, |()| MemoryManagerError::Success)
}

/// Boot handoff: the root MOP that every early task chains from.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn memory_root_mop() -> u64 { cairn_memory().root_mop_id().0 }

type MemoryManagerResult = Result<(), MemoryManagerError>;

fn serve(
    manager: &mut impl MemoryManagerInterface,
    request_buffer: &[u8],
    reply_buffer: &mut MemoryRequestData,
) -> MemoryManagerError {
    let request = match postcard::from_bytes::<MemoryManagerRequest>(request_buffer) {
        Ok(request) => request,
        Err(_) => return MemoryManagerError::DeserializeFailed,
    };
    match request {
        MemoryManagerRequest::Request {
            base,
            length,
            flags,
            owner,
        } => request_request(manager, base, length, flags, owner, reply_buffer),
        MemoryManagerRequest::Claim {
            base,
            length,
            times,
            owner,
        } => manager.mem_claim(base, length, times, owner),
        MemoryManagerRequest::Release {
            base,
            length,
            times,
            owner,
        } => manager.mem_release(base, length, times, owner),
        MemoryManagerRequest::MakeMop {
            space,
            parent,
            debug_label,
        } => makemop_request(manager, space, parent, &debug_label, reply_buffer),
        MemoryManagerRequest::ReclaimMop { owner } => manager.mem_reclaim_mop(owner),
        MemoryManagerRequest::VirtToPhys { vaddr } => {
            virt_to_phys_request(manager, vaddr, reply_buffer)
        }
        MemoryManagerRequest::PhysCap {
            base,
            length,
            cached,
            owner,
        } => phys_cap_request(manager, base, length, cached, owner, reply_buffer),
        MemoryManagerRequest::Stats => stats_request(manager, reply_buffer),
        MemoryManagerRequest::Debug => manager.debug(),
    }
    .map_or_else(|e| e, |()| MemoryManagerError::Success)
}

fn request_request(
    manager: &mut impl MemoryManagerInterface,
    base: usize,
    length: usize,
    flags: usize,
    owner: cairn_memory_interface::MopId,
    reply_buffer: &mut MemoryRequestData,
) -> MemoryManagerResult {
    // Unknown flag bits from a newer client are dropped, not refused.
    let flags = MemRequestFlags::from_bits_truncate(flags);
    let region = manager.mem_request(base, length, flags, owner)?;
    let _ = postcard::to_slice(&RequestResponse { region }, reply_buffer)
        .or(Err(MemoryManagerError::SerializeFailed))?;
    Ok(())
}

fn makemop_request(
    manager: &mut impl MemoryManagerInterface,
    space: cairn_nano_interface::ResHandle,
    parent: cairn_memory_interface::MopId,
    debug_label: &str,
    reply_buffer: &mut MemoryRequestData,
) -> MemoryManagerResult {
    let mop = manager.mem_makemop(space, parent, debug_label)?;
    let _ = postcard::to_slice(&MakeMopResponse { mop }, reply_buffer)
        .or(Err(MemoryManagerError::SerializeFailed))?;
    Ok(())
}

fn virt_to_phys_request(
    manager: &mut impl MemoryManagerInterface,
    vaddr: usize,
    reply_buffer: &mut MemoryRequestData,
) -> MemoryManagerResult {
    let paddr = manager.mem_virt_to_phys(vaddr)?;
    let _ = postcard::to_slice(&VirtToPhysResponse { paddr }, reply_buffer)
        .or(Err(MemoryManagerError::SerializeFailed))?;
    Ok(())
}

fn phys_cap_request(
    manager: &mut impl MemoryManagerInterface,
    base: usize,
    length: usize,
    cached: bool,
    owner: cairn_memory_interface::MopId,
    reply_buffer: &mut MemoryRequestData,
) -> MemoryManagerResult {
    let region = manager.mem_phys_cap(base, length, cached, owner)?;
    let _ = postcard::to_slice(&PhysCapResponse { region }, reply_buffer)
        .or(Err(MemoryManagerError::SerializeFailed))?;
    Ok(())
}

fn stats_request(
    manager: &mut impl MemoryManagerInterface,
    reply_buffer: &mut MemoryRequestData,
) -> MemoryManagerResult {
    let stats = manager.stats()?;
    let _ = postcard::to_slice(&StatsResponse { stats }, reply_buffer)
        .or(Err(MemoryManagerError::SerializeFailed))?;
    Ok(())
}

// Halt on panic; the nano layer reaps a wedged component.
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);
    loop {
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_memory_interface::MemRegion;
    use cairn_memory_interface::MemoryManagerStats;
    use cairn_memory_interface::MopId;
    use cairn_memory_interface::PhysRegion;
    use cairn_memory_interface::MEMORY_REQUEST_DATA_SIZE;
    use cairn_nano_interface::PhysHandle;
    use cairn_nano_interface::ResHandle;

    /// Scripted interface impl: records what the wire decoded to and
    /// answers canned replies.
    #[derive(Default)]
    struct FakeManager {
        calls: Vec<String>,
        fail_next: Option<MemoryManagerError>,
    }

    impl FakeManager {
        fn take_failure(&mut self) -> Result<(), MemoryManagerError> {
            match self.fail_next.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    impl MemoryManagerInterface for FakeManager {
        fn mem_request(
            &mut self,
            base: usize,
            length: usize,
            flags: MemRequestFlags,
            owner: MopId,
        ) -> Result<MemRegion, MemoryManagerError> {
            self.calls
                .push(format!("request {:#x}+{:#x} {:?} {:#x}", base, length, flags, owner.0));
            self.take_failure()?;
            Ok(MemRegion {
                base: 0x4000,
                length,
                reservation: ResHandle(7),
            })
        }
        fn mem_claim(
            &mut self,
            base: usize,
            length: usize,
            times: usize,
            owner: MopId,
        ) -> Result<(), MemoryManagerError> {
            self.calls
                .push(format!("claim {:#x}+{:#x} x{} {:#x}", base, length, times, owner.0));
            self.take_failure()
        }
        fn mem_release(
            &mut self,
            base: usize,
            length: usize,
            times: usize,
            owner: MopId,
        ) -> Result<(), MemoryManagerError> {
            self.calls
                .push(format!("release {:#x}+{:#x} x{} {:#x}", base, length, times, owner.0));
            self.take_failure()
        }
        fn mem_makemop(
            &mut self,
            space: ResHandle,
            parent: MopId,
            debug_label: &str,
        ) -> Result<MopId, MemoryManagerError> {
            self.calls
                .push(format!("makemop {} {:#x} '{}'", space.0, parent.0, debug_label));
            self.take_failure()?;
            Ok(MopId::new(9, 3))
        }
        fn mem_reclaim_mop(&mut self, owner: MopId) -> Result<(), MemoryManagerError> {
            self.calls.push(format!("reclaim {:#x}", owner.0));
            self.take_failure()
        }
        fn mem_virt_to_phys(&self, vaddr: usize) -> Result<usize, MemoryManagerError> {
            let _ = vaddr;
            Ok(0x1234)
        }
        fn mem_phys_cap(
            &mut self,
            base: usize,
            length: usize,
            cached: bool,
            owner: MopId,
        ) -> Result<PhysRegion, MemoryManagerError> {
            self.calls
                .push(format!("physcap {:#x}+{:#x} cached={} {:#x}", base, length, cached, owner.0));
            self.take_failure()?;
            Ok(PhysRegion {
                base: 0x8000,
                length,
                phys: PhysHandle(5),
            })
        }
        fn stats(&self) -> Result<MemoryManagerStats, MemoryManagerError> {
            Ok(MemoryManagerStats {
                total_pages: 64,
                ..Default::default()
            })
        }
        fn debug(&self) -> Result<(), MemoryManagerError> { Ok(()) }
    }

    fn call(
        fake: &mut FakeManager,
        request: &MemoryManagerRequest,
    ) -> (MemoryManagerError, MemoryRequestData) {
        let mut request_buffer = [0u8; MEMORY_REQUEST_DATA_SIZE];
        let encoded = postcard::to_slice(request, &mut request_buffer).unwrap();
        let mut reply_buffer = [0u8; MEMORY_REQUEST_DATA_SIZE];
        let status = serve(fake, encoded, &mut reply_buffer);
        (status, reply_buffer)
    }

    #[test]
    fn test_request_round_trip() {
        let mut fake = FakeManager::default();
        let (status, reply) = call(
            &mut fake,
            &MemoryManagerRequest::Request {
                base: 0,
                length: 0x3000,
                flags: MemRequestFlags::COMMIT_NOW.bits(),
                owner: MopId::new(1, 0),
            },
        );
        assert_eq!(status, MemoryManagerError::Success);
        let response: RequestResponse = postcard::from_bytes(&reply).unwrap();
        assert_eq!(response.region.base, 0x4000);
        assert_eq!(response.region.length, 0x3000);
        assert_eq!(response.region.reservation, ResHandle(7));
        assert_eq!(fake.calls.len(), 1);
        assert!(fake.calls[0].starts_with("request"));
    }

    #[test]
    fn test_makemop_label_survives_the_wire() {
        let mut fake = FakeManager::default();
        let (status, reply) = call(
            &mut fake,
            &MemoryManagerRequest::MakeMop {
                space: ResHandle(11),
                parent: MopId::new(0, 0),
                debug_label: "console".into(),
            },
        );
        assert_eq!(status, MemoryManagerError::Success);
        let response: MakeMopResponse = postcard::from_bytes(&reply).unwrap();
        assert_eq!(response.mop, MopId::new(9, 3));
        assert_eq!(fake.calls[0], "makemop 11 0x0 'console'");
    }

    #[test]
    fn test_errors_pass_through_unserialized() {
        let mut fake = FakeManager::default();
        fake.fail_next = Some(MemoryManagerError::ClaimFreed);
        let (status, _) = call(
            &mut fake,
            &MemoryManagerRequest::Claim {
                base: 0x4000,
                length: 0x1000,
                times: 1,
                owner: MopId::new(2, 0),
            },
        );
        assert_eq!(status, MemoryManagerError::ClaimFreed);
    }

    #[test]
    fn test_release_and_reclaim_dispatch() {
        let mut fake = FakeManager::default();
        let (status, _) = call(
            &mut fake,
            &MemoryManagerRequest::Release {
                base: 0x4000,
                length: 0x1000,
                times: 2,
                owner: MopId::new(2, 1),
            },
        );
        assert_eq!(status, MemoryManagerError::Success);
        let (status, _) = call(&mut fake, &MemoryManagerRequest::ReclaimMop {
            owner: MopId::new(2, 1),
        });
        assert_eq!(status, MemoryManagerError::Success);
        assert_eq!(fake.calls, vec![
            "release 0x4000+0x1000 x2 0x100000002".to_string(),
            "reclaim 0x100000002".to_string(),
        ]);
    }

    #[test]
    fn test_stats_and_virt_to_phys_replies() {
        let mut fake = FakeManager::default();
        let (status, reply) = call(&mut fake, &MemoryManagerRequest::Stats);
        assert_eq!(status, MemoryManagerError::Success);
        let response: StatsResponse = postcard::from_bytes(&reply).unwrap();
        assert_eq!(response.stats.total_pages, 64);

        let (status, reply) = call(&mut fake, &MemoryManagerRequest::VirtToPhys {
            vaddr: 0x5000,
        });
        assert_eq!(status, MemoryManagerError::Success);
        let response: VirtToPhysResponse = postcard::from_bytes(&reply).unwrap();
        assert_eq!(response.paddr, 0x1234);
    }

    #[test]
    fn test_phys_cap_round_trip() {
        let mut fake = FakeManager::default();
        let (status, reply) = call(
            &mut fake,
            &MemoryManagerRequest::PhysCap {
                base: 0,
                length: 0x2000,
                cached: false,
                owner: MopId::new(3, 0),
            },
        );
        assert_eq!(status, MemoryManagerError::Success);
        let response: PhysCapResponse = postcard::from_bytes(&reply).unwrap();
        assert_eq!(response.region.base, 0x8000);
        assert_eq!(response.region.length, 0x2000);
        assert_eq!(response.region.phys, PhysHandle(5));
        assert_eq!(fake.calls[0], "physcap 0x0+0x2000 cached=false 0x3");
    }

    #[test]
    fn test_garbage_request_is_refused() {
        let mut fake = FakeManager::default();
        let mut reply_buffer = [0u8; MEMORY_REQUEST_DATA_SIZE];
        let status = serve(&mut fake, &[0xff, 0xff, 0xff, 0xff], &mut reply_buffer);
        assert_eq!(status, MemoryManagerError::DeserializeFailed);
        assert!(fake.calls.is_empty());
    }
}
