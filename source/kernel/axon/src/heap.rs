// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel heap backing `alloc` and the frame source
//! OWNERS: @kernel-mm-team
//! PUBLIC API: init(), KernelHeap
//! DEPENDS_ON: linked_list_allocator::Heap, sync::SpinLock (interrupts off while held)
//! INVARIANTS: Initialised once by the boot hart before any allocation; never grows
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;

use crate::sync::SpinLock;

/// Global allocator over a single linked-list heap.
pub struct KernelHeap {
    inner: SpinLock<Heap>,
}

impl KernelHeap {
    pub const fn empty() -> Self {
        Self { inner: SpinLock::new("heap", Heap::empty()) }
    }

    /// Hands `[start, start + size)` to the allocator.
    ///
    /// # Safety
    ///
    /// The range must be unused, writable memory and this must be called once.
    pub unsafe fn init(&self, start: usize, size: usize) {
        let mut heap = self.inner.lock();
        // SAFETY: forwarded from the caller.
        unsafe { heap.init(start as *mut u8, size) };
    }

    /// Bytes currently free.
    pub fn free_bytes(&self) -> usize {
        self.inner.lock().free()
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .lock()
            .allocate_first_fit(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: `ptr` was returned by `alloc` with the same layout.
            unsafe { self.inner.lock().deallocate(ptr, layout) };
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[global_allocator]
static HEAP: KernelHeap = KernelHeap::empty();

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    static __heap_start: u8;
}

/// Gives every byte between the end of the image and the top of RAM to
/// the kernel heap.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn init() {
    // SAFETY: only the symbol address is taken.
    let start = unsafe { ptr::addr_of!(__heap_start) as usize };
    let size = crate::mm::layout::PHYSTOP - start;
    // SAFETY: the linker reserves nothing above `__heap_start`; boot hart only.
    unsafe { HEAP.init(start, size) };
    crate::log_info!(target: "heap", "heap {:#x}..{:#x}", start, start + size);
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn init() {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::alloc::{alloc, dealloc};

    #[test]
    fn allocations_come_back_to_the_free_list() {
        const ARENA: usize = 64 * 1024;
        let arena_layout = Layout::from_size_align(ARENA, 4096).unwrap();
        let arena = unsafe { alloc(arena_layout) };
        assert!(!arena.is_null());

        let heap = KernelHeap::empty();
        unsafe { heap.init(arena as usize, ARENA) };
        let before = heap.free_bytes();

        let page = Layout::from_size_align(4096, 4096).unwrap();
        let ptr = unsafe { heap.alloc(page) };
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 4096, 0);
        assert!(heap.free_bytes() < before);

        unsafe { heap.dealloc(ptr, page) };
        assert_eq!(heap.free_bytes(), before);

        let huge = Layout::from_size_align(2 * ARENA, 8).unwrap();
        assert!(unsafe { heap.alloc(huge) }.is_null());
        unsafe { dealloc(arena, arena_layout) };
    }
}
