#![cfg_attr(not(test), no_std)]

// Required for heap allocation
extern crate alloc;

// Core library (error handling, logging)
#[allow(special_module_name)]
#[path = "lib/mod.rs"]
pub mod lib;
// Timebase
pub mod time;
// Architecture support (trap frame, riscv64 context, memory map)
pub mod arch;
// Memory management (page allocator, Sv39 page tables)
pub mod mm;
// Per-hart state
pub mod smp;
// Tasks, scheduler, processes, signals
pub mod process;
// Virtual File System
pub mod vfs;
// Syscall surface
pub mod syscall;
// Kernel initialization
pub mod init;

// Kernel heap for bare-metal builds; host builds use the system allocator.
#[cfg(all(not(test), target_arch = "riscv64"))]
#[global_allocator]
static KERNEL_HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Give the kernel heap its backing memory. Called once during bring-up,
/// before the first allocation.
#[cfg(all(not(test), target_arch = "riscv64"))]
pub unsafe fn init_kernel_heap(start: *mut u8, size: usize) {
    KERNEL_HEAP.lock().init(start, size);
}
