/// Memory management subsystem
///
/// - Physical page allocator over the linker-provided heap window
/// - Sv39 three-level page tables with range/level optimisation

pub mod page;
pub mod pagealloc;
pub mod pagetable;

pub use page::{page_align_down, page_align_up, pages_for, PAGE_SHIFT, PAGE_SIZE};

pub use pagealloc::{
    alloc_page, alloc_pages, dealloc_page, dealloc_pages, init_page_allocator, zalloc_page,
    zalloc_pages, zero_page, PageAllocation,
};

pub use pagetable::{
    all_pages_do, create_page_table, free_page_table, map_page, map_range, map_range_at_level,
    page_size, translate, unmap_all, unmap_page, unmap_range, virt_to_entry, PageTable, Pte,
    PteFlags, PAGE_TABLE_ENTRIES,
};

/// Shared heap arena for host-side tests. Initialises the global page
/// allocator exactly once over a static region.
#[cfg(test)]
pub(crate) mod test_heap {
    use spin::Once;

    pub const TEST_HEAP_PAGES: usize = 2048;

    #[repr(C, align(4096))]
    struct Arena([u8; TEST_HEAP_PAGES * super::PAGE_SIZE]);

    static mut ARENA: Arena = Arena([0; TEST_HEAP_PAGES * super::PAGE_SIZE]);
    static INIT: Once = Once::new();

    pub fn ensure() {
        INIT.call_once(|| {
            let start = unsafe { core::ptr::addr_of_mut!(ARENA) } as usize;
            let end = start + TEST_HEAP_PAGES * super::PAGE_SIZE;
            super::init_page_allocator(start, end).expect("test heap init");
        });
    }
}
