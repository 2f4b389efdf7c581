/// Physical page allocator
///
/// A single free list of contiguous runs, each described by a header
/// written at the run's own first bytes. Allocation splits or unlinks a
/// run; release coalesces with both neighbours so no two free runs ever
/// abut. Exhaustion is surfaced to the caller, never blocked on.

use super::page::PAGE_SIZE;
use crate::lib::error::{Errno, Error, Result};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// Header at the start of a free run.
#[repr(C)]
struct FreeRun {
    /// Number of free pages in this run, including the header page.
    pages: usize,
    next: *mut FreeRun,
}

/// A contiguous allocation handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAllocation {
    pub ptr: *mut u8,
    pub pages: usize,
}

impl PageAllocation {
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

pub struct PageAllocator {
    first: *mut FreeRun,
    heap_start: usize,
    heap_end: usize,
    total_pages: usize,
}

// The raw list pointers are only touched under the owning lock.
unsafe impl Send for PageAllocator {}

impl PageAllocator {
    pub const fn empty() -> Self {
        Self {
            first: ptr::null_mut(),
            heap_start: 0,
            heap_end: 0,
            total_pages: 0,
        }
    }

    /// Take ownership of `[start, end)`. Bounds are aligned inward to page
    /// boundaries; the whole window becomes one free run.
    ///
    /// # Safety
    /// The region must be unused RAM, exclusively owned by this allocator.
    pub unsafe fn init(&mut self, start: usize, end: usize) {
        let start = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = end & !(PAGE_SIZE - 1);
        assert!(end >= start, "heap window inverted");
        self.heap_start = start;
        self.heap_end = end;
        self.total_pages = (end - start) / PAGE_SIZE;
        if self.total_pages > 0 {
            let first = start as *mut FreeRun;
            (*first).pages = self.total_pages;
            (*first).next = ptr::null_mut();
            self.first = first;
        } else {
            self.first = ptr::null_mut();
        }
    }

    pub fn alloc_pages(&mut self, pages: usize) -> Option<PageAllocation> {
        if pages == 0 {
            return None;
        }
        unsafe {
            let mut link: *mut *mut FreeRun = &mut self.first;
            while !(*link).is_null() {
                let run = *link;
                if (*run).pages > pages {
                    // Carve the head of the run, splice the remainder in place.
                    let moved = (run as usize + PAGE_SIZE * pages) as *mut FreeRun;
                    (*moved).pages = (*run).pages - pages;
                    (*moved).next = (*run).next;
                    *link = moved;
                    return Some(PageAllocation {
                        ptr: run as *mut u8,
                        pages,
                    });
                } else if (*run).pages == pages {
                    *link = (*run).next;
                    return Some(PageAllocation {
                        ptr: run as *mut u8,
                        pages,
                    });
                } else {
                    link = &mut (*run).next;
                }
            }
        }
        None
    }

    pub fn dealloc_pages(&mut self, alloc: PageAllocation) {
        if alloc.ptr.is_null() || alloc.pages == 0 {
            return;
        }
        let base = alloc.ptr as usize;
        let end = base + alloc.pages * PAGE_SIZE;
        // Freeing outside the heap is allocator corruption.
        assert!(
            base >= self.heap_start && base < self.heap_end,
            "dealloc outside heap"
        );
        assert!(end <= self.heap_end, "dealloc run exceeds heap");

        unsafe {
            let mut run = base as *mut FreeRun;
            (*run).pages = alloc.pages;
            (*run).next = ptr::null_mut();
            // Merge with any adjacent free run on either side, unlinking it.
            let mut link: *mut *mut FreeRun = &mut self.first;
            while !(*link).is_null() {
                let current = *link;
                let current_base = current as usize;
                let run_base = run as usize;
                if run_base + (*run).pages * PAGE_SIZE == current_base {
                    (*run).pages += (*current).pages;
                    *link = (*current).next;
                } else if current_base + (*current).pages * PAGE_SIZE == run_base {
                    (*current).pages += (*run).pages;
                    run = current;
                    *link = (*current).next;
                } else {
                    link = &mut (*current).next;
                }
            }
            (*run).next = self.first;
            self.first = run;
        }
    }

    pub fn zalloc_pages(&mut self, pages: usize) -> Option<PageAllocation> {
        let alloc = self.alloc_pages(pages)?;
        unsafe {
            ptr::write_bytes(alloc.ptr, 0, alloc.pages * PAGE_SIZE);
        }
        Some(alloc)
    }

    /// Total free pages across all runs.
    pub fn free_pages(&self) -> usize {
        let mut total = 0;
        let mut run = self.first;
        while !run.is_null() {
            unsafe {
                total += (*run).pages;
                run = (*run).next;
            }
        }
        total
    }

    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Snapshot of the free runs as `(base, pages)` pairs.
    pub fn runs(&self) -> alloc::vec::Vec<(usize, usize)> {
        let mut out = alloc::vec::Vec::new();
        let mut run = self.first;
        while !run.is_null() {
            unsafe {
                out.push((run as usize, (*run).pages));
                run = (*run).next;
            }
        }
        out
    }
}

static ALLOCATOR: Mutex<PageAllocator> = Mutex::new(PageAllocator::empty());
static ZERO_PAGE: AtomicUsize = AtomicUsize::new(0);

/// Hand the heap window to the global allocator and set up the shared
/// zero page. Called once under the primary hart before any secondary
/// hart is released.
pub fn init_page_allocator(start: usize, end: usize) -> Result<()> {
    unsafe {
        ALLOCATOR.lock().init(start, end);
    }
    let zero = zalloc_page().ok_or(Error::with_details(Errno::ENOMEM, "no room for zero page"))?;
    ZERO_PAGE.store(zero as usize, Ordering::Release);
    crate::info!(
        "page allocator: {} pages at {:#x}..{:#x}",
        ALLOCATOR.lock().total_pages(),
        start,
        end
    );
    Ok(())
}

/// The shared all-zero page set up at init.
pub fn zero_page() -> *mut u8 {
    ZERO_PAGE.load(Ordering::Acquire) as *mut u8
}

pub fn alloc_pages(pages: usize) -> Option<PageAllocation> {
    ALLOCATOR.lock().alloc_pages(pages)
}

pub fn alloc_page() -> Option<*mut u8> {
    alloc_pages(1).map(|a| a.ptr)
}

pub fn zalloc_pages(pages: usize) -> Option<PageAllocation> {
    ALLOCATOR.lock().zalloc_pages(pages)
}

pub fn zalloc_page() -> Option<*mut u8> {
    zalloc_pages(1).map(|a| a.ptr)
}

pub fn dealloc_pages(alloc: PageAllocation) {
    ALLOCATOR.lock().dealloc_pages(alloc);
}

pub fn dealloc_page(ptr: *mut u8) {
    dealloc_pages(PageAllocation { ptr, pages: 1 });
}

/// Free pages remaining in the global allocator.
pub fn free_page_count() -> usize {
    ALLOCATOR.lock().free_pages()
}
