/// Kernel bring-up
///
/// `init_all_systems` runs once on the primary hart before any secondary
/// hart is released: page allocator over the linker heap window, kernel
/// identity mapping (DRAM plus the virt MMIO windows), traps, VFS root,
/// then the first kernel task. Afterwards the globals it filled are
/// immutable or lock-guarded.

use core::sync::atomic::{AtomicUsize, Ordering};

static KERNEL_SATP: AtomicUsize = AtomicUsize::new(0);

/// satp value shared by kernel tasks (0 until paging is up).
pub fn kernel_satp() -> usize {
    KERNEL_SATP.load(Ordering::Acquire)
}

pub fn set_kernel_satp(value: usize) {
    KERNEL_SATP.store(value, Ordering::Release);
}

/// Mount the ramfs root. Separated out so the host test harness can run
/// the same path.
pub fn init_root_filesystem() {
    crate::vfs::init_vfs(crate::vfs::ramfs::RamfsSuper::new());
}

#[cfg(target_arch = "riscv64")]
mod bringup {
    use super::*;
    use crate::arch::memmap::MEMORY_MAP;
    use crate::lib::error::Result;
    use crate::mm::pagetable::{map_range, PteFlags};
    use crate::mm::{create_page_table, init_page_allocator, PAGE_SIZE};
    use crate::process::task::DEFAULT_PRIORITY;
    use crate::smp::HART_STACK_SIZE;

    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
    }

    /// Identity-map the kernel image, the heap and every MMIO window,
    /// then switch satp. Range mapping picks superleaves wherever the
    /// alignment allows.
    fn init_kernel_page_table(heap_end: usize) -> Result<()> {
        let root = create_page_table()?;
        let root_ref = unsafe { &mut *root.as_ptr() };

        let text_start = unsafe { &__text_start as *const u8 as usize };
        let text_end = unsafe { &__text_end as *const u8 as usize };
        map_range(
            root_ref,
            text_start,
            text_end,
            text_start,
            PteFlags::AD_RX.union(PteFlags::GLOBAL),
        )?;

        map_range(
            root_ref,
            text_end,
            heap_end,
            text_end,
            PteFlags::AD_RW.union(PteFlags::GLOBAL),
        )?;

        for entry in MEMORY_MAP.iter().filter(|e| e.size != 0) {
            map_range(
                root_ref,
                entry.base,
                entry.base + entry.size,
                entry.base,
                PteFlags::AD_RW.union(PteFlags::GLOBAL),
            )?;
        }

        let satp = crate::arch::riscv64::satp_value(root.as_ptr(), 0);
        set_kernel_satp(satp);
        unsafe {
            crate::arch::riscv64::activate_page_table(root.as_ptr(), 0);
        }
        Ok(())
    }

    /// Idle loop body for each hart's idle task.
    extern "C" fn idle_main() -> ! {
        loop {
            crate::arch::wait_for_interrupt();
        }
    }

    fn setup_idle_task(hart_index: usize) -> Result<()> {
        let idle = crate::process::create_kernel_task(
            idle_main as usize,
            crate::process::LOWEST_PRIORITY,
            PAGE_SIZE,
        )?;
        crate::smp::hart(hart_index)
            .idle_task
            .store(idle, core::sync::atomic::Ordering::Release);
        Ok(())
    }

    /// Full bring-up on the primary hart. `[heap_start, heap_end)` is the
    /// window left for the page allocator.
    pub fn init_all_systems(
        heap_start: usize,
        heap_end: usize,
        hartid: usize,
        main: extern "C" fn() -> !,
    ) -> Result<()> {
        init_page_allocator(heap_start, heap_end)?;
        crate::info!("page heap {:#x}..{:#x}", heap_start, heap_end);

        init_kernel_page_table(heap_end)?;
        crate::info!("paging enabled");

        let index = crate::smp::register_hart(hartid);
        let hart = crate::smp::hart(index);
        hart.stack_top.store(
            crate::mm::alloc_pages(HART_STACK_SIZE / PAGE_SIZE)
                .map(|a| a.ptr as usize + HART_STACK_SIZE)
                .unwrap_or(0),
            core::sync::atomic::Ordering::Release,
        );
        setup_idle_task(index)?;

        crate::arch::riscv64::trap::init_traps();
        crate::arch::riscv64::set_timer(crate::time::get_time() + crate::time::CLOCKS_PER_SEC / 100);

        init_root_filesystem();

        let first = crate::process::create_kernel_task(main as usize, DEFAULT_PRIORITY, HART_STACK_SIZE)?;
        {
            let mut table = crate::process::tasks();
            crate::process::sched::enqueue_task_on(&mut table, hart, first);
        }
        crate::info!("kernel initialized, entering scheduler");
        Ok(())
    }

    /// Secondary hart bring-up: register, idle task, traps, scheduler.
    pub fn init_secondary_hart(hartid: usize) -> Result<()> {
        let index = crate::smp::register_hart(hartid);
        setup_idle_task(index)?;
        crate::arch::riscv64::trap::init_traps();
        crate::arch::riscv64::set_timer(crate::time::get_time() + crate::time::CLOCKS_PER_SEC / 100);
        Ok(())
    }
}

#[cfg(target_arch = "riscv64")]
pub use bringup::{init_all_systems, init_secondary_hart};
