#![cfg_attr(all(not(test), target_arch = "riscv64"), no_std)]
#![cfg_attr(target_arch = "riscv64", no_main)]

#[cfg(target_arch = "riscv64")]
mod boot {
    use minnow_kernel::syscall::nr;

    core::arch::global_asm!(
        r#"
        .section .text.init
        .global _start
    _start:
        # a0 = hartid from firmware.
        mv tp, a0
        la sp, BOOT_STACKS
        li t0, {boot_stack_size}
        addi t1, a0, 1
        mul t0, t0, t1
        add sp, sp, t0
        bnez a0, 1f
        # clear .bss on the primary hart
        la t0, __bss_start
        la t1, __bss_end
    2:  bgeu t0, t1, 3f
        sd zero, 0(t0)
        addi t0, t0, 8
        j 2b
    3:  call primary_start
    1:  call secondary_start
    4:  wfi
        j 4b
        "#,
        boot_stack_size = const 16 * 1024,
    );

    #[no_mangle]
    static mut BOOT_STACKS: [u8; 16 * 1024 * minnow_kernel::smp::MAX_HARTS] =
        [0; 16 * 1024 * minnow_kernel::smp::MAX_HARTS];

    extern "C" {
        static __heap_start: u8;
        static __heap_end: u8;
    }

    /// First task: prove the syscall path end to end, then tick as a
    /// slow heartbeat.
    extern "C" fn kernel_main() -> ! {
        let banner = b"minnow: first task running\n\0";
        unsafe {
            syscall3(nr::PRINT, banner.as_ptr() as usize, 0, 0);
        }
        loop {
            unsafe {
                syscall3(nr::SLEEP, 1_000_000_000, 0, 0);
            }
        }
    }

    unsafe fn syscall3(number: usize, a0: usize, a1: usize, a2: usize) -> isize {
        let ret: isize;
        core::arch::asm!(
            "ecall",
            inlateout("a0") a0 => ret,
            in("a1") a1,
            in("a2") a2,
            in("a7") number,
        );
        ret
    }

    #[no_mangle]
    extern "C" fn primary_start(hartid: usize) -> ! {
        // A slice of the heap window feeds the kernel heap; the page
        // allocator owns the rest.
        unsafe {
            let heap_start = &__heap_start as *const u8 as usize;
            let heap_end = &__heap_end as *const u8 as usize;
            let kernel_heap = 4 * 1024 * 1024;
            minnow_kernel::init_kernel_heap(heap_start as *mut u8, kernel_heap);
            if minnow_kernel::init::init_all_systems(
                heap_start + kernel_heap,
                heap_end,
                hartid,
                kernel_main,
            )
            .is_err()
            {
                panic!("kernel initialization failed");
            }
        }
        minnow_kernel::process::sched::run_next_task()
    }

    #[no_mangle]
    extern "C" fn secondary_start(hartid: usize) -> ! {
        let _ = minnow_kernel::init::init_secondary_hart(hartid);
        minnow_kernel::process::sched::run_next_task()
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn main() {
    eprintln!("minnow targets riscv64 hardware; run the test suite on the host instead");
}
