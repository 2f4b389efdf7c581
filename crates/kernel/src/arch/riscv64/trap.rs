// Trap decode: syscalls, timer ticks, faults.

use crate::arch::TrapFrame;
use crate::syscall::SyscallReturn;

const INTERRUPT_TIMER: usize = 5;
const INTERRUPT_EXTERNAL: usize = 9;
const EXCEPTION_ECALL_USER: usize = 8;
const EXCEPTION_ECALL_SUPERVISOR: usize = 9;

pub fn init_traps() {
    extern "C" {
        fn trap_vector();
    }
    unsafe {
        riscv::register::stvec::write(
            trap_vector as usize,
            riscv::register::stvec::TrapMode::Direct,
        );
    }
    super::enable_interrupts();
}

#[no_mangle]
extern "C" fn handle_trap(frame: *mut TrapFrame) -> ! {
    let frame = unsafe { &mut *frame };
    let scause = riscv::register::scause::read();

    if scause.is_interrupt() {
        match scause.code() {
            INTERRUPT_TIMER => crate::process::sched::handle_timer_tick(frame),
            INTERRUPT_EXTERNAL => {
                // PLIC routing belongs to the driver layer.
                crate::debug!("external interrupt on hart {}", super::hart_id());
            }
            code => crate::warn!("unhandled interrupt {}", code),
        }
    } else {
        match scause.code() {
            EXCEPTION_ECALL_USER | EXCEPTION_ECALL_SUPERVISOR => {
                frame.pc += 4;
                let is_kernel = scause.code() == EXCEPTION_ECALL_SUPERVISOR;
                match crate::syscall::dispatch(is_kernel, frame) {
                    SyscallReturn::Continue => {}
                    SyscallReturn::Schedule => crate::process::sched::run_next_task(),
                }
            }
            code => {
                let stval = riscv::register::stval::read();
                if frame.is_task() {
                    crate::warn!(
                        "task fault: cause {} at {:#x} (stval {:#x})",
                        code,
                        frame.pc,
                        stval
                    );
                    crate::process::fault_current_task(frame);
                    crate::process::sched::run_next_task();
                } else {
                    panic!("kernel fault: cause {} at {:#x} (stval {:#x})", code, frame.pc, stval);
                }
            }
        }
    }

    // Deliver any pending signals with interrupts still masked, then resume.
    crate::process::signal::handle_pending_for_frame(frame);
    unsafe { super::context::load_from_frame(frame) }
}
