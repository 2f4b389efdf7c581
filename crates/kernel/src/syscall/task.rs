/// Task syscalls: yield, sleep, critical sections.

use super::{caller, ret, SyscallArgs, SyscallReturn};
use crate::arch::TrapFrame;
use crate::lib::error::{Errno, Error};
use crate::process::sched;
use crate::process::task::tasks;
use crate::time::{get_time, nanos_to_clocks};

/// Give up the CPU; the task re-enters its ready queue at static
/// priority.
pub fn yield_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    frame.set_return(0);
    let Some(task) = crate::smp::current_task() else {
        return SyscallReturn::Continue;
    };
    {
        let mut table = tasks();
        sched::enqueue_task(&mut table, task);
    }
    crate::smp::current_hart().set_current_task(None);
    SyscallReturn::Schedule
}

/// Sleep for at least the given number of nanoseconds (subject to tick
/// granularity). Outside task context the call spins instead.
pub fn sleep_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let deadline = get_time() + nanos_to_clocks(args[0] as u64);
    frame.set_return(0);
    if !frame.is_task() {
        while get_time() < deadline {
            crate::arch::wait_for_interrupt();
        }
        return SyscallReturn::Continue;
    }
    let Some(task) = crate::smp::current_task() else {
        return SyscallReturn::Continue;
    };
    {
        let mut table = tasks();
        if let Some(entry) = table.get_mut(task) {
            entry.sched.sleeping_until = deadline;
        }
        sched::move_task_to_state(&mut table, task, crate::process::TaskState::Sleeping);
    }
    crate::smp::current_hart().set_current_task(None);
    SyscallReturn::Schedule
}

/// Toggle the non-preemptable flag. Kernel callers and root only.
pub fn critical_syscall(is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let enter = args[0] != 0;
    let allowed = if is_kernel {
        true
    } else {
        match caller() {
            Ok(who) => crate::process::processes()
                .get(who.pid)
                .map(|p| p.resources.uid == 0)
                .unwrap_or(false),
            Err(_) => false,
        }
    };
    if !allowed {
        ret(frame, Err(Error::new(Errno::EPERM)));
        return SyscallReturn::Continue;
    }
    if let Some(task) = crate::smp::current_task() {
        let mut table = tasks();
        if let Some(entry) = table.get_mut(task) {
            entry.sched.critical = enter;
        }
    }
    ret(frame, Ok(0));
    SyscallReturn::Continue
}
