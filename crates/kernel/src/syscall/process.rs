/// Process syscalls: fork/exit/wait, identity, signals, alarm, times.

use super::uaccess::{self, VirtPtr};
use super::{caller, ret, SyscallArgs, SyscallReturn};
use crate::arch::TrapFrame;
use crate::lib::error::{Errno, Error};
use crate::process::sched;
use crate::process::signal::{self, SigHandler, Signal};
use crate::process::task::{tasks, TaskState};
use crate::process::wait::{try_wait, WaitOutcome};
use crate::process::{exit_process, fork_process, processes};
use crate::time::{get_time, Time, CLOCKS_PER_SEC};

pub fn fork_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let (child_pid, child_task) = fork_process(who.pid)?;
        let mut table = tasks();
        sched::enqueue_task(&mut table, child_task);
        Ok(child_pid as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn exit_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    match caller() {
        Ok(who) => {
            let _ = exit_process(who.pid, args[0] as u64);
            crate::smp::current_hart().set_current_task(None);
            SyscallReturn::Schedule
        }
        Err(err) => {
            // Exit outside process context has nothing to tear down.
            ret(frame, Err(err));
            SyscallReturn::Continue
        }
    }
}

/// Wait for any child. Returns the reaped child's PID; its status goes to
/// the pointer in `a0` (when non-null). Blocks in WaitChild when children
/// exist but none has terminated.
pub fn wait_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let status_ptr = args[0];
    let who = match caller() {
        Ok(who) => who,
        Err(err) => {
            ret(frame, Err(err));
            return SyscallReturn::Continue;
        }
    };
    let mut procs = processes();
    let mut table = tasks();
    match try_wait(&mut procs, &mut table, who.pid) {
        WaitOutcome::Reaped { pid, status } => {
            if status_ptr != 0 {
                let _ = uaccess::write_value(who.buf(status_ptr), &status);
            }
            ret(frame, Ok(pid as isize));
            SyscallReturn::Continue
        }
        WaitOutcome::NoChildren => {
            ret(frame, Err(Error::new(Errno::ECHILD)));
            SyscallReturn::Continue
        }
        WaitOutcome::Pending => {
            if let Some(process) = procs.get_mut(who.pid) {
                process.wait_status_ptr = status_ptr;
            }
            sched::move_task_to_state(&mut table, who.task, TaskState::WaitChild);
            drop(table);
            drop(procs);
            crate::smp::current_hart().set_current_task(None);
            SyscallReturn::Schedule
        }
    }
}

pub fn pause_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    let who = match caller() {
        Ok(who) => who,
        Err(err) => {
            ret(frame, Err(err));
            return SyscallReturn::Continue;
        }
    };
    {
        let mut table = tasks();
        sched::move_task_to_state(&mut table, who.task, TaskState::Paused);
    }
    // Whatever signal resumes us surfaces as EINTR.
    frame.set_return(Errno::EINTR.as_isize());
    crate::smp::current_hart().set_current_task(None);
    SyscallReturn::Schedule
}

/// Arm the alarm clock; returns the seconds that were left on a previous
/// alarm, zero otherwise.
pub fn alarm_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        let now = get_time();
        let remaining = match process.signals.alarm_at {
            Some(at) if at > now => ((at - now) / CLOCKS_PER_SEC) as isize,
            _ => 0,
        };
        let seconds = args[0] as u64;
        process.signals.alarm_at = if seconds == 0 {
            None
        } else {
            Some(now + seconds * CLOCKS_PER_SEC)
        };
        Ok(remaining)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn getpid_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    let result = caller().map(|who| who.pid as isize);
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn getppid_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    let result = caller().map(|who| {
        processes()
            .get(who.pid)
            .and_then(|p| p.parent)
            .unwrap_or(0) as isize
    });
    ret(frame, result);
    SyscallReturn::Continue
}

/// Send a signal. Root may target anyone; others only processes of the
/// same uid.
pub fn kill_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let target = args[0] as crate::process::Pid;
    let sig = args[1] as Signal;
    let result = caller().and_then(|who| {
        {
            let procs = processes();
            let sender_uid = procs
                .get(who.pid)
                .map(|p| p.resources.uid)
                .ok_or(Error::new(Errno::ESRCH))?;
            let target_uid = procs
                .get(target)
                .map(|p| p.resources.uid)
                .ok_or(Error::new(Errno::ESRCH))?;
            if sender_uid != 0 && sender_uid != target_uid {
                return Err(Error::new(Errno::EPERM));
            }
        }
        signal::send_signal(target, sig)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

const SIG_DFL: usize = 0;
const SIG_IGN: usize = 1;

/// Install a handler: `sigaction(sig, handler, restorer)`. Returns the
/// previous handler encoded the same way.
pub fn sigaction_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let sig = args[0] as Signal;
    let result = caller().and_then(|who| {
        if !signal::valid_signal(sig) || !signal::is_catchable(sig) {
            return Err(Error::new(Errno::EINVAL));
        }
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        let old = process.signals.handlers[sig as usize];
        process.signals.handlers[sig as usize] = match args[1] {
            SIG_DFL => SigHandler::Default,
            SIG_IGN => SigHandler::Ignore,
            addr => SigHandler::Handler {
                addr,
                restorer: args[2],
            },
        };
        let encoded = match old {
            SigHandler::Default => SIG_DFL as isize,
            SigHandler::Ignore => SIG_IGN as isize,
            SigHandler::Handler { addr, .. } => addr as isize,
        };
        Ok(encoded)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

/// Return from a signal handler; the restored frame's own `a0` is the
/// caller-visible result, so on success nothing is written here.
pub fn sigreturn_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    match caller() {
        Ok(who) => {
            let mut procs = processes();
            let mut table = tasks();
            if let Err(err) = signal::return_from_signal(&mut procs, &mut table, who.pid) {
                ret(frame, Err(err));
            }
        }
        Err(err) => ret(frame, Err(err)),
    }
    SyscallReturn::Continue
}

pub fn sigpending_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let procs = processes();
        let process = procs.get(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        Ok(process.signals.pending as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

const SIG_BLOCK: usize = 0;
const SIG_UNBLOCK: usize = 1;
const SIG_SETMASK: usize = 2;

/// Adjust the signal mask; returns the previous mask.
pub fn sigprocmask_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        let old = process.signals.mask;
        let operand = args[1] as u64;
        process.signals.mask = match args[0] {
            SIG_BLOCK => old | operand,
            SIG_UNBLOCK => old & !operand,
            SIG_SETMASK => operand,
            _ => return Err(Error::new(Errno::EINVAL)),
        };
        Ok(old as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn getuid_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        Ok(processes()
            .get(who.pid)
            .ok_or(Error::new(Errno::ESRCH))?
            .resources
            .uid as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn getgid_syscall(_is_kernel: bool, frame: &mut TrapFrame, _args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        Ok(processes()
            .get(who.pid)
            .ok_or(Error::new(Errno::ESRCH))?
            .resources
            .gid as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn setuid_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        let new_uid = args[0] as u32;
        if process.resources.uid != 0 && process.resources.uid != new_uid {
            return Err(Error::new(Errno::EPERM));
        }
        process.resources.uid = new_uid;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn setgid_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        let new_gid = args[0] as u32;
        if process.resources.uid != 0 && process.resources.gid != new_gid {
            return Err(Error::new(Errno::EPERM));
        }
        process.resources.gid = new_gid;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

/// Resource accounting as reported by `times`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Tms {
    pub utime: Time,
    pub stime: Time,
    pub cutime: Time,
    pub cstime: Time,
}

pub fn times_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let table = tasks();
        let task = table.get(who.task).ok_or(Error::new(Errno::ESRCH))?;
        let tms = Tms {
            utime: task.times.user_time,
            stime: task.times.system_time,
            cutime: task.times.user_child_time,
            cstime: task.times.system_child_time,
        };
        drop(table);
        if args[0] != 0 {
            uaccess::write_value(VirtPtr::user(args[0], who.root), &tms)?;
        }
        Ok(get_time() as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}
