/// Syscall dispatch
///
/// Traps land here with the syscall number in `a7` and up to seven
/// arguments in `a0..a6`. Each handler writes its result into `a0`
/// (negative errno in [-4095, -1] for failures) and reports whether the
/// caller can simply resume or the task left the Running state and the
/// hart must schedule.

pub mod file;
pub mod memory;
pub mod process;
pub mod task;
pub mod uaccess;

use crate::arch::{reg, TrapFrame};
use crate::lib::error::{Errno, Error, Result};
use crate::process::task::TaskId;
use crate::process::Pid;

pub type SyscallArgs = [usize; 7];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// Resume the calling frame.
    Continue,
    /// The task moved out of Running; pick the next one.
    Schedule,
}

pub type SyscallHandler = fn(bool, &mut TrapFrame, &SyscallArgs) -> SyscallReturn;

/// Fixed syscall numbering.
pub mod nr {
    pub const PRINT: usize = 0;
    pub const EXIT: usize = 1;
    pub const YIELD: usize = 2;
    pub const FORK: usize = 3;
    pub const SLEEP: usize = 4;
    pub const OPEN: usize = 5;
    pub const CLOSE: usize = 6;
    pub const READ: usize = 7;
    pub const WRITE: usize = 8;
    pub const SEEK: usize = 9;
    pub const STAT: usize = 10;
    pub const DUP: usize = 11;
    pub const TRUNC: usize = 12;
    pub const CHMOD: usize = 13;
    pub const CHOWN: usize = 14;
    pub const MOUNT: usize = 15;
    pub const UMOUNT: usize = 16;
    pub const READDIR: usize = 17;
    pub const CHDIR: usize = 18;
    pub const GETCWD: usize = 19;
    pub const PIPE: usize = 20;
    pub const MKNOD: usize = 21;
    pub const UMASK: usize = 22;
    pub const FCNTL: usize = 23;
    pub const IOCTL: usize = 24;
    pub const ISATTY: usize = 25;
    pub const LINK: usize = 26;
    pub const UNLINK: usize = 27;
    pub const RENAME: usize = 28;
    pub const SBRK: usize = 29;
    pub const PROTECT: usize = 30;
    pub const GETPID: usize = 31;
    pub const GETPPID: usize = 32;
    pub const WAIT: usize = 33;
    pub const KILL: usize = 34;
    pub const SIGACTION: usize = 35;
    pub const SIGRETURN: usize = 36;
    pub const SIGPENDING: usize = 37;
    pub const SIGPROCMASK: usize = 38;
    pub const PAUSE: usize = 39;
    pub const ALARM: usize = 40;
    pub const GETUID: usize = 41;
    pub const GETGID: usize = 42;
    pub const SETUID: usize = 43;
    pub const SETGID: usize = 44;
    pub const TIMES: usize = 45;
    pub const CRITICAL: usize = 46;
}

pub const SYSCALL_COUNT: usize = 47;

/// The table is fixed at init and immutable afterwards.
static SYSCALL_TABLE: [SyscallHandler; SYSCALL_COUNT] = [
    file::print_syscall,
    process::exit_syscall,
    task::yield_syscall,
    process::fork_syscall,
    task::sleep_syscall,
    file::open_syscall,
    file::close_syscall,
    file::read_syscall,
    file::write_syscall,
    file::seek_syscall,
    file::stat_syscall,
    file::dup_syscall,
    file::trunc_syscall,
    file::chmod_syscall,
    file::chown_syscall,
    file::mount_syscall,
    file::umount_syscall,
    file::readdir_syscall,
    file::chdir_syscall,
    file::getcwd_syscall,
    file::pipe_syscall,
    file::mknod_syscall,
    file::umask_syscall,
    file::fcntl_syscall,
    file::ioctl_syscall,
    file::isatty_syscall,
    file::link_syscall,
    file::unlink_syscall,
    file::rename_syscall,
    memory::sbrk_syscall,
    memory::protect_syscall,
    process::getpid_syscall,
    process::getppid_syscall,
    process::wait_syscall,
    process::kill_syscall,
    process::sigaction_syscall,
    process::sigreturn_syscall,
    process::sigpending_syscall,
    process::sigprocmask_syscall,
    process::pause_syscall,
    process::alarm_syscall,
    process::getuid_syscall,
    process::getgid_syscall,
    process::setuid_syscall,
    process::setgid_syscall,
    process::times_syscall,
    task::critical_syscall,
];

/// Decode and run one syscall for the given frame.
pub fn dispatch(is_kernel: bool, frame: &mut TrapFrame) -> SyscallReturn {
    let number = frame.regs[reg::A7];
    let args: SyscallArgs = [
        frame.regs[reg::A0],
        frame.regs[reg::A1],
        frame.regs[reg::A2],
        frame.regs[reg::A3],
        frame.regs[reg::A4],
        frame.regs[reg::A5],
        frame.regs[reg::A6],
    ];
    match SYSCALL_TABLE.get(number) {
        Some(handler) => handler(is_kernel, frame, &args),
        None => {
            crate::debug!("unknown syscall {}", number);
            frame.set_return(Errno::EUNSUP.as_isize());
            SyscallReturn::Continue
        }
    }
}

/// Write a `Result` into the frame's return slot.
pub(crate) fn ret(frame: &mut TrapFrame, result: Result<isize>) {
    match result {
        Ok(value) => frame.set_return(value),
        Err(err) => frame.set_return(err.as_isize()),
    }
}

/// Identity of the task performing a syscall.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Caller {
    pub pid: Pid,
    pub task: TaskId,
    pub root: *mut crate::mm::pagetable::PageTable,
}

impl Caller {
    pub fn buf(&self, addr: usize) -> uaccess::VirtPtr {
        uaccess::VirtPtr::user(addr, self.root)
    }
}

/// The current task's process context; file, memory and process calls
/// all require one.
pub(crate) fn caller() -> Result<Caller> {
    let task = crate::smp::current_task().ok_or(Error::new(Errno::ESRCH))?;
    let pid = crate::process::tasks()
        .get(task)
        .and_then(|t| t.process)
        .ok_or(Error::new(Errno::ESRCH))?;
    let root = crate::process::processes()
        .get(pid)
        .map(|p| p.memory.root)
        .ok_or(Error::new(Errno::ESRCH))?;
    Ok(Caller { pid, task, root })
}
