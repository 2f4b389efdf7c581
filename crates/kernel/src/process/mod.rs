// Process management: tasks, scheduling, the process tree, signals.

pub mod pid;
pub mod process;
pub mod sched;
pub mod signal;
pub mod task;
pub mod wait;

pub use pid::{alloc_pid, processes, Pid, ProcessTable, INIT_PID};
pub use process::{create_process, exit_process, fork_process, Process};
pub use task::{
    create_kernel_task, tasks, Priority, Task, TaskId, TaskState, TaskTable, DEFAULT_PRIORITY,
    HIGHEST_PRIORITY, LOWEST_PRIORITY, MAX_PRIORITY,
};
pub use wait::{try_wait, WaitOutcome};

/// PID of the process owning the currently running task, if any.
pub fn current_process() -> Option<Pid> {
    let task = crate::smp::current_task()?;
    tasks().get(task).and_then(|t| t.process)
}

/// A task took an unrecoverable fault: its process dies as if killed by
/// SIGSEGV.
#[cfg(target_arch = "riscv64")]
pub fn fault_current_task(_frame: &mut crate::arch::TrapFrame) {
    if let Some(pid) = current_process() {
        let _ = exit_process(pid, 128 + signal::SIGSEGV as u64);
    }
    crate::smp::current_hart().set_current_task(None);
}
