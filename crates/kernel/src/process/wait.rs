/// Zombie reaping
///
/// A Terminated child keeps its process entry (and status) until the
/// parent waits for it; only then is the PID recyclable. The racing case,
/// child exiting while the parent already sits in WaitChild, is handled
/// directly on the exit path in `process.rs`.

use super::pid::{Pid, ProcessTable};
use super::process::reap_child;
use super::task::{TaskState, TaskTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A child was reaped; its PID and exit status.
    Reaped { pid: Pid, status: u64 },
    /// Children exist but none has terminated yet.
    Pending,
    /// Nothing to wait for.
    NoChildren,
}

/// Reap any Terminated child of `pid`, oldest first.
pub fn try_wait(procs: &mut ProcessTable, table: &mut TaskTable, pid: Pid) -> WaitOutcome {
    let children = match procs.get(pid) {
        Some(process) => process.children.clone(),
        None => return WaitOutcome::NoChildren,
    };
    if children.is_empty() {
        return WaitOutcome::NoChildren;
    }
    for child_pid in children {
        let terminated = procs
            .get(child_pid)
            .and_then(|child| table.get(child.main_task))
            .map(|task| task.sched.state == TaskState::Terminated)
            .unwrap_or(false);
        if terminated {
            if let Some((pid, status)) = reap_child(procs, table, pid, child_pid) {
                return WaitOutcome::Reaped { pid, status };
            }
        }
    }
    WaitOutcome::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_heap;
    use crate::process::pid::processes;
    use crate::process::process::{create_process, exit_process, fork_process};
    use crate::process::task::{tasks, DEFAULT_PRIORITY};

    #[test]
    fn wait_outcomes() {
        test_heap::ensure();
        let parent = create_process(DEFAULT_PRIORITY, None).unwrap();
        {
            let mut procs = processes();
            let mut table = tasks();
            assert_eq!(
                try_wait(&mut procs, &mut table, parent),
                WaitOutcome::NoChildren
            );
        }

        let (child, _) = fork_process(parent).unwrap();
        {
            let mut procs = processes();
            let mut table = tasks();
            assert_eq!(try_wait(&mut procs, &mut table, parent), WaitOutcome::Pending);
        }

        exit_process(child, 3).unwrap();
        {
            let mut procs = processes();
            let mut table = tasks();
            assert_eq!(
                try_wait(&mut procs, &mut table, parent),
                WaitOutcome::Reaped {
                    pid: child,
                    status: 3
                }
            );
            // Reaped exactly once.
            assert_eq!(
                try_wait(&mut procs, &mut table, parent),
                WaitOutcome::NoChildren
            );
        }

        // Cleanup.
        let mut procs = processes();
        let mut table = tasks();
        if let Some(process) = procs.remove(parent) {
            let root = unsafe { &mut *process.memory.root };
            crate::process::process::free_user_pages(root);
            crate::mm::dealloc_page(process.memory.root as *mut u8);
            if let Some(task) = table.remove(process.main_task) {
                crate::process::task::free_task(task);
            }
        }
    }
}
