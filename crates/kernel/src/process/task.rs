/// Tasks and the task arena
///
/// A task is a schedulable thread of execution: its trap frame, stack and
/// scheduling block. Tasks live in a global arena indexed by `TaskId`;
/// every list (ready queue, sleeping list, waiter lists) links tasks by id
/// through `sched_next` rather than by owning pointers. A live task is
/// held by exactly one of: a ready queue, a waiting list, the sleeping
/// list, or a hart's running slot.

use crate::arch::TrapFrame;
use crate::lib::error::{Errno, Error, Result};
use crate::mm::{alloc_pages, dealloc_pages, PageAllocation, PAGE_SIZE};
use crate::process::pid::Pid;
use crate::time::Time;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

pub type TaskId = u32;
pub const NO_TASK: TaskId = u32::MAX;

pub type Priority = u8;

pub const MAX_PRIORITY: usize = 40;
pub const HIGHEST_PRIORITY: Priority = 0;
pub const LOWEST_PRIORITY: Priority = (MAX_PRIORITY - 1) as Priority;
pub const DEFAULT_PRIORITY: Priority = (MAX_PRIORITY / 2) as Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unknown,
    Running,
    Ready,
    Waiting,
    Sleeping,
    Paused,
    Terminated,
    WaitChild,
}

/// All data needed for scheduling.
#[derive(Debug, Clone)]
pub struct TaskSched {
    pub priority: Priority,
    /// Starts at `priority`, decreased over time so long-resident tasks
    /// bubble toward the queue head.
    pub queue_priority: Priority,
    pub runs: u16,
    pub state: TaskState,
    pub sched_next: Option<TaskId>,
    pub sleeping_until: Time,
    /// Non-preemptable section; only root may enter.
    pub critical: bool,
}

impl TaskSched {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            queue_priority: priority,
            runs: 0,
            state: TaskState::Unknown,
            sched_next: None,
            sleeping_until: 0,
            critical: false,
        }
    }
}

/// Resource accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskTimes {
    pub entered: Time,
    pub user_time: Time,
    pub user_child_time: Time,
    pub system_time: Time,
    pub system_child_time: Time,
}

pub struct Task {
    pub frame: TrapFrame,
    /// Kernel-owned stack; user tasks run on user memory instead.
    pub stack: Option<PageAllocation>,
    pub stack_top: usize,
    pub sched: TaskSched,
    pub times: TaskTimes,
    pub process: Option<Pid>,
    /// Pipe this task is currently blocked on, for cancellation.
    pub waiting_pipe: Option<alloc::sync::Arc<crate::vfs::pipe::PipeShared>>,
}

unsafe impl Send for Task {}

impl Task {
    pub fn new(priority: Priority, process: Option<Pid>) -> Self {
        Self {
            frame: TrapFrame::new(),
            stack: None,
            stack_top: 0,
            sched: TaskSched::new(priority),
            times: TaskTimes::default(),
            process,
            waiting_pipe: None,
        }
    }
}

/// Arena of all tasks in the system. Slots are boxed so trap-frame
/// pointers (held in sscratch while a task runs) stay stable across
/// arena growth.
pub struct TaskTable {
    slots: Vec<Option<alloc::boxed::Box<Task>>>,
    free: Vec<TaskId>,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, task: Task) -> TaskId {
        let boxed = alloc::boxed::Box::new(task);
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(boxed);
            id
        } else {
            self.slots.push(Some(boxed));
            (self.slots.len() - 1) as TaskId
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id as usize).and_then(|s| s.as_deref())
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_deref_mut())
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        let slot = self.slots.get_mut(id as usize)?;
        let task = slot.take()?;
        self.free.push(id);
        Some(*task)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

static TASKS: Mutex<TaskTable> = Mutex::new(TaskTable::new());

pub fn tasks() -> MutexGuard<'static, TaskTable> {
    TASKS.lock()
}

/// Create a kernel task running `entry` on a freshly allocated stack.
/// The task starts Ready once enqueued by the caller.
pub fn create_kernel_task(entry: usize, priority: Priority, stack_size: usize) -> Result<TaskId> {
    let stack_pages = (stack_size + PAGE_SIZE - 1) / PAGE_SIZE;
    let stack = alloc_pages(stack_pages)
        .ok_or(Error::with_details(Errno::ENOMEM, "kernel task stack"))?;
    let stack_top = stack.ptr as usize + stack.pages * PAGE_SIZE;

    let mut task = Task::new(priority, None);
    task.stack = Some(stack);
    task.stack_top = stack_top;
    task.frame.pc = entry;
    task.frame.regs[crate::arch::reg::SP] = stack_top;
    task.frame.satp = crate::init::kernel_satp();
    task.times.entered = crate::time::get_time();

    Ok(tasks().insert(task))
}

/// Release a task's kernel-owned resources. The caller has already
/// removed it from every list.
pub fn free_task(task: Task) {
    if let Some(stack) = task.stack {
        dealloc_pages(stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_recycles_slots() {
        let mut table = TaskTable::new();
        let a = table.insert(Task::new(DEFAULT_PRIORITY, None));
        let b = table.insert(Task::new(DEFAULT_PRIORITY, None));
        assert_ne!(a, b);
        table.remove(a);
        let c = table.insert(Task::new(DEFAULT_PRIORITY, None));
        assert_eq!(a, c);
        assert!(table.get(b).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn new_task_defaults() {
        let task = Task::new(7, None);
        assert_eq!(task.sched.state, TaskState::Unknown);
        assert_eq!(task.sched.priority, 7);
        assert_eq!(task.sched.queue_priority, 7);
        assert_eq!(task.sched.runs, 0);
        assert!(!task.sched.critical);
    }
}
