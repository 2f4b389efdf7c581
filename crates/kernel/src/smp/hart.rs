// Hart frames
//
// One slot per hardware thread, constructed at hart bring-up and never
// destroyed. The embedded trap frame is used for traps taken from the
// idle loop and for nested contexts; the ready queue and sleeping list
// drive this hart's scheduling.

use crate::arch::TrapFrame;
use crate::process::sched::ScheduleQueue;
use crate::process::task::{TaskId, NO_TASK};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

pub const MAX_HARTS: usize = 8;
pub const HART_STACK_SIZE: usize = 1 << 16;

pub type HartId = usize;

pub struct Hart {
    /// Trap context used while no task frame is active on this hart.
    frame: UnsafeCell<TrapFrame>,
    pub stack_top: AtomicUsize,
    pub hartid: AtomicUsize,
    pub online: AtomicBool,
    pub queue: Mutex<ScheduleQueue>,
    pub sleeping: Mutex<alloc::vec::Vec<TaskId>>,
    pub idle_task: AtomicU32,
    current: AtomicU32,
}

// The embedded frame is only touched by the owning hart (or before the
// hart is released during bring-up).
unsafe impl Sync for Hart {}

impl Hart {
    const fn new() -> Self {
        Self {
            frame: UnsafeCell::new(TrapFrame::new()),
            stack_top: AtomicUsize::new(0),
            hartid: AtomicUsize::new(0),
            online: AtomicBool::new(false),
            queue: Mutex::new(ScheduleQueue::new()),
            sleeping: Mutex::new(alloc::vec::Vec::new()),
            idle_task: AtomicU32::new(NO_TASK),
            current: AtomicU32::new(NO_TASK),
        }
    }

    pub fn frame_ptr(&self) -> *mut TrapFrame {
        self.frame.get()
    }

    pub fn current_task(&self) -> Option<TaskId> {
        match self.current.load(Ordering::Acquire) {
            NO_TASK => None,
            id => Some(id),
        }
    }

    pub fn set_current_task(&self, task: Option<TaskId>) {
        self.current.store(task.unwrap_or(NO_TASK), Ordering::Release);
    }

    pub fn index(&self) -> usize {
        let base = HARTS.as_ptr() as usize;
        (self as *const Hart as usize - base) / core::mem::size_of::<Hart>()
    }
}

const HART_INIT: Hart = Hart::new();
static HARTS: [Hart; MAX_HARTS] = [HART_INIT; MAX_HARTS];

static HART_IDS: Mutex<heapless::Vec<usize, MAX_HARTS>> = Mutex::new(heapless::Vec::new());

pub fn hart(index: usize) -> &'static Hart {
    &HARTS[index]
}

/// Record a hart at bring-up; returns its index. The primary hart
/// registers first, before any secondary hart is released.
pub fn register_hart(hartid: usize) -> usize {
    let mut ids = HART_IDS.lock();
    if let Some(index) = ids.iter().position(|&id| id == hartid) {
        return index;
    }
    let index = ids.len();
    ids.push(hartid).expect("too many harts");
    let slot = &HARTS[index];
    slot.hartid.store(hartid, Ordering::Release);
    slot.online.store(true, Ordering::Release);
    crate::info!("hart {} registered as index {}", hartid, index);
    index
}

pub fn hart_count() -> usize {
    HART_IDS.lock().len()
}

pub fn hart_index_of(hartid: usize) -> Option<usize> {
    HART_IDS.lock().iter().position(|&id| id == hartid)
}

/// The hart slot of the executing CPU. Before registration (early boot,
/// host tests) this falls back to slot 0.
pub fn current_hart() -> &'static Hart {
    let hartid = crate::arch::hart_id();
    let index = hart_index_of(hartid).unwrap_or(0);
    &HARTS[index]
}

pub fn current_task() -> Option<TaskId> {
    current_hart().current_task()
}

pub fn set_current_task(task: Option<TaskId>) {
    current_hart().set_current_task(task);
}
