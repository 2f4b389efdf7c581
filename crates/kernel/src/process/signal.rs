/// Signals
///
/// Each process keeps a pending bitset, a blocking mask and a handler
/// table. Delivery happens on the return-to-user path with interrupts
/// masked (a signal raised between the check and the sret would otherwise
/// be lost): the lowest pending unmasked signal wins. A caught signal
/// pushes the pre-signal trap frame and the old mask onto the user stack,
/// enters the handler with `a0 = signo` and `ra` pointing at the caller's
/// sigreturn trampoline; `sigreturn` pops the context back. A signal
/// aimed at a task blocked in a syscall cancels the wait with EINTR.

use super::pid::{processes, Pid, ProcessTable};
use super::sched;
use super::task::{tasks, TaskState, TaskTable};
use crate::arch::{reg, TrapFrame};
use crate::lib::error::{Errno, Error, Result};
use crate::syscall::uaccess::{self, VirtPtr};
use crate::time::Time;

pub type Signal = u32;

pub const SIG_COUNT: usize = 32;

pub const SIGHUP: Signal = 1;
pub const SIGINT: Signal = 2;
pub const SIGQUIT: Signal = 3;
pub const SIGILL: Signal = 4;
pub const SIGTRAP: Signal = 5;
pub const SIGABRT: Signal = 6;
pub const SIGBUS: Signal = 7;
pub const SIGFPE: Signal = 8;
pub const SIGKILL: Signal = 9;
pub const SIGUSR1: Signal = 10;
pub const SIGSEGV: Signal = 11;
pub const SIGUSR2: Signal = 12;
pub const SIGPIPE: Signal = 13;
pub const SIGALRM: Signal = 14;
pub const SIGTERM: Signal = 15;
pub const SIGCHLD: Signal = 17;
pub const SIGCONT: Signal = 18;
pub const SIGSTOP: Signal = 19;
pub const SIGTSTP: Signal = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHandler {
    Default,
    Ignore,
    Handler { addr: usize, restorer: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

pub fn default_action(sig: Signal) -> DefaultAction {
    match sig {
        SIGCHLD => DefaultAction::Ignore,
        SIGCONT => DefaultAction::Continue,
        SIGSTOP | SIGTSTP => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

pub fn is_catchable(sig: Signal) -> bool {
    sig != SIGKILL && sig != SIGSTOP
}

const fn bit(sig: Signal) -> u64 {
    1 << sig
}

pub fn valid_signal(sig: Signal) -> bool {
    sig >= 1 && (sig as usize) < SIG_COUNT
}

#[derive(Clone)]
pub struct ProcessSignals {
    pub pending: u64,
    pub mask: u64,
    pub handlers: [SigHandler; SIG_COUNT],
    pub alarm_at: Option<Time>,
}

impl ProcessSignals {
    pub fn new() -> Self {
        Self {
            pending: 0,
            mask: 0,
            handlers: [SigHandler::Default; SIG_COUNT],
            alarm_at: None,
        }
    }

    /// Fork semantics: handlers and mask are inherited, pending signals
    /// and the alarm are not.
    pub fn inherit(&self) -> Self {
        Self {
            pending: 0,
            mask: self.mask,
            handlers: self.handlers,
            alarm_at: None,
        }
    }
}

impl Default for ProcessSignals {
    fn default() -> Self {
        Self::new()
    }
}

/// The context pushed onto the user stack for a caught signal. On
/// sigreturn the saved frame comes back, but the hart binding and satp
/// are kernel-owned and never restored from user memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SignalContext {
    pub frame: TrapFrame,
    pub mask: u64,
    pub signal: u64,
}

/// Raise `sig` on `target`. If its main task is blocked and the signal is
/// deliverable, the wait is cancelled: the task is pulled off whatever
/// list holds it and resumes with EINTR.
pub fn send_signal(target: Pid, sig: Signal) -> Result<()> {
    if !valid_signal(sig) {
        return Err(Error::new(Errno::EINVAL));
    }
    let mut cancel_pipe = None;
    let mut cancel_task = None;
    {
        let mut procs = processes();
        let process = procs.get_mut(target).ok_or(Error::new(Errno::ESRCH))?;
        process.signals.pending |= bit(sig);
        let blocked = process.signals.mask & bit(sig) != 0 && is_catchable(sig);
        let task_id = process.main_task;
        if !blocked {
            let mut table = tasks();
            let state = table.get(task_id).map(|t| t.sched.state);
            match state {
                Some(TaskState::Sleeping) => {
                    let hart = {
                        let task = table.get(task_id).unwrap();
                        sched::hart_of_task(task)
                    };
                    hart.sleeping.lock().retain(|&id| id != task_id);
                    sched::wake_task(&mut table, task_id, Some(Errno::EINTR.as_isize()));
                }
                Some(TaskState::WaitChild) | Some(TaskState::Paused) => {
                    sched::wake_task(&mut table, task_id, Some(Errno::EINTR.as_isize()));
                }
                Some(TaskState::Waiting) => {
                    cancel_pipe = table.get(task_id).and_then(|t| t.waiting_pipe.clone());
                    cancel_task = Some(task_id);
                }
                _ => {}
            }
        }
    }
    // Pipe waiter removal happens outside the process/task locks; the
    // pipe lock is always taken first.
    if let (Some(pipe), Some(task_id)) = (cancel_pipe, cancel_task) {
        if pipe.cancel_waiter(task_id) {
            let mut table = tasks();
            sched::wake_task(&mut table, task_id, Some(Errno::EINTR.as_isize()));
        }
    }
    Ok(())
}

/// What the trap path has to do after a delivery pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Nothing,
    Delivered(Signal),
    Terminated(Signal),
    Stopped,
}

/// Deliver the lowest pending unmasked signal of `pid`, if any. Called on
/// every return to user with interrupts masked.
pub fn handle_pending_signals(
    procs: &mut ProcessTable,
    table: &mut TaskTable,
    pid: Pid,
) -> SignalOutcome {
    loop {
        let Some(process) = procs.get_mut(pid) else {
            return SignalOutcome::Nothing;
        };
        // SIGKILL and SIGSTOP ignore the mask.
        let unmaskable = bit(SIGKILL) | bit(SIGSTOP);
        let deliverable = process.signals.pending & !(process.signals.mask & !unmaskable);
        if deliverable == 0 {
            return SignalOutcome::Nothing;
        }
        let sig = deliverable.trailing_zeros() as Signal;
        process.signals.pending &= !bit(sig);

        let handler = if is_catchable(sig) {
            process.signals.handlers[sig as usize]
        } else {
            SigHandler::Default
        };
        match handler {
            SigHandler::Ignore => continue,
            SigHandler::Default => match default_action(sig) {
                DefaultAction::Ignore | DefaultAction::Continue => continue,
                DefaultAction::Stop => {
                    let task_id = process.main_task;
                    sched::move_task_to_state(table, task_id, TaskState::Paused);
                    return SignalOutcome::Stopped;
                }
                DefaultAction::Terminate => return SignalOutcome::Terminated(sig),
            },
            SigHandler::Handler { addr, restorer } => {
                let root = process.memory.root;
                let task_id = process.main_task;
                let Some(task) = table.get_mut(task_id) else {
                    return SignalOutcome::Nothing;
                };
                let context = SignalContext {
                    frame: task.frame.clone(),
                    mask: process.signals.mask,
                    signal: sig as u64,
                };
                let mut sp = task.frame.regs[reg::SP];
                sp = (sp - core::mem::size_of::<SignalContext>()) & !0xf;
                if uaccess::write_value(VirtPtr::user(sp, root), &context).is_err() {
                    // Unusable user stack: fall back to the default fate.
                    return SignalOutcome::Terminated(sig);
                }
                process.signals.mask |= bit(sig);
                task.frame.pc = addr;
                task.frame.regs[reg::RA] = restorer;
                task.frame.regs[reg::A0] = sig as usize;
                task.frame.regs[reg::SP] = sp;
                return SignalOutcome::Delivered(sig);
            }
        }
    }
}

/// sigreturn: pop the context pushed at delivery and restore the
/// pre-signal register state and mask.
pub fn return_from_signal(procs: &mut ProcessTable, table: &mut TaskTable, pid: Pid) -> Result<()> {
    let process = procs.get_mut(pid).ok_or(Error::new(Errno::ESRCH))?;
    let task = table
        .get_mut(process.main_task)
        .ok_or(Error::new(Errno::ESRCH))?;
    let sp = task.frame.regs[reg::SP];
    let context: SignalContext = uaccess::read_value(VirtPtr::user(sp, process.memory.root))?;
    let hart = task.frame.hart;
    let satp = task.frame.satp;
    task.frame = context.frame;
    task.frame.hart = hart;
    task.frame.satp = satp;
    process.signals.mask = context.mask;
    Ok(())
}

/// Fire due alarms. Called from the timer tick.
pub fn check_alarms() {
    let now = crate::time::get_time();
    let due: alloc::vec::Vec<Pid> = {
        let mut procs = processes();
        let pids = procs.pids();
        let mut due = alloc::vec::Vec::new();
        for pid in pids {
            if let Some(process) = procs.get_mut(pid) {
                if matches!(process.signals.alarm_at, Some(at) if at <= now) {
                    process.signals.alarm_at = None;
                    due.push(pid);
                }
            }
        }
        due
    };
    for pid in due {
        let _ = send_signal(pid, SIGALRM);
    }
}

/// Delivery hook on the return-to-user path.
#[cfg(target_arch = "riscv64")]
pub fn handle_pending_for_frame(frame: &mut TrapFrame) {
    if !frame.is_task() {
        return;
    }
    let Some(task_id) = crate::smp::current_task() else {
        return;
    };
    let Some(pid) = tasks().get(task_id).and_then(|t| t.process) else {
        return;
    };
    let outcome = {
        let mut procs = processes();
        let mut table = tasks();
        handle_pending_signals(&mut procs, &mut table, pid)
    };
    match outcome {
        SignalOutcome::Terminated(sig) => {
            let _ = super::process::exit_process(pid, 128 + sig as u64);
            crate::smp::current_hart().set_current_task(None);
            sched::run_next_task();
        }
        SignalOutcome::Stopped => {
            crate::smp::current_hart().set_current_task(None);
            sched::run_next_task();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pagetable::{map_page, PteFlags};
    use crate::mm::test_heap;
    use crate::mm::PAGE_SIZE;
    use crate::process::process::create_process;
    use crate::process::task::DEFAULT_PRIORITY;

    /// Process with one mapped user-stack page; returns (pid, stack_top).
    fn process_with_stack() -> (Pid, usize) {
        test_heap::ensure();
        let pid = create_process(DEFAULT_PRIORITY, None).unwrap();
        let stack_va = 0x3fff_f000usize;
        {
            let procs = processes();
            let process = procs.get(pid).unwrap();
            let frame = crate::mm::zalloc_page().unwrap() as usize;
            let root = unsafe { &mut *process.memory.root };
            map_page(
                root,
                stack_va,
                frame,
                PteFlags::AD_RW.union(PteFlags::USER),
                0,
            )
            .unwrap();
        }
        let stack_top = stack_va + PAGE_SIZE;
        {
            let procs = processes();
            let mut table = tasks();
            let task_id = procs.get(pid).unwrap().main_task;
            let task = table.get_mut(task_id).unwrap();
            task.frame.regs[reg::SP] = stack_top;
            task.frame.pc = 0x10_0000;
        }
        (pid, stack_top)
    }

    fn destroy(pid: Pid) {
        let mut procs = processes();
        let mut table = tasks();
        if let Some(process) = procs.remove(pid) {
            if !process.memory.root.is_null() {
                let root = unsafe { &mut *process.memory.root };
                crate::process::process::free_user_pages(root);
                crate::mm::dealloc_page(process.memory.root as *mut u8);
            }
            if let Some(task) = table.remove(process.main_task) {
                crate::process::task::free_task(task);
            }
        }
    }

    #[test]
    fn caught_signal_enters_handler_and_sigreturn_restores() {
        let (pid, stack_top) = process_with_stack();
        let handler_addr = 0x20_0000usize;
        let restorer = 0x20_1000usize;
        {
            let mut procs = processes();
            let signals = &mut procs.get_mut(pid).unwrap().signals;
            signals.handlers[SIGUSR1 as usize] = SigHandler::Handler {
                addr: handler_addr,
                restorer,
            };
            signals.pending |= bit(SIGUSR1);
        }

        let outcome = {
            let mut procs = processes();
            let mut table = tasks();
            handle_pending_signals(&mut procs, &mut table, pid)
        };
        assert_eq!(outcome, SignalOutcome::Delivered(SIGUSR1));

        {
            let procs = processes();
            let table = tasks();
            let process = procs.get(pid).unwrap();
            let task = table.get(process.main_task).unwrap();
            assert_eq!(task.frame.pc, handler_addr);
            assert_eq!(task.frame.regs[reg::A0], SIGUSR1 as usize);
            assert_eq!(task.frame.regs[reg::RA], restorer);
            assert!(task.frame.regs[reg::SP] < stack_top);
            // The handler's signal is blocked while it runs.
            assert!(process.signals.mask & bit(SIGUSR1) != 0);
        }

        let result = {
            let mut procs = processes();
            let mut table = tasks();
            return_from_signal(&mut procs, &mut table, pid)
        };
        result.unwrap();
        {
            let procs = processes();
            let table = tasks();
            let process = procs.get(pid).unwrap();
            let task = table.get(process.main_task).unwrap();
            assert_eq!(task.frame.pc, 0x10_0000);
            assert_eq!(task.frame.regs[reg::SP], stack_top);
            assert_eq!(process.signals.mask & bit(SIGUSR1), 0);
        }
        destroy(pid);
    }

    #[test]
    fn masked_signals_wait_for_unmask() {
        let (pid, _) = process_with_stack();
        {
            let mut procs = processes();
            let signals = &mut procs.get_mut(pid).unwrap().signals;
            signals.handlers[SIGUSR2 as usize] = SigHandler::Handler {
                addr: 0x1000,
                restorer: 0x2000,
            };
            signals.mask = bit(SIGUSR2);
            signals.pending |= bit(SIGUSR2);
        }
        let outcome = {
            let mut procs = processes();
            let mut table = tasks();
            handle_pending_signals(&mut procs, &mut table, pid)
        };
        assert_eq!(outcome, SignalOutcome::Nothing);
        {
            let mut procs = processes();
            procs.get_mut(pid).unwrap().signals.mask = 0;
        }
        let outcome = {
            let mut procs = processes();
            let mut table = tasks();
            handle_pending_signals(&mut procs, &mut table, pid)
        };
        assert_eq!(outcome, SignalOutcome::Delivered(SIGUSR2));
        destroy(pid);
    }

    #[test]
    fn default_disposition_terminates() {
        let (pid, _) = process_with_stack();
        {
            let mut procs = processes();
            procs.get_mut(pid).unwrap().signals.pending |= bit(SIGTERM);
        }
        let outcome = {
            let mut procs = processes();
            let mut table = tasks();
            handle_pending_signals(&mut procs, &mut table, pid)
        };
        assert_eq!(outcome, SignalOutcome::Terminated(SIGTERM));
        destroy(pid);
    }

    #[test]
    fn signal_interrupts_a_blocked_wait() {
        let (pid, _) = process_with_stack();
        {
            let procs = processes();
            let mut table = tasks();
            let task_id = procs.get(pid).unwrap().main_task;
            // Pin the task to a quiet hart so the wakeup is observable.
            table.get_mut(task_id).unwrap().frame.hart =
                crate::smp::hart(3) as *const crate::smp::Hart as usize;
            sched::move_task_to_state(&mut table, task_id, TaskState::WaitChild);
        }
        send_signal(pid, SIGINT).unwrap();
        {
            let procs = processes();
            let table = tasks();
            let task = table.get(procs.get(pid).unwrap().main_task).unwrap();
            assert_eq!(task.sched.state, TaskState::Ready);
            assert_eq!(task.frame.return_value(), Errno::EINTR.as_isize());
        }
        {
            // Detach from the hart queue before destruction.
            let procs = processes();
            let mut table = tasks();
            let task_id = procs.get(pid).unwrap().main_task;
            crate::smp::hart(3).queue.lock().remove(&mut table, task_id);
        }
        destroy(pid);
    }
}
