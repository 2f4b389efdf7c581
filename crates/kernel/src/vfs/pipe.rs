/// Pipes
///
/// A bounded ring buffer shared by the read and write ends, with FIFO
/// queues of blocked operations on both sides. A blocked operation parks
/// the task (state Waiting) together with its user buffer; the
/// complementary side transfers directly into that buffer under the pipe
/// lock and delivers exactly one wakeup per completed waiter. A blocked
/// reader completes as soon as it holds any bytes (or the pipe hits EOF);
/// a blocked writer only once its whole buffer has drained.
///
/// Lock order: the pipe lock is taken before the task table, so wakeups
/// from inside the transfer path and end-of-life notifications are safe
/// from any hart.

use crate::lib::error::{Errno, Error, Result};
use crate::process::sched::{move_task_to_state, wake_task};
use crate::process::task::{tasks, TaskId, TaskState};
use crate::syscall::uaccess::{self, VirtPtr};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

pub const PIPE_BUFFER_CAPACITY: usize = 512;

/// A parked read or write, keyed by the task to wake.
pub struct PipeWaiter {
    pub task: TaskId,
    pub buf: VirtPtr,
    pub size: usize,
    /// Bytes transferred so far; only the complementary side advances
    /// this, holding the pipe lock.
    pub written: usize,
}

struct PipeInner {
    buffer: [u8; PIPE_BUFFER_CAPACITY],
    read_pos: usize,
    count: usize,
    read_count: usize,
    write_count: usize,
    waiting_reads: VecDeque<PipeWaiter>,
    waiting_writes: VecDeque<PipeWaiter>,
}

impl PipeInner {
    /// Move bytes out of the ring into `buf`, returning the amount copied.
    fn drain_ring(&mut self, buf: VirtPtr, offset: usize, want: usize) -> Result<usize> {
        let mut got = 0;
        while got < want && self.count > 0 {
            let contiguous = (PIPE_BUFFER_CAPACITY - self.read_pos).min(self.count);
            let chunk = contiguous.min(want - got);
            uaccess::write_to(
                buf.offset(offset + got),
                &self.buffer[self.read_pos..self.read_pos + chunk],
            )?;
            self.read_pos = (self.read_pos + chunk) % PIPE_BUFFER_CAPACITY;
            self.count -= chunk;
            got += chunk;
        }
        Ok(got)
    }

    /// Move bytes from `buf` into the ring, returning the amount copied.
    fn fill_ring(&mut self, buf: VirtPtr, offset: usize, want: usize) -> Result<usize> {
        let mut sent = 0;
        while sent < want && self.count < PIPE_BUFFER_CAPACITY {
            let write_pos = (self.read_pos + self.count) % PIPE_BUFFER_CAPACITY;
            let contiguous =
                (PIPE_BUFFER_CAPACITY - write_pos).min(PIPE_BUFFER_CAPACITY - self.count);
            let chunk = contiguous.min(want - sent);
            let slice = &mut self.buffer[write_pos..write_pos + chunk];
            uaccess::read_from(buf.offset(offset + sent), slice)?;
            self.count += chunk;
            sent += chunk;
        }
        Ok(sent)
    }
}

/// Outcome of a pipe operation that made progress or parked the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOp {
    Done(usize),
    Blocked,
}

pub struct PipeShared {
    inner: Mutex<PipeInner>,
}

fn wake(task: TaskId, value: isize) {
    let mut table = tasks();
    wake_task(&mut table, task, Some(value));
}

impl PipeShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PipeInner {
                buffer: [0; PIPE_BUFFER_CAPACITY],
                read_pos: 0,
                count: 0,
                read_count: 0,
                write_count: 0,
                waiting_reads: VecDeque::new(),
                waiting_writes: VecDeque::new(),
            }),
        })
    }

    pub fn add_end(&self, write: bool) {
        let mut inner = self.inner.lock();
        if write {
            inner.write_count += 1;
        } else {
            inner.read_count += 1;
        }
    }

    /// Drop one end. Closing the last write end wakes every blocked
    /// reader (EOF); closing the last read end fails blocked writers.
    pub fn remove_end(&self, write: bool) {
        let mut inner = self.inner.lock();
        if write {
            inner.write_count -= 1;
            if inner.write_count == 0 {
                while let Some(waiter) = inner.waiting_reads.pop_front() {
                    wake(waiter.task, waiter.written as isize);
                }
            }
        } else {
            inner.read_count -= 1;
            if inner.read_count == 0 {
                while let Some(waiter) = inner.waiting_writes.pop_front() {
                    let value = if waiter.written > 0 {
                        waiter.written as isize
                    } else {
                        Errno::EPIPE.as_isize()
                    };
                    wake(waiter.task, value);
                }
            }
        }
    }

    /// Remove a parked operation (signal cancellation). The caller
    /// transitions the task and delivers EINTR.
    pub fn cancel_waiter(&self, task: TaskId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.waiting_reads.len() + inner.waiting_writes.len();
        inner.waiting_reads.retain(|w| w.task != task);
        inner.waiting_writes.retain(|w| w.task != task);
        before != inner.waiting_reads.len() + inner.waiting_writes.len()
    }

    /// Would an operation make progress without blocking?
    pub fn is_ready(&self, write: bool) -> bool {
        let inner = self.inner.lock();
        if write {
            inner.count < PIPE_BUFFER_CAPACITY || !inner.waiting_reads.is_empty()
                || inner.read_count == 0
        } else {
            inner.count > 0 || inner.write_count == 0 || !inner.waiting_writes.is_empty()
        }
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.lock().count
    }
}

/// Perform a read or write of `size` bytes at `buf`.
///
/// Transfers as much as currently fits, services the opposite side's
/// oldest waiters, and either completes, parks the calling task
/// (`block`), or reports EAGAIN.
pub fn execute_operation(
    pipe: &Arc<PipeShared>,
    task: Option<TaskId>,
    buf: VirtPtr,
    size: usize,
    write: bool,
    block: bool,
) -> Result<PipeOp> {
    let mut inner = pipe.inner.lock();
    if write {
        execute_write(pipe, &mut inner, task, buf, size, block)
    } else {
        execute_read(pipe, &mut inner, task, buf, size, block)
    }
}

fn execute_write(
    pipe: &Arc<PipeShared>,
    inner: &mut PipeInner,
    task: Option<TaskId>,
    buf: VirtPtr,
    size: usize,
    block: bool,
) -> Result<PipeOp> {
    if inner.read_count == 0 && inner.waiting_reads.is_empty() {
        return Err(Error::new(Errno::EPIPE));
    }
    let mut sent = 0;
    // Readers only park on an empty ring, so serving them first keeps
    // byte order.
    while sent < size {
        let Some(waiter) = inner.waiting_reads.front_mut() else {
            break;
        };
        let room = waiter.size - waiter.written;
        let chunk = room.min(size - sent);
        uaccess::copy_between(waiter.buf.offset(waiter.written), buf.offset(sent), chunk)?;
        waiter.written += chunk;
        sent += chunk;
        let done = inner.waiting_reads.pop_front().unwrap();
        wake(done.task, done.written as isize);
    }
    sent += inner.fill_ring(buf, sent, size - sent)?;
    if sent < size {
        if block {
            let task = task.ok_or(Error::new(Errno::EINVAL))?;
            inner.waiting_writes.push_back(PipeWaiter {
                task,
                buf,
                size,
                written: sent,
            });
            park(pipe, task);
            return Ok(PipeOp::Blocked);
        }
        if sent == 0 {
            return Err(Error::new(Errno::EAGAIN));
        }
    }
    Ok(PipeOp::Done(sent))
}

fn execute_read(
    pipe: &Arc<PipeShared>,
    inner: &mut PipeInner,
    task: Option<TaskId>,
    buf: VirtPtr,
    size: usize,
    block: bool,
) -> Result<PipeOp> {
    let mut got = inner.drain_ring(buf, 0, size)?;
    // Serve directly from parked writers, oldest first.
    while got < size {
        let Some(waiter) = inner.waiting_writes.front_mut() else {
            break;
        };
        let avail = waiter.size - waiter.written;
        let chunk = avail.min(size - got);
        uaccess::copy_between(buf.offset(got), waiter.buf.offset(waiter.written), chunk)?;
        waiter.written += chunk;
        got += chunk;
        if waiter.written == waiter.size {
            let done = inner.waiting_writes.pop_front().unwrap();
            wake(done.task, done.size as isize);
        }
    }
    // With ring space freed, let parked writers refill it.
    while inner.count < PIPE_BUFFER_CAPACITY {
        let Some(waiter) = inner.waiting_writes.front_mut() else {
            break;
        };
        let avail = waiter.size - waiter.written;
        let offset = waiter.written;
        let wbuf = waiter.buf;
        let moved = inner.fill_ring(wbuf, offset, avail)?;
        let waiter = inner.waiting_writes.front_mut().unwrap();
        waiter.written += moved;
        if waiter.written == waiter.size {
            let done = inner.waiting_writes.pop_front().unwrap();
            wake(done.task, done.size as isize);
        } else {
            break;
        }
    }
    if got > 0 {
        return Ok(PipeOp::Done(got));
    }
    if inner.write_count == 0 {
        // All write ends closed and the buffer is drained.
        return Ok(PipeOp::Done(0));
    }
    if block {
        let task = task.ok_or(Error::new(Errno::EINVAL))?;
        inner.waiting_reads.push_back(PipeWaiter {
            task,
            buf,
            size,
            written: 0,
        });
        park(pipe, task);
        return Ok(PipeOp::Blocked);
    }
    Err(Error::new(Errno::EAGAIN))
}

/// Mark the calling task Waiting and remember the pipe for signal
/// cancellation. Runs under the pipe lock.
fn park(pipe: &Arc<PipeShared>, task: TaskId) {
    let mut table = tasks();
    move_task_to_state(&mut table, task, TaskState::Waiting);
    if let Some(t) = table.get_mut(task) {
        t.waiting_pipe = Some(pipe.clone());
    }
}

/// Non-blocking kernel-space read; EOF yields 0.
pub fn read_kernel(pipe: &Arc<PipeShared>, buf: &mut [u8]) -> Result<usize> {
    match execute_operation(
        pipe,
        None,
        VirtPtr::kernel(buf.as_mut_ptr() as usize),
        buf.len(),
        false,
        false,
    )? {
        PipeOp::Done(n) => Ok(n),
        PipeOp::Blocked => unreachable!("non-blocking read parked"),
    }
}

/// Non-blocking kernel-space write.
pub fn write_kernel(pipe: &Arc<PipeShared>, buf: &[u8]) -> Result<usize> {
    match execute_operation(
        pipe,
        None,
        VirtPtr::kernel(buf.as_ptr() as usize),
        buf.len(),
        true,
        false,
    )? {
        PipeOp::Done(n) => Ok(n),
        PipeOp::Blocked => unreachable!("non-blocking write parked"),
    }
}
