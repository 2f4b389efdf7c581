// Kernel logging (printk) with ring buffer
//
// Log lines are formatted into a fixed stack buffer, recorded in an
// in-memory ring for later inspection, and forwarded to whatever console
// sink the platform registered. The serial driver itself is out of the
// core's scope; it only has to implement `Console`.

use super::ringbuf::RingBuffer;
use crate::time::{get_time, Time};
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

/// Byte sink for console output. Registered once by the platform's serial
/// bring-up; the core never talks to hardware directly.
pub trait Console: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

static CONSOLE: Mutex<Option<&'static dyn Console>> = Mutex::new(None);

pub fn set_console(console: &'static dyn Console) {
    *CONSOLE.lock() = Some(console);
}

pub fn console_write(bytes: &[u8]) {
    if let Some(console) = *CONSOLE.lock() {
        console.write_bytes(bytes);
    }
}

const MESSAGE_CAPACITY: usize = 192;

#[derive(Clone, Copy)]
pub struct LogEntry {
    pub timestamp: Time,
    pub level: LogLevel,
    pub message: [u8; MESSAGE_CAPACITY],
    pub len: usize,
}

impl LogEntry {
    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<invalid utf8>")
    }
}

static KERNEL_LOG: Mutex<RingBuffer<LogEntry, 256>> = Mutex::new(RingBuffer::new());

struct MessageWriter {
    buf: [u8; MESSAGE_CAPACITY],
    len: usize,
}

impl Write for MessageWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let space = MESSAGE_CAPACITY - self.len;
        let take = s.len().min(space);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let mut writer = MessageWriter {
        buf: [0; MESSAGE_CAPACITY],
        len: 0,
    };
    let _ = writer.write_fmt(args);

    let entry = LogEntry {
        timestamp: get_time(),
        level,
        message: writer.buf,
        len: writer.len,
    };
    KERNEL_LOG.lock().push(entry);

    console_write(b"[");
    console_write(level.as_str().as_bytes());
    console_write(b"] ");
    console_write(&writer.buf[..writer.len]);
    console_write(b"\n");
}

/// Drain the buffered log entries, oldest first.
pub fn drain_log() -> alloc::vec::Vec<LogEntry> {
    KERNEL_LOG.lock().drain_all()
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::lib::printk::log($crate::lib::printk::LogLevel::Debug, format_args!($($arg)*))
    };
}
