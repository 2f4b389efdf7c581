/// Per-process file-descriptor table
///
/// A sparse mapping from small integers to file references. Slots carry
/// their own flags (close-on-exec); the file itself is shared through
/// `Arc`, so dup and fork bump the reference count and the file is freed
/// exactly when the last holder closes it.

use super::file::File;
use crate::lib::error::{Errno, Error, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Highest fd number a process may hold.
pub const MAX_FDS: i32 = 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        const CLOEXEC = 1 << 0;
    }
}

#[derive(Clone)]
pub struct FdEntry {
    pub fd: i32,
    pub flags: FdFlags,
    pub file: Arc<File>,
}

pub struct FdTable {
    entries: Vec<FdEntry>,
    /// Lowest fd that might be free; a hint, rechecked on allocation.
    next_fd: i32,
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_fd: 0,
        }
    }

    pub fn get(&self, fd: i32) -> Result<Arc<File>> {
        self.entry(fd).map(|e| e.file.clone())
    }

    pub fn entry(&self, fd: i32) -> Result<&FdEntry> {
        self.entries
            .iter()
            .find(|e| e.fd == fd)
            .ok_or(Error::new(Errno::EBADF))
    }

    pub fn entry_mut(&mut self, fd: i32) -> Result<&mut FdEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.fd == fd)
            .ok_or(Error::new(Errno::EBADF))
    }

    fn lowest_free(&self) -> i32 {
        let mut fd = self.next_fd;
        while self.entries.iter().any(|e| e.fd == fd) {
            fd += 1;
        }
        fd
    }

    /// Install a file at `fd`, or at the lowest free slot when `fd < 0`.
    /// With `replace`, an existing slot at `fd` is closed first
    /// (dup2 semantics); without it an occupied slot is an error.
    pub fn put(&mut self, fd: i32, flags: FdFlags, file: Arc<File>, replace: bool) -> Result<i32> {
        let fd = if fd < 0 { self.lowest_free() } else { fd };
        if fd >= MAX_FDS {
            return Err(Error::new(Errno::EMFILE));
        }
        if let Some(existing) = self.entries.iter_mut().find(|e| e.fd == fd) {
            if !replace {
                return Err(Error::new(Errno::EBUSY));
            }
            existing.flags = flags;
            existing.file = file;
        } else {
            self.entries.push(FdEntry { fd, flags, file });
        }
        if fd == self.next_fd {
            self.next_fd = fd + 1;
        }
        Ok(fd)
    }

    pub fn close(&mut self, fd: i32) -> Result<()> {
        let index = self
            .entries
            .iter()
            .position(|e| e.fd == fd)
            .ok_or(Error::new(Errno::EBADF))?;
        self.entries.swap_remove(index);
        if fd < self.next_fd {
            self.next_fd = fd;
        }
        Ok(())
    }

    pub fn close_all(&mut self) {
        self.entries.clear();
        self.next_fd = 0;
    }

    /// Close every slot carrying the close-on-exec flag.
    pub fn close_exec(&mut self) {
        self.entries.retain(|e| !e.flags.contains(FdFlags::CLOEXEC));
        self.next_fd = 0;
    }

    /// Duplicate every slot for a forked child, bumping refcounts.
    pub fn fork(&self) -> FdTable {
        FdTable {
            entries: self.entries.clone(),
            next_fd: self.next_fd,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FdEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
