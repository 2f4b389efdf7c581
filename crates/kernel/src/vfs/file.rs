/// Open files
///
/// A file is a positioned handle over a node (or over a pipe's shared
/// data). The position advances under the per-file lock, so concurrent
/// users of one handle see a consistent stream.

use super::node::{NodeKind, VfsNode};
use super::pipe::PipeShared;
use crate::lib::error::{Errno, Error, Result};
use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0o0;
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_NONBLOCK = 0o4000;
        const O_DIRECTORY = 0o200000;
        const O_CLOEXEC = 0o2000000;
    }
}

impl OpenFlags {
    pub fn is_readable(&self) -> bool {
        (*self & OpenFlags::O_WRONLY).is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

impl SeekWhence {
    pub fn from_raw(raw: usize) -> Result<Self> {
        match raw {
            0 => Ok(SeekWhence::Set),
            1 => Ok(SeekWhence::Cur),
            2 => Ok(SeekWhence::End),
            _ => Err(Error::new(Errno::EINVAL)),
        }
    }
}

/// One end of a pipe held by a file.
pub struct PipeEnd {
    pub shared: Arc<PipeShared>,
    pub write: bool,
}

pub struct File {
    pub node: Option<Arc<VfsNode>>,
    pub pipe: Option<PipeEnd>,
    pos: Mutex<u64>,
    pub flags: Mutex<OpenFlags>,
}

impl File {
    pub fn new(node: Arc<VfsNode>, flags: OpenFlags) -> Self {
        Self {
            node: Some(node),
            pipe: None,
            pos: Mutex::new(0),
            flags: Mutex::new(flags),
        }
    }

    /// Wrap one end of a pipe, bumping the pipe's end counts.
    pub fn from_pipe(shared: Arc<PipeShared>, write: bool, flags: OpenFlags) -> Self {
        shared.add_end(write);
        Self {
            node: None,
            pipe: Some(PipeEnd { shared, write }),
            pos: Mutex::new(0),
            flags: Mutex::new(flags),
        }
    }

    pub fn flags(&self) -> OpenFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: OpenFlags) {
        *self.flags.lock() = flags;
    }

    pub fn pos(&self) -> u64 {
        *self.pos.lock()
    }

    pub fn set_pos(&self, pos: u64) {
        *self.pos.lock() = pos;
    }

    pub fn is_pipe(&self) -> bool {
        self.pipe.is_some()
    }

    /// Kernel-space read at the current position; the position advances by
    /// the amount actually read. Pipe handles are served non-blocking here;
    /// blocking pipe reads go through the syscall layer.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.flags().is_readable() {
            return Err(Error::new(Errno::EBADF));
        }
        if let Some(end) = &self.pipe {
            if end.write {
                return Err(Error::new(Errno::EBADF));
            }
            return super::pipe::read_kernel(&end.shared, buf);
        }
        let node = self.node.as_ref().ok_or(Error::new(Errno::EBADF))?;
        let mut pos = self.pos.lock();
        let read = node.read_at(*pos, buf)?;
        *pos += read as u64;
        Ok(read)
    }

    /// Kernel-space write at the current position (or the end with
    /// O_APPEND).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if !self.flags().is_writable() {
            return Err(Error::new(Errno::EBADF));
        }
        if let Some(end) = &self.pipe {
            if !end.write {
                return Err(Error::new(Errno::EBADF));
            }
            return super::pipe::write_kernel(&end.shared, buf);
        }
        let node = self.node.as_ref().ok_or(Error::new(Errno::EBADF))?;
        let mut pos = self.pos.lock();
        if self.flags().contains(OpenFlags::O_APPEND) {
            *pos = node.size();
        }
        let written = node.write_at(*pos, buf)?;
        *pos += written as u64;
        Ok(written)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let node = self.node.as_ref().ok_or(Error::new(Errno::ESPIPE))?;
        node.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let node = self.node.as_ref().ok_or(Error::new(Errno::ESPIPE))?;
        node.write_at(offset, buf)
    }

    pub fn seek(&self, offset: i64, whence: SeekWhence) -> Result<u64> {
        if self.is_pipe() {
            return Err(Error::new(Errno::ESPIPE));
        }
        let node = self.node.as_ref().ok_or(Error::new(Errno::EBADF))?;
        let mut pos = self.pos.lock();
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => *pos as i64,
            SeekWhence::End => node.size() as i64,
        };
        let target = base.checked_add(offset).ok_or(Error::new(Errno::EINVAL))?;
        if target < 0 {
            return Err(Error::new(Errno::EINVAL));
        }
        *pos = target as u64;
        Ok(*pos)
    }

    pub fn node_kind(&self) -> Option<NodeKind> {
        self.node.as_ref().map(|n| n.kind())
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Some(end) = &self.pipe {
            end.shared.remove_end(end.write);
        }
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut d = f.debug_struct("File");
        if let Some(node) = &self.node {
            d.field("ino", &node.ino());
        } else if let Some(end) = &self.pipe {
            d.field("pipe", if end.write { &"write" } else { &"read" });
        }
        d.field("pos", &self.pos()).field("flags", &self.flags()).finish()
    }
}
