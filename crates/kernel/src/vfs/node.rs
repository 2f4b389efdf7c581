/// VFS nodes
///
/// A node is the in-memory face of a filesystem object. Every open handle
/// referencing the same object shares one node through `Arc`; cloning the
/// Arc is the copy operation, dropping it the close, and the node lives as
/// long as its longest holder. Behaviour is supplied by the filesystem
/// through the `NodeOps` capability set; unsupported capabilities fall
/// back to the matching errno.

use crate::lib::error::{Errno, Error, Result};
use crate::time::Time;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

pub type Ino = u64;

static NEXT_INO: AtomicU64 = AtomicU64::new(2); // 1 is reserved for roots

pub fn alloc_ino() -> Ino {
    NEXT_INO.fetch_add(1, Ordering::SeqCst)
}

// File type and permission bits (mode layout follows the classic format)
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFIFO: u32 = 0o010000;
pub const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Regular,
    CharDevice,
    BlockDevice,
    Fifo,
    Symlink,
}

impl NodeKind {
    pub fn mode_bits(&self) -> u32 {
        match self {
            NodeKind::Directory => S_IFDIR,
            NodeKind::Regular => S_IFREG,
            NodeKind::CharDevice => S_IFCHR,
            NodeKind::BlockDevice => S_IFBLK,
            NodeKind::Fifo => S_IFIFO,
            NodeKind::Symlink => S_IFLNK,
        }
    }

    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(NodeKind::Directory),
            S_IFREG => Some(NodeKind::Regular),
            S_IFCHR => Some(NodeKind::CharDevice),
            S_IFBLK => Some(NodeKind::BlockDevice),
            S_IFIFO => Some(NodeKind::Fifo),
            S_IFLNK => Some(NodeKind::Symlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NodeMeta {
    pub ino: Ino,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
    pub dev: u32,
}

impl NodeMeta {
    pub fn new(kind: NodeKind, mode: u32) -> Self {
        Self {
            ino: alloc_ino(),
            kind,
            mode: kind.mode_bits() | (mode & 0o7777),
            uid: 0,
            gid: 0,
            nlink: if kind == NodeKind::Directory { 2 } else { 1 },
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            dev: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    pub kind: NodeKind,
}

/// Capability set a filesystem implements per node. Defaults surface
/// EUNSUP/ENOTDIR/ENOTTY so filesystems only fill in what they support.
pub trait NodeOps: Send + Sync {
    fn read_at(&self, node: &VfsNode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let _ = (node, offset, buf);
        Err(Error::new(Errno::EUNSUP))
    }

    fn write_at(&self, node: &VfsNode, offset: u64, buf: &[u8]) -> Result<usize> {
        let _ = (node, offset, buf);
        Err(Error::new(Errno::EUNSUP))
    }

    fn readdir(&self, node: &VfsNode) -> Result<Vec<DirEntry>> {
        let _ = node;
        Err(Error::new(Errno::ENOTDIR))
    }

    fn lookup(&self, node: &VfsNode, name: &str) -> Result<Arc<VfsNode>> {
        let _ = (node, name);
        Err(Error::new(Errno::ENOTDIR))
    }

    fn create(&self, node: &VfsNode, name: &str, kind: NodeKind, mode: u32) -> Result<Arc<VfsNode>> {
        let _ = (node, name, kind, mode);
        Err(Error::new(Errno::EUNSUP))
    }

    /// Insert an existing node under a new name (hard link).
    fn link(&self, node: &VfsNode, name: &str, target: &Arc<VfsNode>) -> Result<()> {
        let _ = (node, name, target);
        Err(Error::new(Errno::EUNSUP))
    }

    fn unlink(&self, node: &VfsNode, name: &str) -> Result<()> {
        let _ = (node, name);
        Err(Error::new(Errno::EUNSUP))
    }

    fn trunc(&self, node: &VfsNode, size: u64) -> Result<()> {
        let _ = (node, size);
        Err(Error::new(Errno::EUNSUP))
    }

    fn ioctl(&self, node: &VfsNode, request: usize, arg: usize) -> Result<usize> {
        let _ = (node, request, arg);
        Err(Error::new(Errno::ENOTTY))
    }

    /// Would a read (or write) make progress right now?
    fn is_ready(&self, node: &VfsNode, write: bool) -> bool {
        let _ = (node, write);
        true
    }

    /// FIFO nodes expose their shared pipe here.
    fn pipe(&self, node: &VfsNode) -> Option<Arc<crate::vfs::pipe::PipeShared>> {
        let _ = node;
        None
    }
}

pub struct VfsNode {
    pub meta: RwLock<NodeMeta>,
    ops: alloc::boxed::Box<dyn NodeOps>,
}

impl VfsNode {
    pub fn new(kind: NodeKind, mode: u32, ops: alloc::boxed::Box<dyn NodeOps>) -> Self {
        Self {
            meta: RwLock::new(NodeMeta::new(kind, mode)),
            ops,
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ops.read_at(self, offset, buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.ops.write_at(self, offset, buf)
    }

    pub fn readdir(&self) -> Result<Vec<DirEntry>> {
        self.ops.readdir(self)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<VfsNode>> {
        self.ops.lookup(self, name)
    }

    pub fn create(&self, name: &str, kind: NodeKind, mode: u32) -> Result<Arc<VfsNode>> {
        self.ops.create(self, name, kind, mode)
    }

    pub fn link(&self, name: &str, target: &Arc<VfsNode>) -> Result<()> {
        self.ops.link(self, name, target)
    }

    pub fn unlink(&self, name: &str) -> Result<()> {
        self.ops.unlink(self, name)
    }

    pub fn trunc(&self, size: u64) -> Result<()> {
        self.ops.trunc(self, size)
    }

    pub fn ioctl(&self, request: usize, arg: usize) -> Result<usize> {
        self.ops.ioctl(self, request, arg)
    }

    pub fn is_ready(&self, write: bool) -> bool {
        self.ops.is_ready(self, write)
    }

    pub fn pipe(&self) -> Option<Arc<crate::vfs::pipe::PipeShared>> {
        self.ops.pipe(self)
    }

    pub fn ino(&self) -> Ino {
        self.meta.read().ino
    }

    pub fn kind(&self) -> NodeKind {
        self.meta.read().kind
    }

    pub fn size(&self) -> u64 {
        self.meta.read().size
    }

    pub fn set_size(&self, size: u64) {
        self.meta.write().size = size;
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == NodeKind::Directory
    }
}

impl core::fmt::Debug for VfsNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let meta = self.meta.read();
        f.debug_struct("VfsNode")
            .field("ino", &meta.ino)
            .field("kind", &meta.kind)
            .field("mode", &format_args!("{:#o}", meta.mode))
            .field("size", &meta.size)
            .finish()
    }
}
