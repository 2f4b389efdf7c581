/// ramfs - in-memory filesystem
///
/// Directories keep their children in a BTreeMap, regular files hold their
/// bytes in a Vec, symlinks store the target path, FIFOs carry a shared
/// pipe, and device nodes record their device number for whatever driver
/// claims them. Backs the root mount and anything mounted at runtime.

use super::mount::Superblock;
use super::node::{DirEntry, NodeKind, NodeOps, VfsNode};
use super::pipe::PipeShared;
use crate::lib::error::{Errno, Error, Result};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

pub struct RamfsSuper {
    root: Arc<VfsNode>,
}

impl RamfsSuper {
    pub fn new() -> Arc<dyn Superblock> {
        let root = Arc::new(VfsNode::new(
            NodeKind::Directory,
            0o755,
            Box::new(RamfsDir::new()),
        ));
        Arc::new(RamfsSuper { root })
    }
}

impl Superblock for RamfsSuper {
    fn root(&self) -> Arc<VfsNode> {
        self.root.clone()
    }

    fn fs_type(&self) -> &'static str {
        "ramfs"
    }
}

struct RamfsDir {
    children: RwLock<BTreeMap<String, Arc<VfsNode>>>,
}

impl RamfsDir {
    fn new() -> Self {
        Self {
            children: RwLock::new(BTreeMap::new()),
        }
    }
}

fn new_node(kind: NodeKind, mode: u32) -> Result<Arc<VfsNode>> {
    let ops: Box<dyn NodeOps> = match kind {
        NodeKind::Directory => Box::new(RamfsDir::new()),
        NodeKind::Regular => Box::new(RamfsFile::new()),
        NodeKind::Symlink => Box::new(RamfsSymlink::new()),
        NodeKind::Fifo => Box::new(RamfsFifo::new()),
        NodeKind::CharDevice | NodeKind::BlockDevice => Box::new(RamfsDevice),
    };
    Ok(Arc::new(VfsNode::new(kind, mode, ops)))
}

impl NodeOps for RamfsDir {
    fn lookup(&self, _node: &VfsNode, name: &str) -> Result<Arc<VfsNode>> {
        self.children
            .read()
            .get(name)
            .cloned()
            .ok_or(Error::new(Errno::ENOENT))
    }

    fn create(&self, node: &VfsNode, name: &str, kind: NodeKind, mode: u32) -> Result<Arc<VfsNode>> {
        if name.is_empty() || name.contains('/') {
            return Err(Error::new(Errno::EINVAL));
        }
        let mut children = self.children.write();
        if children.contains_key(name) {
            return Err(Error::new(Errno::EEXIST));
        }
        let child = new_node(kind, mode)?;
        children.insert(name.to_string(), child.clone());
        let mut meta = node.meta.write();
        meta.size = children.len() as u64;
        if kind == NodeKind::Directory {
            meta.nlink += 1;
        }
        Ok(child)
    }

    fn link(&self, node: &VfsNode, name: &str, target: &Arc<VfsNode>) -> Result<()> {
        if target.is_dir() {
            // Hard links to directories would create cycles.
            return Err(Error::new(Errno::EISDIR));
        }
        let mut children = self.children.write();
        if children.contains_key(name) {
            return Err(Error::new(Errno::EEXIST));
        }
        children.insert(name.to_string(), target.clone());
        target.meta.write().nlink += 1;
        node.meta.write().size = children.len() as u64;
        Ok(())
    }

    fn unlink(&self, node: &VfsNode, name: &str) -> Result<()> {
        let mut children = self.children.write();
        let entry = children.get(name).ok_or(Error::new(Errno::ENOENT))?;
        if entry.is_dir() {
            // Only empty directories may go.
            let empty = entry.size() == 0;
            if !empty {
                return Err(Error::new(Errno::EBUSY));
            }
            node.meta.write().nlink -= 1;
        }
        let removed = children.remove(name).unwrap();
        removed.meta.write().nlink -= 1;
        node.meta.write().size = children.len() as u64;
        Ok(())
    }

    fn readdir(&self, node: &VfsNode) -> Result<Vec<DirEntry>> {
        let children = self.children.read();
        let mut entries = Vec::with_capacity(children.len() + 2);
        let own_ino = node.ino();
        entries.push(DirEntry {
            ino: own_ino,
            name: ".".into(),
            kind: NodeKind::Directory,
        });
        entries.push(DirEntry {
            ino: own_ino,
            name: "..".into(),
            kind: NodeKind::Directory,
        });
        for (name, child) in children.iter() {
            entries.push(DirEntry {
                ino: child.ino(),
                name: name.clone(),
                kind: child.kind(),
            });
        }
        Ok(entries)
    }

    fn read_at(&self, _node: &VfsNode, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::new(Errno::EISDIR))
    }

    fn write_at(&self, _node: &VfsNode, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(Error::new(Errno::EISDIR))
    }
}

struct RamfsFile {
    data: RwLock<Vec<u8>>,
}

impl RamfsFile {
    fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
        }
    }
}

impl NodeOps for RamfsFile {
    fn read_at(&self, _node: &VfsNode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, node: &VfsNode, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.write();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            // Sparse writes fill the gap with zeros.
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        node.set_size(data.len() as u64);
        Ok(buf.len())
    }

    fn trunc(&self, node: &VfsNode, size: u64) -> Result<()> {
        let mut data = self.data.write();
        data.resize(size as usize, 0);
        node.set_size(size);
        Ok(())
    }
}

struct RamfsSymlink {
    target: RwLock<String>,
}

impl RamfsSymlink {
    fn new() -> Self {
        Self {
            target: RwLock::new(String::new()),
        }
    }
}

impl NodeOps for RamfsSymlink {
    fn read_at(&self, _node: &VfsNode, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let target = self.target.read();
        let bytes = target.as_bytes();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, node: &VfsNode, offset: u64, buf: &[u8]) -> Result<usize> {
        if offset != 0 {
            return Err(Error::new(Errno::EINVAL));
        }
        let text = core::str::from_utf8(buf).map_err(|_| Error::new(Errno::EINVAL))?;
        *self.target.write() = text.to_string();
        node.set_size(buf.len() as u64);
        Ok(buf.len())
    }
}

struct RamfsFifo {
    pipe: Arc<PipeShared>,
}

impl RamfsFifo {
    fn new() -> Self {
        Self {
            pipe: PipeShared::new(),
        }
    }
}

impl NodeOps for RamfsFifo {
    fn pipe(&self, _node: &VfsNode) -> Option<Arc<PipeShared>> {
        Some(self.pipe.clone())
    }

    fn is_ready(&self, _node: &VfsNode, write: bool) -> bool {
        self.pipe.is_ready(write)
    }
}

/// Device node: holds only identity; reads and writes wait for a driver.
struct RamfsDevice;

impl NodeOps for RamfsDevice {
    fn read_at(&self, _node: &VfsNode, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::new(Errno::ENXIO))
    }

    fn write_at(&self, _node: &VfsNode, _offset: u64, _buf: &[u8]) -> Result<usize> {
        Err(Error::new(Errno::ENXIO))
    }
}
