/// Mount table
///
/// Mounted filesystems are keyed by their absolute, normalized mount-point
/// path. The table holds superblock references; the path walker consults
/// it at every component so lookups cross into mounted roots and `..` at a
/// mount root escapes to the covered directory's parent.

use super::node::VfsNode;
use crate::lib::error::{Errno, Error, Result};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

pub trait Superblock: Send + Sync {
    fn root(&self) -> Arc<VfsNode>;
    fn fs_type(&self) -> &'static str;
}

#[derive(Clone)]
pub struct Mount {
    pub mountpoint: String,
    pub sb: Arc<dyn Superblock>,
}

struct MountTable {
    mounts: Vec<Mount>,
}

static MOUNTS: RwLock<MountTable> = RwLock::new(MountTable { mounts: Vec::new() });

/// Install the root filesystem. Idempotent across re-initialisation.
pub fn init_vfs(sb: Arc<dyn Superblock>) {
    let mut table = MOUNTS.write();
    if table.mounts.iter().any(|m| m.mountpoint == "/") {
        return;
    }
    crate::info!("vfs: mounted {} at /", sb.fs_type());
    table.mounts.push(Mount {
        mountpoint: "/".to_string(),
        sb,
    });
}

/// Attach a superblock at an absolute, normalized path. The caller has
/// already checked that the path names a directory.
pub fn mount_at(path: &str, sb: Arc<dyn Superblock>) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::new(Errno::EINVAL));
    }
    let mut table = MOUNTS.write();
    if table.mounts.iter().any(|m| m.mountpoint == path) {
        return Err(Error::new(Errno::EBUSY));
    }
    crate::info!("vfs: mounted {} at {}", sb.fs_type(), path);
    table.mounts.push(Mount {
        mountpoint: path.to_string(),
        sb,
    });
    Ok(())
}

/// Detach the mount at `path`. Fails with EBUSY while another mount sits
/// beneath it; the open-handle and cwd busy checks happen at the syscall
/// boundary where the process table is in reach.
pub fn unmount(path: &str) -> Result<()> {
    if path == "/" {
        return Err(Error::new(Errno::EBUSY));
    }
    let mut table = MOUNTS.write();
    let index = table
        .mounts
        .iter()
        .position(|m| m.mountpoint == path)
        .ok_or(Error::new(Errno::ENOENT))?;
    let nested = table.mounts.iter().any(|m| {
        m.mountpoint != path && m.mountpoint.starts_with(path) && {
            let rest = &m.mountpoint[path.len()..];
            rest.starts_with('/')
        }
    });
    if nested {
        return Err(Error::new(Errno::EBUSY));
    }
    let removed = table.mounts.swap_remove(index);
    crate::info!("vfs: unmounted {} from {}", removed.sb.fs_type(), path);
    Ok(())
}

/// The superblock mounted exactly at `path`, if any.
pub fn mount_at_path(path: &str) -> Option<Arc<dyn Superblock>> {
    let table = MOUNTS.read();
    table
        .mounts
        .iter()
        .find(|m| m.mountpoint == path)
        .map(|m| m.sb.clone())
}

pub fn root_node() -> Option<Arc<VfsNode>> {
    mount_at_path("/").map(|sb| sb.root())
}

/// Whether `path` lies at or below any mount point other than "/".
pub fn is_mount_prefix(path: &str) -> bool {
    let table = MOUNTS.read();
    table.mounts.iter().any(|m| m.mountpoint == path)
}

pub fn list_mounts() -> Vec<(String, &'static str)> {
    let table = MOUNTS.read();
    table
        .mounts
        .iter()
        .map(|m| (m.mountpoint.clone(), m.sb.fs_type()))
        .collect()
}
