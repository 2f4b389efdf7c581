/// Virtual File System
///
/// Two-layer polymorphism: nodes (the filesystem object, shared and
/// reference counted) and files (a positioned handle over a node or a
/// pipe). Path resolution walks components with a parent stack so `..`
/// behaves physically, crosses mount points through the mount table, and
/// follows symlinks up to a fixed depth.

pub mod fd;
pub mod file;
pub mod mount;
pub mod node;
pub mod pipe;
pub mod ramfs;

pub use fd::{FdEntry, FdFlags, FdTable};
pub use file::{File, OpenFlags, PipeEnd, SeekWhence};
pub use mount::{init_vfs, mount_at, root_node, unmount, Superblock};
pub use node::{DirEntry, NodeKind, NodeMeta, NodeOps, VfsNode};

use crate::lib::error::{Errno, Error, Result};
use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Symbolic links are chased at most this deep.
pub const SYMLINK_DEPTH_LIMIT: usize = 40;

/// Lexically resolve `path` against `cwd` into an absolute path with no
/// `.`/`..` components. Used for mount keys and the process cwd.
pub fn normalize_path(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for comp in base.split('/').chain(path.split('/')) {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            name => parts.push(name),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        let mut out = String::new();
        for part in parts {
            out.push('/');
            out.push_str(part);
        }
        out
    }
}

struct Walker {
    /// Nodes from the root down to the current directory. A mount root
    /// replaces the directory it covers, so popping naturally escapes the
    /// mount.
    stack: Vec<Arc<VfsNode>>,
    names: Vec<String>,
    symlink_depth: usize,
}

impl Walker {
    fn new() -> Result<Self> {
        let root = mount::root_node().ok_or(Error::with_details(Errno::ENOENT, "no root mount"))?;
        Ok(Self {
            stack: alloc::vec![root],
            names: Vec::new(),
            symlink_depth: 0,
        })
    }

    fn current(&self) -> &Arc<VfsNode> {
        self.stack.last().unwrap()
    }

    fn abs_path(&self) -> String {
        if self.names.is_empty() {
            "/".to_string()
        } else {
            let mut out = String::new();
            for name in &self.names {
                out.push('/');
                out.push_str(name);
            }
            out
        }
    }

    fn ascend(&mut self) {
        if !self.names.is_empty() {
            self.names.pop();
            self.stack.pop();
        }
    }

    /// Enter one component, crossing mounts and expanding symlinks into
    /// the pending queue.
    fn descend(&mut self, name: &str, queue: &mut VecDeque<String>, follow: bool) -> Result<()> {
        let node = self.current().lookup(name)?;
        if node.kind() == NodeKind::Symlink && follow {
            self.symlink_depth += 1;
            if self.symlink_depth > SYMLINK_DEPTH_LIMIT {
                return Err(Error::with_details(Errno::EINVAL, "symlink loop"));
            }
            let mut target = [0u8; 256];
            let n = node.read_at(0, &mut target)?;
            let target =
                core::str::from_utf8(&target[..n]).map_err(|_| Error::new(Errno::EINVAL))?;
            if target.starts_with('/') {
                self.stack.truncate(1);
                self.names.clear();
            }
            for comp in target.split('/').rev() {
                if !comp.is_empty() {
                    queue.push_front(comp.to_string());
                }
            }
            return Ok(());
        }
        self.names.push(name.to_string());
        let abs = self.abs_path();
        match mount::mount_at_path(&abs) {
            Some(sb) if abs != "/" => self.stack.push(sb.root()),
            _ => self.stack.push(node),
        }
        Ok(())
    }
}

fn component_queue(cwd: &str, path: &str) -> VecDeque<String> {
    let mut queue = VecDeque::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for comp in base.split('/').chain(path.split('/')) {
        if !comp.is_empty() {
            queue.push_back(comp.to_string());
        }
    }
    queue
}

/// Resolve `path` (relative paths start at `cwd`) to its node.
pub fn resolve_path(cwd: &str, path: &str) -> Result<Arc<VfsNode>> {
    resolve_path_with(cwd, path, true)
}

/// Like `resolve_path` but leaves a final-component symlink unresolved
/// (unlink, readlink-style callers).
pub fn resolve_path_no_follow(cwd: &str, path: &str) -> Result<Arc<VfsNode>> {
    resolve_path_with(cwd, path, false)
}

fn resolve_path_with(cwd: &str, path: &str, follow_last: bool) -> Result<Arc<VfsNode>> {
    let mut walker = Walker::new()?;
    let mut queue = component_queue(cwd, path);
    while let Some(comp) = queue.pop_front() {
        match comp.as_str() {
            "." => {}
            ".." => walker.ascend(),
            name => {
                let follow = follow_last || !queue.is_empty();
                walker.descend(name, &mut queue, follow)?;
            }
        }
    }
    Ok(walker.current().clone())
}

/// Resolve everything but the last component; returns the parent
/// directory and the final name. Paths ending in `.`, `..` or `/` do not
/// name a creatable entry.
pub fn resolve_parent(cwd: &str, path: &str) -> Result<(Arc<VfsNode>, String)> {
    let mut queue = component_queue(cwd, path);
    // Lexically reduce trailing . / .. so the final component is a name.
    let last = loop {
        match queue.pop_back() {
            None => return Err(Error::new(Errno::EINVAL)),
            Some(comp) if comp == "." => {}
            Some(comp) if comp == ".." => return Err(Error::new(Errno::EINVAL)),
            Some(name) => break name,
        }
    };
    let mut walker = Walker::new()?;
    while let Some(comp) = queue.pop_front() {
        match comp.as_str() {
            "." => {}
            ".." => walker.ascend(),
            name => walker.descend(name, &mut queue, true)?,
        }
    }
    let parent = walker.current().clone();
    if !parent.is_dir() {
        return Err(Error::new(Errno::ENOTDIR));
    }
    Ok((parent, last))
}


#[cfg(test)]
mod tests {
    use super::*;
    use test_vfs::ensure_root;

    #[test]
    fn normalization() {
        assert_eq!(normalize_path("/", "/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("/home", "docs//file"), "/home/docs/file");
        assert_eq!(normalize_path("/home", "../.."), "/");
        assert_eq!(normalize_path("/", "."), "/");
        assert_eq!(normalize_path("/a", "./b/."), "/a/b");
    }

    #[test]
    fn absolute_and_relative_resolution() {
        let root = ensure_root();
        let dir = root.create("walk_dir", NodeKind::Directory, 0o755).unwrap();
        dir.create("file", NodeKind::Regular, 0o644).unwrap();

        let found = resolve_path("/", "/walk_dir/file").unwrap();
        assert_eq!(found.kind(), NodeKind::Regular);
        let relative = resolve_path("/walk_dir", "file").unwrap();
        assert_eq!(relative.ino(), found.ino());
        let dotted = resolve_path("/walk_dir", "../walk_dir/./file").unwrap();
        assert_eq!(dotted.ino(), found.ino());
        assert_eq!(
            resolve_path("/", "/walk_dir/missing").unwrap_err().kind,
            Errno::ENOENT
        );
    }

    #[test]
    fn parent_resolution() {
        let root = ensure_root();
        root.create("pr_dir", NodeKind::Directory, 0o755).unwrap();
        let (parent, name) = resolve_parent("/", "/pr_dir/newfile").unwrap();
        assert_eq!(name, "newfile");
        assert!(parent.is_dir());
        assert_eq!(parent.ino(), resolve_path("/", "/pr_dir").unwrap().ino());
        assert!(resolve_parent("/", "/pr_dir/..").is_err());
    }

    #[test]
    fn symlinks_follow_with_depth_bound() {
        let root = ensure_root();
        let dir = root.create("sl_dir", NodeKind::Directory, 0o755).unwrap();
        dir.create("real", NodeKind::Regular, 0o644)
            .unwrap()
            .write_at(0, b"data")
            .unwrap();
        let link = dir.create("alias", NodeKind::Symlink, 0o777).unwrap();
        link.write_at(0, b"/sl_dir/real").unwrap();

        let via = resolve_path("/", "/sl_dir/alias").unwrap();
        assert_eq!(via.kind(), NodeKind::Regular);

        // no-follow keeps the link itself
        let raw = resolve_path_no_follow("/", "/sl_dir/alias").unwrap();
        assert_eq!(raw.kind(), NodeKind::Symlink);

        // self-loop hits the depth bound
        let looper = dir.create("loop", NodeKind::Symlink, 0o777).unwrap();
        looper.write_at(0, b"/sl_dir/loop").unwrap();
        assert!(resolve_path("/", "/sl_dir/loop").is_err());
    }

    #[test]
    fn mounts_cross_and_dotdot_escapes() {
        let root = ensure_root();
        root.create("mnt_a", NodeKind::Directory, 0o755).unwrap();
        mount_at("/mnt_a", ramfs::RamfsSuper::new()).unwrap();

        let mounted_root = resolve_path("/", "/mnt_a").unwrap();
        mounted_root
            .create("inside", NodeKind::Regular, 0o644)
            .unwrap();
        // The file lives in the mounted fs, not the covered directory.
        assert!(resolve_path("/", "/mnt_a/inside").is_ok());

        // `..` at the mount root escapes to the parent of the mount point.
        let escaped = resolve_path("/", "/mnt_a/..").unwrap();
        assert_eq!(escaped.ino(), root.ino());

        // A second mount on the same point is refused.
        assert_eq!(
            mount_at("/mnt_a", ramfs::RamfsSuper::new()).unwrap_err().kind,
            Errno::EBUSY
        );
        unmount("/mnt_a").unwrap();
        // After unmount the covered directory is empty again.
        assert_eq!(
            resolve_path("/", "/mnt_a/inside").unwrap_err().kind,
            Errno::ENOENT
        );
    }

    #[test]
    fn unmount_busy_rules() {
        let root = ensure_root();
        root.create("um_a", NodeKind::Directory, 0o755).unwrap();
        mount_at("/um_a", ramfs::RamfsSuper::new()).unwrap();
        let inner_root = resolve_path("/", "/um_a").unwrap();
        inner_root.create("b", NodeKind::Directory, 0o755).unwrap();
        mount_at("/um_a/b", ramfs::RamfsSuper::new()).unwrap();

        assert_eq!(unmount("/um_a").unwrap_err().kind, Errno::EBUSY);
        unmount("/um_a/b").unwrap();
        unmount("/um_a").unwrap();
        assert_eq!(unmount("/um_a").unwrap_err().kind, Errno::ENOENT);
        assert_eq!(unmount("/").unwrap_err().kind, Errno::EBUSY);
    }
}
