/// File syscalls
///
/// Thin decode layer over the VFS: path strings and buffers cross the
/// user boundary through uaccess, descriptors resolve through the calling
/// process's table, and blocking pipe operations park the task via the
/// pipe's waiter queues.

use super::uaccess::{self, VirtPtr};
use super::{caller, ret, Caller, SyscallArgs, SyscallReturn};
use crate::arch::TrapFrame;
use crate::lib::error::{Errno, Error, Result};
use crate::process::{processes, Pid};
use crate::time::Time;
use crate::vfs::pipe::{self, PipeOp};
use crate::vfs::{
    self, mount, node, File, FdFlags, NodeKind, OpenFlags, SeekWhence, VfsNode,
};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

const PATH_MAX: usize = 1024;

fn read_path(who: &Caller, addr: usize) -> Result<String> {
    uaccess::read_string(who.buf(addr), PATH_MAX)
}

fn cwd_of(pid: Pid) -> Result<String> {
    processes()
        .get(pid)
        .map(|p| p.resources.cwd.clone())
        .ok_or(Error::new(Errno::ESRCH))
}

fn fd_file(pid: Pid, fd: i32) -> Result<Arc<File>> {
    processes()
        .get(pid)
        .ok_or(Error::new(Errno::ESRCH))?
        .resources
        .fds
        .get(fd)
}

/// open(path, flags, mode) -> fd
pub(crate) fn do_open(pid: Pid, path: &str, flags: OpenFlags, mode: u32) -> Result<i32> {
    let cwd = cwd_of(pid)?;
    let umask = processes()
        .get(pid)
        .map(|p| p.resources.umask)
        .unwrap_or(0);
    let node = match vfs::resolve_path(&cwd, path) {
        Ok(node) => {
            if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) {
                return Err(Error::new(Errno::EEXIST));
            }
            node
        }
        Err(err) if err.kind == Errno::ENOENT && flags.contains(OpenFlags::O_CREAT) => {
            let (parent, name) = vfs::resolve_parent(&cwd, path)?;
            parent.create(&name, NodeKind::Regular, mode & !umask & 0o7777)?
        }
        Err(err) => return Err(err),
    };

    if flags.contains(OpenFlags::O_DIRECTORY) && !node.is_dir() {
        return Err(Error::new(Errno::ENOTDIR));
    }
    if node.is_dir() && flags.is_writable() {
        return Err(Error::new(Errno::EISDIR));
    }
    if flags.contains(OpenFlags::O_TRUNC) && node.kind() == NodeKind::Regular && flags.is_writable()
    {
        node.trunc(0)?;
    }

    let file = if node.kind() == NodeKind::Fifo {
        let shared = node.pipe().ok_or(Error::new(Errno::ENXIO))?;
        File::from_pipe(shared, flags.is_writable(), flags)
    } else {
        File::new(node, flags)
    };

    let fd_flags = if flags.contains(OpenFlags::O_CLOEXEC) {
        FdFlags::CLOEXEC
    } else {
        FdFlags::empty()
    };
    let mut procs = processes();
    let process = procs.get_mut(pid).ok_or(Error::new(Errno::ESRCH))?;
    process.resources.fds.put(-1, fd_flags, Arc::new(file), false)
}

/// Outcome of read/write: done with a byte count, or the task parked.
#[derive(Debug)]
pub(crate) enum IoOutcome {
    Done(isize),
    Blocked,
}

pub(crate) fn do_read(
    pid: Pid,
    task: Option<crate::process::TaskId>,
    fd: i32,
    buf: VirtPtr,
    len: usize,
) -> Result<IoOutcome> {
    let file = fd_file(pid, fd)?;
    let flags = file.flags();
    if !flags.is_readable() {
        return Err(Error::new(Errno::EBADF));
    }
    if let Some(end) = &file.pipe {
        if end.write {
            return Err(Error::new(Errno::EBADF));
        }
        let block = !flags.contains(OpenFlags::O_NONBLOCK);
        return match pipe::execute_operation(&end.shared, task, buf, len, false, block)? {
            PipeOp::Done(n) => Ok(IoOutcome::Done(n as isize)),
            PipeOp::Blocked => Ok(IoOutcome::Blocked),
        };
    }
    // Regular nodes: bounce through a kernel buffer page by page.
    let mut chunk = [0u8; 512];
    let mut total = 0usize;
    while total < len {
        let want = chunk.len().min(len - total);
        let n = file.read(&mut chunk[..want])?;
        if n == 0 {
            break;
        }
        uaccess::write_to(buf.offset(total), &chunk[..n])?;
        total += n;
        if n < want {
            break;
        }
    }
    Ok(IoOutcome::Done(total as isize))
}

pub(crate) fn do_write(
    pid: Pid,
    task: Option<crate::process::TaskId>,
    fd: i32,
    buf: VirtPtr,
    len: usize,
) -> Result<IoOutcome> {
    let file = fd_file(pid, fd)?;
    let flags = file.flags();
    if !flags.is_writable() {
        return Err(Error::new(Errno::EBADF));
    }
    if let Some(end) = &file.pipe {
        if !end.write {
            return Err(Error::new(Errno::EBADF));
        }
        let block = !flags.contains(OpenFlags::O_NONBLOCK);
        return match pipe::execute_operation(&end.shared, task, buf, len, true, block)? {
            PipeOp::Done(n) => Ok(IoOutcome::Done(n as isize)),
            PipeOp::Blocked => Ok(IoOutcome::Blocked),
        };
    }
    let mut chunk = [0u8; 512];
    let mut total = 0usize;
    while total < len {
        let want = chunk.len().min(len - total);
        uaccess::read_from(buf.offset(total), &mut chunk[..want])?;
        let n = file.write(&chunk[..want])?;
        total += n;
        if n < want {
            break;
        }
    }
    Ok(IoOutcome::Done(total as isize))
}

/// stat payload written to user space.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub dev: u32,
    pub rdev: u32,
    pub size: u64,
    pub atime: Time,
    pub mtime: Time,
    pub ctime: Time,
}

fn stat_of(node: &VfsNode) -> Stat {
    let meta = node.meta.read();
    Stat {
        ino: meta.ino,
        mode: meta.mode,
        nlink: meta.nlink,
        uid: meta.uid,
        gid: meta.gid,
        dev: 0,
        rdev: meta.dev,
        size: meta.size,
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
    }
}

/// One serialized directory record: ino, record length, kind, name.
pub(crate) fn pack_dirent(out: &mut Vec<u8>, entry: &node::DirEntry) {
    let name = entry.name.as_bytes();
    let reclen = ((8 + 2 + 1 + 1 + name.len() + 7) & !7) as u16;
    out.extend_from_slice(&entry.ino.to_le_bytes());
    out.extend_from_slice(&reclen.to_le_bytes());
    out.push(match entry.kind {
        NodeKind::Directory => 4,
        NodeKind::Regular => 8,
        NodeKind::CharDevice => 2,
        NodeKind::BlockDevice => 6,
        NodeKind::Fifo => 1,
        NodeKind::Symlink => 10,
    });
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    while out.len() % 8 != 0 {
        out.push(0);
    }
}

/// readdir(fd, buf, len): fills as many whole records as fit; the file
/// position counts entries already delivered.
pub(crate) fn do_readdir(pid: Pid, fd: i32, buf: VirtPtr, len: usize) -> Result<isize> {
    let file = fd_file(pid, fd)?;
    let node = file.node.as_ref().ok_or(Error::new(Errno::EBADF))?;
    if !node.is_dir() {
        return Err(Error::new(Errno::ENOTDIR));
    }
    let entries = node.readdir()?;
    let mut consumed = file.pos() as usize;
    let mut packed: Vec<u8> = Vec::new();
    for entry in entries.iter().skip(consumed) {
        let mut record = Vec::new();
        pack_dirent(&mut record, entry);
        if packed.len() + record.len() > len {
            break;
        }
        packed.extend_from_slice(&record);
        consumed += 1;
    }
    uaccess::write_to(buf, &packed)?;
    file.set_pos(consumed as u64);
    Ok(packed.len() as isize)
}

pub(crate) fn do_pipe(pid: Pid) -> Result<(i32, i32)> {
    let shared = pipe::PipeShared::new();
    let read_end = Arc::new(File::from_pipe(shared.clone(), false, OpenFlags::O_RDONLY));
    let write_end = Arc::new(File::from_pipe(shared, true, OpenFlags::O_WRONLY));
    let mut procs = processes();
    let process = procs.get_mut(pid).ok_or(Error::new(Errno::ESRCH))?;
    let read_fd = process.resources.fds.put(-1, FdFlags::empty(), read_end, false)?;
    let write_fd = match process.resources.fds.put(-1, FdFlags::empty(), write_end, false) {
        Ok(fd) => fd,
        Err(err) => {
            let _ = process.resources.fds.close(read_fd);
            return Err(err);
        }
    };
    Ok((read_fd, write_fd))
}

pub(crate) fn do_mknod(pid: Pid, path: &str, mode: u32, dev: u32) -> Result<()> {
    let cwd = cwd_of(pid)?;
    let kind = NodeKind::from_mode(mode).unwrap_or(NodeKind::Regular);
    if kind == NodeKind::Directory {
        return Err(Error::new(Errno::EINVAL));
    }
    let (parent, name) = vfs::resolve_parent(&cwd, path)?;
    let node = parent.create(&name, kind, mode & 0o7777)?;
    node.meta.write().dev = dev;
    Ok(())
}

pub(crate) fn do_link(pid: Pid, old: &str, new: &str) -> Result<()> {
    let cwd = cwd_of(pid)?;
    let target = vfs::resolve_path_no_follow(&cwd, old)?;
    let (parent, name) = vfs::resolve_parent(&cwd, new)?;
    parent.link(&name, &target)
}

pub(crate) fn do_unlink(pid: Pid, path: &str) -> Result<()> {
    let cwd = cwd_of(pid)?;
    let (parent, name) = vfs::resolve_parent(&cwd, path)?;
    parent.unlink(&name)
}

pub(crate) fn do_rename(pid: Pid, old: &str, new: &str) -> Result<()> {
    let cwd = cwd_of(pid)?;
    let node = vfs::resolve_path_no_follow(&cwd, old)?;
    let (new_parent, new_name) = vfs::resolve_parent(&cwd, new)?;
    // Replace semantics: an existing destination is dropped first.
    match new_parent.unlink(&new_name) {
        Ok(()) => {}
        Err(err) if err.kind == Errno::ENOENT => {}
        Err(err) => return Err(err),
    }
    new_parent.link(&new_name, &node)?;
    let (old_parent, old_name) = vfs::resolve_parent(&cwd, old)?;
    old_parent.unlink(&old_name)
}

pub(crate) fn do_chdir(pid: Pid, path: &str) -> Result<()> {
    let cwd = cwd_of(pid)?;
    let node = vfs::resolve_path(&cwd, path)?;
    if !node.is_dir() {
        return Err(Error::new(Errno::ENOTDIR));
    }
    let normalized = vfs::normalize_path(&cwd, path);
    let mut procs = processes();
    procs
        .get_mut(pid)
        .ok_or(Error::new(Errno::ESRCH))?
        .resources
        .cwd = normalized;
    Ok(())
}

pub(crate) fn do_mount(pid: Pid, target: &str, fs_type: &str) -> Result<()> {
    let cwd = cwd_of(pid)?;
    let node = vfs::resolve_path(&cwd, target)?;
    if !node.is_dir() {
        return Err(Error::new(Errno::ENOTDIR));
    }
    let sb = match fs_type {
        "ramfs" => vfs::ramfs::RamfsSuper::new(),
        _ => return Err(Error::new(Errno::ENODEV)),
    };
    mount::mount_at(&vfs::normalize_path(&cwd, target), sb)
}

pub(crate) fn do_umount(pid: Pid, target: &str) -> Result<()> {
    let cwd = cwd_of(pid)?;
    let path = vfs::normalize_path(&cwd, target);
    // Busy while any process has its cwd at or beneath the mount point.
    {
        let procs = processes();
        for other in procs.pids() {
            if let Some(process) = procs.get(other) {
                let other_cwd = &process.resources.cwd;
                if other_cwd == &path || other_cwd.starts_with(&alloc::format!("{}/", path)) {
                    return Err(Error::new(Errno::EBUSY));
                }
            }
        }
    }
    mount::unmount(&path)
}

// ---- handlers ----

pub fn print_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = match caller() {
        Ok(who) => uaccess::read_string(who.buf(args[0]), 4096),
        // Early-boot contexts print straight from kernel memory.
        Err(_) => uaccess::read_string(VirtPtr::kernel(args[0]), 4096),
    };
    match result {
        Ok(text) => {
            crate::lib::printk::console_write(text.as_bytes());
            frame.set_return(text.len() as isize);
        }
        Err(err) => frame.set_return(err.as_isize()),
    }
    SyscallReturn::Continue
}

pub fn open_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let path = read_path(&who, args[0])?;
        let flags = OpenFlags::from_bits_truncate(args[1] as u32);
        do_open(who.pid, &path, flags, args[2] as u32).map(|fd| fd as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn close_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        process.resources.fds.close(args[0] as i32)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn read_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let outcome = caller().and_then(|who| {
        do_read(
            who.pid,
            Some(who.task),
            args[0] as i32,
            who.buf(args[1]),
            args[2],
        )
    });
    match outcome {
        Ok(IoOutcome::Done(n)) => {
            frame.set_return(n);
            SyscallReturn::Continue
        }
        Ok(IoOutcome::Blocked) => {
            crate::smp::current_hart().set_current_task(None);
            SyscallReturn::Schedule
        }
        Err(err) => {
            frame.set_return(err.as_isize());
            SyscallReturn::Continue
        }
    }
}

pub fn write_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let outcome = caller().and_then(|who| {
        do_write(
            who.pid,
            Some(who.task),
            args[0] as i32,
            who.buf(args[1]),
            args[2],
        )
    });
    match outcome {
        Ok(IoOutcome::Done(n)) => {
            frame.set_return(n);
            SyscallReturn::Continue
        }
        Ok(IoOutcome::Blocked) => {
            crate::smp::current_hart().set_current_task(None);
            SyscallReturn::Schedule
        }
        Err(err) => {
            frame.set_return(err.as_isize());
            SyscallReturn::Continue
        }
    }
}

pub fn seek_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let file = fd_file(who.pid, args[0] as i32)?;
        let whence = SeekWhence::from_raw(args[2])?;
        file.seek(args[1] as i64, whence).map(|pos| pos as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn stat_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let file = fd_file(who.pid, args[0] as i32)?;
        let node = file.node.as_ref().ok_or(Error::new(Errno::EBADF))?;
        let stat = stat_of(node);
        uaccess::write_value(who.buf(args[1]), &stat)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

/// dup(fd, newfd): newfd < 0 picks the lowest free slot; otherwise the
/// slot is replaced dup2-style. The duplicate drops close-on-exec.
pub fn dup_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let newfd = args[1] as i32;
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        let file = process.resources.fds.get(args[0] as i32)?;
        let replace = newfd >= 0;
        process
            .resources
            .fds
            .put(newfd, FdFlags::empty(), file, replace)
            .map(|fd| fd as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn trunc_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let file = fd_file(who.pid, args[0] as i32)?;
        if !file.flags().is_writable() {
            return Err(Error::new(Errno::EBADF));
        }
        let node = file.node.as_ref().ok_or(Error::new(Errno::EBADF))?;
        node.trunc(args[1] as u64)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn chmod_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let path = read_path(&who, args[0])?;
        let cwd = cwd_of(who.pid)?;
        let node = vfs::resolve_path(&cwd, &path)?;
        let uid = processes()
            .get(who.pid)
            .map(|p| p.resources.uid)
            .ok_or(Error::new(Errno::ESRCH))?;
        let mut meta = node.meta.write();
        if uid != 0 && uid != meta.uid {
            return Err(Error::new(Errno::EPERM));
        }
        meta.mode = (meta.mode & !0o7777) | (args[1] as u32 & 0o7777);
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn chown_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let path = read_path(&who, args[0])?;
        let cwd = cwd_of(who.pid)?;
        let node = vfs::resolve_path(&cwd, &path)?;
        let uid = processes()
            .get(who.pid)
            .map(|p| p.resources.uid)
            .ok_or(Error::new(Errno::ESRCH))?;
        if uid != 0 {
            return Err(Error::new(Errno::EPERM));
        }
        let mut meta = node.meta.write();
        meta.uid = args[1] as u32;
        meta.gid = args[2] as u32;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

/// mount(source, target, fstype); the source is unused by ramfs.
pub fn mount_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let _source = read_path(&who, args[0])?;
        let target = read_path(&who, args[1])?;
        let fs_type = read_path(&who, args[2])?;
        do_mount(who.pid, &target, &fs_type)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn umount_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let target = read_path(&who, args[0])?;
        do_umount(who.pid, &target)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn readdir_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        do_readdir(who.pid, args[0] as i32, who.buf(args[1]), args[2])
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn chdir_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let path = read_path(&who, args[0])?;
        do_chdir(who.pid, &path)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn getcwd_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let cwd = cwd_of(who.pid)?;
        let needed = cwd.len() + 1;
        if args[1] < needed {
            return Err(Error::new(Errno::ERANGE));
        }
        uaccess::write_to(who.buf(args[0]), cwd.as_bytes())?;
        uaccess::write_to(who.buf(args[0] + cwd.len()), &[0])?;
        Ok(needed as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

/// pipe(fds_ptr): writes the two descriptors as a pair of i32s.
pub fn pipe_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let (read_fd, write_fd) = do_pipe(who.pid)?;
        let pair = [read_fd, write_fd];
        uaccess::write_value(who.buf(args[0]), &pair)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn mknod_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let path = read_path(&who, args[0])?;
        do_mknod(who.pid, &path, args[1] as u32, args[2] as u32)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn umask_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        let old = process.resources.umask;
        process.resources.umask = args[0] as u32 & 0o777;
        Ok(old as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

const F_DUPFD: usize = 0;
const F_GETFD: usize = 1;
const F_SETFD: usize = 2;
const F_GETFL: usize = 3;
const F_SETFL: usize = 4;

pub fn fcntl_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let fd = args[0] as i32;
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        match args[1] {
            F_DUPFD => {
                let file = process.resources.fds.get(fd)?;
                process
                    .resources
                    .fds
                    .put(-1, FdFlags::empty(), file, false)
                    .map(|fd| fd as isize)
            }
            F_GETFD => {
                let entry = process.resources.fds.entry(fd)?;
                Ok(entry.flags.bits() as isize)
            }
            F_SETFD => {
                let entry = process.resources.fds.entry_mut(fd)?;
                entry.flags = FdFlags::from_bits_truncate(args[2] as u32);
                Ok(0)
            }
            F_GETFL => {
                let file = process.resources.fds.get(fd)?;
                Ok(file.flags().bits() as isize)
            }
            F_SETFL => {
                let file = process.resources.fds.get(fd)?;
                let settable = OpenFlags::O_NONBLOCK | OpenFlags::O_APPEND;
                let requested = OpenFlags::from_bits_truncate(args[2] as u32) & settable;
                let keep = file.flags().difference(settable);
                file.set_flags(keep | requested);
                Ok(0)
            }
            _ => Err(Error::new(Errno::EINVAL)),
        }
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn ioctl_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let file = fd_file(who.pid, args[0] as i32)?;
        let node = file.node.as_ref().ok_or(Error::new(Errno::ENOTTY))?;
        node.ioctl(args[1], args[2]).map(|v| v as isize)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn isatty_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let file = fd_file(who.pid, args[0] as i32)?;
        match file.node_kind() {
            Some(NodeKind::CharDevice) => Ok(1),
            _ => Err(Error::new(Errno::ENOTTY)),
        }
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn link_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let old = read_path(&who, args[0])?;
        let new = read_path(&who, args[1])?;
        do_link(who.pid, &old, &new)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn unlink_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let path = read_path(&who, args[0])?;
        do_unlink(who.pid, &path)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn rename_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let old = read_path(&who, args[0])?;
        let new = read_path(&who, args[1])?;
        do_rename(who.pid, &old, &new)?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_heap;
    use crate::process::task::DEFAULT_PRIORITY;
    use crate::vfs::test_vfs::ensure_root;

    fn new_process() -> Pid {
        test_heap::ensure();
        ensure_root();
        crate::process::create_process(DEFAULT_PRIORITY, None).unwrap()
    }

    fn destroy(pid: Pid) {
        let mut procs = processes();
        let mut table = crate::process::tasks();
        if let Some(process) = procs.remove(pid) {
            let root = unsafe { &mut *process.memory.root };
            crate::process::process::free_user_pages(root);
            crate::mm::dealloc_page(process.memory.root as *mut u8);
            if let Some(task) = table.remove(process.main_task) {
                crate::process::task::free_task(task);
            }
        }
    }

    fn kernel_buf(data: &mut [u8]) -> VirtPtr {
        VirtPtr::kernel(data.as_mut_ptr() as usize)
    }

    #[test]
    fn open_write_seek_read_close() {
        let pid = new_process();
        let fd = do_open(
            pid,
            "/sys_file_a",
            OpenFlags::O_CREAT | OpenFlags::O_RDWR,
            0o644,
        )
        .unwrap();

        let payload = b"file syscall payload".to_vec();
        let mut src = payload.clone();
        match do_write(pid, None, fd, kernel_buf(&mut src), src.len()).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n as usize, payload.len()),
            IoOutcome::Blocked => panic!("regular file write blocked"),
        }

        let file = fd_file(pid, fd).unwrap();
        file.seek(0, SeekWhence::Set).unwrap();
        let mut back = alloc::vec![0u8; payload.len()];
        match do_read(pid, None, fd, kernel_buf(&mut back), back.len()).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n as usize, payload.len()),
            IoOutcome::Blocked => panic!("regular file read blocked"),
        }
        assert_eq!(back, payload);

        // O_EXCL on an existing file refuses.
        assert_eq!(
            do_open(
                pid,
                "/sys_file_a",
                OpenFlags::O_CREAT | OpenFlags::O_EXCL,
                0o644
            )
            .unwrap_err()
            .kind,
            Errno::EEXIST
        );

        {
            let mut procs = processes();
            procs
                .get_mut(pid)
                .unwrap()
                .resources
                .fds
                .close(fd)
                .unwrap();
        }
        assert_eq!(fd_file(pid, fd).unwrap_err().kind, Errno::EBADF);
        destroy(pid);
    }

    #[test]
    fn umask_applies_to_created_files() {
        let pid = new_process();
        {
            let mut procs = processes();
            procs.get_mut(pid).unwrap().resources.umask = 0o077;
        }
        let fd = do_open(
            pid,
            "/sys_umask_file",
            OpenFlags::O_CREAT | OpenFlags::O_RDWR,
            0o666,
        )
        .unwrap();
        let file = fd_file(pid, fd).unwrap();
        let mode = file.node.as_ref().unwrap().meta.read().mode;
        assert_eq!(mode & 0o777, 0o600);
        destroy(pid);
    }

    #[test]
    fn pipe_round_trip_through_descriptors() {
        let pid = new_process();
        let (read_fd, write_fd) = do_pipe(pid).unwrap();

        let mut message = b"through the pipe".to_vec();
        match do_write(pid, None, write_fd, kernel_buf(&mut message), message.len()).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n as usize, message.len()),
            IoOutcome::Blocked => panic!("small pipe write blocked"),
        }

        let mut sink = alloc::vec![0u8; message.len()];
        match do_read(pid, None, read_fd, kernel_buf(&mut sink), sink.len()).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n as usize, message.len()),
            IoOutcome::Blocked => panic!("pipe read with data blocked"),
        }
        assert_eq!(sink, message);

        // Reading the write end (and vice versa) is EBADF.
        let mut buf = [0u8; 4];
        assert_eq!(
            do_read(pid, None, write_fd, kernel_buf(&mut buf), 4)
                .unwrap_err()
                .kind,
            Errno::EBADF
        );

        // Closing the write end makes the empty pipe EOF.
        {
            let mut procs = processes();
            procs
                .get_mut(pid)
                .unwrap()
                .resources
                .fds
                .close(write_fd)
                .unwrap();
        }
        match do_read(pid, None, read_fd, kernel_buf(&mut buf), 4).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n, 0),
            IoOutcome::Blocked => panic!("EOF read blocked"),
        }
        destroy(pid);
    }

    #[test]
    fn readdir_packs_records() {
        let pid = new_process();
        do_open(
            pid,
            "/rd_dir_marker",
            OpenFlags::O_CREAT | OpenFlags::O_RDWR,
            0o644,
        )
        .unwrap();
        let dirfd = do_open(pid, "/", OpenFlags::O_DIRECTORY, 0).unwrap();
        let mut buf = alloc::vec![0u8; 4096];
        let n = do_readdir(pid, dirfd, kernel_buf(&mut buf), 4096).unwrap() as usize;
        assert!(n > 0);
        // First record is "." with the root ino.
        let namelen = buf[11] as usize;
        assert_eq!(&buf[12..12 + namelen], b".");
        // A second call from the stored position eventually returns 0.
        let mut total = n;
        loop {
            let n = do_readdir(pid, dirfd, kernel_buf(&mut buf), 4096).unwrap() as usize;
            if n == 0 {
                break;
            }
            total += n;
        }
        assert!(total >= 24);
        destroy(pid);
    }

    #[test]
    fn chdir_and_getcwd_state() {
        let pid = new_process();
        ensure_root()
            .create("cd_dir", NodeKind::Directory, 0o755)
            .unwrap();
        do_chdir(pid, "cd_dir").unwrap();
        assert_eq!(cwd_of(pid).unwrap(), "/cd_dir");
        // Relative resolution now starts at the new cwd.
        do_open(pid, "inner", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o644).unwrap();
        assert!(vfs::resolve_path("/", "/cd_dir/inner").is_ok());
        assert_eq!(
            do_chdir(pid, "inner").unwrap_err().kind,
            Errno::ENOTDIR
        );
        destroy(pid);
    }

    #[test]
    fn mknod_fifo_and_open_both_ends() {
        let pid = new_process();
        do_mknod(pid, "/sys_fifo", node::S_IFIFO | 0o644, 0).unwrap();
        let rfd = do_open(pid, "/sys_fifo", OpenFlags::O_RDONLY | OpenFlags::O_NONBLOCK, 0).unwrap();
        let wfd = do_open(pid, "/sys_fifo", OpenFlags::O_WRONLY | OpenFlags::O_NONBLOCK, 0).unwrap();
        let mut data = b"fifo bytes".to_vec();
        match do_write(pid, None, wfd, kernel_buf(&mut data), data.len()).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n as usize, data.len()),
            IoOutcome::Blocked => panic!("nonblocking fifo write blocked"),
        }
        let mut sink = alloc::vec![0u8; data.len()];
        match do_read(pid, None, rfd, kernel_buf(&mut sink), sink.len()).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n as usize, data.len()),
            IoOutcome::Blocked => panic!("nonblocking fifo read blocked"),
        }
        assert_eq!(sink, data);
        destroy(pid);
    }

    #[test]
    fn fork_child_writes_pipe_then_exits_parent_reaps() {
        use crate::process::wait::{try_wait, WaitOutcome};
        use crate::process::{exit_process, fork_process, tasks};

        let parent = new_process();
        let (read_fd, write_fd) = do_pipe(parent).unwrap();

        // The child inherits both descriptors with bumped refcounts.
        let (child, _child_task) = fork_process(parent).unwrap();
        {
            let procs = processes();
            assert_eq!(procs.get(child).unwrap().resources.fds.len(), 2);
        }

        let mut message = b"ok".to_vec();
        match do_write(child, None, write_fd, kernel_buf(&mut message), 2).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n, 2),
            IoOutcome::Blocked => panic!("tiny pipe write blocked"),
        }
        exit_process(child, 7).unwrap();

        // The parent still reads what the child wrote before dying.
        let mut sink = [0u8; 2];
        match do_read(parent, None, read_fd, kernel_buf(&mut sink), 2).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n, 2),
            IoOutcome::Blocked => panic!("pipe read with data blocked"),
        }
        assert_eq!(&sink, b"ok");

        let outcome = {
            let mut procs = processes();
            let mut table = tasks();
            try_wait(&mut procs, &mut table, parent)
        };
        assert_eq!(
            outcome,
            WaitOutcome::Reaped {
                pid: child,
                status: 7
            }
        );
        destroy(parent);
    }

    #[test]
    fn link_unlink_rename() {
        let pid = new_process();
        let fd = do_open(
            pid,
            "/ln_orig",
            OpenFlags::O_CREAT | OpenFlags::O_RDWR,
            0o644,
        )
        .unwrap();
        let mut text = b"linked data".to_vec();
        do_write(pid, None, fd, kernel_buf(&mut text), text.len()).unwrap();

        do_link(pid, "/ln_orig", "/ln_alias").unwrap();
        let alias = vfs::resolve_path("/", "/ln_alias").unwrap();
        assert_eq!(alias.meta.read().nlink, 2);

        do_unlink(pid, "/ln_orig").unwrap();
        assert!(vfs::resolve_path("/", "/ln_orig").is_err());
        assert_eq!(alias.meta.read().nlink, 1);

        do_rename(pid, "/ln_alias", "/ln_final").unwrap();
        assert!(vfs::resolve_path("/", "/ln_alias").is_err());
        let fd2 = do_open(pid, "/ln_final", OpenFlags::O_RDONLY, 0).unwrap();
        let mut back = alloc::vec![0u8; text.len()];
        match do_read(pid, None, fd2, kernel_buf(&mut back), back.len()).unwrap() {
            IoOutcome::Done(n) => assert_eq!(n as usize, text.len()),
            IoOutcome::Blocked => panic!("blocked"),
        }
        assert_eq!(back, text);
        destroy(pid);
    }
}
