/// Memory syscalls: sbrk and protect.

use super::{caller, ret, SyscallArgs, SyscallReturn};
use crate::arch::TrapFrame;
use crate::lib::error::{Errno, Error, Result};
use crate::mm::pagetable::{all_pages_do, translate, unmap_page, PteFlags};
use crate::mm::{alloc_page, dealloc_page, map_page, page_align_up, PAGE_SIZE};
use crate::process::process::Process;
use crate::process::processes;

pub const PROT_READ: usize = 1 << 0;
pub const PROT_WRITE: usize = 1 << 1;
pub const PROT_EXEC: usize = 1 << 2;
const PROT_RWX: usize = PROT_READ | PROT_WRITE | PROT_EXEC;

/// Move the program break. Newly covered pages are mapped user-RW with
/// accessed and dirty preset; vacated pages are unmapped and returned to
/// the allocator. On allocation failure mid-expansion every page mapped
/// by this call is rolled back and -1 comes back to the caller. The break
/// never moves below `start_brk`.
pub(crate) fn change_process_break(process: &mut Process, change: isize) -> isize {
    let old_brk = process.memory.brk;
    let mut end = (old_brk as isize).saturating_add(change).max(0) as usize;
    if end < process.memory.start_brk {
        end = process.memory.start_brk;
    }
    let page_start = page_align_up(old_brk);
    let page_end = page_align_up(end);
    let root = unsafe { &mut *process.memory.root };

    if page_end > page_start {
        let mut vaddr = page_start;
        while vaddr < page_end {
            let page = match alloc_page() {
                Some(page) => page,
                None => {
                    // Roll back everything this call mapped.
                    let mut undo = page_start;
                    while undo < vaddr {
                        if let Some(pa) = translate(root, undo) {
                            dealloc_page(pa as *mut u8);
                        }
                        unmap_page(root, undo);
                        undo += PAGE_SIZE;
                    }
                    return -1;
                }
            };
            let flags = PteFlags::USER.union(PteFlags::AD_RW);
            if map_page(root, vaddr, page as usize, flags, 0).is_err() {
                dealloc_page(page);
                let mut undo = page_start;
                while undo < vaddr {
                    if let Some(pa) = translate(root, undo) {
                        dealloc_page(pa as *mut u8);
                    }
                    unmap_page(root, undo);
                    undo += PAGE_SIZE;
                }
                return -1;
            }
            vaddr += PAGE_SIZE;
        }
    } else {
        let mut vaddr = page_end;
        while vaddr < page_start {
            if let Some(pa) = translate(root, vaddr) {
                dealloc_page(pa as *mut u8);
            }
            unmap_page(root, vaddr);
            vaddr += PAGE_SIZE;
        }
    }
    process.memory.brk = end;
    old_brk as isize
}

/// Re-protect user leaves inside `[addr, addr + len)`, rounded outward to
/// page boundaries. Kernel mappings are untouched.
pub(crate) fn protect_range(process: &mut Process, addr: usize, len: usize, prot: usize) -> Result<()> {
    if prot & PROT_RWX == 0 {
        return Err(Error::new(Errno::EUNSUP));
    }
    if len == 0 {
        return Ok(());
    }
    let start = addr & !(PAGE_SIZE - 1);
    let end = page_align_up(addr + len);
    let root = unsafe { &mut *process.memory.root };
    all_pages_do(root, |entry, vaddr, _level| {
        if vaddr >= start && vaddr < end && entry.flags().contains(PteFlags::USER) {
            let mut flags = entry.flags().difference(PteFlags::RWX);
            if prot & PROT_READ != 0 {
                flags |= PteFlags::READ;
            }
            if prot & PROT_WRITE != 0 {
                flags |= PteFlags::WRITE;
            }
            if prot & PROT_EXEC != 0 {
                flags |= PteFlags::EXEC;
            }
            entry.set_flags(flags);
        }
    });
    Ok(())
}

pub fn sbrk_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().map(|who| {
        let mut procs = processes();
        match procs.get_mut(who.pid) {
            Some(process) => change_process_break(process, args[0] as isize),
            None => -1,
        }
    });
    ret(frame, result);
    SyscallReturn::Continue
}

pub fn protect_syscall(_is_kernel: bool, frame: &mut TrapFrame, args: &SyscallArgs) -> SyscallReturn {
    let result = caller().and_then(|who| {
        let mut procs = processes();
        let process = procs.get_mut(who.pid).ok_or(Error::new(Errno::ESRCH))?;
        protect_range(process, args[0], args[1], args[2])?;
        Ok(0)
    });
    ret(frame, result);
    SyscallReturn::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pagetable::virt_to_entry;
    use crate::mm::test_heap;
    use crate::process::process::{create_process, USER_HEAP_START};
    use crate::process::task::DEFAULT_PRIORITY;
    use crate::process::Pid;
    use crate::syscall::uaccess::{self, VirtPtr};

    fn new_process() -> Pid {
        test_heap::ensure();
        create_process(DEFAULT_PRIORITY, None).unwrap()
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

    #[test]
    fn sbrk_growth_maps_writable_pages_and_shrink_unmaps() {
        let pid = new_process();
        let mut procs = processes();
        let process = procs.get_mut(pid).unwrap();

        let old = change_process_break(process, (8 * PAGE_SIZE) as isize);
        assert_eq!(old as usize, USER_HEAP_START);
        assert_eq!(process.memory.brk, USER_HEAP_START + 8 * PAGE_SIZE);

        // The whole new range is writable through the user mapping.
        let root_ptr = process.memory.root;
        let data = [0xabu8; 64];
        for page in 0..8 {
            let va = USER_HEAP_START + page * PAGE_SIZE;
            uaccess::write_to(VirtPtr::user(va, root_ptr), &data).unwrap();
        }

        // Shrink by half; the vacated half faults, the rest still works.
        let old = change_process_break(process, -(4 * PAGE_SIZE as isize));
        assert_eq!(old as usize, USER_HEAP_START + 8 * PAGE_SIZE);
        assert_eq!(process.memory.brk, USER_HEAP_START + 4 * PAGE_SIZE);
        let root = unsafe { &mut *root_ptr };
        assert!(translate(root, USER_HEAP_START + 3 * PAGE_SIZE).is_some());
        assert!(translate(root, USER_HEAP_START + 4 * PAGE_SIZE).is_none());
        let mut buf = [0u8; 8];
        assert_eq!(
            uaccess::read_from(
                VirtPtr::user(USER_HEAP_START + 5 * PAGE_SIZE, root_ptr),
                &mut buf
            )
            .unwrap_err()
            .kind,
            Errno::EFAULT
        );

        drop(procs);
        destroy(pid);
    }

    #[test]
    fn sbrk_never_drops_below_start_brk() {
        let pid = new_process();
        {
            let mut procs = processes();
            let process = procs.get_mut(pid).unwrap();
            change_process_break(process, (2 * PAGE_SIZE) as isize);
            change_process_break(process, -(64 * PAGE_SIZE as isize));
            assert_eq!(process.memory.brk, USER_HEAP_START);
        }
        destroy(pid);
    }

    #[test]
    fn protect_drops_write_keeps_read() {
        let pid = new_process();
        {
            let mut procs = processes();
            let process = procs.get_mut(pid).unwrap();
            change_process_break(process, (2 * PAGE_SIZE) as isize);
            protect_range(process, USER_HEAP_START, PAGE_SIZE, PROT_READ).unwrap();

            let root = unsafe { &mut *process.memory.root };
            let entry = virt_to_entry(root, USER_HEAP_START).unwrap();
            assert!(entry.flags().contains(PteFlags::READ));
            assert!(!entry.flags().contains(PteFlags::WRITE));
            // The page after the protected range keeps its write bit.
            let entry = virt_to_entry(root, USER_HEAP_START + PAGE_SIZE).unwrap();
            assert!(entry.flags().contains(PteFlags::WRITE));

            // Writes through uaccess now fault; reads still succeed.
            let root_ptr = process.memory.root;
            let mut buf = [0u8; 4];
            assert!(
                uaccess::read_from(VirtPtr::user(USER_HEAP_START, root_ptr), &mut buf).is_ok()
            );
            assert_eq!(
                uaccess::write_to(VirtPtr::user(USER_HEAP_START, root_ptr), &buf)
                    .unwrap_err()
                    .kind,
                Errno::EFAULT
            );
        }
        destroy(pid);
    }

    #[test]
    fn protect_requires_some_permission_bits() {
        let pid = new_process();
        {
            let mut procs = processes();
            let process = procs.get_mut(pid).unwrap();
            assert_eq!(
                protect_range(process, USER_HEAP_START, PAGE_SIZE, 0)
                    .unwrap_err()
                    .kind,
                Errno::EUNSUP
            );
        }
        destroy(pid);
    }
}
