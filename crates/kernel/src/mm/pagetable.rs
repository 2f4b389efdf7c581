/// Sv39 three-level page tables
///
/// Tables are pages themselves, allocated from the page allocator. A table
/// owns its child tables (non-leaf entries); leaf-mapped pages have
/// independent owners. Allocation failure while building a walk is
/// surfaced as ENOMEM and any intermediate tables installed by the failing
/// call are unwound.

use super::page::PAGE_SIZE;
use super::pagealloc::{dealloc_page, zalloc_page};
use crate::lib::error::{Errno, Error, Result};
use bitflags::bitflags;
use core::ptr::NonNull;

bitflags! {
    /// Sv39 PTE bits. `COPY` marks a copy-on-write leaf; it lives in the
    /// RSW field and is ignored by the hardware walker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
        const COPY     = 1 << 8;

        const RW  = Self::READ.bits() | Self::WRITE.bits();
        const RX  = Self::READ.bits() | Self::EXEC.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
        const AD  = Self::ACCESSED.bits() | Self::DIRTY.bits();
        const AD_R  = Self::AD.bits() | Self::READ.bits();
        const AD_RW = Self::AD.bits() | Self::RW.bits();
        const AD_RX = Self::AD.bits() | Self::RX.bits();
    }
}

/// A single 64-bit page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

const PTE_FLAG_MASK: usize = 0x3ff;
const PTE_PPN_MASK: usize = (1 << 44) - 1;

impl Pte {
    pub const INVALID: Pte = Pte(0);

    pub fn new(paddr: usize, flags: PteFlags) -> Self {
        Pte((((paddr >> 12) & PTE_PPN_MASK) << 10) | (flags.bits() & PTE_FLAG_MASK))
    }

    pub fn is_valid(&self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// A valid entry with any of R/W/X is a leaf; valid without them it
    /// points at a next-level table. Exactly one semantic per slot.
    pub fn is_leaf(&self) -> bool {
        self.0 & PteFlags::RWX.bits() != 0
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PTE_FLAG_MASK)
    }

    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !PTE_FLAG_MASK) | (flags.bits() & PTE_FLAG_MASK);
    }

    pub fn paddr(&self) -> usize {
        ((self.0 >> 10) & PTE_PPN_MASK) << 12
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Mapping levels: 0 = 4 KiB leaf, 1 = 2 MiB superleaf, 2 = 1 GiB superleaf.
pub const fn page_size(level: usize) -> usize {
    PAGE_SIZE << (9 * level)
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Pte; PAGE_TABLE_ENTRIES],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

const fn vpn(vaddr: usize) -> [usize; 3] {
    [
        (vaddr >> 12) & 0x1ff,
        (vaddr >> 21) & 0x1ff,
        (vaddr >> 30) & 0x1ff,
    ]
}

/// Allocate a zeroed page table. ENOMEM is surfaced, not asserted.
pub fn create_page_table() -> Result<NonNull<PageTable>> {
    let page = zalloc_page().ok_or(Error::with_details(Errno::ENOMEM, "page table allocation"))?;
    Ok(unsafe { NonNull::new_unchecked(page as *mut PageTable) })
}

/// Unmap everything below `root` and release the root itself.
///
/// # Safety
/// `root` must have been produced by `create_page_table` and must not be
/// referenced afterwards (nor live in any hart's satp).
pub unsafe fn free_page_table(root: NonNull<PageTable>) {
    unmap_all(root.as_ptr().as_mut().unwrap());
    dealloc_page(root.as_ptr() as *mut u8);
}

/// Install a mapping for `vaddr` -> `paddr` at the given level. Remapping
/// an existing leaf is an idempotent replacement. Both addresses must be
/// aligned to the level's page size and `flags` must carry at least one of
/// R/W/X.
pub fn map_page(
    root: &mut PageTable,
    vaddr: usize,
    paddr: usize,
    flags: PteFlags,
    level: usize,
) -> Result<()> {
    assert!(level <= 2, "bad mapping level");
    assert!(
        flags.intersects(PteFlags::RWX),
        "leaf mapping without R/W/X"
    );
    let align = page_size(level) - 1;
    assert!(vaddr & align == 0, "vaddr unaligned for level");
    assert!(paddr & align == 0, "paddr unaligned for level");

    let vpn = vpn(vaddr);
    let mut table: *mut PageTable = root;
    // Tables installed by this call, innermost last; unwound on failure.
    let mut installed: [Option<(*mut Pte, *mut PageTable)>; 2] = [None, None];
    let mut installed_count = 0;

    let mut lvl = 2;
    loop {
        let entry = unsafe { &mut (*table).entries[vpn[lvl]] };
        if lvl == level {
            // Final slot: must be invalid or already a leaf.
            assert!(
                !entry.is_valid() || entry.is_leaf(),
                "remap over a branch entry"
            );
            *entry = Pte::new(paddr, flags | PteFlags::VALID);
            return Ok(());
        }
        if !entry.is_valid() {
            match create_page_table() {
                Ok(child) => {
                    *entry = Pte::new(child.as_ptr() as usize, PteFlags::VALID);
                    installed[installed_count] = Some((entry as *mut Pte, child.as_ptr()));
                    installed_count += 1;
                }
                Err(err) => {
                    // Unwind the tables this call installed; they are
                    // empty apart from the chain built here.
                    for slot in installed.iter().take(installed_count).rev() {
                        if let Some((entry, child)) = slot {
                            unsafe {
                                (**entry).clear();
                                dealloc_page(*child as *mut u8);
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }
        let entry = unsafe { &(*table).entries[vpn[lvl]] };
        // Intermediate entries must remain non-leaf.
        assert!(!entry.is_leaf(), "branch slot holds a superleaf");
        table = entry.paddr() as *mut PageTable;
        lvl -= 1;
    }
}

fn table_is_empty(table: *const PageTable) -> bool {
    unsafe { (*table).entries.iter().all(|e| !e.is_valid()) }
}

/// Remove the mapping covering `vaddr`, then walk back up releasing any
/// intermediate table that became wholly invalid. Idempotent over absent
/// mappings.
pub fn unmap_page(root: &mut PageTable, vaddr: usize) {
    let vpn = vpn(vaddr);
    let mut tables: [*mut PageTable; 3] = [core::ptr::null_mut(); 3];
    tables[2] = root;
    let mut entries: [*mut Pte; 3] = [core::ptr::null_mut(); 3];

    let mut lvl = 2usize;
    loop {
        let entry = unsafe { &mut (*tables[lvl]).entries[vpn[lvl]] };
        entries[lvl] = entry;
        if !entry.is_valid() {
            return;
        }
        if entry.is_leaf() {
            entry.clear();
            // Ascend, freeing tables that are now empty.
            for i in lvl..2 {
                if table_is_empty(tables[i]) {
                    dealloc_page(tables[i] as *mut u8);
                    unsafe {
                        (*entries[i + 1]).clear();
                    }
                } else {
                    break;
                }
            }
            return;
        }
        assert!(lvl != 0, "level 0 cannot hold branches");
        tables[lvl - 1] = entry.paddr() as *mut PageTable;
        lvl -= 1;
    }
}

/// Find the leaf entry covering `vaddr`.
pub fn virt_to_entry<'a>(root: &'a mut PageTable, vaddr: usize) -> Option<&'a mut Pte> {
    let vpn = vpn(vaddr);
    let mut table: *mut PageTable = root;
    let mut lvl = 2usize;
    loop {
        let entry = unsafe { &mut (*table).entries[vpn[lvl]] };
        if !entry.is_valid() {
            return None;
        }
        if entry.is_leaf() {
            return Some(entry);
        }
        assert!(lvl != 0, "level 0 cannot hold branches");
        table = entry.paddr() as *mut PageTable;
        lvl -= 1;
    }
}

/// Software walk: physical address for `vaddr`, or None when unmapped.
pub fn translate(root: &PageTable, vaddr: usize) -> Option<usize> {
    let vpn = vpn(vaddr);
    let mut table: *const PageTable = root;
    let mut lvl = 2usize;
    loop {
        let entry = unsafe { &(*table).entries[vpn[lvl]] };
        if !entry.is_valid() {
            return None;
        }
        if entry.is_leaf() {
            let mask = page_size(lvl) - 1;
            return Some((entry.paddr() & !mask) | (vaddr & mask));
        }
        assert!(lvl != 0, "level 0 cannot hold branches");
        table = entry.paddr() as *const PageTable;
        lvl -= 1;
    }
}

/// Visit every leaf exactly once with its reconstructed virtual address
/// and mapping level.
pub fn all_pages_do(root: &mut PageTable, mut callback: impl FnMut(&mut Pte, usize, usize)) {
    for i in 0..PAGE_TABLE_ENTRIES {
        let entry_lv2 = &mut root.entries[i];
        if !entry_lv2.is_valid() {
            continue;
        }
        if entry_lv2.is_leaf() {
            callback(entry_lv2, i << 30, 2);
            continue;
        }
        let table_lv1 = entry_lv2.paddr() as *mut PageTable;
        for j in 0..PAGE_TABLE_ENTRIES {
            let entry_lv1 = unsafe { &mut (*table_lv1).entries[j] };
            if !entry_lv1.is_valid() {
                continue;
            }
            if entry_lv1.is_leaf() {
                callback(entry_lv1, (i << 30) | (j << 21), 1);
                continue;
            }
            let table_lv0 = entry_lv1.paddr() as *mut PageTable;
            for k in 0..PAGE_TABLE_ENTRIES {
                let entry_lv0 = unsafe { &mut (*table_lv0).entries[k] };
                if entry_lv0.is_valid() {
                    // No more branches below level 0.
                    assert!(entry_lv0.is_leaf());
                    callback(entry_lv0, (i << 30) | (j << 21) | (k << 12), 0);
                }
            }
        }
    }
}

/// Drop every mapping under `root`, releasing the intermediate tables but
/// not the leaf-mapped pages (those have independent owners).
pub fn unmap_all(root: &mut PageTable) {
    for i in 0..PAGE_TABLE_ENTRIES {
        let entry_lv2 = &mut root.entries[i];
        if entry_lv2.is_valid() && !entry_lv2.is_leaf() {
            let table_lv1 = entry_lv2.paddr() as *mut PageTable;
            for j in 0..PAGE_TABLE_ENTRIES {
                let entry_lv1 = unsafe { &(*table_lv1).entries[j] };
                if entry_lv1.is_valid() && !entry_lv1.is_leaf() {
                    dealloc_page(entry_lv1.paddr() as *mut u8);
                }
            }
            dealloc_page(table_lv1 as *mut u8);
        }
        entry_lv2.clear();
    }
}

/// Map `[from, to)` to contiguous physical addresses starting at `paddr`,
/// choosing the largest level whose alignment and length admit it and
/// splitting into head/middle/tail around the aligned middle. Ends are
/// first aligned outward to 4 KiB. On failure the whole requested range is
/// unmapped before the error is returned.
pub fn map_range(
    root: &mut PageTable,
    from: usize,
    to: usize,
    paddr: usize,
    flags: PteFlags,
) -> Result<()> {
    let start = from & !(PAGE_SIZE - 1);
    let end = (to + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    match try_map_range_at_level(root, start, end, paddr, flags, 2) {
        Ok(()) => Ok(()),
        Err(err) => {
            // unmap_range is idempotent over the never-mapped tail.
            unmap_range(root, start, end);
            Err(err)
        }
    }
}

fn try_map_range_at_level(
    root: &mut PageTable,
    from: usize,
    to: usize,
    paddr: usize,
    flags: PteFlags,
    level: usize,
) -> Result<()> {
    if from == to {
        return Ok(());
    }
    if level == 0 {
        return map_range_at_level(root, from, to, paddr, flags, 0);
    }
    let size = page_size(level);
    let start = (from + size - 1) & !(size - 1);
    let end = to & !(size - 1);
    if start < end && (to - from) > size {
        try_map_range_at_level(root, from, start, paddr, flags, level - 1)?;
        map_range_at_level(root, start, end, paddr + (start - from), flags, level)?;
        try_map_range_at_level(root, end, to, paddr + (end - from), flags, level - 1)
    } else {
        try_map_range_at_level(root, from, to, paddr, flags, level - 1)
    }
}

/// Map `[from, to)` with leaves of exactly the given level.
pub fn map_range_at_level(
    root: &mut PageTable,
    from: usize,
    to: usize,
    paddr: usize,
    flags: PteFlags,
    level: usize,
) -> Result<()> {
    let size = page_size(level);
    let mut offset = 0;
    while offset < to - from {
        map_page(root, from + offset, paddr + offset, flags, level)?;
        offset += size;
    }
    Ok(())
}

/// Remove all 4 KiB-granular mappings in `[from, to)`.
pub fn unmap_range(root: &mut PageTable, from: usize, to: usize) {
    let mut vaddr = from;
    while vaddr < to {
        unmap_page(root, vaddr);
        vaddr += PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_heap;

    fn new_root() -> NonNull<PageTable> {
        test_heap::ensure();
        create_page_table().expect("root table")
    }

    fn root_ref<'a>(root: &NonNull<PageTable>) -> &'a mut PageTable {
        unsafe { &mut *root.as_ptr() }
    }

    fn count_leaves(root: &mut PageTable) -> usize {
        let mut count = 0;
        all_pages_do(root, |_, _, _| count += 1);
        count
    }

    /// Number of child tables hanging below the root.
    fn count_tables(root: &PageTable) -> usize {
        let mut count = 0;
        for entry_lv2 in root.entries.iter() {
            if entry_lv2.is_valid() && !entry_lv2.is_leaf() {
                count += 1;
                let table_lv1 = entry_lv2.paddr() as *const PageTable;
                for j in 0..PAGE_TABLE_ENTRIES {
                    let entry_lv1 = unsafe { &(*table_lv1).entries[j] };
                    if entry_lv1.is_valid() && !entry_lv1.is_leaf() {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    #[test]
    fn map_translate_round_trip() {
        let root = new_root();
        let r = root_ref(&root);
        let frame = crate::mm::zalloc_page().unwrap() as usize;
        let vaddr = 0x10_0000_0000usize;
        map_page(r, vaddr, frame, PteFlags::AD_RW, 0).unwrap();
        for off in [0usize, 1, 0x7ff, 0xfff] {
            assert_eq!(translate(r, vaddr + off), Some(frame + off));
        }
        assert_eq!(translate(r, vaddr + PAGE_SIZE), None);
        unmap_page(r, vaddr);
        crate::mm::dealloc_page(frame as *mut u8);
        unsafe { free_page_table(root) };
    }

    #[test]
    fn superleaf_round_trip() {
        let root = new_root();
        let r = root_ref(&root);
        // Level-1 mapping: 2 MiB alignment on both sides. The "physical"
        // side need not be backed for a walk test.
        let vaddr = 0x20_0000usize * 3;
        let paddr = 0x20_0000usize * 7;
        map_page(r, vaddr, paddr, PteFlags::AD_RX, 1).unwrap();
        for off in [0usize, 0x1000, 0x1f_ffff] {
            assert_eq!(translate(r, vaddr + off), Some(paddr + off));
        }
        unmap_page(r, vaddr);
        assert_eq!(translate(r, vaddr), None);
        unsafe { free_page_table(root) };
    }

    #[test]
    fn remap_is_idempotent() {
        let root = new_root();
        let r = root_ref(&root);
        let vaddr = 0x8000_0000usize;
        map_page(r, vaddr, 0x8000_0000, PteFlags::AD_RW, 0).unwrap();
        let tables_before = count_tables(r);
        map_page(r, vaddr, 0x8000_0000, PteFlags::AD_RW, 0).unwrap();
        // Structurally identical: same leaf, no extra tables.
        assert_eq!(count_tables(r), tables_before);
        assert_eq!(count_leaves(r), 1);
        assert_eq!(translate(r, vaddr), Some(0x8000_0000));
        unsafe { free_page_table(root) };
    }

    #[test]
    fn unmap_frees_empty_intermediate_tables() {
        let root = new_root();
        let r = root_ref(&root);
        map_page(r, 0x1000, 0x1000, PteFlags::AD_RW, 0).unwrap();
        // Two intermediate tables were needed below the root.
        assert_eq!(count_tables(r), 2);
        unmap_page(r, 0x1000);
        assert_eq!(count_tables(r), 0);
        unmap_page(r, 0x1000); // idempotent
        assert_eq!(count_tables(r), 0);
        unsafe { free_page_table(root) };
    }

    #[test]
    fn range_mapping_uses_minimal_leaves() {
        let root = new_root();
        let r = root_ref(&root);
        // 4 MiB + 8 KiB range aligned to 2 MiB: expect 2 superleaves and a
        // 2-page tail rather than 1026 small leaves.
        let from = 0x4000_0000usize;
        let to = from + 2 * page_size(1) + 2 * PAGE_SIZE;
        map_range(r, from, to, from, PteFlags::AD_RW).unwrap();
        let mut leaves = alloc::vec::Vec::new();
        all_pages_do(r, |_, vaddr, _| leaves.push(vaddr));
        assert_eq!(leaves.len(), 4);

        // Same translation result as leaf-by-leaf mapping would give.
        let mut probe = from;
        while probe < to {
            assert_eq!(translate(r, probe), Some(probe));
            probe += PAGE_SIZE;
        }
        assert_eq!(translate(r, to), None);
        unmap_range(r, from, to);
        unsafe { free_page_table(root) };
    }

    #[test]
    fn unaligned_range_falls_to_small_leaves() {
        let root = new_root();
        let r = root_ref(&root);
        // Identity-offset range not admitting any superleaf.
        let from = 0x30_0000usize + PAGE_SIZE;
        let to = from + 5 * PAGE_SIZE;
        map_range(r, from, to, from, PteFlags::AD_RW).unwrap();
        assert_eq!(count_leaves(r), 5);
        unmap_range(r, from, to);
        unsafe { free_page_table(root) };
    }

    #[test]
    fn unmap_range_removes_superleaves() {
        let root = new_root();
        let r = root_ref(&root);
        let from = 0x8000_0000usize;
        // One 2 MiB superleaf plus a 4 KiB tail page.
        let to = from + page_size(1) + PAGE_SIZE;
        let flags = PteFlags::AD_RW.union(PteFlags::GLOBAL);
        map_range(r, from, to, from, flags).unwrap();
        assert_eq!(count_leaves(r), 2);
        unmap_range(r, from, to);
        assert_eq!(count_leaves(r), 0);
        assert_eq!(translate(r, from), None);
        unsafe { free_page_table(root) };
    }

    #[test]
    fn all_pages_do_reports_virtual_addresses() {
        let root = new_root();
        let r = root_ref(&root);
        let addrs = [0x1000usize, 0x2000, 0x40_0000, 0x8000_0000];
        for &va in &addrs {
            map_page(r, va, va, PteFlags::AD_RW.union(PteFlags::USER), 0).unwrap();
        }
        let mut seen = alloc::vec::Vec::new();
        all_pages_do(r, |entry, vaddr, level| {
            assert_eq!(level, 0);
            assert!(entry.flags().contains(PteFlags::USER));
            seen.push(vaddr);
        });
        seen.sort_unstable();
        assert_eq!(seen, addrs);
        for &va in &addrs {
            unmap_page(r, va);
        }
        unsafe { free_page_table(root) };
    }
}
