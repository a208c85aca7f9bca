// =============================================================================
// Helios — 4-Level Page Table Walker
// =============================================================================
//
// This module is the one place in the kernel that walks raw x86_64 page
// tables. Everything here operates on *physical* table addresses reached
// through the HHDM — page tables are never self-mapped.
//
//   PML4 (level 4) → PDPT (level 3) → PD (level 2) → PT (level 1) → page
//
// Each level is a 4 KiB table of 512 8-byte entries:
//
//   63  62..52  51..12       11..9   8   7   6   5   4   3   2   1   0
//   ┌───┬──────┬────────────┬───────┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//   │NX │ Avail│ Phys Addr  │ Avail │ G │PS │ D │ A │PCD│PWT│U/S│R/W│ P │
//   └───┴──────┴────────────┴───────┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//
// DESIGN:
//   - Every function takes the HHDM offset and a `FrameSource` explicitly.
//     The kernel passes the real bootloader offset and the PMM; unit tests
//     pass 0 and std-allocated page-aligned buffers, which makes the whole
//     walker host-testable.
//   - The VMM (`memory::vmm`) owns the global state (current CR3, NX
//     support, arenas) and wraps these functions; nothing else calls them.
//   - Intermediate tables are allocated on demand and zeroed here. For
//     lower-half mappings the USER bit is propagated to intermediate
//     entries so ring 3 can complete the walk.
//   - Mapping virtual address 0 is rejected: the null page stays unmapped
//     in every address space.
//
// =============================================================================

use bitflags::bitflags;
use core::ptr;

use crate::memory::address::{
    GIANT_PAGE_SIZE, HUGE_PAGE_SIZE, PAGE_SIZE, PhysAddr, VirtAddr,
};

/// Mask for the physical address bits of a page table entry (bits 12–51).
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// PML4 index of the first upper-half (kernel) entry.
pub const KERNEL_PML4_START: usize = 256;

bitflags! {
    /// Page table entry flags.
    ///
    /// These are the kernel's logical flags; they happen to sit at the
    /// hardware bit positions, but `encode` is still the only path from a
    /// request to an entry because NX must be dropped on CPUs without
    /// EFER.NXE support and HUGE must never reach a 4 KiB leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is valid; all other bits are ignored when clear.
        const PRESENT       = 1 << 0;
        /// Writes allowed. Clear means writes fault.
        const WRITABLE      = 1 << 1;
        /// Ring 3 may access. Must also be set on intermediate entries.
        const USER          = 1 << 2;
        /// Write-through caching, for MMIO where write ordering matters.
        const WRITETHROUGH  = 1 << 3;
        /// Caching disabled, for MMIO.
        const NOCACHE       = 1 << 4;
        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on a write (leaf entries only).
        const DIRTY         = 1 << 6;
        /// In PD entries: 2 MiB page. In PDPT entries: 1 GiB page.
        const HUGE          = 1 << 7;
        /// TLB entry survives CR3 switches (kernel mappings).
        const GLOBAL        = 1 << 8;
        /// Instruction fetch faults. Requires EFER.NXE.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Translates logical flags into leaf entry bits.
///
/// PRESENT is always set; NO_EXECUTE is silently dropped when the CPU has
/// no NX support; HUGE is managed by the mapper itself and stripped here.
fn encode(flags: PageTableFlags, nx_supported: bool) -> u64 {
    let mut bits = (flags | PageTableFlags::PRESENT).bits();
    bits &= !PageTableFlags::HUGE.bits();
    if !nx_supported {
        bits &= !PageTableFlags::NO_EXECUTE.bits();
    }
    bits
}

// =============================================================================
// Entry and table types
// =============================================================================

/// A single 8-byte entry in a page table.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    /// Huge leaf — only meaningful in PDPT (1 GiB) and PD (2 MiB) entries.
    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE.bits() != 0
    }

    #[inline]
    pub fn set_raw(&mut self, raw: u64) {
        self.0 = raw;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_present() {
            write!(f, "PTE({} {:?})", self.addr(), self.flags())
        } else {
            write!(f, "PTE(empty)")
        }
    }
}

/// A 4 KiB page table: 512 entries at any of the four levels.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; 512],
}

/// Borrows a page table through the HHDM.
///
/// # Safety
/// `phys` must be the physical address of a live page table and `hhdm`
/// the direct-map offset under which it is addressable.
unsafe fn table_mut<'a>(hhdm: u64, phys: PhysAddr) -> &'a mut PageTable {
    unsafe { &mut *phys.to_virt(hhdm).as_mut_ptr::<PageTable>() }
}

/// Zeroes one 4 KiB frame through the HHDM.
///
/// # Safety
/// `phys` must be an owned, mapped-via-HHDM frame.
unsafe fn zero_frame(hhdm: u64, phys: PhysAddr) {
    unsafe {
        ptr::write_bytes(phys.to_virt(hhdm).as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
    }
}

// =============================================================================
// Frame source seam
// =============================================================================

/// Where the walker gets frames for page tables (and returns them on
/// teardown). The kernel implements this on top of the PMM; tests provide
/// std-allocated frames.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Option<PhysAddr>;
    fn free_frame(&mut self, frame: PhysAddr);
}

// =============================================================================
// Errors
// =============================================================================

/// Why a mapping request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Virtual address 0, or a misaligned request.
    InvalidAddress,
    /// No frame available for a needed intermediate table.
    OutOfMemory,
    /// A huge mapping at a higher level blocks this walk.
    HugePageConflict,
}

/// Why an unmap request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// Nothing mapped at that address.
    NotMapped,
}

// =============================================================================
// Walking helpers
// =============================================================================

/// Returns the physical table the entry points to, allocating and zeroing
/// a fresh one when the entry is empty.
///
/// When `user` is set, intermediate entries get the USER bit (and it is
/// added to an existing entry if missing) so ring 3 can traverse down to
/// the leaf.
unsafe fn ensure_table(
    hhdm: u64,
    table_phys: PhysAddr,
    index: usize,
    user: bool,
    frames: &mut dyn FrameSource,
) -> Result<PhysAddr, MapError> {
    let table = unsafe { table_mut(hhdm, table_phys) };
    let entry = &mut table.entries[index];

    if entry.is_present() {
        if user && !entry.flags().contains(PageTableFlags::USER) {
            entry.set_raw(entry.raw() | PageTableFlags::USER.bits());
        }
        return Ok(entry.addr());
    }

    let frame = frames.alloc_frame().ok_or(MapError::OutOfMemory)?;
    unsafe { zero_frame(hhdm, frame) };

    let mut bits = frame.as_u64()
        | PageTableFlags::PRESENT.bits()
        | PageTableFlags::WRITABLE.bits();
    if user {
        bits |= PageTableFlags::USER.bits();
    }
    entry.set_raw(bits);
    Ok(frame)
}

// =============================================================================
// Mapping
// =============================================================================

/// Maps one page at `virt` to `phys` in the address space rooted at
/// `pml4`.
///
/// With `HUGE` requested and 1 GiB or 2 MiB alignment of both addresses,
/// the mapping terminates at the PDPT or PD level; otherwise a 4 KiB leaf
/// is written. A present leaf is overwritten with a warning. The caller is
/// responsible for TLB invalidation (the VMM flushes; a foreign address
/// space needs none).
///
/// # Safety
/// `pml4` must root a live address space reachable through `hhdm`, and
/// the mapping must not pull the kernel's own code or stacks out from
/// under it.
pub unsafe fn map_page_in(
    hhdm: u64,
    pml4: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageTableFlags,
    nx_supported: bool,
    frames: &mut dyn FrameSource,
) -> Result<(), MapError> {
    if virt.is_zero() {
        log::error!("refusing to map the null page");
        return Err(MapError::InvalidAddress);
    }

    let virt = virt.page_align_down();
    let phys = phys.page_align_down();
    let [pt_idx, pd_idx, pdpt_idx, pml4_idx] = virt.page_table_indices();
    let user = virt.is_user();
    let leaf_bits = encode(flags, nx_supported);

    let pdpt_phys =
        unsafe { ensure_table(hhdm, pml4, pml4_idx as usize, user, frames)? };

    // 1 GiB mapping: terminate at the PDPT when everything is aligned.
    if flags.contains(PageTableFlags::HUGE)
        && virt.as_u64() % GIANT_PAGE_SIZE == 0
        && phys.as_u64() % GIANT_PAGE_SIZE == 0
    {
        let pdpt = unsafe { table_mut(hhdm, pdpt_phys) };
        let entry = &mut pdpt.entries[pdpt_idx as usize];
        if entry.is_present() {
            log::warn!("{} already mapped, overwriting 1 GiB entry", virt);
        }
        entry.set_raw(phys.as_u64() | leaf_bits | PageTableFlags::HUGE.bits());
        return Ok(());
    }

    {
        let pdpt = unsafe { table_mut(hhdm, pdpt_phys) };
        let entry = pdpt.entries[pdpt_idx as usize];
        if entry.is_present() && entry.is_huge() {
            return Err(MapError::HugePageConflict);
        }
    }
    let pd_phys =
        unsafe { ensure_table(hhdm, pdpt_phys, pdpt_idx as usize, user, frames)? };

    // 2 MiB mapping: terminate at the PD.
    if flags.contains(PageTableFlags::HUGE)
        && virt.as_u64() % HUGE_PAGE_SIZE == 0
        && phys.as_u64() % HUGE_PAGE_SIZE == 0
    {
        let pd = unsafe { table_mut(hhdm, pd_phys) };
        let entry = &mut pd.entries[pd_idx as usize];
        if entry.is_present() {
            log::warn!("{} already mapped, overwriting 2 MiB entry", virt);
        }
        entry.set_raw(phys.as_u64() | leaf_bits | PageTableFlags::HUGE.bits());
        return Ok(());
    }

    {
        let pd = unsafe { table_mut(hhdm, pd_phys) };
        let entry = pd.entries[pd_idx as usize];
        if entry.is_present() && entry.is_huge() {
            return Err(MapError::HugePageConflict);
        }
    }
    let pt_phys =
        unsafe { ensure_table(hhdm, pd_phys, pd_idx as usize, user, frames)? };

    let pt = unsafe { table_mut(hhdm, pt_phys) };
    let leaf = &mut pt.entries[pt_idx as usize];
    if leaf.is_present() {
        log::warn!("{} already mapped to {}, overwriting", virt, leaf.addr());
    }
    leaf.set_raw(phys.as_u64() | leaf_bits);
    Ok(())
}

/// Unmaps the page at `virt`, returning the physical address it mapped.
///
/// Huge mappings are cleared whole. Intermediate tables are never freed
/// here (there is no per-table refcount; teardown happens in
/// `delete_address_space`). The caller invalidates the TLB.
///
/// # Safety
/// As for `map_page_in`.
pub unsafe fn unmap_page_in(
    hhdm: u64,
    pml4: PhysAddr,
    virt: VirtAddr,
) -> Result<PhysAddr, UnmapError> {
    let virt = virt.page_align_down();
    let [pt_idx, pd_idx, pdpt_idx, pml4_idx] = virt.page_table_indices();

    let pml4_table = unsafe { table_mut(hhdm, pml4) };
    let pml4_entry = pml4_table.entries[pml4_idx as usize];
    if !pml4_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }

    let pdpt = unsafe { table_mut(hhdm, pml4_entry.addr()) };
    let pdpt_entry = &mut pdpt.entries[pdpt_idx as usize];
    if !pdpt_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }
    if pdpt_entry.is_huge() {
        let base = pdpt_entry.addr();
        pdpt_entry.clear();
        return Ok(base);
    }

    let pd = unsafe { table_mut(hhdm, pdpt_entry.addr()) };
    let pd_entry = &mut pd.entries[pd_idx as usize];
    if !pd_entry.is_present() {
        return Err(UnmapError::NotMapped);
    }
    if pd_entry.is_huge() {
        let base = pd_entry.addr();
        pd_entry.clear();
        return Ok(base);
    }

    let pt = unsafe { table_mut(hhdm, pd_entry.addr()) };
    let leaf = &mut pt.entries[pt_idx as usize];
    if !leaf.is_present() {
        return Err(UnmapError::NotMapped);
    }
    let base = leaf.addr();
    leaf.clear();
    Ok(base)
}

/// Walks the tables and returns the physical address `virt` translates
/// to, including the page offset. Handles 4 KiB, 2 MiB and 1 GiB leaves.
///
/// # Safety
/// `pml4` must root a live address space reachable through `hhdm`.
pub unsafe fn translate_in(hhdm: u64, pml4: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let [pt_idx, pd_idx, pdpt_idx, pml4_idx] = virt.page_table_indices();

    let pml4_table = unsafe { table_mut(hhdm, pml4) };
    let pml4_entry = pml4_table.entries[pml4_idx as usize];
    if !pml4_entry.is_present() {
        return None;
    }

    let pdpt = unsafe { table_mut(hhdm, pml4_entry.addr()) };
    let pdpt_entry = pdpt.entries[pdpt_idx as usize];
    if !pdpt_entry.is_present() {
        return None;
    }
    if pdpt_entry.is_huge() {
        let base = pdpt_entry.raw() & ADDR_MASK & !(GIANT_PAGE_SIZE - 1);
        return Some(PhysAddr::new(base + (virt.as_u64() & (GIANT_PAGE_SIZE - 1))));
    }

    let pd = unsafe { table_mut(hhdm, pdpt_entry.addr()) };
    let pd_entry = pd.entries[pd_idx as usize];
    if !pd_entry.is_present() {
        return None;
    }
    if pd_entry.is_huge() {
        let base = pd_entry.raw() & ADDR_MASK & !(HUGE_PAGE_SIZE - 1);
        return Some(PhysAddr::new(base + (virt.as_u64() & (HUGE_PAGE_SIZE - 1))));
    }

    let pt = unsafe { table_mut(hhdm, pd_entry.addr()) };
    let leaf = pt.entries[pt_idx as usize];
    if !leaf.is_present() {
        return None;
    }
    Some(PhysAddr::new(leaf.addr().as_u64() + virt.page_offset() as u64))
}

/// Whether `virt` currently translates to anything.
///
/// # Safety
/// As for `translate_in`.
#[allow(dead_code)]
pub unsafe fn is_mapped_in(hhdm: u64, pml4: PhysAddr, virt: VirtAddr) -> bool {
    unsafe { translate_in(hhdm, pml4, virt) }.is_some()
}

/// Returns the raw leaf entry covering `virt`, for diagnostics and tests.
///
/// # Safety
/// As for `translate_in`.
#[allow(dead_code)]
pub unsafe fn leaf_entry_in(hhdm: u64, pml4: PhysAddr, virt: VirtAddr) -> Option<u64> {
    let [pt_idx, pd_idx, pdpt_idx, pml4_idx] = virt.page_table_indices();

    let pml4_table = unsafe { table_mut(hhdm, pml4) };
    let pml4_entry = pml4_table.entries[pml4_idx as usize];
    if !pml4_entry.is_present() {
        return None;
    }
    let pdpt = unsafe { table_mut(hhdm, pml4_entry.addr()) };
    let pdpt_entry = pdpt.entries[pdpt_idx as usize];
    if !pdpt_entry.is_present() {
        return None;
    }
    if pdpt_entry.is_huge() {
        return Some(pdpt_entry.raw());
    }
    let pd = unsafe { table_mut(hhdm, pdpt_entry.addr()) };
    let pd_entry = pd.entries[pd_idx as usize];
    if !pd_entry.is_present() {
        return None;
    }
    if pd_entry.is_huge() {
        return Some(pd_entry.raw());
    }
    let pt = unsafe { table_mut(hhdm, pd_entry.addr()) };
    let leaf = pt.entries[pt_idx as usize];
    leaf.is_present().then_some(leaf.raw())
}

// =============================================================================
// Address-space surgery
// =============================================================================

/// Creates a fresh address space: a zeroed PML4 whose upper half (entries
/// 256–511) is copied by value from `kernel_pml4`, so kernel virtual
/// addresses resolve identically in every address space.
///
/// # Safety
/// `kernel_pml4` must be the live kernel PML4 reachable through `hhdm`.
pub unsafe fn create_address_space(
    hhdm: u64,
    kernel_pml4: PhysAddr,
    frames: &mut dyn FrameSource,
) -> Option<PhysAddr> {
    let new_pml4 = frames.alloc_frame()?;
    unsafe { zero_frame(hhdm, new_pml4) };

    let src = unsafe { table_mut(hhdm, kernel_pml4) };
    let dst = unsafe { table_mut(hhdm, new_pml4) };
    for i in KERNEL_PML4_START..512 {
        dst.entries[i] = src.entries[i];
    }
    Some(new_pml4)
}

/// Tears down the lower (user) half of an address space and frees the
/// PML4 itself.
///
/// Every present 4 KiB leaf frame is returned to the frame source along
/// with every intermediate table — a terminated task's code, stack, heap
/// and guard frames all come back here. Huge leaves are cleared but their
/// frames are not freed (the kernel never hands huge frames to a single
/// owner). Returns `(tables_freed, leaf_frames_freed)`.
///
/// # Safety
/// `pml4` must not be the active address space, and nothing may be using
/// any mapping in its lower half.
pub unsafe fn delete_address_space(
    hhdm: u64,
    pml4: PhysAddr,
    frames: &mut dyn FrameSource,
) -> (usize, usize) {
    let mut tables = 0usize;
    let mut leaves = 0usize;

    let pml4_table = unsafe { table_mut(hhdm, pml4) };
    for pml4_idx in 0..KERNEL_PML4_START {
        let pml4_entry = pml4_table.entries[pml4_idx];
        if !pml4_entry.is_present() {
            continue;
        }
        let pdpt_phys = pml4_entry.addr();
        let pdpt = unsafe { table_mut(hhdm, pdpt_phys) };
        for pdpt_idx in 0..512 {
            let pdpt_entry = pdpt.entries[pdpt_idx];
            if !pdpt_entry.is_present() || pdpt_entry.is_huge() {
                continue;
            }
            let pd_phys = pdpt_entry.addr();
            let pd = unsafe { table_mut(hhdm, pd_phys) };
            for pd_idx in 0..512 {
                let pd_entry = pd.entries[pd_idx];
                if !pd_entry.is_present() || pd_entry.is_huge() {
                    continue;
                }
                let pt_phys = pd_entry.addr();
                let pt = unsafe { table_mut(hhdm, pt_phys) };
                for pt_idx in 0..512 {
                    let leaf = pt.entries[pt_idx];
                    if leaf.is_present() {
                        frames.free_frame(leaf.addr());
                        leaves += 1;
                    }
                }
                frames.free_frame(pt_phys);
                tables += 1;
            }
            frames.free_frame(pd_phys);
            tables += 1;
        }
        frames.free_frame(pdpt_phys);
        tables += 1;
    }
    frames.free_frame(pml4);
    tables += 1;

    (tables, leaves)
}

/// Deep-copies the lower half of `src_pml4` into a new address space:
/// fresh frames, identical bytes, identical flags. The upper half is
/// shared by value as in `create_address_space`. This is the machinery
/// behind `fork`.
///
/// On failure the partially built space is deleted and `None` returned.
///
/// # Safety
/// `src_pml4` must root a live, quiescent address space reachable through
/// `hhdm`.
pub unsafe fn clone_address_space(
    hhdm: u64,
    src_pml4: PhysAddr,
    frames: &mut dyn FrameSource,
) -> Option<PhysAddr> {
    let new_pml4 = unsafe { create_address_space(hhdm, src_pml4, frames)? };

    let src_table = unsafe { table_mut(hhdm, src_pml4) };
    for pml4_idx in 0..KERNEL_PML4_START {
        let pml4_entry = src_table.entries[pml4_idx];
        if !pml4_entry.is_present() {
            continue;
        }
        let pdpt = unsafe { table_mut(hhdm, pml4_entry.addr()) };
        for pdpt_idx in 0..512 {
            let pdpt_entry = pdpt.entries[pdpt_idx];
            if !pdpt_entry.is_present() {
                continue;
            }
            if pdpt_entry.is_huge() {
                log::warn!("fork: skipping 1 GiB user mapping");
                continue;
            }
            let pd = unsafe { table_mut(hhdm, pdpt_entry.addr()) };
            for pd_idx in 0..512 {
                let pd_entry = pd.entries[pd_idx];
                if !pd_entry.is_present() {
                    continue;
                }
                if pd_entry.is_huge() {
                    log::warn!("fork: skipping 2 MiB user mapping");
                    continue;
                }
                let pt = unsafe { table_mut(hhdm, pd_entry.addr()) };
                for pt_idx in 0..512 {
                    let leaf = pt.entries[pt_idx];
                    if !leaf.is_present() {
                        continue;
                    }

                    let virt = VirtAddr::new(
                        ((pml4_idx as u64) << 39)
                            | ((pdpt_idx as u64) << 30)
                            | ((pd_idx as u64) << 21)
                            | ((pt_idx as u64) << 12),
                    );

                    let copy = match frames.alloc_frame() {
                        Some(f) => f,
                        None => {
                            unsafe { delete_address_space(hhdm, new_pml4, frames) };
                            return None;
                        }
                    };
                    unsafe {
                        ptr::copy_nonoverlapping(
                            leaf.addr().to_virt(hhdm).as_ptr::<u8>(),
                            copy.to_virt(hhdm).as_mut_ptr::<u8>(),
                            PAGE_SIZE as usize,
                        );
                    }

                    // Preserve the source entry's flag bits verbatim; NX
                    // passed through raw, so no re-encoding is needed.
                    let flag_bits = leaf.raw() & !ADDR_MASK;
                    let map_result = unsafe {
                        map_raw_leaf(hhdm, new_pml4, virt, copy, flag_bits, frames)
                    };
                    if map_result.is_err() {
                        frames.free_frame(copy);
                        unsafe { delete_address_space(hhdm, new_pml4, frames) };
                        return None;
                    }
                }
            }
        }
    }

    Some(new_pml4)
}

/// Writes a 4 KiB leaf with pre-encoded flag bits (used by the clone walk
/// to preserve flags exactly).
unsafe fn map_raw_leaf(
    hhdm: u64,
    pml4: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flag_bits: u64,
    frames: &mut dyn FrameSource,
) -> Result<(), MapError> {
    let [pt_idx, pd_idx, pdpt_idx, pml4_idx] = virt.page_table_indices();
    let user = virt.is_user();

    let pdpt_phys = unsafe { ensure_table(hhdm, pml4, pml4_idx as usize, user, frames)? };
    let pd_phys = unsafe { ensure_table(hhdm, pdpt_phys, pdpt_idx as usize, user, frames)? };
    let pt_phys = unsafe { ensure_table(hhdm, pd_phys, pd_idx as usize, user, frames)? };

    let pt = unsafe { table_mut(hhdm, pt_phys) };
    pt.entries[pt_idx as usize].set_raw(phys.as_u64() | flag_bits);
    Ok(())
}

// =============================================================================
// Host tests
// =============================================================================
//
// "Physical" frames are std-allocated 4 KiB-aligned buffers and the HHDM
// offset is zero, so a PhysAddr is literally the buffer's pointer value.
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const HHDM: u64 = 0;

    struct TestFrames {
        live: Vec<u64>,
        freed: Vec<u64>,
    }

    impl TestFrames {
        fn new() -> Self {
            Self {
                live: Vec::new(),
                freed: Vec::new(),
            }
        }

        fn layout() -> Layout {
            Layout::from_size_align(PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap()
        }
    }

    impl FrameSource for TestFrames {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            let ptr = unsafe { alloc_zeroed(Self::layout()) };
            assert!(!ptr.is_null());
            self.live.push(ptr as u64);
            Some(PhysAddr::new(ptr as u64))
        }

        fn free_frame(&mut self, frame: PhysAddr) {
            self.freed.push(frame.as_u64());
            if let Some(pos) = self.live.iter().position(|&p| p == frame.as_u64()) {
                self.live.swap_remove(pos);
                unsafe { dealloc(frame.as_u64() as *mut u8, Self::layout()) };
            }
        }
    }

    impl Drop for TestFrames {
        fn drop(&mut self) {
            for &ptr in &self.live {
                unsafe { dealloc(ptr as *mut u8, Self::layout()) };
            }
        }
    }

    fn new_space(frames: &mut TestFrames) -> PhysAddr {
        let pml4 = frames.alloc_frame().unwrap();
        unsafe { zero_frame(HHDM, pml4) };
        pml4
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);
        let target = frames.alloc_frame().unwrap();
        let virt = VirtAddr::new(0x40_0000);

        unsafe {
            map_page_in(
                HHDM,
                pml4,
                virt,
                target,
                PageTableFlags::WRITABLE | PageTableFlags::USER,
                true,
                &mut frames,
            )
            .unwrap();

            assert!(is_mapped_in(HHDM, pml4, virt));
            assert_eq!(translate_in(HHDM, pml4, virt), Some(target));
            // Offsets within the page carry through the translation.
            assert_eq!(
                translate_in(HHDM, pml4, virt + 0x123),
                Some(target + 0x123)
            );

            assert_eq!(unmap_page_in(HHDM, pml4, virt), Ok(target));
            assert!(!is_mapped_in(HHDM, pml4, virt));
            assert_eq!(translate_in(HHDM, pml4, virt), None);
            assert_eq!(unmap_page_in(HHDM, pml4, virt), Err(UnmapError::NotMapped));
        }
    }

    #[test]
    fn null_page_is_rejected() {
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);
        let target = frames.alloc_frame().unwrap();
        let err = unsafe {
            map_page_in(
                HHDM,
                pml4,
                VirtAddr::zero(),
                target,
                PageTableFlags::WRITABLE,
                true,
                &mut frames,
            )
        };
        assert_eq!(err, Err(MapError::InvalidAddress));
    }

    #[test]
    fn user_bit_propagates_to_intermediate_levels() {
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);
        let target = frames.alloc_frame().unwrap();
        let virt = VirtAddr::new(0x40_0000);

        unsafe {
            map_page_in(
                HHDM,
                pml4,
                virt,
                target,
                PageTableFlags::WRITABLE | PageTableFlags::USER,
                true,
                &mut frames,
            )
            .unwrap();

            let pml4_table = table_mut(HHDM, pml4);
            let entry = pml4_table.entries[0];
            assert!(entry.flags().contains(PageTableFlags::USER));
            assert!(entry.flags().contains(PageTableFlags::WRITABLE));
        }
    }

    #[test]
    fn nx_is_dropped_without_cpu_support() {
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);
        let target = frames.alloc_frame().unwrap();
        let virt = VirtAddr::new(0x40_0000);

        unsafe {
            map_page_in(
                HHDM,
                pml4,
                virt,
                target,
                PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                false,
                &mut frames,
            )
            .unwrap();
            let raw = leaf_entry_in(HHDM, pml4, virt).unwrap();
            assert_eq!(raw & PageTableFlags::NO_EXECUTE.bits(), 0);
        }

        // And preserved when supported.
        let virt2 = VirtAddr::new(0x40_1000);
        unsafe {
            map_page_in(
                HHDM,
                pml4,
                virt2,
                target,
                PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                true,
                &mut frames,
            )
            .unwrap();
            let raw = leaf_entry_in(HHDM, pml4, virt2).unwrap();
            assert_ne!(raw & PageTableFlags::NO_EXECUTE.bits(), 0);
        }
    }

    #[test]
    fn present_leaf_is_overwritten() {
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);
        let first = frames.alloc_frame().unwrap();
        let second = frames.alloc_frame().unwrap();
        let virt = VirtAddr::new(0x40_0000);

        unsafe {
            map_page_in(HHDM, pml4, virt, first, PageTableFlags::WRITABLE, true, &mut frames)
                .unwrap();
            map_page_in(HHDM, pml4, virt, second, PageTableFlags::WRITABLE, true, &mut frames)
                .unwrap();
            assert_eq!(translate_in(HHDM, pml4, virt), Some(second));
        }
    }

    #[test]
    fn huge_2mib_mapping() {
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);
        // A fake physical base with 2 MiB alignment; never dereferenced.
        let phys = PhysAddr::new(0x4000_0000);
        let virt = VirtAddr::new(0x20_0000);

        unsafe {
            map_page_in(
                HHDM,
                pml4,
                virt,
                phys,
                PageTableFlags::WRITABLE | PageTableFlags::HUGE,
                true,
                &mut frames,
            )
            .unwrap();

            let raw = leaf_entry_in(HHDM, pml4, virt).unwrap();
            assert_ne!(raw & PageTableFlags::HUGE.bits(), 0);
            assert_eq!(
                translate_in(HHDM, pml4, virt + 0x12_3456),
                Some(phys + 0x12_3456)
            );
            // Mapping a 4 KiB page under the huge leaf is refused.
            let target = frames.alloc_frame().unwrap();
            assert_eq!(
                map_page_in(
                    HHDM,
                    pml4,
                    virt + PAGE_SIZE,
                    target,
                    PageTableFlags::WRITABLE,
                    true,
                    &mut frames
                ),
                Err(MapError::HugePageConflict)
            );
            assert_eq!(unmap_page_in(HHDM, pml4, virt), Ok(phys));
            assert!(!is_mapped_in(HHDM, pml4, virt));
        }
    }

    #[test]
    fn created_space_shares_kernel_half_by_value() {
        let mut frames = TestFrames::new();
        let kernel_pml4 = new_space(&mut frames);

        // Plant recognizable upper-half entries.
        unsafe {
            let table = table_mut(HHDM, kernel_pml4);
            for i in KERNEL_PML4_START..512 {
                table.entries[i].set_raw((i as u64) << 12 | 0x3);
            }
        }

        let space = unsafe { create_address_space(HHDM, kernel_pml4, &mut frames) }.unwrap();
        unsafe {
            let src = table_mut(HHDM, kernel_pml4);
            let dst = table_mut(HHDM, space);
            for i in 0..KERNEL_PML4_START {
                assert_eq!(dst.entries[i].raw(), 0, "lower half must start empty");
            }
            for i in KERNEL_PML4_START..512 {
                assert_eq!(dst.entries[i].raw(), src.entries[i].raw());
            }
        }
    }

    #[test]
    fn delete_returns_tables_and_leaf_frames() {
        let mut frames = TestFrames::new();
        let kernel_pml4 = new_space(&mut frames);
        let space = unsafe { create_address_space(HHDM, kernel_pml4, &mut frames) }.unwrap();

        let leaf = frames.alloc_frame().unwrap();
        unsafe {
            map_page_in(
                HHDM,
                space,
                VirtAddr::new(0x40_0000),
                leaf,
                PageTableFlags::WRITABLE | PageTableFlags::USER,
                true,
                &mut frames,
            )
            .unwrap();
        }

        let (tables, leaves) = unsafe { delete_address_space(HHDM, space, &mut frames) };
        // PT + PD + PDPT + PML4.
        assert_eq!(tables, 4);
        assert_eq!(leaves, 1);
        assert!(frames.freed.contains(&leaf.as_u64()));
        assert!(frames.freed.contains(&space.as_u64()));
    }

    #[test]
    fn clone_copies_bytes_into_fresh_frames() {
        let mut frames = TestFrames::new();
        let kernel_pml4 = new_space(&mut frames);
        let parent = unsafe { create_address_space(HHDM, kernel_pml4, &mut frames) }.unwrap();

        let code = frames.alloc_frame().unwrap();
        let data = frames.alloc_frame().unwrap();
        unsafe {
            ptr::write_bytes(code.to_virt(HHDM).as_mut_ptr::<u8>(), 0xAB, 64);
            ptr::write_bytes(data.to_virt(HHDM).as_mut_ptr::<u8>(), 0xCD, 64);
            // Read-only executable page and a writable NX page.
            map_page_in(
                HHDM,
                parent,
                VirtAddr::new(0x40_0000),
                code,
                PageTableFlags::USER,
                true,
                &mut frames,
            )
            .unwrap();
            map_page_in(
                HHDM,
                parent,
                VirtAddr::new(0x60_0000),
                data,
                PageTableFlags::USER | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE,
                true,
                &mut frames,
            )
            .unwrap();
        }

        let child = unsafe { clone_address_space(HHDM, parent, &mut frames) }.unwrap();

        unsafe {
            let child_code = translate_in(HHDM, child, VirtAddr::new(0x40_0000)).unwrap();
            let child_data = translate_in(HHDM, child, VirtAddr::new(0x60_0000)).unwrap();
            // Distinct frames...
            assert_ne!(child_code, code);
            assert_ne!(child_data, data);
            // ...with equal bytes...
            let orig = core::slice::from_raw_parts(code.to_virt(HHDM).as_ptr::<u8>(), 64);
            let copy = core::slice::from_raw_parts(child_code.to_virt(HHDM).as_ptr::<u8>(), 64);
            assert_eq!(orig, copy);
            // ...and identical flags.
            let parent_raw = leaf_entry_in(HHDM, parent, VirtAddr::new(0x60_0000)).unwrap();
            let child_raw = leaf_entry_in(HHDM, child, VirtAddr::new(0x60_0000)).unwrap();
            assert_eq!(parent_raw & !ADDR_MASK, child_raw & !ADDR_MASK);

            // Writes to the child are invisible to the parent.
            *child_data.to_virt(HHDM).as_mut_ptr::<u8>() = 0x5A;
            assert_eq!(*data.to_virt(HHDM).as_ptr::<u8>(), 0xCD);
        }
    }
}
