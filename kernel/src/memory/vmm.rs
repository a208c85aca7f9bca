// =============================================================================
// Helios — Virtual Memory Manager
// =============================================================================
//
// The VMM owns the global paging state and wraps the raw walker in
// `memory::paging` with policy:
//
//   - the HHDM offset and kernel PML4 captured at init
//   - NX support, probed once via CPUID 8000_0001h
//   - the notion of a *current* address space (what CR3 holds)
//   - two virtual allocation arenas (kernel half / user half) from which
//     `allocate` and `map_physical` carve ranges
//   - the page-fault handler (vector 14): report and halt, no demand
//     paging
//
// The kernel occupies the upper half. Its PML4 entries 256–511 are
// populated by the bootloader before init and copied by value into every
// address space created afterwards, so kernel virtual addresses resolve
// identically everywhere and CR3 can be switched freely inside the kernel.
//
// =============================================================================

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Once;

use crate::arch::cpu;
use crate::memory::address::{PAGE_SIZE, PhysAddr, VirtAddr};
use crate::memory::paging::{
    self, ADDR_MASK, FrameSource, MapError, PageTableFlags, UnmapError,
};
use crate::memory::pmm;
use crate::sync::SpinLock;
use crate::traps::{self, InterruptFrame};

/// Size of both virtual allocation arenas (256 MiB each).
const ARENA_SIZE: u64 = 0x1000_0000;

/// Kernel arena: direct-map window starting 256 MiB into physical memory.
const KERNEL_ARENA_PHYS_BASE: u64 = 0x1000_0000;

/// User arena: well above the classic ELF load address so images and
/// arena ranges cannot collide.
const USER_ARENA_BASE: u64 = 0x1000_0000;

/// Physical addresses below this are reachable through the HHDM without
/// a dedicated mapping; `map_physical` short-circuits them.
const HHDM_DIRECT_LIMIT: u64 = 0x1_0000_0000; // 4 GiB

// =============================================================================
// Global state
// =============================================================================

static INIT: Once<()> = Once::new();
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);
static KERNEL_PHYS_BASE: AtomicU64 = AtomicU64::new(0);
static KERNEL_VIRT_BASE: AtomicU64 = AtomicU64::new(0);
static NX_SUPPORTED: AtomicBool = AtomicBool::new(false);
static CURRENT_PML4: AtomicU64 = AtomicU64::new(0);

static KERNEL_ARENA: SpinLock<Arena> = SpinLock::new(Arena::empty());
static USER_ARENA: SpinLock<Arena> = SpinLock::new(Arena::empty());

/// The walker's frame source, backed by the PMM.
pub struct PmmFrames;

impl FrameSource for PmmFrames {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        pmm::alloc_frame()
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        pmm::free_frame(frame);
    }
}

// =============================================================================
// Initialization
// =============================================================================

/// Initializes the VMM.
///
/// Reads the active CR3 as the kernel PML4, records the HHDM offset and
/// kernel load addresses, probes NX support, sets up the allocation
/// arenas and installs the page-fault handler. Must run after `pmm::init`.
pub fn init(hhdm_offset: u64, kernel_phys_base: u64, kernel_virt_base: u64) {
    INIT.call_once(|| {
        HHDM_OFFSET.store(hhdm_offset, Ordering::Relaxed);
        KERNEL_PHYS_BASE.store(kernel_phys_base, Ordering::Relaxed);
        KERNEL_VIRT_BASE.store(kernel_virt_base, Ordering::Relaxed);

        let pml4 = cpu::read_cr3() & ADDR_MASK;
        KERNEL_PML4.store(pml4, Ordering::Relaxed);
        CURRENT_PML4.store(pml4, Ordering::Relaxed);

        let nx = cpu::has_nx();
        NX_SUPPORTED.store(nx, Ordering::Relaxed);

        *KERNEL_ARENA.lock() = Arena::new(hhdm_offset + KERNEL_ARENA_PHYS_BASE, ARENA_SIZE);
        *USER_ARENA.lock() = Arena::new(USER_ARENA_BASE, ARENA_SIZE);

        traps::register_handler(14, page_fault_handler);

        log::info!(
            "hhdm={:#x} kernel phys={:#x} virt={:#x} pml4={:#x} nx={}",
            hhdm_offset,
            kernel_phys_base,
            kernel_virt_base,
            pml4,
            nx
        );
    });
}

/// The HHDM offset recorded at init.
#[inline]
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Whether page table entries may carry the NX bit.
#[inline]
pub fn nx_supported() -> bool {
    NX_SUPPORTED.load(Ordering::Relaxed)
}

/// The kernel's own PML4 (the one live at boot).
#[inline]
pub fn kernel_pml4() -> PhysAddr {
    PhysAddr::new(KERNEL_PML4.load(Ordering::Relaxed))
}

// =============================================================================
// Page mapping (current address space)
// =============================================================================

/// Maps `virt` to `phys` in the current address space and invalidates the
/// TLB entry.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageTableFlags) -> Result<(), MapError> {
    let result = unsafe {
        paging::map_page_in(
            hhdm_offset(),
            current_address_space(),
            virt,
            phys,
            flags,
            nx_supported(),
            &mut PmmFrames,
        )
    };
    if result.is_ok() {
        flush_tlb_page(virt);
    }
    result
}

/// Unmaps `virt` from the current address space, returning the physical
/// address that was mapped. Intermediate tables are not freed.
pub fn unmap_page(virt: VirtAddr) -> Result<PhysAddr, UnmapError> {
    let result =
        unsafe { paging::unmap_page_in(hhdm_offset(), current_address_space(), virt) };
    match result {
        Ok(_) => flush_tlb_page(virt),
        Err(UnmapError::NotMapped) => {
            log::warn!("unmap of unmapped address {}", virt)
        }
    }
    result
}

/// Maps `count` pages starting at `virt`/`phys`.
///
/// When `HUGE` is requested and both addresses are 2 MiB aligned with at
/// least 512 pages to go, whole 2 MiB pages are emitted and the remainder
/// mapped 4 KiB at a time. On failure everything mapped so far is undone.
#[allow(dead_code)]
pub fn map_pages(
    virt: VirtAddr,
    phys: PhysAddr,
    count: usize,
    flags: PageTableFlags,
) -> Result<(), MapError> {
    let huge_eligible = flags.contains(PageTableFlags::HUGE)
        && virt.as_u64() % crate::memory::address::HUGE_PAGE_SIZE == 0
        && phys.as_u64() % crate::memory::address::HUGE_PAGE_SIZE == 0
        && count >= 512;

    let mut mapped: usize = 0; // pages successfully mapped, for rollback
    let result = (|| {
        if huge_eligible {
            let huge_pages = count / 512;
            let rest = count % 512;
            for i in 0..huge_pages {
                let off = i as u64 * crate::memory::address::HUGE_PAGE_SIZE;
                map_page(virt + off, phys + off, flags)?;
                mapped += 512;
            }
            let base_off = huge_pages as u64 * crate::memory::address::HUGE_PAGE_SIZE;
            for i in 0..rest {
                let off = base_off + i as u64 * PAGE_SIZE;
                map_page(virt + off, phys + off, flags - PageTableFlags::HUGE)?;
                mapped += 1;
            }
        } else {
            for i in 0..count {
                let off = i as u64 * PAGE_SIZE;
                map_page(virt + off, phys + off, flags - PageTableFlags::HUGE)?;
                mapped += 1;
            }
        }
        Ok(())
    })();

    if result.is_err() {
        // Undo in page units; unmap_page handles both leaf sizes.
        let mut off = 0u64;
        while off < mapped as u64 * PAGE_SIZE {
            let _ = unmap_page(virt + off);
            off += PAGE_SIZE;
        }
    }
    result
}

/// Unmaps `count` pages starting at `virt`. Absent pages are skipped.
pub fn unmap_pages(virt: VirtAddr, count: usize) {
    for i in 0..count {
        let _ = unmap_page(virt + i as u64 * PAGE_SIZE);
    }
}

/// Translates `virt` in the current address space.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    unsafe { paging::translate_in(hhdm_offset(), current_address_space(), virt) }
}

/// Whether `virt` is mapped in the current address space.
#[allow(dead_code)]
pub fn is_mapped(virt: VirtAddr) -> bool {
    translate(virt).is_some()
}

// =============================================================================
// Virtual allocation
// =============================================================================

/// Allocates `size` bytes of fresh, zeroed virtual memory.
///
/// The range comes from the kernel arena, or the user arena when `USER`
/// is set; every page is backed by its own frame from the PMM. On partial
/// failure everything acquired so far is released.
#[allow(dead_code)]
pub fn allocate(size: usize, flags: PageTableFlags) -> Option<VirtAddr> {
    if size == 0 {
        return None;
    }
    let size = (size as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let arena = if flags.contains(PageTableFlags::USER) {
        &USER_ARENA
    } else {
        &KERNEL_ARENA
    };

    let base = arena.lock().allocate(size)?;
    let virt = VirtAddr::new(base);

    if populate_range(virt, size, flags) {
        Some(virt)
    } else {
        arena.lock().free(base);
        None
    }
}

/// Maps fresh zeroed frames at the fixed range `[virt, virt+size)` in the
/// current address space (the program-break growth path). No arena
/// bookkeeping. Returns false and unwinds on failure.
pub fn allocate_at(virt: VirtAddr, size: u64, flags: PageTableFlags) -> bool {
    if size == 0 {
        return true;
    }
    let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    populate_range(virt, size, flags)
}

fn populate_range(virt: VirtAddr, size: u64, flags: PageTableFlags) -> bool {
    let pages = (size / PAGE_SIZE) as usize;
    let hhdm = hhdm_offset();
    for i in 0..pages {
        let page_virt = virt + i as u64 * PAGE_SIZE;
        let frame = match pmm::alloc_frame() {
            Some(f) => f,
            None => {
                release_range(virt, i);
                return false;
            }
        };
        // Zero through the HHDM before the page becomes visible.
        unsafe {
            core::ptr::write_bytes(frame.to_virt(hhdm).as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
        if map_page(page_virt, frame, flags - PageTableFlags::HUGE).is_err() {
            pmm::free_frame(frame);
            release_range(virt, i);
            return false;
        }
    }
    true
}

fn release_range(virt: VirtAddr, pages: usize) {
    for i in 0..pages {
        let page_virt = virt + i as u64 * PAGE_SIZE;
        if let Some(phys) = translate(page_virt) {
            let _ = unmap_page(page_virt);
            pmm::free_frame(phys.page_align_down());
        }
    }
}

/// Frees a range previously handed out by `allocate`: unmaps every page,
/// returns the frames to the PMM and releases the arena slot.
#[allow(dead_code)]
pub fn free(virt: VirtAddr, size: usize) {
    if size == 0 {
        return;
    }
    let size = (size as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    release_range(virt, (size / PAGE_SIZE) as usize);

    let arena = if virt.is_kernel() {
        &KERNEL_ARENA
    } else {
        &USER_ARENA
    };
    if arena.lock().free(virt.as_u64()).is_none() {
        log::warn!("free of {} with no matching arena slot", virt);
    }
}

// =============================================================================
// Physical mappings (MMIO)
// =============================================================================

/// Makes the physical range `[phys, phys+size)` addressable and returns
/// its virtual base.
///
/// Low physical memory is already covered by the HHDM and short-circuits
/// to `hhdm + phys`; higher ranges get a kernel-arena mapping with the
/// requested flags.
pub fn map_physical(phys: PhysAddr, size: usize, flags: PageTableFlags) -> Option<VirtAddr> {
    if phys.is_zero() || size == 0 {
        return None;
    }
    let size = (size as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

    if phys.as_u64() + size <= HHDM_DIRECT_LIMIT {
        return Some(phys.to_virt(hhdm_offset()));
    }

    let base = KERNEL_ARENA.lock().allocate(size)?;
    let virt = VirtAddr::new(base);
    let pages = (size / PAGE_SIZE) as usize;
    for i in 0..pages {
        let off = i as u64 * PAGE_SIZE;
        if map_page(virt + off, phys + off, flags).is_err() {
            unmap_pages(virt, i);
            KERNEL_ARENA.lock().free(base);
            return None;
        }
    }
    Some(virt)
}

/// Releases a `map_physical` mapping. Addresses inside the HHDM window
/// were never individually mapped and are left alone; the underlying
/// frames are never freed (they are MMIO or foreign).
pub fn unmap_physical(virt: VirtAddr, size: usize) {
    if size == 0 {
        return;
    }
    let hhdm = hhdm_offset();
    let raw = virt.as_u64();
    if raw >= hhdm && raw < hhdm + HHDM_DIRECT_LIMIT {
        return;
    }
    let size = (size as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    unmap_pages(virt, (size / PAGE_SIZE) as usize);
    if KERNEL_ARENA.lock().free(raw).is_none() {
        log::warn!("unmap_physical of {} with no matching arena slot", virt);
    }
}

// =============================================================================
// Address spaces
// =============================================================================

/// Creates a new address space with the kernel upper half shared.
pub fn create_address_space() -> Option<PhysAddr> {
    unsafe { paging::create_address_space(hhdm_offset(), kernel_pml4(), &mut PmmFrames) }
}

/// Destroys an address space, returning its lower-half frames and tables
/// to the PMM. Refuses the currently active space.
pub fn delete_address_space(pml4: PhysAddr) {
    if pml4.is_zero() {
        return;
    }
    if pml4 == current_address_space() {
        log::error!("refusing to delete the active address space {}", pml4);
        return;
    }
    let (tables, leaves) =
        unsafe { paging::delete_address_space(hhdm_offset(), pml4, &mut PmmFrames) };
    log::debug!("deleted address space {} ({} tables, {} frames)", pml4, tables, leaves);
}

/// Deep-copies the lower half of `src` into a new address space (fork).
pub fn clone_address_space(src: PhysAddr) -> Option<PhysAddr> {
    unsafe { paging::clone_address_space(hhdm_offset(), src, &mut PmmFrames) }
}

/// Switches CR3 to `pml4` and updates the current-space record.
pub fn switch_address_space(pml4: PhysAddr) {
    if pml4.is_zero() || pml4 == current_address_space() {
        return;
    }
    CURRENT_PML4.store(pml4.as_u64(), Ordering::Relaxed);
    // SAFETY: every address space shares the kernel upper half, so the
    // executing code and stack stay mapped across the switch.
    unsafe { cpu::write_cr3(pml4.as_u64()) };
}

/// The address space CR3 currently points at.
pub fn current_address_space() -> PhysAddr {
    PhysAddr::new(CURRENT_PML4.load(Ordering::Relaxed))
}

/// Invalidates the TLB entry for one page.
pub fn flush_tlb_page(virt: VirtAddr) {
    cpu::invlpg(virt.as_u64());
}

/// Flushes the entire TLB by reloading CR3.
#[allow(dead_code)]
pub fn flush_tlb_full() {
    // SAFETY: rewriting the current CR3 value is always valid.
    unsafe { cpu::write_cr3(cpu::read_cr3()) };
}

// =============================================================================
// Page fault handling
// =============================================================================

bitflags! {
    /// Page-fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy)]
    pub struct PageFaultCode: u64 {
        /// Set: protection violation. Clear: non-present page.
        const PROTECTION  = 1 << 0;
        /// The faulting access was a write.
        const WRITE       = 1 << 1;
        /// The fault originated in ring 3.
        const USER        = 1 << 2;
        /// A reserved bit was set in a page table entry.
        const RESERVED    = 1 << 3;
        /// The fault was an instruction fetch (NX violation).
        const INSTRUCTION = 1 << 4;
    }
}

/// Vector 14 handler: report everything useful, then halt.
///
/// There is no demand paging — any page fault is a kernel or user bug and
/// the most valuable thing to do is preserve the evidence.
fn page_fault_handler(frame: &mut InterruptFrame) {
    let fault_addr = VirtAddr::new(cpu::read_cr2());
    let code = PageFaultCode::from_bits_truncate(frame.error_code);
    let translation = translate(fault_addr);

    log::error!("PAGE FAULT");
    log::error!("  address:     {}", fault_addr);
    log::error!("  error code:  {:#x} ({:?})", frame.error_code, code);
    log::error!("  rip:         {:#018x}", frame.rip);
    match translation {
        Some(phys) => log::error!("  translation: {}", phys),
        None => log::error!("  translation: <not mapped>"),
    }
    log::error!("  cr3:         {:#x}", cpu::read_cr3());

    cpu::halt_forever();
}

// =============================================================================
// Arena — virtual range bookkeeping
// =============================================================================

const ARENA_SLOTS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Region {
    base: u64,
    size: u64,
}

/// A fixed-capacity first-fit allocator over one virtual range.
///
/// Used slots record live allocations; allocation finds the lowest gap
/// large enough for the request.
pub struct Arena {
    base: u64,
    size: u64,
    slots: [Option<Region>; ARENA_SLOTS],
}

impl Arena {
    const fn empty() -> Self {
        Self {
            base: 0,
            size: 0,
            slots: [None; ARENA_SLOTS],
        }
    }

    const fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            slots: [None; ARENA_SLOTS],
        }
    }

    /// Reserves the lowest `size`-byte gap, returning its base.
    fn allocate(&mut self, size: u64) -> Option<u64> {
        if size == 0 || size > self.size {
            return None;
        }
        let slot_idx = self.slots.iter().position(|s| s.is_none())?;

        // Walk candidates upward: start at the arena base and jump past
        // any region that overlaps. Terminates because each conflict
        // advances the candidate past one of at most 32 regions.
        let mut candidate = self.base;
        'search: loop {
            if candidate + size > self.base + self.size {
                log::warn!("arena exhausted for {} byte request", size);
                return None;
            }
            for region in self.slots.iter().flatten() {
                let overlap =
                    candidate < region.base + region.size && region.base < candidate + size;
                if overlap {
                    candidate = region.base + region.size;
                    continue 'search;
                }
            }
            break;
        }

        self.slots[slot_idx] = Some(Region {
            base: candidate,
            size,
        });
        Some(candidate)
    }

    /// Releases the region with the given base, returning its size.
    fn free(&mut self, base: u64) -> Option<u64> {
        for slot in self.slots.iter_mut() {
            if let Some(region) = slot
                && region.base == base
            {
                let size = region.size;
                *slot = None;
                return Some(size);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_first_fit_is_lowest_and_disjoint() {
        let mut arena = Arena::new(0x1000_0000, 0x10_0000);
        let a = arena.allocate(0x4000).unwrap();
        let b = arena.allocate(0x2000).unwrap();
        let c = arena.allocate(0x1000).unwrap();
        assert_eq!(a, 0x1000_0000);
        assert_eq!(b, 0x1000_4000);
        assert_eq!(c, 0x1000_6000);
    }

    #[test]
    fn arena_reuses_freed_gaps_first_fit() {
        let mut arena = Arena::new(0x1000_0000, 0x10_0000);
        let a = arena.allocate(0x4000).unwrap();
        let _b = arena.allocate(0x4000).unwrap();
        assert_eq!(arena.free(a), Some(0x4000));

        // A request that fits in the freed gap lands there; a larger one
        // goes after the live region.
        assert_eq!(arena.allocate(0x2000), Some(0x1000_0000));
        assert_eq!(arena.allocate(0x4000), Some(0x1000_8000));
    }

    #[test]
    fn arena_rejects_oversize_and_unknown_free() {
        let mut arena = Arena::new(0x1000_0000, 0x8000);
        assert_eq!(arena.allocate(0x1_0000), None);
        assert_eq!(arena.free(0x1234_0000), None);

        let a = arena.allocate(0x8000).unwrap();
        assert_eq!(arena.allocate(0x1000), None, "arena is full");
        arena.free(a);
        assert!(arena.allocate(0x1000).is_some());
    }

    #[test]
    fn arena_slot_exhaustion() {
        let mut arena = Arena::new(0, 0x100_0000);
        for _ in 0..ARENA_SLOTS {
            assert!(arena.allocate(0x1000).is_some());
        }
        assert_eq!(arena.allocate(0x1000), None, "no free slots left");
    }
}
