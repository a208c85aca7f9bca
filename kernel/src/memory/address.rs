// =============================================================================
// Helios — Physical and Virtual Address Types
// =============================================================================
//
// Confusing a physical address with a virtual address is one of the most
// common and catastrophic kernel bugs. You write to what you think is a
// physical frame, but it's actually a virtual address — you corrupt random
// memory and the system crashes mysteriously.
//
// SOLUTION: Newtype pattern.
//   PhysAddr and VirtAddr are separate types. The compiler prevents you from
//   using one where the other is expected. Converting between them requires
//   explicit function calls that document the relationship.
//
// x86_64 ADDRESS SPACE:
//   - Physical: 52 bits max (architectural limit)
//   - Virtual: 48 bits used (the "canonical" range), 16 bits sign-extended
//     - Lower half: 0x0000_0000_0000_0000 — 0x0000_7FFF_FFFF_FFFF (user)
//     - Upper half: 0xFFFF_8000_0000_0000 — 0xFFFF_FFFF_FFFF_FFFF (kernel)
//     - The gap in the middle is "non-canonical" — accessing it is a GPF
//
// HHDM (Higher Half Direct Map):
//   Limine maps ALL physical memory at a fixed virtual offset, so for any
//   physical address p the kernel can read/write it at `hhdm_offset + p`.
//   The offset is owned by the VMM and passed explicitly to the conversion
//   helpers here; that keeps the page-table walker testable on the host,
//   where an ordinary heap buffer stands in for physical memory.
//
// =============================================================================

use core::fmt;

/// Size of a standard page (4 KiB).
pub const PAGE_SIZE: u64 = 4096;

/// Size of a large/huge page (2 MiB).
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Size of a gigantic page (1 GiB).
pub const GIANT_PAGE_SIZE: u64 = 1024 * 1024 * 1024;

/// Bit shift for standard pages (4K = 2^12).
#[allow(dead_code)]
pub const PAGE_SHIFT: u64 = 12;

/// First virtual address of the canonical upper (kernel) half.
pub const KERNEL_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

// =============================================================================
// PhysAddr — A physical memory address
// =============================================================================

/// A physical memory address.
///
/// Physical addresses refer to locations in the system's physical RAM
/// (or memory-mapped I/O). They are what the CPU sends on the memory bus
/// after page table translation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

#[allow(dead_code)]
impl PhysAddr {
    /// Creates a new physical address.
    ///
    /// On x86_64, physical addresses must fit in 52 bits (architectural
    /// limit). Bits 52–63 must be zero.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        debug_assert!(
            addr & 0xFFF0_0000_0000_0000 == 0,
            "Physical address exceeds 52-bit limit"
        );
        Self(addr)
    }

    /// Returns the raw u64 value of this physical address.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this physical address to its direct-map virtual address.
    ///
    /// Valid only for `hhdm` values handed out by the bootloader (or a
    /// test harness); the caller is the VMM, which owns the real offset.
    #[inline]
    pub const fn to_virt(self, hhdm: u64) -> VirtAddr {
        VirtAddr::new(self.0.wrapping_add(hhdm))
    }

    /// Returns true if this address is aligned to a 4 KiB page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    /// Aligns this address down to the nearest 4 KiB page boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !0xFFF)
    }

    /// Aligns this address up to the nearest 4 KiB page boundary.
    #[inline]
    pub const fn page_align_up(self) -> Self {
        Self((self.0 + 0xFFF) & !0xFFF)
    }

    /// Creates a zero physical address (used as a null/invalid marker).
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns true if this is the zero address.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Display a physical address with a `P:` prefix to distinguish it from
/// virtual addresses in log output.
impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#012X}", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P:{:#012X}", self.0)
    }
}

impl core::ops::Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u64) -> Self {
        Self::new(self.0 - offset)
    }
}

impl core::ops::Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: PhysAddr) -> u64 {
        self.0 - other.0
    }
}

// =============================================================================
// VirtAddr — A virtual memory address
// =============================================================================

/// A virtual memory address.
///
/// Virtual addresses are what the CPU uses for all memory accesses. They go
/// through the page table translation (PML4 → PDPT → PD → PT) to produce a
/// physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

#[allow(dead_code)]
impl VirtAddr {
    /// Creates a new virtual address.
    ///
    /// The address must be canonical (bits 48–63 are copies of bit 47);
    /// non-canonical addresses would cause a GPF if used.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        // Sign-extend bit 47 across bits 48-63 and compare with the
        // original to check canonicality.
        let canonical = ((addr << 16) as i64 >> 16) as u64;
        debug_assert!(addr == canonical, "Non-canonical virtual address");
        Self(addr)
    }

    /// Returns the raw u64 value of this virtual address.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Converts this virtual address to a raw pointer.
    ///
    /// This is the bridge between the type-safe address world and Rust's
    /// pointer world, used when we actually need to read/write memory.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts this virtual address to a mutable raw pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns true if this is a kernel-space address (upper half).
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_HALF_BASE
    }

    /// Returns true if this is a user-space address (lower half).
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < 0x0000_8000_0000_0000
    }

    /// Returns true if this address is aligned to a 4 KiB page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & 0xFFF == 0
    }

    /// Aligns this address down to the nearest 4 KiB page boundary.
    #[inline]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !0xFFF)
    }

    /// Aligns this address up to the nearest 4 KiB page boundary.
    #[inline]
    pub const fn page_align_up(self) -> Self {
        Self((self.0 + 0xFFF) & !0xFFF)
    }

    /// Extracts the page table indices from this virtual address.
    ///
    /// A 48-bit virtual address is split into four 9-bit indices, one per
    /// level of the paging hierarchy, plus a 12-bit page offset:
    ///
    /// ```text
    /// 63       48 47    39 38    30 29    21 20    12 11       0
    /// ┌──────────┬────────┬────────┬────────┬────────┬─────────┐
    /// │ sign ext │ PML4   │  PDPT  │   PD   │   PT   │ Offset  │
    /// └──────────┴────────┴────────┴────────┴────────┴─────────┘
    /// ```
    ///
    /// Returns `[PT index, PD index, PDPT index, PML4 index]` — index 0 is
    /// the lowest level, which is the natural order for the unmap walk.
    #[inline]
    pub const fn page_table_indices(self) -> [u16; 4] {
        [
            ((self.0 >> 12) & 0x1FF) as u16, // PT index    (level 1)
            ((self.0 >> 21) & 0x1FF) as u16, // PD index    (level 2)
            ((self.0 >> 30) & 0x1FF) as u16, // PDPT index  (level 3)
            ((self.0 >> 39) & 0x1FF) as u16, // PML4 index  (level 4)
        ]
    }

    /// Extracts the 12-bit page offset (the part within a 4 KiB page).
    #[inline]
    pub const fn page_offset(self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    /// Creates a zero virtual address (null pointer equivalent).
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns true if this is the zero address.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// Display a virtual address with a `V:` prefix.
impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V:{:#018X}", self.0)
    }
}

impl core::ops::Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, offset: u64) -> Self {
        Self::new(self.0 + offset)
    }
}

impl core::ops::Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, offset: u64) -> Self {
        Self::new(self.0 - offset)
    }
}

impl core::ops::Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, other: VirtAddr) -> u64 {
        self.0 - other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_page_alignment() {
        assert!(PhysAddr::new(0x1000).is_page_aligned());
        assert!(!PhysAddr::new(0x1234).is_page_aligned());
        assert_eq!(PhysAddr::new(0x1234).page_align_down(), PhysAddr::new(0x1000));
        assert_eq!(PhysAddr::new(0x1234).page_align_up(), PhysAddr::new(0x2000));
        assert_eq!(PhysAddr::new(0x1000).page_align_up(), PhysAddr::new(0x1000));
    }

    #[test]
    fn virt_half_predicates() {
        assert!(VirtAddr::new(0xFFFF_8000_0000_1000).is_kernel());
        assert!(VirtAddr::new(0x0000_0000_0040_0000).is_user());
        assert!(!VirtAddr::new(0x0000_0000_0040_0000).is_kernel());
    }

    #[test]
    fn page_table_index_split() {
        // 0x0000_0040_0000 = PML4 0, PDPT 0, PD 2, PT 0.
        let idx = VirtAddr::new(0x40_0000).page_table_indices();
        assert_eq!(idx, [0, 2, 0, 0]);

        // The canonical upper-half base selects PML4 entry 256.
        let idx = VirtAddr::new(KERNEL_HALF_BASE).page_table_indices();
        assert_eq!(idx[3], 256);

        let addr = VirtAddr::new(0x0000_7FFF_FFFF_F000);
        assert_eq!(addr.page_table_indices(), [511, 511, 511, 255]);
    }

    #[test]
    fn hhdm_conversion_is_additive() {
        let p = PhysAddr::new(0x20_0000);
        assert_eq!(p.to_virt(0x1000_0000).as_u64(), 0x1020_0000);
    }
}
