//! Global Descriptor Table (GDT) and Task State Segment (TSS).
//!
//! In long mode most of segmentation is disabled, but a GDT is still
//! required to define code/data segments for ring 0 and ring 3 and to
//! point at the TSS, which carries the RSP0 kernel stack used on every
//! ring 3 → ring 0 transition.
//!
//! Layout (selectors are byte offsets into the table):
//!   0x00  Null            (required)
//!   0x08  Kernel code     access 0x9A, granularity 0xA0 (L=1)
//!   0x10  Kernel data     access 0x92, granularity 0x80
//!   0x18  User data       access 0xF2, granularity 0x80
//!   0x20  User code       access 0xFA, granularity 0xA0 (L=1)
//!   0x28  TSS             access 0x89, 16-byte system descriptor
//!
//! The user data segment sits below the user code segment because SYSRET
//! computes CS = STAR[63:48]+16 and SS = STAR[63:48]+8; with
//! STAR[63:48] = 0x10 that yields CS=0x23 and SS=0x1B at RPL 3.
//!
//! A snapshot of the table is kept from boot so long-running systems can
//! verify the descriptors have not been corrupted and reinstall them.

use core::arch::asm;
use core::mem::size_of;

use crate::sync::SpinLock;

/// Number of 8-byte GDT slots: null, 4 segments, and the 16-byte TSS
/// descriptor spanning two slots.
const GDT_ENTRIES: usize = 7;

/// Kernel code segment selector (ring 0).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Kernel data segment selector (ring 0).
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// User data segment selector with RPL 3.
pub const USER_DATA_SELECTOR: u16 = 0x18 | 3;
/// User code segment selector with RPL 3.
pub const USER_CODE_SELECTOR: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

// =============================================================================
// Task State Segment
// =============================================================================

/// The 64-bit Task State Segment.
///
/// In long mode the TSS no longer stores register state for hardware task
/// switching. It carries:
/// - RSP0–RSP2: stacks loaded on privilege-level transitions
/// - IST1–IST7: dedicated stacks for selected interrupt vectors (unused)
/// - the I/O permission bitmap offset
#[repr(C, packed(4))]
pub struct Tss {
    reserved0: u32,
    /// Stack pointers for privilege transitions; RSP0 is loaded when an
    /// interrupt arrives in ring 3.
    rsp: [u64; 3],
    reserved1: u64,
    /// Interrupt Stack Table entries (unused; all zero).
    ist: [u64; 7],
    reserved2: u64,
    reserved3: u16,
    /// Offset of the I/O permission bitmap from the TSS base. Set to
    /// `size_of::<Tss>()` so the bitmap is absent and all port access
    /// from ring 3 faults.
    iopb_offset: u16,
}

impl Tss {
    pub const fn new() -> Self {
        Self {
            reserved0: 0,
            rsp: [0; 3],
            reserved1: 0,
            ist: [0; 7],
            reserved2: 0,
            reserved3: 0,
            iopb_offset: size_of::<Tss>() as u16,
        }
    }
}

// =============================================================================
// Descriptor encoding
// =============================================================================

/// Encodes an 8-byte segment descriptor from its classic fields.
///
/// ```text
/// 63      56 55  52 51  48 47      40 39      16 15       0
/// ┌─────────┬──────┬──────┬──────────┬──────────┬──────────┐
/// │base24-31│ gran │lim16+│  access  │ base0-23 │ limit0-15│
/// └─────────┴──────┴──────┴──────────┴──────────┴──────────┘
/// ```
const fn descriptor(base: u64, limit: u32, access: u8, gran: u8) -> u64 {
    let mut d: u64 = (limit as u64) & 0xFFFF;
    d |= (base & 0xFFFF) << 16;
    d |= ((base >> 16) & 0xFF) << 32;
    d |= (access as u64) << 40;
    d |= (((limit as u64) >> 16) & 0xF) << 48;
    d |= ((gran as u64) & 0xF0) << 48;
    d |= ((base >> 24) & 0xFF) << 56;
    d
}

/// The low and high halves of a 16-byte 64-bit TSS descriptor.
///
/// The low half is an ordinary system descriptor (access 0x89 = present,
/// DPL 0, available 64-bit TSS); the high half carries base bits 32–63.
fn tss_descriptor(base: u64, limit: u32) -> (u64, u64) {
    let low = descriptor(base, limit, 0x89, 0x00);
    let high = base >> 32;
    (low, high)
}

/// Pointer operand for the LGDT instruction.
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

// =============================================================================
// Global state
// =============================================================================

struct GdtState {
    entries: [u64; GDT_ENTRIES],
    /// Snapshot taken right after boot-time construction; `check_integrity`
    /// compares against it and `recover` reinstalls it.
    backup: [u64; GDT_ENTRIES],
    built: bool,
}

static GDT: SpinLock<GdtState> = SpinLock::new(GdtState {
    entries: [0; GDT_ENTRIES],
    backup: [0; GDT_ENTRIES],
    built: false,
});

static TSS: SpinLock<Tss> = SpinLock::new(Tss::new());

// =============================================================================
// Public API
// =============================================================================

/// Builds the GDT, installs it with LGDT, reloads the segment registers
/// and loads the TSS with LTR.
///
/// Must be called exactly once, before the IDT is installed.
pub fn init() {
    let tss_base = {
        let tss = TSS.lock();
        &*tss as *const Tss as u64
    };
    let tss_limit = (size_of::<Tss>() - 1) as u32;
    let (tss_low, tss_high) = tss_descriptor(tss_base, tss_limit);

    let gdt_base;
    {
        let mut gdt = GDT.lock();
        gdt.entries = [
            0,                                           // 0x00: null
            descriptor(0, 0xFFFFF, 0x9A, 0xA0),          // 0x08: kernel code
            descriptor(0, 0xFFFFF, 0x92, 0x80),          // 0x10: kernel data
            descriptor(0, 0xFFFFF, 0xF2, 0x80),          // 0x18: user data
            descriptor(0, 0xFFFFF, 0xFA, 0xA0),          // 0x20: user code
            tss_low,                                     // 0x28: TSS low
            tss_high,                                    // 0x30: TSS high
        ];
        gdt.backup = gdt.entries;
        gdt.built = true;
        gdt_base = gdt.entries.as_ptr() as u64;
    }

    // SAFETY: The table is a static, so it lives for the whole kernel
    // lifetime; the selectors below index valid descriptors in it.
    unsafe {
        load(gdt_base);
    }

    log::info!(
        "GDT loaded (kcode={:#04x} kdata={:#04x} ucode={:#04x} udata={:#04x} tss={:#04x})",
        KERNEL_CODE_SELECTOR,
        KERNEL_DATA_SELECTOR,
        USER_CODE_SELECTOR,
        USER_DATA_SELECTOR,
        TSS_SELECTOR,
    );
}

/// Installs the table at `gdt_base` and reloads CS/DS/ES/SS and TR.
unsafe fn load(gdt_base: u64) {
    let ptr = GdtPointer {
        limit: (size_of::<[u64; GDT_ENTRIES]>() - 1) as u16,
        base: gdt_base,
    };

    unsafe {
        asm!(
            "lgdt [{}]",
            in(reg) &ptr,
            options(readonly, nostack, preserves_flags)
        );

        // Reload CS with a far return: push the new selector and a label
        // address, then RETFQ pops both.
        asm!(
            "push {sel}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            sel = in(reg) KERNEL_CODE_SELECTOR as u64,
            tmp = lateout(reg) _,
            options(preserves_flags)
        );

        // Reload the data segment registers.
        asm!(
            "mov ds, {sel:x}",
            "mov es, {sel:x}",
            "mov ss, {sel:x}",
            sel = in(reg) KERNEL_DATA_SELECTOR,
            options(nostack, preserves_flags)
        );

        // Load the task register with the TSS selector.
        asm!(
            "ltr {sel:x}",
            sel = in(reg) TSS_SELECTOR,
            options(nostack, preserves_flags)
        );
    }
}

/// Updates TSS.RSP0, the stack the CPU switches to when an interrupt
/// arrives in ring 3.
///
/// Called by the scheduler on every dispatch so traps from user mode land
/// on the incoming task's kernel stack.
pub fn set_kernel_stack(rsp0: u64) {
    TSS.lock().rsp[0] = rsp0;
}

/// Compares the live table against the boot snapshot.
///
/// Returns `false` if any descriptor has been modified since `init`.
#[allow(dead_code)]
pub fn check_integrity() -> bool {
    let gdt = GDT.lock();
    gdt.built && gdt.entries == gdt.backup
}

/// Restores the table from the boot snapshot and reinstalls it.
///
/// Returns whether the recovery produced a table passing the integrity
/// check again.
#[allow(dead_code)]
pub fn recover() -> bool {
    let gdt_base;
    {
        let mut gdt = GDT.lock();
        if !gdt.built {
            return false;
        }
        let backup = gdt.backup;
        gdt.entries = backup;
        gdt_base = gdt.entries.as_ptr() as u64;
    }
    // SAFETY: same static table as in `init`.
    unsafe {
        load(gdt_base);
    }
    log::warn!("GDT reinstalled from boot snapshot");
    check_integrity()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_descriptor_encodings() {
        // The four non-null segments, encoded per the x86_64 convention.
        assert_eq!(descriptor(0, 0xFFFFF, 0x9A, 0xA0), 0x00AF_9A00_0000_FFFF);
        assert_eq!(descriptor(0, 0xFFFFF, 0x92, 0x80), 0x008F_9200_0000_FFFF);
        assert_eq!(descriptor(0, 0xFFFFF, 0xFA, 0xA0), 0x00AF_FA00_0000_FFFF);
        assert_eq!(descriptor(0, 0xFFFFF, 0xF2, 0x80), 0x008F_F200_0000_FFFF);
    }

    #[test]
    fn tss_descriptor_splits_base() {
        let base = 0xFFFF_8000_DEAD_BEE0u64;
        let limit = (size_of::<Tss>() - 1) as u32;
        let (low, high) = tss_descriptor(base, limit);

        // Limit in bits 0-15.
        assert_eq!(low & 0xFFFF, limit as u64);
        // Base bits 0-15 at bits 16-31, 16-23 at 32-39, 24-31 at 56-63.
        assert_eq!((low >> 16) & 0xFFFF, base & 0xFFFF);
        assert_eq!((low >> 32) & 0xFF, (base >> 16) & 0xFF);
        assert_eq!(low >> 56, (base >> 24) & 0xFF);
        // Access byte 0x89: present 64-bit available TSS.
        assert_eq!((low >> 40) & 0xFF, 0x89);
        // High half holds base bits 32-63.
        assert_eq!(high, base >> 32);
    }

    #[test]
    fn tss_iopb_disabled() {
        let tss = Tss::new();
        assert_eq!({ tss.iopb_offset }, size_of::<Tss>() as u16);
        assert_eq!(size_of::<Tss>(), 0x68);
    }

    #[test]
    fn sysret_selector_arithmetic() {
        // SYSRET loads CS = STAR[63:48]+16 | 3 and SS = STAR[63:48]+8 | 3.
        let sysret_base: u16 = 0x10;
        assert_eq!((sysret_base + 16) | 3, USER_CODE_SELECTOR);
        assert_eq!((sysret_base + 8) | 3, USER_DATA_SELECTOR);
    }
}
