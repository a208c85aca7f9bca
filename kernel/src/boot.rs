// =============================================================================
// Helios — Limine Boot Protocol Interface
// =============================================================================
//
// The kernel declares static "request" structures; Limine finds them by
// their magic bytes while loading the image and fills in response
// pointers before jumping to `_start`. This module owns every request
// and exposes typed accessors so the rest of the kernel never touches
// protocol structures — the memory map in particular is converted into
// the kernel's own `MemoryRegion` form, which keeps the allocators (and
// their host tests) free of bootloader types.
//
// =============================================================================

use limine::BaseRevision;
use limine::request::{
    ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest,
};

use crate::memory::{MemoryRegion, RegionKind};

/// Limine protocol revision supported by this kernel.
#[used]
#[unsafe(link_section = ".limine_requests")]
static BASE_REVISION: BaseRevision = BaseRevision::new();

/// Higher Half Direct Map offset: `phys + offset` addresses any physical
/// byte from kernel space. The whole VMM is anchored on this value.
#[used]
#[unsafe(link_section = ".limine_requests")]
static HHDM_REQUEST: HhdmRequest = HhdmRequest::new();

/// The physical memory map: sorted, non-overlapping regions with their
/// usability classification. Consumed once by the PMM.
#[used]
#[unsafe(link_section = ".limine_requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

/// The framebuffer, used only to blank the screen at boot.
#[used]
#[unsafe(link_section = ".limine_requests")]
static FRAMEBUFFER_REQUEST: FramebufferRequest = FramebufferRequest::new();

/// Where the kernel image landed, physically and virtually.
#[used]
#[unsafe(link_section = ".limine_requests")]
static KERNEL_ADDRESS_REQUEST: ExecutableAddressRequest = ExecutableAddressRequest::new();

/// Largest memory map the conversion below will carry.
pub const MAX_MEMORY_REGIONS: usize = 128;

/// Whether the bootloader speaks our protocol revision.
pub fn base_revision_supported() -> bool {
    BASE_REVISION.is_supported()
}

/// The HHDM offset.
///
/// # Panics
/// If the response is missing — a boot protocol violation the kernel
/// cannot survive.
pub fn hhdm_offset() -> u64 {
    HHDM_REQUEST
        .get_response()
        .expect("Limine HHDM response missing")
        .offset()
}

/// Converts the Limine memory map into `buf`, returning the entry count.
///
/// # Panics
/// If the response is missing.
pub fn memory_map(buf: &mut [MemoryRegion; MAX_MEMORY_REGIONS]) -> usize {
    use limine::memory_map::EntryType;

    let entries = MEMORY_MAP_REQUEST
        .get_response()
        .expect("Limine memory map response missing")
        .entries();

    let mut n = 0;
    for entry in entries.iter() {
        if n == MAX_MEMORY_REGIONS {
            log::warn!("memory map truncated at {} regions", n);
            break;
        }
        let kind = if entry.entry_type == EntryType::USABLE {
            RegionKind::Usable
        } else if entry.entry_type == EntryType::ACPI_RECLAIMABLE {
            RegionKind::AcpiReclaimable
        } else if entry.entry_type == EntryType::ACPI_NVS {
            RegionKind::AcpiNvs
        } else if entry.entry_type == EntryType::BAD_MEMORY {
            RegionKind::BadMemory
        } else if entry.entry_type == EntryType::BOOTLOADER_RECLAIMABLE {
            RegionKind::BootloaderReclaimable
        } else if entry.entry_type == EntryType::EXECUTABLE_AND_MODULES {
            RegionKind::KernelAndModules
        } else if entry.entry_type == EntryType::FRAMEBUFFER {
            RegionKind::Framebuffer
        } else {
            RegionKind::Reserved
        };
        buf[n] = MemoryRegion::new(entry.base, entry.length, kind);
        n += 1;
    }
    n
}

/// Framebuffer geometry, if the bootloader set one up.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address of the first pixel.
    pub address: *mut u8,
    pub width: u64,
    pub height: u64,
    /// Bytes per row, padding included — never compute rows from width.
    pub pitch: u64,
    pub bpp: u16,
}

pub fn framebuffer_info() -> Option<FramebufferInfo> {
    let response = FRAMEBUFFER_REQUEST.get_response()?;
    let fb = response.framebuffers().next()?;
    Some(FramebufferInfo {
        address: fb.addr() as *mut u8,
        width: fb.width(),
        height: fb.height(),
        pitch: fb.pitch(),
        bpp: fb.bpp(),
    })
}

/// The kernel's load addresses as `(physical_base, virtual_base)`.
///
/// # Panics
/// If the response is missing.
pub fn kernel_address() -> (u64, u64) {
    let response = KERNEL_ADDRESS_REQUEST
        .get_response()
        .expect("Limine executable address response missing");
    (response.physical_base(), response.virtual_base())
}
