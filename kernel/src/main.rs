// =============================================================================
// Helios — Kernel Entry
// =============================================================================
//
// Bring-up order is leaves-first; every stage depends only on the ones
// before it:
//
//   logging → GDT → IDT + PIC → PMM → VMM (#PF handler) → filesystem →
//   scheduler (timer callback + PIT) → syscall MSRs → STI → idle loop
//
// After `interrupt_enable` the timer drives preemption; the boot context
// lives on as the idle task (TID 0).
//
// =============================================================================

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

mod arch;
mod boot;
mod drivers;
mod exec;
mod fs;
mod logging;
mod memory;
mod sync;
mod syscall;
mod task;
mod traps;

#[cfg_attr(test, allow(unused_imports))]
use memory::address::PAGE_SIZE;
#[cfg_attr(test, allow(unused_imports))]
use memory::{MemoryRegion, RegionKind, pmm, vmm};
#[cfg_attr(test, allow(unused_imports))]
use task::scheduler::{self, Priority};

/// Kernel entry point, called by Limine in long mode with paging live.
#[cfg(not(test))]
#[unsafe(no_mangle)]
unsafe extern "C" fn _start() -> ! {
    kmain()
}

#[cfg(not(test))]
fn kmain() -> ! {
    logging::init(log::LevelFilter::Info);
    log::info!("Helios booting");

    assert!(
        boot::base_revision_supported(),
        "bootloader speaks an unsupported Limine revision"
    );

    clear_framebuffer();

    arch::gdt::init();
    traps::init();

    let mut regions = [MemoryRegion::new(0, 0, RegionKind::Reserved); boot::MAX_MEMORY_REGIONS];
    let count = boot::memory_map(&mut regions);
    pmm::init(&regions[..count]);

    let (kernel_phys, kernel_virt) = boot::kernel_address();
    vmm::init(boot::hhdm_offset(), kernel_phys, kernel_virt);

    fs::ramfs::init();

    scheduler::init();

    // The syscall gate needs a kernel stack before the first dispatch
    // updates the slot with a per-task one.
    let syscall_stack = pmm::alloc_frames(4).expect("no frames for the syscall boot stack");
    let syscall_stack_top =
        syscall_stack.to_virt(vmm::hhdm_offset()).as_u64() + 4 * PAGE_SIZE;
    syscall::init(syscall_stack_top);

    traps::interrupt_enable();

    report_memory();
    spawn_init();

    log::info!("kernel initialized, entering idle loop");
    loop {
        arch::cpu::halt();
    }
}

/// Blanks the framebuffer so the boot console starts clean.
#[cfg(not(test))]
fn clear_framebuffer() {
    if let Some(fb) = boot::framebuffer_info() {
        log::info!(
            "framebuffer {}x{} pitch={} bpp={}",
            fb.width,
            fb.height,
            fb.pitch,
            fb.bpp
        );
        // SAFETY: the bootloader maps pitch*height bytes at fb.address.
        unsafe {
            core::ptr::write_bytes(fb.address, 0, (fb.pitch * fb.height) as usize);
        }
    } else {
        log::warn!("no framebuffer available");
    }
}

#[cfg(not(test))]
fn report_memory() {
    let stats = pmm::stats();
    let info = pmm::info();
    log::info!(
        "memory: window {:#x}..{:#x}, {} MiB free / {} MiB managed",
        info.base,
        info.end,
        stats.free_frames * PAGE_SIZE as usize / (1024 * 1024),
        stats.total_frames * PAGE_SIZE as usize / (1024 * 1024),
    );
}

/// Launches `/bin/init` when the filesystem carries one. Without it the
/// idle loop simply runs alone — useful for bring-up on an empty ramfs.
#[cfg(not(test))]
fn spawn_init() {
    const INIT_PATH: &str = "/bin/init";
    if fs::lookup_path(INIT_PATH).is_none() {
        log::info!("no {} in the filesystem, staying idle", INIT_PATH);
        return;
    }

    let Ok(fd) = fs::open(INIT_PATH, fs::O_RDONLY) else {
        log::warn!("{} exists but cannot be opened", INIT_PATH);
        return;
    };
    let image = (|| {
        let len = fs::fstat(fd).ok()?.st_size as usize;
        if len == 0 {
            return None;
        }
        let pages = len.div_ceil(PAGE_SIZE as usize);
        let base = pmm::alloc_frames(pages)?;
        let buf = unsafe {
            core::slice::from_raw_parts_mut(
                base.to_virt(vmm::hhdm_offset()).as_mut_ptr::<u8>(),
                len,
            )
        };
        let mut read = 0;
        while read < len {
            match fs::read(fd, &mut buf[read..]) {
                Ok(0) | Err(_) => break,
                Ok(n) => read += n,
            }
        }
        if read == len {
            Some((base, pages, len))
        } else {
            pmm::free_frames(base, pages);
            None
        }
    })();
    let _ = fs::close(fd);

    let Some((base, pages, len)) = image else {
        log::warn!("failed to read {}", INIT_PATH);
        return;
    };
    let data = unsafe {
        core::slice::from_raw_parts(base.to_virt(vmm::hhdm_offset()).as_ptr::<u8>(), len)
    };
    let tid = scheduler::create_task(data, "init", Priority::Normal, &[INIT_PATH], &[]);
    pmm::free_frames(base, pages);
    if tid == 0 {
        log::error!("failed to create the init task");
    } else {
        log::info!("init task created with tid {}", tid);
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("KERNEL PANIC: {}", info);
    arch::cpu::halt_forever()
}
