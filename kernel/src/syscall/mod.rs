// =============================================================================
// Helios — Syscall Gate
// =============================================================================
//
// Installs the SYSCALL/SYSRET fast system-call path and dispatches the
// Linux-flavoured call numbers in §the ABI below to their handlers.
//
// MSR SETUP:
//   STAR   = (0x10 << 48) | (0x08 << 32)
//            SYSCALL loads CS=0x08/SS=0x10 (kernel); SYSRET loads
//            CS=0x10+16|3=0x23 and SS=0x10+8|3=0x1B (user).
//   LSTAR  = syscall_entry (the trampoline below)
//   SFMASK = IF | DF — interrupts masked and direction cleared on entry
//   EFER.SCE = 1
//
// TRAMPOLINE CONTRACT:
//   On SYSCALL the CPU leaves RIP in RCX, RFLAGS in R11 and does NOT
//   switch stacks. The trampoline parks the user RSP in a save slot,
//   enters the per-task kernel stack, preserves the user resume state
//   and the SysV callee-saved set on that stack, snapshots them for
//   fork, realigns the argument registers (R10 takes RCX's place in the
//   SysV order) and calls the dispatcher. The return value travels back
//   in RAX through SYSRETQ.
//
//   Single CPU: the save slots are plain statics rather than a GS-based
//   per-CPU block, and the resume state a preempted syscall needs lives
//   on its own kernel stack, never in the slots.
//
// ABI (number in RAX, args in RDI, RSI, RDX, R10, R8, R9 → RAX):
//   0 read  1 write  2 open  3 close  5 fstat  8 lseek  9 mmap
//   11 munmap  12 brk  39 getpid  57 fork  59 execve  60 exit
//   61 waitpid  78 getdents  79 getcwd  80 chdir  83 mkdir  84 rmdir
//   87 unlink — anything else returns -1.
//
// =============================================================================

use core::arch::global_asm;

use crate::arch::cpu;
use crate::fs;
use crate::memory::address::{PAGE_SIZE, PhysAddr, VirtAddr};
use crate::memory::paging::PageTableFlags;
use crate::memory::pmm;
use crate::memory::vmm;
use crate::task::scheduler::{self, SyscallSaved, TaskState};

// ── MSR addresses ───────────────────────────────────────────────

/// Extended Feature Enable Register — bit 0 enables SYSCALL/SYSRET.
const MSR_EFER: u32 = 0xC000_0080;
/// Segment bases for SYSCALL/SYSRET.
const MSR_STAR: u32 = 0xC000_0081;
/// Long-mode SYSCALL target RIP.
const MSR_LSTAR: u32 = 0xC000_0082;
/// RFLAGS bits cleared on SYSCALL entry.
const MSR_SFMASK: u32 = 0xC000_0084;

const EFER_SCE: u64 = 1 << 0;
const RFLAGS_IF: u64 = 1 << 9;
const RFLAGS_DF: u64 = 1 << 10;

// ── Syscall numbers ─────────────────────────────────────────────

pub mod nr {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const FSTAT: u64 = 5;
    pub const LSEEK: u64 = 8;
    pub const MMAP: u64 = 9;
    pub const MUNMAP: u64 = 11;
    pub const BRK: u64 = 12;
    pub const GETPID: u64 = 39;
    pub const FORK: u64 = 57;
    pub const EXECVE: u64 = 59;
    pub const EXIT: u64 = 60;
    pub const WAITPID: u64 = 61;
    pub const GETDENTS: u64 = 78;
    pub const GETCWD: u64 = 79;
    pub const CHDIR: u64 = 80;
    pub const MKDIR: u64 = 83;
    pub const RMDIR: u64 = 84;
    pub const UNLINK: u64 = 87;
}

// ── Save slots shared with the trampoline ───────────────────────

/// User RSP parked across the kernel excursion.
#[unsafe(no_mangle)]
static mut SYSCALL_USER_RSP: u64 = 0;

/// Kernel stack entered on SYSCALL; the scheduler points this at the
/// incoming task's stack on every dispatch.
#[unsafe(no_mangle)]
static mut SYSCALL_KERNEL_RSP: u64 = 0;

/// Entry snapshot for fork: rbx, rbp, r12–r15, user RIP, user RFLAGS,
/// user RSP. Read by the dispatcher before interrupts can re-enable.
#[unsafe(no_mangle)]
static mut SYSCALL_SAVED: [u64; 9] = [0; 9];

/// Points the trampoline at `top` for the next SYSCALL entry.
pub fn set_kernel_stack(top: u64) {
    // SAFETY: plain word store; the slot is only read by the trampoline
    // on the next syscall entry, which cannot overlap this store on a
    // single CPU.
    unsafe { *(&raw mut SYSCALL_KERNEL_RSP) = top };
}

// ── Initialisation ──────────────────────────────────────────────

/// Enables SYSCALL/SYSRET and programs the STAR/LSTAR/SFMASK MSRs.
///
/// `kernel_rsp` seeds the kernel-stack slot until the first dispatch.
/// Must be called after the GDT is live.
pub fn init(kernel_rsp: u64) {
    set_kernel_stack(kernel_rsp);

    // SAFETY: the MSRs below are architectural and the values follow
    // the layout contract with arch::gdt.
    unsafe {
        let efer = cpu::rdmsr(MSR_EFER);
        cpu::wrmsr(MSR_EFER, efer | EFER_SCE);

        let star = (0x10u64 << 48) | (0x08u64 << 32);
        cpu::wrmsr(MSR_STAR, star);
        cpu::wrmsr(MSR_LSTAR, syscall_entry_addr());
        cpu::wrmsr(MSR_SFMASK, RFLAGS_IF | RFLAGS_DF);
    }

    log::info!("syscall gate enabled (EFER.SCE=1)");
}

unsafe extern "C" {
    fn syscall_entry();
}

fn syscall_entry_addr() -> u64 {
    syscall_entry as usize as u64
}

// ── The trampoline ──────────────────────────────────────────────

global_asm!(
    ".global syscall_entry",
    "syscall_entry:",
    // Enter the kernel stack; the user RSP waits in its slot.
    "mov [rip + SYSCALL_USER_RSP], rsp",
    "mov rsp, [rip + SYSCALL_KERNEL_RSP]",
    // Preserve the resume state on the kernel stack — the slots are
    // clobbered by the next syscall from any task, the stack is ours.
    "push rcx", // user RIP
    "push r11", // user RFLAGS
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push qword ptr [rip + SYSCALL_USER_RSP]",
    // Snapshot for fork (interrupts are masked via SFMASK until the
    // dispatcher has copied these into the task).
    "mov [rip + SYSCALL_SAVED + 0x00], rbx",
    "mov [rip + SYSCALL_SAVED + 0x08], rbp",
    "mov [rip + SYSCALL_SAVED + 0x10], r12",
    "mov [rip + SYSCALL_SAVED + 0x18], r13",
    "mov [rip + SYSCALL_SAVED + 0x20], r14",
    "mov [rip + SYSCALL_SAVED + 0x28], r15",
    "mov [rip + SYSCALL_SAVED + 0x30], rcx",
    "mov [rip + SYSCALL_SAVED + 0x38], r11",
    "mov rcx, [rip + SYSCALL_USER_RSP]",
    "mov [rip + SYSCALL_SAVED + 0x40], rcx",
    // Realign to SysV: RAX carried the number, R10 stands in for RCX.
    //   dispatcher(nr=RDI, a0=RSI, a1=RDX, a2=RCX, a3=R8, a4=R9)
    "mov r15, rdi",
    "mov rdi, rax",
    "mov rcx, rdx",
    "mov rdx, rsi",
    "mov rsi, r15",
    "mov r9, r8",
    "mov r8, r10",
    "call syscall_dispatch",
    // RAX holds the return value; unwind and leave.
    "pop r15",
    "mov [rip + SYSCALL_USER_RSP], r15",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "pop r11", // user RFLAGS
    "pop rcx", // user RIP
    "mov rsp, [rip + SYSCALL_USER_RSP]",
    "sysretq",
);

// ── Dispatch ────────────────────────────────────────────────────

/// End of canonical user space; kernel never dereferences user pointers
/// at or above this.
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Longest path or argv string accepted from user space.
const MAX_USER_STR: usize = 256;

/// Validates that `[ptr, ptr+len)` lies entirely in user space.
fn validate_user_range(ptr: u64, len: usize) -> bool {
    if ptr == 0 {
        return false;
    }
    match ptr.checked_add(len as u64) {
        Some(end) => end <= USER_SPACE_END,
        None => false,
    }
}

/// Borrows a user buffer for reading.
fn user_slice<'a>(ptr: u64, len: usize) -> Option<&'a [u8]> {
    if !validate_user_range(ptr, len) {
        return None;
    }
    // SAFETY: range-checked; the current address space maps user memory
    // or the access faults inside the kernel, which the #PF handler
    // reports. No demand paging means no silent recovery either way.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len) })
}

/// Borrows a user buffer for writing.
fn user_slice_mut<'a>(ptr: u64, len: usize) -> Option<&'a mut [u8]> {
    if !validate_user_range(ptr, len) {
        return None;
    }
    // SAFETY: see user_slice.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len) })
}

/// Copies a NUL-terminated user string into `buf`, returning it as &str.
fn user_cstr<'a>(ptr: u64, buf: &'a mut [u8; MAX_USER_STR]) -> Option<&'a str> {
    if !validate_user_range(ptr, 1) {
        return None;
    }
    for i in 0..MAX_USER_STR {
        if !validate_user_range(ptr + i as u64, 1) {
            return None;
        }
        // SAFETY: byte-wise read of a validated user address.
        let byte = unsafe { *((ptr + i as u64) as *const u8) };
        if byte == 0 {
            return core::str::from_utf8(&buf[..i]).ok();
        }
        buf[i] = byte;
    }
    None // unterminated
}

/// The Rust dispatcher, called by the trampoline. Returns the value to
/// place in RAX.
#[unsafe(no_mangle)]
extern "C" fn syscall_dispatch(nr: u64, a0: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    // First order of business (interrupts still masked): pin the entry
    // snapshot to the current task so fork can clone the resume point.
    let saved = {
        // SAFETY: the trampoline filled the array immediately before the
        // call and nothing can overwrite it until interrupts re-enable.
        let s = unsafe { *(&raw const SYSCALL_SAVED) };
        SyscallSaved {
            rbx: s[0],
            rbp: s[1],
            r12: s[2],
            r13: s[3],
            r14: s[4],
            r15: s[5],
            rip: s[6],
            rflags: s[7],
            rsp: s[8],
        }
    };
    scheduler::record_syscall_entry(saved);

    match nr {
        nr::READ => sys_read(a0 as i32, a1, a2 as usize),
        nr::WRITE => sys_write(a0 as i32, a1, a2 as usize),
        nr::OPEN => sys_open(a0, a1 as u32),
        nr::CLOSE => sys_close(a0 as i32),
        nr::FSTAT => sys_fstat(a0 as i32, a1),
        nr::LSEEK => sys_lseek(a0 as i32, a1 as i64, a2 as i32),
        nr::MMAP => sys_mmap(a0, a1 as usize),
        nr::MUNMAP => sys_munmap(a0, a1 as usize),
        nr::BRK => sys_brk(a0),
        nr::GETPID => scheduler::current_tid() as i64,
        nr::FORK => sys_fork(),
        nr::EXECVE => sys_execve(a0, a1, a2),
        nr::EXIT => scheduler::exit_current(a0 as i32),
        nr::WAITPID => sys_waitpid(a0 as u32, a1, a2 as i32),
        nr::GETDENTS => sys_getdents(a0 as i32, a1, a2 as usize),
        nr::GETCWD => sys_getcwd(a0, a1 as usize),
        nr::CHDIR => sys_chdir(a0),
        nr::MKDIR => sys_mkdir(a0),
        nr::RMDIR => sys_rmdir(a0),
        nr::UNLINK => sys_unlink(a0),
        _ => {
            log::warn!("unknown syscall {}", nr);
            -1
        }
    }
}

// ── File handlers ───────────────────────────────────────────────

fn sys_read(fd: i32, buf: u64, count: usize) -> i64 {
    let Some(buf) = user_slice_mut(buf, count) else {
        return -1;
    };
    match fs::read(fd, buf) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

fn sys_write(fd: i32, buf: u64, count: usize) -> i64 {
    let Some(buf) = user_slice(buf, count) else {
        return -1;
    };
    match fs::write(fd, buf) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

fn sys_open(path: u64, flags: u32) -> i64 {
    let mut buf = [0u8; MAX_USER_STR];
    let Some(path) = user_cstr(path, &mut buf) else {
        return -1;
    };
    match fs::open(path, flags) {
        Ok(fd) => fd as i64,
        Err(_) => -1,
    }
}

fn sys_close(fd: i32) -> i64 {
    match fs::close(fd) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_fstat(fd: i32, statbuf: u64) -> i64 {
    let Some(out) = user_slice_mut(statbuf, size_of::<fs::Stat>()) else {
        return -1;
    };
    match fs::fstat(fd) {
        Ok(stat) => {
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    &stat as *const fs::Stat as *const u8,
                    size_of::<fs::Stat>(),
                )
            };
            out.copy_from_slice(bytes);
            0
        }
        Err(_) => -1,
    }
}

fn sys_lseek(fd: i32, offset: i64, whence: i32) -> i64 {
    let Some(whence) = fs::Whence::from_raw(whence) else {
        return -1;
    };
    match fs::lseek(fd, offset, whence) {
        Ok(pos) => pos as i64,
        Err(_) => -1,
    }
}

fn sys_getdents(fd: i32, dirp: u64, count: usize) -> i64 {
    let Some(buf) = user_slice_mut(dirp, count) else {
        return -1;
    };
    match fs::getdents(fd, buf) {
        Ok(n) => n as i64,
        Err(_) => -1,
    }
}

fn sys_getcwd(buf: u64, size: usize) -> i64 {
    let Some(out) = user_slice_mut(buf, size) else {
        return -1;
    };
    match fs::getcwd(out) {
        Ok(len) => len as i64,
        Err(_) => -1,
    }
}

fn sys_chdir(path: u64) -> i64 {
    let mut buf = [0u8; MAX_USER_STR];
    let Some(path) = user_cstr(path, &mut buf) else {
        return -1;
    };
    match fs::chdir(path) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_mkdir(path: u64) -> i64 {
    let mut buf = [0u8; MAX_USER_STR];
    let Some(path) = user_cstr(path, &mut buf) else {
        return -1;
    };
    match fs::mkdir(path) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_rmdir(path: u64) -> i64 {
    let mut buf = [0u8; MAX_USER_STR];
    let Some(path) = user_cstr(path, &mut buf) else {
        return -1;
    };
    match fs::rmdir(path) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

fn sys_unlink(path: u64) -> i64 {
    let mut buf = [0u8; MAX_USER_STR];
    let Some(path) = user_cstr(path, &mut buf) else {
        return -1;
    };
    match fs::unlink(path) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

// ── Memory handlers ─────────────────────────────────────────────

fn sys_mmap(addr: u64, length: usize) -> i64 {
    if addr == 0 || length == 0 {
        return -1;
    }
    match vmm::map_physical(
        PhysAddr::new(addr),
        length,
        PageTableFlags::USER | PageTableFlags::WRITABLE,
    ) {
        Some(virt) => virt.as_u64() as i64,
        None => -1,
    }
}

fn sys_munmap(addr: u64, length: usize) -> i64 {
    if addr == 0 || length == 0 {
        return -1;
    }
    vmm::unmap_physical(VirtAddr::new(addr), length);
    0
}

/// brk(2): 0 or a shrink request reports the current break; growth maps
/// fresh zeroed user pages and moves the break. Failure reports the old
/// break, Linux-style.
fn sys_brk(addr: u64) -> i64 {
    let current = scheduler::current_brk();
    if addr <= current {
        return current as i64;
    }
    if addr >= USER_SPACE_END {
        return current as i64;
    }

    let grow_start = (current + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let grow_end = (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    if grow_end > grow_start {
        let ok = vmm::allocate_at(
            VirtAddr::new(grow_start),
            grow_end - grow_start,
            PageTableFlags::USER | PageTableFlags::WRITABLE,
        );
        if !ok {
            return current as i64;
        }
    }
    scheduler::set_current_brk(addr);
    addr as i64
}

// ── Process handlers ────────────────────────────────────────────

fn sys_fork() -> i64 {
    match scheduler::fork_current() {
        0 => -1,
        child => child as i64,
    }
}

fn sys_waitpid(pid: u32, status: u64, _options: i32) -> i64 {
    if status != 0 && !validate_user_range(status, size_of::<i32>()) {
        return -1;
    }
    loop {
        match scheduler::task_exit_status(pid) {
            None => return -1,
            Some((TaskState::Terminated, code)) => {
                if status != 0 {
                    // SAFETY: validated above; the current address space
                    // is the caller's.
                    unsafe { (status as *mut i32).write(code) };
                }
                return pid as i64;
            }
            Some(_) => scheduler::yield_now(),
        }
    }
}

/// execve(2): loads `filename` through the filesystem, rebuilds the
/// current task's image and enters it. Returns only on failure.
fn sys_execve(filename: u64, argv: u64, envp: u64) -> i64 {
    let mut path_buf = [0u8; MAX_USER_STR];
    let Some(path) = user_cstr(filename, &mut path_buf) else {
        return -1;
    };

    // Copy the user argv/envp before the address space is replaced.
    let mut argv_storage = [[0u8; MAX_USER_STR]; 8];
    let mut envp_storage = [[0u8; MAX_USER_STR]; 8];
    let Some(argc) = copy_user_vector(argv, &mut argv_storage) else {
        return -1;
    };
    let Some(envc) = copy_user_vector(envp, &mut envp_storage) else {
        return -1;
    };
    let mut argv_refs: [&str; 8] = [""; 8];
    let mut envp_refs: [&str; 8] = [""; 8];
    for i in 0..argc {
        let len = argv_storage[i].iter().position(|&b| b == 0).unwrap_or(0);
        argv_refs[i] = match core::str::from_utf8(&argv_storage[i][..len]) {
            Ok(s) => s,
            Err(_) => return -1,
        };
    }
    for i in 0..envc {
        let len = envp_storage[i].iter().position(|&b| b == 0).unwrap_or(0);
        envp_refs[i] = match core::str::from_utf8(&envp_storage[i][..len]) {
            Ok(s) => s,
            Err(_) => return -1,
        };
    }

    // Pull the file into physically contiguous frames via the HHDM.
    let Some((data_phys, pages, len)) = read_file_to_frames(path) else {
        return -1;
    };
    let data = unsafe {
        core::slice::from_raw_parts(
            data_phys.to_virt(vmm::hhdm_offset()).as_ptr::<u8>(),
            len,
        )
    };

    let prepared = scheduler::prepare_exec(data, &argv_refs[..argc], &envp_refs[..envc]);
    // The image (or nothing) now owns copies of everything it needs.
    pmm::free_frames(data_phys, pages);

    match prepared {
        Some(image) => scheduler::commit_exec(image),
        None => -1,
    }
}

/// Copies a user `char *vec[]` (NULL-terminated, at most the storage
/// capacity) into kernel buffers. Returns the entry count.
fn copy_user_vector(vec: u64, storage: &mut [[u8; MAX_USER_STR]]) -> Option<usize> {
    if vec == 0 {
        return Some(0);
    }
    let mut count = 0;
    for i in 0..storage.len() {
        let slot = vec + (i as u64) * 8;
        if !validate_user_range(slot, 8) {
            return None;
        }
        // SAFETY: validated user pointer read.
        let ptr = unsafe { *(slot as *const u64) };
        if ptr == 0 {
            break;
        }
        let mut buf = [0u8; MAX_USER_STR];
        user_cstr(ptr, &mut buf)?;
        storage[i] = buf;
        count += 1;
    }
    Some(count)
}

/// Reads a whole file into freshly allocated contiguous frames.
/// Returns (base frame, page count, byte length).
fn read_file_to_frames(path: &str) -> Option<(PhysAddr, usize, usize)> {
    let fd = fs::open(path, fs::O_RDONLY).ok()?;
    let result = (|| {
        let stat = fs::fstat(fd).ok()?;
        let len = stat.st_size as usize;
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
                Ok(0) => break,
                Ok(n) => read += n,
                Err(_) => {
                    pmm::free_frames(base, pages);
                    return None;
                }
            }
        }
        if read != len {
            pmm::free_frames(base, pages);
            return None;
        }
        Some((base, pages, len))
    })();
    let _ = fs::close(fd);
    result
}
