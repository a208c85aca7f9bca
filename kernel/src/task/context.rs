// =============================================================================
// Helios — CPU Context and Context Switch
// =============================================================================
//
// Two switching mechanisms cooperate here:
//
//  1. `task_switch_context` — the scheduler-to-scheduler path. Saves the
//     SysV callee-save set (plus RFLAGS) on the outgoing task's kernel
//     stack, parks its RSP in the task structure, and resumes the
//     incoming task from its saved kernel RSP. Every suspended task is
//     "inside" this function; preemption state lives on kernel stacks.
//
//  2. `task_restore_context` — the one-shot entry to user mode. Loads the
//     full register file from a `CpuContext` and executes IRETQ, landing
//     in ring 3 at the context's RIP/RSP. A freshly created task's kernel
//     stack is primed so its first `task_switch_context` "return" lands
//     in `task_bootstrap`, which calls this. Fork children take the same
//     path with the parent's registers and RAX = 0.
//
// The `CpuContext` field offsets are baked into the assembly below and
// guarded by a unit test.
//
// =============================================================================

use core::arch::global_asm;

/// A task's saved register file.
///
/// The layout is `repr(C)` and the byte offsets are part of the contract
/// with `task_restore_context`; reorder only together with the assembly.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuContext {
    pub rax: u64,    // 0x00
    pub rbx: u64,    // 0x08
    pub rcx: u64,    // 0x10
    pub rdx: u64,    // 0x18
    pub rsi: u64,    // 0x20
    pub rdi: u64,    // 0x28
    pub rbp: u64,    // 0x30
    pub r8: u64,     // 0x38
    pub r9: u64,     // 0x40
    pub r10: u64,    // 0x48
    pub r11: u64,    // 0x50
    pub r12: u64,    // 0x58
    pub r13: u64,    // 0x60
    pub r14: u64,    // 0x68
    pub r15: u64,    // 0x70
    pub rip: u64,    // 0x78
    pub rsp: u64,    // 0x80
    pub rflags: u64, // 0x88
    pub cs: u64,     // 0x90
    pub ss: u64,     // 0x98
    pub ds: u64,     // 0xA0
    pub es: u64,     // 0xA8
    pub fs: u64,     // 0xB0
    pub gs: u64,     // 0xB8
    pub cr3: u64,    // 0xC0
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            rax: 0,
            rbx: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            rbp: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: 0,
            rsp: 0,
            rflags: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            es: 0,
            fs: 0,
            gs: 0,
            cr3: 0,
        }
    }
}

/// RFLAGS for a fresh user task: IF set plus the always-one bit 1.
pub const USER_RFLAGS: u64 = 0x202;

// -----------------------------------------------------------------------------
// task_switch_context(prev_rsp: *mut u64, next_rsp: u64)
//
// Saves rbp/rbx/r12-r15 and RFLAGS on the current stack, stores RSP
// through `prev_rsp`, switches to `next_rsp` and unwinds the same frame.
// The interrupt flag travels with each task: whatever IF the task had
// when it suspended is restored when it resumes.
// -----------------------------------------------------------------------------
global_asm!(
    ".global task_switch_context",
    "task_switch_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "pushfq",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "popfq",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

// -----------------------------------------------------------------------------
// task_restore_context(ctx: *const CpuContext) -> !
//
// Builds the IRETQ frame (SS, RSP, RFLAGS, CS, RIP) from the context,
// loads the data segments and the full GPR file, and IRETQs into ring 3.
// RDI is restored last because it carries the context pointer.
// -----------------------------------------------------------------------------
global_asm!(
    ".global task_restore_context",
    "task_restore_context:",
    "mov rax, [rdi + 0xA0]", // ds
    "mov ds, ax",
    "mov rax, [rdi + 0xA8]", // es
    "mov es, ax",
    "push qword ptr [rdi + 0x98]", // ss
    "push qword ptr [rdi + 0x80]", // rsp
    "push qword ptr [rdi + 0x88]", // rflags
    "push qword ptr [rdi + 0x90]", // cs
    "push qword ptr [rdi + 0x78]", // rip
    "mov rax, [rdi + 0x00]",
    "mov rbx, [rdi + 0x08]",
    "mov rcx, [rdi + 0x10]",
    "mov rdx, [rdi + 0x18]",
    "mov rsi, [rdi + 0x20]",
    "mov rbp, [rdi + 0x30]",
    "mov r8,  [rdi + 0x38]",
    "mov r9,  [rdi + 0x40]",
    "mov r10, [rdi + 0x48]",
    "mov r11, [rdi + 0x50]",
    "mov r12, [rdi + 0x58]",
    "mov r13, [rdi + 0x60]",
    "mov r14, [rdi + 0x68]",
    "mov r15, [rdi + 0x70]",
    "mov rdi, [rdi + 0x28]",
    "iretq",
);

unsafe extern "C" {
    /// Suspend the current task, storing its kernel RSP through
    /// `prev_rsp`, and resume the task whose kernel RSP is `next_rsp`.
    ///
    /// Returns only when the suspended task is scheduled again.
    pub fn task_switch_context(prev_rsp: *mut u64, next_rsp: u64);

    /// Enter user mode with the full register file from `ctx`.
    pub fn task_restore_context(ctx: *const CpuContext) -> !;
}

/// Number of quadwords `prime_kernel_stack` lays down.
const PRIMED_WORDS: usize = 9;

/// Prepares a fresh kernel stack so the first `task_switch_context` into
/// it "returns" to `entry`.
///
/// Layout from the primed RSP upward, matching the restore sequence
/// (popfq; pop r15/r14/r13/r12/rbx/rbp; ret):
///
/// ```text
///   [rsp + 0x00] rflags (IF clear — entry runs unpreempted until IRETQ)
///   [rsp + 0x08] r15
///   ...
///   [rsp + 0x30] rbp
///   [rsp + 0x38] return address = entry
///   [rsp + 0x40] alignment padding
/// ```
///
/// Returns the RSP value to store as the task's saved kernel RSP.
///
/// # Safety
/// `stack_top` must be the exclusive top of a writable, 16-byte-aligned
/// kernel stack with room for the primed frame.
pub unsafe fn prime_kernel_stack(stack_top: u64, entry: extern "C" fn() -> !) -> u64 {
    let rsp = stack_top - (PRIMED_WORDS as u64) * 8;
    let slots = rsp as *mut u64;
    unsafe {
        slots.add(0).write(0x2); // rflags: interrupts off, bit 1 set
        for i in 1..=6 {
            slots.add(i).write(0); // r15..rbp
        }
        slots.add(7).write(entry as u64);
        slots.add(8).write(0); // padding: keeps entry's RSP ≡ 8 (mod 16)
    }
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn context_offsets_match_restore_assembly() {
        assert_eq!(offset_of!(CpuContext, rax), 0x00);
        assert_eq!(offset_of!(CpuContext, rdi), 0x28);
        assert_eq!(offset_of!(CpuContext, rbp), 0x30);
        assert_eq!(offset_of!(CpuContext, r15), 0x70);
        assert_eq!(offset_of!(CpuContext, rip), 0x78);
        assert_eq!(offset_of!(CpuContext, rsp), 0x80);
        assert_eq!(offset_of!(CpuContext, rflags), 0x88);
        assert_eq!(offset_of!(CpuContext, cs), 0x90);
        assert_eq!(offset_of!(CpuContext, ss), 0x98);
        assert_eq!(offset_of!(CpuContext, ds), 0xA0);
        assert_eq!(offset_of!(CpuContext, es), 0xA8);
        assert_eq!(offset_of!(CpuContext, cr3), 0xC0);
    }

    #[test]
    fn primed_stack_unwinds_to_entry() {
        extern "C" fn dummy_entry() -> ! {
            unreachable!()
        }

        let mut stack = vec![0u64; 512];
        let top = unsafe { stack.as_mut_ptr().add(512) } as u64;
        let top = top & !0xF;
        let rsp = unsafe { prime_kernel_stack(top, dummy_entry) };

        assert_eq!(rsp, top - 72);
        let slots = rsp as *const u64;
        unsafe {
            assert_eq!(slots.add(0).read(), 0x2, "saved rflags");
            assert_eq!(slots.add(7).read(), dummy_entry as u64, "return rip");
        }
        // After popfq + 6 pops + ret, RSP sits 8 below the aligned top.
        assert_eq!((top - (rsp + 8 * 8)), 8);
    }
}
