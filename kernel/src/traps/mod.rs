//! Interrupt and exception handling.
//!
//! `stubs` holds the assembly entry points that normalize every vector
//! into one stack frame layout; `idt` owns the descriptor table, the
//! registered-handler dispatch and the 8259-facing default policy.

pub mod idt;
pub mod stubs;

pub use idt::{check_integrity, init, recover, register_handler};

use crate::arch::cpu;

/// The stack frame the assembly stubs hand to the dispatcher.
///
/// The stubs push a dummy error code for vectors where the CPU does not
/// supply one, then the vector number, then all 15 general-purpose
/// registers, so every handler sees the same layout. This struct is the
/// ABI between `stubs.rs` and the dispatcher — field order is the reverse
/// of the push order and must not change independently.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Vector number, pushed by the stub.
    pub vector: u64,
    /// CPU error code, or 0 for vectors that do not push one.
    pub error_code: u64,
    // Pushed by the CPU on interrupt entry:
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A registered interrupt handler.
pub type InterruptHandler = fn(&mut InterruptFrame);

/// Enables maskable interrupts.
#[inline]
pub fn interrupt_enable() {
    cpu::interrupt_enable();
}

/// Disables maskable interrupts.
#[allow(dead_code)]
#[inline]
pub fn interrupt_disable() {
    cpu::interrupt_disable();
}

/// Whether maskable interrupts are enabled (RFLAGS.IF).
#[allow(dead_code)]
#[inline]
pub fn interrupt_state() -> bool {
    cpu::interrupt_state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn interrupt_frame_layout_matches_stub_pushes() {
        // 15 GPRs + vector + error code + 5 CPU-pushed words.
        assert_eq!(size_of::<InterruptFrame>(), 22 * 8);
        // The stub pushes r15 last, so it sits at the lowest address.
        assert_eq!(offset_of!(InterruptFrame, r15), 0);
        assert_eq!(offset_of!(InterruptFrame, rax), 14 * 8);
        assert_eq!(offset_of!(InterruptFrame, vector), 15 * 8);
        assert_eq!(offset_of!(InterruptFrame, error_code), 16 * 8);
        assert_eq!(offset_of!(InterruptFrame, rip), 17 * 8);
        assert_eq!(offset_of!(InterruptFrame, ss), 21 * 8);
    }
}
