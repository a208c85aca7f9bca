//! Interrupt Descriptor Table and dispatch.
//!
//! 256 16-byte gates, all type 0x8E (present, DPL 0, interrupt gate —
//! interrupts are off on entry) on the kernel code selector. Vectors 0–47
//! point at the assembly stubs; the rest stay non-present. SYSCALL does
//! not go through the IDT.
//!
//! Dispatch policy: a registered handler wins. With no handler, an
//! exception (vector < 32) gets a full register dump and halts the
//! machine, and a hardware IRQ (32–47) is acknowledged to the PIC so the
//! line does not wedge. Registered IRQ handlers send their own EOI, which
//! lets the timer handler acknowledge *before* a context switch.
//!
//! As with the GDT, a snapshot from boot allows integrity checking and
//! recovery after memory corruption.

use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::cpu;
use crate::arch::gdt::KERNEL_CODE_SELECTOR;
use crate::drivers::pic;
use crate::sync::SpinLock;
use crate::traps::stubs::stub_table;
use crate::traps::{InterruptFrame, InterruptHandler};

/// Number of IDT vectors on x86_64.
const IDT_ENTRIES: usize = 256;

/// Gate type 0x8E: present, DPL 0, 64-bit interrupt gate.
const GATE_INTERRUPT: u8 = 0x8E;

/// One 16-byte IDT gate.
///
/// ```text
/// bytes 0-1   offset bits 0-15
/// bytes 2-3   code segment selector
/// byte  4     IST index (bits 0-2)
/// byte  5     type and attributes
/// bytes 6-7   offset bits 16-31
/// bytes 8-11  offset bits 32-63
/// bytes 12-15 reserved
/// ```
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    /// A non-present gate.
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            ist: 0,
            type_attr: 0,
            offset_mid: 0,
            offset_high: 0,
            reserved: 0,
        }
    }

    /// A gate pointing at `handler` through `selector`.
    pub const fn new(handler: u64, selector: u16, ist: u8, type_attr: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector,
            ist: ist & 0x7,
            type_attr,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }

    /// The handler address encoded in this gate.
    #[allow(dead_code)]
    pub fn handler(&self) -> u64 {
        self.offset_low as u64
            | ((self.offset_mid as u64) << 16)
            | ((self.offset_high as u64) << 32)
    }

    fn raw_eq(&self, other: &Self) -> bool {
        self.offset_low == other.offset_low
            && self.selector == other.selector
            && self.ist == other.ist
            && self.type_attr == other.type_attr
            && self.offset_mid == other.offset_mid
            && self.offset_high == other.offset_high
    }
}

/// The full descriptor table, 16-byte aligned for the CPU's benefit.
#[repr(C, align(16))]
struct Idt {
    entries: [IdtEntry; IDT_ENTRIES],
}

/// Pointer operand for LIDT.
#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

static IDT: SpinLock<Idt> = SpinLock::new(Idt {
    entries: [IdtEntry::missing(); IDT_ENTRIES],
});

static IDT_BACKUP: SpinLock<Idt> = SpinLock::new(Idt {
    entries: [IdtEntry::missing(); IDT_ENTRIES],
});

/// Registered per-vector handlers, stored as function addresses so the
/// dispatcher can read them from interrupt context without taking a lock.
/// 0 means unregistered. Mutated only at init time or with interrupts
/// disabled.
static HANDLERS: [AtomicUsize; IDT_ENTRIES] =
    [const { AtomicUsize::new(0) }; IDT_ENTRIES];

/// Human-readable names for the architectural exceptions.
static EXCEPTION_NAMES: [&str; 32] = [
    "Divide By Zero",
    "Debug",
    "Non-maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

// =============================================================================
// Init / integrity
// =============================================================================

/// Builds the IDT, remaps the PIC and loads the table with LIDT.
///
/// Must run after `gdt::init` (the gates reference the kernel code
/// selector) and before interrupts are enabled.
pub fn init() {
    let stubs = stub_table();
    let base;
    {
        let mut idt = IDT.lock();
        for (vector, &stub) in stubs.iter().enumerate() {
            idt.entries[vector] =
                IdtEntry::new(stub as u64, KERNEL_CODE_SELECTOR, 0, GATE_INTERRUPT);
        }
        IDT_BACKUP.lock().entries = idt.entries;
        base = idt.entries.as_ptr() as u64;
    }

    pic::init();

    // SAFETY: the table is a static with a stable address, populated above.
    unsafe { load(base) };
    log::info!("IDT loaded ({} gates, 48 wired)", IDT_ENTRIES);
}

unsafe fn load(base: u64) {
    let ptr = IdtPointer {
        limit: (size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
        base,
    };
    unsafe {
        core::arch::asm!(
            "lidt [{}]",
            in(reg) &ptr,
            options(readonly, nostack, preserves_flags)
        );
    }
}

/// Compares the live table against the boot snapshot.
#[allow(dead_code)]
pub fn check_integrity() -> bool {
    let idt = IDT.lock();
    let backup = IDT_BACKUP.lock();
    idt.entries
        .iter()
        .zip(backup.entries.iter())
        .all(|(a, b)| a.raw_eq(b))
}

/// Restores the table from the boot snapshot and reloads it.
#[allow(dead_code)]
pub fn recover() -> bool {
    let base;
    {
        let mut idt = IDT.lock();
        idt.entries = IDT_BACKUP.lock().entries;
        base = idt.entries.as_ptr() as u64;
    }
    // SAFETY: same static table as in `init`.
    unsafe { load(base) };
    log::warn!("IDT reinstalled from boot snapshot");
    check_integrity()
}

/// Registers `handler` for `vector`, replacing any previous registration.
///
/// Handlers run in interrupt context with interrupts disabled; IRQ
/// handlers are responsible for their own EOI.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    HANDLERS[vector as usize].store(handler as usize, Ordering::Release);
}

// =============================================================================
// Dispatch
// =============================================================================

/// The Rust half of every interrupt: called by `interrupt_common` with a
/// pointer to the frame the stub built.
#[unsafe(no_mangle)]
extern "C" fn interrupt_dispatch(frame: *mut InterruptFrame) {
    // SAFETY: the stub passes the address of a fully initialized frame on
    // the current stack.
    let frame = unsafe { &mut *frame };
    let vector = frame.vector as usize;

    let handler = HANDLERS[vector].load(Ordering::Acquire);
    if handler != 0 {
        // SAFETY: only `register_handler` stores here, always from an
        // `InterruptHandler` fn pointer.
        let handler: InterruptHandler = unsafe { core::mem::transmute(handler) };
        handler(frame);
    } else if vector < 32 {
        unhandled_exception(frame);
    }

    // Unclaimed hardware IRQs are still acknowledged, or the PIC would
    // never deliver that line again.
    if (32..48).contains(&vector) && handler == 0 {
        pic::send_eoi((vector - 32) as u8);
    }
}

/// Logs the complete register state for a fatal exception and halts.
fn unhandled_exception(frame: &InterruptFrame) -> ! {
    let vector = frame.vector as usize;
    log::error!(
        "EXCEPTION: {} (vector {}, error code {:#x}) at RIP={:#018x}",
        EXCEPTION_NAMES[vector],
        vector,
        frame.error_code,
        frame.rip
    );
    log::error!(
        "  RAX={:#018x} RBX={:#018x} RCX={:#018x} RDX={:#018x}",
        frame.rax,
        frame.rbx,
        frame.rcx,
        frame.rdx
    );
    log::error!(
        "  RSI={:#018x} RDI={:#018x} RBP={:#018x} RSP={:#018x}",
        frame.rsi,
        frame.rdi,
        frame.rbp,
        frame.rsp
    );
    log::error!(
        "  R8 ={:#018x} R9 ={:#018x} R10={:#018x} R11={:#018x}",
        frame.r8,
        frame.r9,
        frame.r10,
        frame.r11
    );
    log::error!(
        "  R12={:#018x} R13={:#018x} R14={:#018x} R15={:#018x}",
        frame.r12,
        frame.r13,
        frame.r14,
        frame.r15
    );
    log::error!(
        "  RFLAGS={:#x} CS={:#x} SS={:#x}",
        frame.rflags,
        frame.cs,
        frame.ss
    );
    log::error!("system halted on unhandled exception");
    cpu::halt_forever();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_encoding_splits_offset() {
        let handler = 0xFFFF_FFFF_8012_3456u64;
        let entry = IdtEntry::new(handler, KERNEL_CODE_SELECTOR, 0, GATE_INTERRUPT);
        assert_eq!(entry.handler(), handler);
        assert_eq!({ entry.selector }, KERNEL_CODE_SELECTOR);
        assert_eq!(entry.type_attr, GATE_INTERRUPT);
        assert_eq!(size_of::<IdtEntry>(), 16);
    }

    #[test]
    fn missing_gate_is_not_present() {
        let entry = IdtEntry::missing();
        // Bit 7 of type_attr is the present bit.
        assert_eq!(entry.type_attr & 0x80, 0);
    }

    #[test]
    fn ist_index_is_masked_to_three_bits() {
        let entry = IdtEntry::new(0, KERNEL_CODE_SELECTOR, 0xFF, GATE_INTERRUPT);
        assert_eq!(entry.ist, 0x7);
    }
}
