//! Assembly entry stubs for all exception and IRQ vectors.
//!
//! The CPU pushes an error code for vectors 8, 10–14, 17 and 21 and
//! nothing for the rest. Each stub normalizes that difference — pushing a
//! dummy 0 where needed — then pushes its vector number and jumps to the
//! common path, which spills all 15 general-purpose registers and calls
//! the Rust dispatcher with a pointer to the completed
//! [`InterruptFrame`](super::InterruptFrame).
//!
//! The push order here and the struct layout in `traps::mod` are two
//! halves of one ABI.

use core::arch::global_asm;

// The common tail: spill GPRs, call into Rust, restore, drop the
// vector/error words and IRET.
global_asm!(
    ".global interrupt_common",
    "interrupt_common:",
    "push rax",
    "push rbx",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rbp",
    "push r8",
    "push r9",
    "push r10",
    "push r11",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov rdi, rsp",
    "cld",
    "call interrupt_dispatch",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "add rsp, 16", // vector + error code
    "iretq",
);

/// Emits a stub for a vector where the CPU pushes no error code.
macro_rules! isr_no_err {
    ($name:ident, $vec:literal) => {
        global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            "push 0",
            concat!("push ", stringify!($vec)),
            "jmp interrupt_common",
        );
    };
}

/// Emits a stub for a vector where the CPU pushes an error code.
macro_rules! isr_err {
    ($name:ident, $vec:literal) => {
        global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            concat!("push ", stringify!($vec)),
            "jmp interrupt_common",
        );
    };
}

// CPU exceptions 0–31.
isr_no_err!(isr0, 0); // #DE divide error
isr_no_err!(isr1, 1); // #DB debug
isr_no_err!(isr2, 2); // NMI
isr_no_err!(isr3, 3); // #BP breakpoint
isr_no_err!(isr4, 4); // #OF overflow
isr_no_err!(isr5, 5); // #BR bound range
isr_no_err!(isr6, 6); // #UD invalid opcode
isr_no_err!(isr7, 7); // #NM device not available
isr_err!(isr8, 8); // #DF double fault
isr_no_err!(isr9, 9); // coprocessor segment overrun (legacy)
isr_err!(isr10, 10); // #TS invalid TSS
isr_err!(isr11, 11); // #NP segment not present
isr_err!(isr12, 12); // #SS stack segment fault
isr_err!(isr13, 13); // #GP general protection
isr_err!(isr14, 14); // #PF page fault
isr_no_err!(isr15, 15);
isr_no_err!(isr16, 16); // #MF x87 FP
isr_err!(isr17, 17); // #AC alignment check
isr_no_err!(isr18, 18); // #MC machine check
isr_no_err!(isr19, 19); // #XM SIMD FP
isr_no_err!(isr20, 20); // #VE virtualization
isr_err!(isr21, 21); // #CP control protection
isr_no_err!(isr22, 22);
isr_no_err!(isr23, 23);
isr_no_err!(isr24, 24);
isr_no_err!(isr25, 25);
isr_no_err!(isr26, 26);
isr_no_err!(isr27, 27);
isr_no_err!(isr28, 28);
isr_no_err!(isr29, 29);
isr_no_err!(isr30, 30);
isr_no_err!(isr31, 31);

// Hardware IRQs 0–15 remapped to vectors 32–47.
isr_no_err!(irq0, 32);
isr_no_err!(irq1, 33);
isr_no_err!(irq2, 34);
isr_no_err!(irq3, 35);
isr_no_err!(irq4, 36);
isr_no_err!(irq5, 37);
isr_no_err!(irq6, 38);
isr_no_err!(irq7, 39);
isr_no_err!(irq8, 40);
isr_no_err!(irq9, 41);
isr_no_err!(irq10, 42);
isr_no_err!(irq11, 43);
isr_no_err!(irq12, 44);
isr_no_err!(irq13, 45);
isr_no_err!(irq14, 46);
isr_no_err!(irq15, 47);

unsafe extern "C" {
    fn isr0();
    fn isr1();
    fn isr2();
    fn isr3();
    fn isr4();
    fn isr5();
    fn isr6();
    fn isr7();
    fn isr8();
    fn isr9();
    fn isr10();
    fn isr11();
    fn isr12();
    fn isr13();
    fn isr14();
    fn isr15();
    fn isr16();
    fn isr17();
    fn isr18();
    fn isr19();
    fn isr20();
    fn isr21();
    fn isr22();
    fn isr23();
    fn isr24();
    fn isr25();
    fn isr26();
    fn isr27();
    fn isr28();
    fn isr29();
    fn isr30();
    fn isr31();
    fn irq0();
    fn irq1();
    fn irq2();
    fn irq3();
    fn irq4();
    fn irq5();
    fn irq6();
    fn irq7();
    fn irq8();
    fn irq9();
    fn irq10();
    fn irq11();
    fn irq12();
    fn irq13();
    fn irq14();
    fn irq15();
}

/// Entry addresses for vectors 0–47, in vector order.
pub fn stub_table() -> [usize; 48] {
    [
        isr0 as usize,
        isr1 as usize,
        isr2 as usize,
        isr3 as usize,
        isr4 as usize,
        isr5 as usize,
        isr6 as usize,
        isr7 as usize,
        isr8 as usize,
        isr9 as usize,
        isr10 as usize,
        isr11 as usize,
        isr12 as usize,
        isr13 as usize,
        isr14 as usize,
        isr15 as usize,
        isr16 as usize,
        isr17 as usize,
        isr18 as usize,
        isr19 as usize,
        isr20 as usize,
        isr21 as usize,
        isr22 as usize,
        isr23 as usize,
        isr24 as usize,
        isr25 as usize,
        isr26 as usize,
        isr27 as usize,
        isr28 as usize,
        isr29 as usize,
        isr30 as usize,
        isr31 as usize,
        irq0 as usize,
        irq1 as usize,
        irq2 as usize,
        irq3 as usize,
        irq4 as usize,
        irq5 as usize,
        irq6 as usize,
        irq7 as usize,
        irq8 as usize,
        irq9 as usize,
        irq10 as usize,
        irq11 as usize,
        irq12 as usize,
        irq13 as usize,
        irq14 as usize,
        irq15 as usize,
    ]
}
