//! 16550 UART driver for the COM1 serial port.
//!
//! Serial output is the kernel's earliest and most reliable log sink: it
//! works before the framebuffer is touched and survives a hung display.
//! All logging goes through here (see `crate::logging`).

use crate::sync::SpinLock;
use core::fmt;

/// COM1 I/O port base.
const COM1_BASE: u16 = 0x3F8;

/// The global COM1 port, protected by a spinlock so that a log line from
/// an interrupt handler cannot interleave with one from a syscall path.
pub static SERIAL: SpinLock<SerialPort> = SpinLock::new(SerialPort::new(COM1_BASE));

/// A 16550-compatible UART addressed by its base I/O port.
pub struct SerialPort {
    base: u16,
    initialized: bool,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        Self {
            base,
            initialized: false,
        }
    }

    /// Programs the UART: 38400 baud, 8 data bits, no parity, one stop
    /// bit, FIFOs enabled.
    pub fn init(&mut self) {
        self.outb(1, 0x00); // Disable UART interrupts
        self.outb(3, 0x80); // DLAB on — divisor registers visible
        self.outb(0, 0x03); // Divisor low byte: 3 (115200 / 3 = 38400)
        self.outb(1, 0x00); // Divisor high byte
        self.outb(3, 0x03); // 8N1, DLAB off
        self.outb(2, 0xC7); // Enable + clear FIFOs, 14-byte threshold
        self.outb(4, 0x0B); // DTR + RTS + OUT2
        self.initialized = true;
    }

    /// Writes one byte, waiting for the transmit holding register to
    /// drain first. `\n` is expanded to `\r\n` for terminal emulators.
    /// Silently dropped before `init` has programmed the UART.
    pub fn write_byte(&mut self, byte: u8) {
        if !self.initialized {
            return;
        }
        if byte == b'\n' {
            self.write_raw(b'\r');
        }
        self.write_raw(byte);
    }

    fn write_raw(&mut self, byte: u8) {
        // Bit 5 of the line status register: transmit holding register
        // empty.
        while self.inb(5) & 0x20 == 0 {
            core::hint::spin_loop();
        }
        self.outb(0, byte);
    }

    #[cfg(not(test))]
    fn outb(&mut self, reg: u16, value: u8) {
        use x86_64::instructions::port::Port;
        let mut port = Port::<u8>::new(self.base + reg);
        // SAFETY: UART register I/O has no memory effects; the port range
        // belongs to COM1.
        unsafe { port.write(value) };
    }

    #[cfg(not(test))]
    fn inb(&mut self, reg: u16) -> u8 {
        use x86_64::instructions::port::Port;
        let mut port = Port::<u8>::new(self.base + reg);
        // SAFETY: see `outb`.
        unsafe { port.read() }
    }

    // Host test builds must not execute IN/OUT (ring 3 faults); the
    // logger is never installed in tests so these are unreachable, but
    // they must still compile.
    #[cfg(test)]
    fn outb(&mut self, _reg: u16, _value: u8) {}

    #[cfg(test)]
    fn inb(&mut self, _reg: u16) -> u8 {
        0x20
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Initializes COM1. Must run before the first log line.
pub fn init() {
    SERIAL.lock().init();
}
