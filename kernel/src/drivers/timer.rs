//! 8253/8254 PIT timer driver.
//!
//! Programs channel 0 in mode 3 (square wave) at the requested frequency
//! and maintains the monotonic tick count. A single callback — a static
//! function pointer set once by the scheduler — is invoked on every tick.
//!
//! The IRQ0 handler acknowledges the PIC *before* running the callback:
//! the scheduler's callback may context-switch away mid-handler, and a
//! pending EOI at that point would block every further timer interrupt
//! until the preempted task happens to run again.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::arch::cpu;
use crate::drivers::pic;
use crate::traps::{self, InterruptFrame};

/// PIT input clock in Hz.
const PIT_FREQUENCY: u64 = 1_193_182;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const PIT_MODE3: u8 = 0x36;

static TICKS: AtomicU64 = AtomicU64::new(0);
static HZ: AtomicU64 = AtomicU64::new(0);

/// Tick callback as a raw function address; 0 when unset. A static fn
/// pointer rather than any stored closure — set once at scheduler init,
/// so there is no captured environment to keep alive.
static CALLBACK: AtomicUsize = AtomicUsize::new(0);

/// Signature of the tick callback: receives the monotonic tick count.
pub type TickCallback = fn(u64);

#[cfg(not(test))]
fn outb(port: u16, value: u8) {
    use x86_64::instructions::port::Port;
    // SAFETY: PIT register I/O has no memory side effects.
    unsafe { Port::<u8>::new(port).write(value) };
}

#[cfg(test)]
fn outb(_port: u16, _value: u8) {}

/// Computes the 16-bit PIT divisor for `hz`, clamping out-of-range
/// requests.
fn divisor_for(hz: u64) -> u16 {
    if hz == 0 {
        return 0xFFFF;
    }
    let divisor = PIT_FREQUENCY / hz;
    divisor.clamp(1, 0xFFFF) as u16
}

/// Programs the PIT for `hz` interrupts per second, installs the IRQ0
/// handler and unmasks the timer line.
pub fn init(hz: u64) {
    HZ.store(hz, Ordering::Relaxed);
    let divisor = divisor_for(hz);

    outb(PIT_COMMAND, PIT_MODE3);
    outb(PIT_CHANNEL0, divisor as u8);
    outb(PIT_CHANNEL0, (divisor >> 8) as u8);

    traps::register_handler(pic::IRQ_BASE, timer_interrupt);
    pic::unmask_irq(0);

    log::info!("PIT programmed at {} Hz (divisor {})", hz, divisor);
}

/// Registers the tick callback. Later registrations replace earlier ones.
pub fn register_callback(callback: TickCallback) {
    CALLBACK.store(callback as usize, Ordering::Release);
}

/// Monotonic tick count since boot.
#[allow(dead_code)]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Configured tick frequency in Hz.
#[allow(dead_code)]
pub fn frequency() -> u64 {
    HZ.load(Ordering::Relaxed)
}

/// Sleeps for at least `ms` milliseconds by spinning on the tick count,
/// gated by HLT so the CPU idles between interrupts.
///
/// Only callable with interrupts enabled (otherwise the tick count can
/// never advance and this never returns).
#[allow(dead_code)]
pub fn sleep(ms: u64) {
    let hz = HZ.load(Ordering::Relaxed).max(1);
    let target = ticks() + (ms * hz).div_ceil(1000).max(1);
    while ticks() < target {
        cpu::halt();
    }
}

/// The IRQ0 handler: count, acknowledge, then let the scheduler run.
fn timer_interrupt(_frame: &mut InterruptFrame) {
    let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    // EOI first — the callback may not return to this frame for a while.
    pic::send_eoi(0);

    let callback = CALLBACK.load(Ordering::Acquire);
    if callback != 0 {
        // SAFETY: only `register_callback` stores here, always from a
        // `TickCallback` fn pointer.
        let callback: TickCallback = unsafe { core::mem::transmute(callback) };
        callback(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_matches_pit_formula() {
        assert_eq!(divisor_for(1000), (1_193_182 / 1000) as u16);
        assert_eq!(divisor_for(100), (1_193_182 / 100) as u16);
    }

    #[test]
    fn divisor_clamps_to_sixteen_bits() {
        // 18 Hz would need a divisor > 0xFFFF.
        assert_eq!(divisor_for(1), 0xFFFF);
        assert_eq!(divisor_for(0), 0xFFFF);
        // Requests above the input clock clamp to 1.
        assert_eq!(divisor_for(2_000_000), 1);
    }
}
