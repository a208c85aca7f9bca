// =============================================================================
// Helios — IRQ-safe Ticket Spinlock
// =============================================================================
//
// A ticket spinlock provides mutual exclusion for kernel data structures.
// It's the simplest fair lock: acquirers are served in FIFO order, which
// prevents starvation.
//
// HOW IT WORKS:
//   - Two counters: `next_ticket` and `now_serving`
//   - To lock: atomically increment `next_ticket`, get your ticket number.
//     Spin until `now_serving` equals your ticket.
//   - To unlock: increment `now_serving`, which lets the next waiter proceed.
//
// IRQ SAFETY:
//   Acquiring a spinlock MUST disable interrupts first. Otherwise:
//     1. A kernel path holds lock L with interrupts enabled
//     2. The timer interrupt fires
//     3. The interrupt handler tries to acquire lock L
//     4. DEADLOCK — the handler spins forever because the interrupted code
//        can't release the lock until the handler returns
//
//   The previous interrupt state (RFLAGS.IF) is saved so it can be restored
//   exactly on unlock — nested lock/unlock pairs work correctly. This makes
//   the type distinct from a plain spinlock: the scheduler relies on it to
//   serialize the task table against the timer interrupt.
//
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// A ticket-based spinlock that disables interrupts while held.
///
/// # Examples
/// ```ignore
/// static COUNTER: SpinLock<u64> = SpinLock::new(0);
///
/// {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// } // Lock released (and interrupt state restored) when guard drops
/// ```
pub struct SpinLock<T> {
    /// The next ticket to be dispensed (atomically incremented by lockers).
    next_ticket: AtomicU32,

    /// The ticket number currently being served (incremented on unlock).
    now_serving: AtomicU32,

    /// The protected data. UnsafeCell is required because we mutate through
    /// a shared reference (the lock ensures exclusive access at runtime).
    data: UnsafeCell<T>,
}

// SAFETY: The lock ensures only one context accesses T at a time, so the
// lock may be shared freely as long as T itself can be sent.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock wrapping the given value.
    ///
    /// `const` so spinlocks can be used in statics.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, disabling interrupts on the current CPU.
    ///
    /// Returns a guard providing `Deref`/`DerefMut` access to the protected
    /// data. The lock is released (and the interrupt state restored) when
    /// the guard is dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // Save the current interrupt state, then disable interrupts before
        // taking a ticket so an interrupt handler can never interleave.
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Acquire ordering ensures we see all writes made by the previous
        // lock holder before we touch the protected data.
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            core::hint::spin_loop();
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `None` if the lock is currently held. Useful in interrupt
    /// handlers where spinning on a lock held by the interrupted code
    /// would deadlock.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_was_enabled = interrupts_enabled();
        disable_interrupts();

        let current = self.now_serving.load(Ordering::Relaxed);
        // Take the next ticket only if it equals the currently-served one
        // (meaning the lock is free).
        let result = self.next_ticket.compare_exchange(
            current,
            current.wrapping_add(1),
            Ordering::Acquire,
            Ordering::Relaxed,
        );

        match result {
            Ok(_) => Some(SpinLockGuard {
                lock: self,
                irq_was_enabled,
            }),
            Err(_) => {
                if irq_was_enabled {
                    enable_interrupts();
                }
                None
            }
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Safe because `&mut self` guarantees exclusive access at compile
    /// time — no locking needed.
    #[allow(dead_code)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock.
///
/// While this guard exists the holder has exclusive access to the data and
/// interrupts are disabled on this CPU. Dropping it releases the lock and
/// restores the saved interrupt state.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release ordering makes all our writes visible to the next holder
        // before they observe the incremented `now_serving`.
        self.lock.now_serving.fetch_add(1, Ordering::Release);

        if self.irq_was_enabled {
            enable_interrupts();
        }
    }
}

// =============================================================================
// Interrupt state management
// =============================================================================
//
// Thin wrappers over STI/CLI/PUSHFQ. Under `cfg(test)` these are no-ops:
// host test binaries run in ring 3 where CLI would fault, and there is no
// interrupt delivery to guard against.
// =============================================================================

/// Checks whether interrupts are currently enabled on this CPU
/// (RFLAGS bit 9, the Interrupt Flag).
#[cfg(not(test))]
#[inline(always)]
fn interrupts_enabled() -> bool {
    let rflags: u64;
    // SAFETY: Reading RFLAGS is a side-effect-free observation.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            out(reg) rflags,
            options(nomem, preserves_flags)
        );
    }
    rflags & (1 << 9) != 0
}

/// Disables maskable interrupts on the current CPU (CLI).
#[cfg(not(test))]
#[inline(always)]
fn disable_interrupts() {
    // SAFETY: Disabling interrupts is always safe in kernel code; the
    // guard re-enables them if they were enabled.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Enables maskable interrupts on the current CPU (STI).
#[cfg(not(test))]
#[inline(always)]
fn enable_interrupts() {
    // SAFETY: Only called to restore a previously-saved enabled state.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

#[cfg(test)]
fn interrupts_enabled() -> bool {
    false
}

#[cfg(test)]
fn disable_interrupts() {}

#[cfg(test)]
fn enable_interrupts() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_provides_mutation() {
        let lock = SpinLock::new(0u64);
        {
            let mut g = lock.lock();
            *g += 41;
            *g += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }
}
