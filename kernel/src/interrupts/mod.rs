//! Interrupt masking, descriptor tables and the timer entry path.
//!
//! The kernel runs on one processor, so keeping interrupts masked is what
//! makes access to shared kernel state exclusive. [`InterruptGuard`] turns
//! that rule into a value that has to be held.

pub mod gdt;
pub mod trap;

/// Interrupt flag state. On the kernel target this is EFLAGS.IF; elsewhere
/// a software flag stands in for it.
#[cfg(target_arch = "x86")]
mod flag {
    use core::arch::asm;
    use x86_64::registers::rflags::RFlags;

    pub fn are_enabled() -> bool {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
        }
        eflags & RFlags::INTERRUPT_FLAG.bits() as u32 != 0
    }

    pub fn enable() {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    pub fn disable() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }
}

#[cfg(all(not(target_arch = "x86"), not(test)))]
mod flag {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn are_enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    pub fn enable() {
        ENABLED.store(true, Ordering::SeqCst);
    }

    pub fn disable() {
        ENABLED.store(false, Ordering::SeqCst);
    }
}

// one flag per test thread, so parallel tests do not see each other
#[cfg(all(not(target_arch = "x86"), test))]
mod flag {
    use std::cell::Cell;

    std::thread_local! {
        static ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    pub fn are_enabled() -> bool {
        ENABLED.with(Cell::get)
    }

    pub fn enable() {
        ENABLED.with(|flag| flag.set(true));
    }

    pub fn disable() {
        ENABLED.with(|flag| flag.set(false));
    }
}

pub use flag::{are_enabled, disable, enable};

/// Interrupts stay masked for as long as this is alive.
///
/// Dropping it restores the flag to what it was when the guard was
/// taken, so guards nest.
#[must_use]
pub struct InterruptGuard {
    was_enabled: bool,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let was_enabled = are_enabled();
        if was_enabled {
            disable();
        }
        Self { was_enabled }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            enable();
        }
    }
}

/// Executes a closure with interrupts disabled.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = InterruptGuard::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_masks_and_restores() {
        assert!(are_enabled());
        {
            let _guard = InterruptGuard::new();
            assert!(!are_enabled());
        }
        assert!(are_enabled());
    }

    #[test]
    fn test_guards_nest() {
        let outer = InterruptGuard::new();
        let inner = InterruptGuard::new();
        drop(inner);
        assert!(!are_enabled());
        drop(outer);
        assert!(are_enabled());
    }

    #[test]
    fn test_without_interrupts() {
        let masked = without_interrupts(|| !are_enabled());
        assert!(masked);
        assert!(are_enabled());
    }

    #[test]
    fn test_guard_keeps_disabled_state() {
        disable();
        drop(InterruptGuard::new());
        assert!(!are_enabled());
        enable();
    }
}
