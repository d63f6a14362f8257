//! Locking for state shared with interrupt handlers.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::interrupts::InterruptGuard;

/// A spin lock that keeps interrupts masked while it is held.
///
/// On a single processor a handler can only observe the protected data
/// half-updated if it interrupts the holder, so masking interrupts is what
/// makes the lock sound. The spin lock catches reentry from the same path.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

/// Fields drop in order: the data lock is released before interrupts
/// are restored.
pub struct IrqMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _interrupts: InterruptGuard,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let interrupts = InterruptGuard::new();
        IrqMutexGuard {
            guard: self.inner.lock(),
            _interrupts: interrupts,
        }
    }

    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let interrupts = InterruptGuard::new();
        let guard = self.inner.try_lock()?;
        Some(IrqMutexGuard {
            guard,
            _interrupts: interrupts,
        })
    }
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::are_enabled;

    #[test]
    fn test_lock_masks_interrupts() {
        let lock = IrqMutex::new(5);
        {
            let mut value = lock.lock();
            assert!(!are_enabled());
            *value += 1;
        }
        assert!(are_enabled());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock_while_held() {
        let lock = IrqMutex::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        // the failed attempt must not unmask
        assert!(!are_enabled());
        drop(held);
        assert!(are_enabled());
    }
}
