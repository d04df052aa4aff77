use crate::IrqGuard;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Interrupts-off critical section around a value.
///
/// Acquiring the lock first disables interrupts (remembering the previous
/// state) and then claims the value. Because the kernel runs on a single
/// CPU, a claimed value while interrupts are already off means the current
/// control path re-entered its own critical section (for example an
/// interrupt handler touching a structure the interrupted code was
/// mutating). [`lock`](Self::lock) panics in that case; it never spins.
pub struct IrqLock<T> {
    /// * `false`: free
    /// * `true`: held
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the held flag hands out exclusive access; only T: Send may cross contexts.
unsafe impl<T: Send> Sync for IrqLock<T> {}
unsafe impl<T: Send> Send for IrqLock<T> {}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Enter the critical section.
    ///
    /// # Panics
    /// If the lock is already held, i.e. on re-entrant acquisition.
    #[inline]
    #[track_caller]
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        match self.try_lock() {
            Some(guard) => guard,
            None => panic!("re-entrant critical section"),
        }
    }

    /// Try once; returns `None` if the lock is held.
    ///
    /// Interrupts are restored before returning `None`.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        if self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqLockGuard { lock: self, _irq: irq })
        } else {
            None
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    #[track_caller]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for IrqLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("IrqLock");
        match self.try_lock() {
            Some(guard) => d.field("value", &&*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// Guard returned by [`IrqLock::lock`]; releases the value, then restores
/// the interrupt flag.
pub struct IrqLockGuard<'a, T> {
    lock: &'a IrqLock<T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release before `_irq` drops and re-enables interrupts.
        self.lock.held.store(false, Ordering::Release);
    }
}
