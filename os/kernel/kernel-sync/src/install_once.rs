use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// Write-once slot.
///
/// Kernel bring-up installs a value exactly once (for example the object the
/// timer entry stub dispatches to); afterwards readers get a shared reference
/// without taking any lock. A second `install` hands the value back.
pub struct InstallOnce<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for InstallOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InstallOnce<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Store `value` if the slot is still empty.
    ///
    /// # Errors
    /// Returns the value back if something was installed before.
    pub fn install(&self, value: T) -> Result<&T, T> {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }

        // SAFETY: WRITING makes us the only writer.
        let stored = unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
        Ok(stored)
    }

    /// Returns `Some(&T)` once installed.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY guarantees the write is done and never repeated.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Drop for InstallOnce<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

// Safety: shared after READY; installation is single-writer.
unsafe impl<T: Sync + Send> Sync for InstallOnce<T> {}
unsafe impl<T: Send> Send for InstallOnce<T> {}
