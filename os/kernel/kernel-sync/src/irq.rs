//! Interrupt flag control.
//!
//! On bare-metal `x86_64` these are `cli`/`sti`/`pushfq`. Everywhere else the
//! interrupt flag is an atomic so that code built on [`IrqGuard`] can be
//! exercised by host tests.

/// RFLAGS bit 9 (`IF`).
pub const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use super::RFLAGS_IF;

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r & RFLAGS_IF != 0
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static EMULATED_IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn disable() {
        EMULATED_IF.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable() {
        EMULATED_IF.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn enabled() -> bool {
        EMULATED_IF.load(Ordering::SeqCst)
    }
}

/// Disables maskable interrupts (`cli`).
///
/// # Privilege
///
/// Ring 0 only on bare metal.
#[inline]
pub fn disable_interrupts() {
    imp::disable();
}

/// Enables maskable interrupts (`sti`).
///
/// # Privilege
///
/// Ring 0 only on bare metal.
#[inline]
pub fn enable_interrupts() {
    imp::enable();
}

/// Whether maskable interrupts are currently enabled (`RFLAGS.IF`).
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    imp::enabled()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the interrupt flag. If interrupts were enabled
/// it disables them; on drop it re-enables them **only** if they were enabled
/// before, so guards nest correctly.
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}
