//! # QEMU debug console output
//!
//! Kernel log output goes to QEMU's debug console (I/O port `0x402`,
//! captured on the host with `-debugcon stdio`). Two entry points:
//!
//! * [`QemuLogger`], a `log::Log` backend. Every kernel crate logs through
//!   the `log` facade; installing this logger routes those records to the
//!   debug port.
//! * [`qemu_trace!`], which writes formatted text straight to the port,
//!   usable before the logger is installed or from a fault handler.
//!
//! ```text
//! log::info!(..) ──► QemuLogger ──┐
//!                                 ├─► QemuSink ──► out 0x402 ──► -debugcon
//! qemu_trace!(..) ────────────────┘
//! ```
//!
//! The port write only exists on bare-metal `x86_64` with the `enabled`
//! feature. Hosted builds (tests) and builds without the feature compile
//! the sink to a no-op.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! QemuLogger::new(LevelFilter::Debug).init().expect("logger initialization");
//! info!("frame allocator ready");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// The port number for QEMU's debug port.
    #[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Write a single byte to QEMU's debug port.
    #[allow(clippy::inline_always)]
    #[inline(always)]
    pub fn dbg_putc(c: u8) {
        #[cfg(all(feature = "enabled", target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") QEMU_DEBUG_PORT,
                in("al") c,
                options(nomem, nostack, preserves_flags)
            );
        }

        #[cfg(not(all(feature = "enabled", target_arch = "x86_64", target_os = "none")))]
        let _ = c;
    }

    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best-effort debug output.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

/// Formatted write to the QEMU debug console, bypassing the `log` facade.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        // No allocation: `format_args!` builds a lightweight `Arguments`.
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
