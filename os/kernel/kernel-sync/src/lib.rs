//! # Kernel synchronization primitives
//!
//! The kernel runs on a single logical CPU. The only actor that can observe a
//! half-updated structure is an interrupt handler, so every shared structure
//! (run queue, wait lists, frame bitmap) is mutated with interrupts disabled:
//!
//! * [`IrqGuard`] disables interrupts for a scope and restores the previous
//!   state on drop.
//! * [`IrqLock`] pairs an [`IrqGuard`] with an ownership flag. On one CPU with
//!   interrupts off, finding the flag already set can only mean the holder
//!   re-entered its own critical section, so [`IrqLock::lock`] panics instead
//!   of spinning forever.
//! * [`InstallOnce`] is a write-once slot for handing a kernel object to the
//!   assembly entry stubs.
//!
//! On hosted targets (unit and integration tests) the interrupt flag is
//! emulated, so the same code paths run under `cargo test`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod install_once;
pub mod irq;
mod irq_lock;

pub use install_once::InstallOnce;
pub use irq::IrqGuard;
pub use irq_lock::{IrqLock, IrqLockGuard};
