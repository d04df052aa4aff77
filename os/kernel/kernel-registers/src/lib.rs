//! # Typed `x86_64` Registers
//!
//! Bitfield models of the control registers the task and memory managers
//! touch, plus the privileged instructions that load them.
//!
//! The models themselves are plain data and compile everywhere; the
//! `asm`-gated [`LoadRegisterUnsafe`]/[`StoreRegisterUnsafe`] impls and the
//! TLB helpers only exist on `x86_64`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "rflags")]
pub mod rflags;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
