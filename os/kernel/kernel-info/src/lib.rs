//! # Kernel Layout and Limits
//!
//! Compile-time configuration shared by the memory manager and the task
//! manager. Nothing in here is discovered at runtime; every consumer reads
//! the same constants, so the page-table builder, the frame allocator and the
//! scheduler can never disagree about sizes or region boundaries.
//!
//! ## Modules
//!
//! * [`memory`]: frame/page size, the physical memory ceiling tracked by the
//!   frame bitmap, and the fixed virtual layout (private user gigabyte plus
//!   the two shared kernel gigabytes at the top of the address space).
//! * [`tasks`]: scheduler capacity, per-process open-file table size and the
//!   idle task's stack size.
//!
//! ## Virtual layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  User region (1 GiB, per group) │  PML4[0]   → PDPT[0]
//! USER_REGION_END       ├─────────────────────────────────┤
//!                       │            unmapped             │
//! KERNEL_STATIC_BASE    ├─────────────────────────────────┤  PML4[511] → PDPT[510]
//!                       │  Static window: phys 0..1 GiB   │
//! KERNEL_DYNAMIC_BASE   ├─────────────────────────────────┤  PML4[511] → PDPT[511]
//!                       │  Dynamic kernel region (demand) │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
pub mod tasks;
