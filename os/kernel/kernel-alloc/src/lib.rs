//! # Kernel Memory Allocation
//!
//! Physical frames and per-group address spaces.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              AddressSpaceManager                    │
//! │    • alloc / release task address spaces            │
//! │    • static bump allocation, guarded stacks         │
//! │    • page-fault resolution, stack word writes       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              StaticMapPhysMapper                    │
//! │    • physical → kernel static window                │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           BitmapFrameAlloc                          │
//! │    • 2 MiB frames, one bit each                     │
//! │    • first-fit single and contiguous allocation     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The frame bitmap is shared kernel state: the manager only touches it
//! through an [`IrqLock`](kernel_sync::IrqLock), so an interrupt can never
//! observe a half-updated bitmap.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod address_space;
pub mod frame_alloc;
pub mod phys_mapper;

pub use address_space::{AddressSpace, AddressSpaceError, AddressSpaceManager, PageFaultResolution};
pub use frame_alloc::BitmapFrameAlloc;
pub use phys_mapper::StaticMapPhysMapper;
