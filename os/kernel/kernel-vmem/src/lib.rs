//! # Virtual Memory Support
//!
//! Fixed-layout x86-64 paging for the kernel and its task groups.
//!
//! ## What you get
//! - A [`PageTableEntry`] bitfield and a 4 KiB-aligned [`PageTable`].
//! - [`PageTables64`], the explicitly laid out block of tables backing one
//!   address space, and the functions that build and query it.
//! - Page-fault classification ([`page_fault::classify`]) and demand paging
//!   ([`page_fault::alloc_missing_page`]).
//! - The seams to the rest of the kernel: [`FrameAlloc`] (physical frames),
//!   [`PhysMapper`] (reach a physical address) and [`PagingControl`]
//!   (CR3 and TLB).
//!
//! ## Three-level walk
//!
//! Every mapping is a 2 MiB huge page, so the walk stops at the page
//! directory and there is no PTE level:
//!
//! ```text
//! | 63‒48 | 47‒39 | 38‒30 | 29‒21 | 20‒0          |
//! | sign  |  PML4 |  PDPT |   PD  | 2 MiB offset  |
//!
//!  PML4E ──► PDPTE ──► PDE (PS=1) ──► 2 MiB frame
//! ```
//!
//! ## Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┬ PML4[0]   → user PDPT[0]   → user PDE       (private, demand-paged)
//! 0x0000_0000_4000_0000 ┴
//!                          (unmapped)
//! 0xffff_ffff_8000_0000 ┬ PML4[511] → kernel PDPT[510] → static PDE   (phys 0..1 GiB, global)
//! 0xffff_ffff_c000_0000 ┼             kernel PDPT[511] → dynamic PDE  (shared, demand-paged)
//! 0xffff_ffff_ffff_ffff ┴
//! ```
//!
//! The dynamic kernel PDE exists once, in the kernel's own tables; every
//! task address space links to it, so a kernel page mapped on demand in one
//! address space is visible in all of them.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod page_fault;
mod page_table;
mod tables;

pub use crate::page_table::{PageTable, PageTableEntry};
pub use crate::tables::{
    PageTables64, get_page_for_virt_address, load_address_space, map_elf_address_space,
    map_kernel_address_space, map_stack_guard_page, tables_at,
};
pub use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Physical frame allocator.
///
/// Frames are [`info::FRAME_SIZE`] bytes. Exhaustion is reported as `None`,
/// never as a panic.
pub trait FrameAlloc {
    /// Allocate one frame.
    fn alloc_frame(&mut self) -> Option<PhysicalAddress>;

    /// Allocate enough physically contiguous frames to hold `num_bytes`.
    fn alloc_consecutive_frames(&mut self, num_bytes: u64) -> Option<PhysicalAddress>;

    /// Return one frame. Addresses the allocator does not manage are ignored.
    fn free_frame(&mut self, pa: PhysicalAddress);

    /// Return a run obtained from [`alloc_consecutive_frames`](Self::alloc_consecutive_frames).
    fn free_consecutive_frames(&mut self, pa: PhysicalAddress, num_bytes: u64);
}

/// Converts physical addresses to usable references in the current virtual
/// address space (in the kernel: through the static window).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be reachable and writable through this mapper.
    /// - The lifetime `'a` is unchecked; the memory must stay valid for `'a`.
    /// - `T` must match the bytes at `pa` and must not alias another live
    ///   mutable reference.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Fill one whole frame with zeros.
    ///
    /// # Safety
    /// `pa` must be a frame-aligned frame owned by the caller.
    unsafe fn zero_frame(&self, pa: PhysicalAddress) {
        let frame = unsafe { self.phys_to_mut::<[u64; FRAME_WORDS]>(pa) };
        frame.fill(0);
    }
}

const FRAME_WORDS: usize = (info::FRAME_SIZE / 8) as usize;

/// Control over the active translation: CR3 and the TLB.
pub trait PagingControl {
    /// Make the tables rooted at `root` the active address space.
    ///
    /// # Safety
    /// `root` must hold complete tables mapping the running kernel.
    unsafe fn load_root(&self, root: PhysicalAddress);

    /// Drop any cached translation for `va`.
    fn invalidate_page(&self, va: VirtualAddress);
}

/// [`PagingControl`] backed by the real `mov cr3` and `invlpg`.
///
/// Only exists in the bare-metal kernel build.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub struct X86Paging;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl PagingControl for X86Paging {
    unsafe fn load_root(&self, root: PhysicalAddress) {
        use kernel_registers::StoreRegisterUnsafe;
        unsafe { kernel_registers::cr3::Cr3::from_pml4(root).store_unsafe() }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: the kernel build runs at CPL0.
        unsafe { kernel_registers::tlb::invalidate_page(va) }
    }
}

/// Errors from building or editing page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmemError {
    #[error("no free physical frame")]
    OutOfFrames,
    #[error("address is not covered by this address space's tables")]
    InvalidAddressSpace,
    #[error("page is a stack guard page")]
    GuardPage,
    #[error("address is not aligned for this operation")]
    Unaligned,
}

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
