//! # Address-space management
//!
//! An [`AddressSpace`] is the value a task group owns: the root of its
//! [`PageTables64`] block plus the bounds of its heap. The
//! [`AddressSpaceManager`] creates and destroys these and hands out memory
//! inside them.
//!
//! Heap memory is bump-allocated *downward* from `heap_high_limit`; nothing
//! is freed individually. Releasing the address space frees every demand
//! mapped user page and the table block in one go.
//!
//! ```text
//! heap_high_limit (initial) ┬──────────────┐
//!                           │ static alloc │
//!                           ├──────────────┤
//!                           │ stack        │ ◄─ returned base .. base+size
//!                           ├──────────────┤
//!                           │ guard page   │ not present, tagged
//! heap_high_limit (now)     ├──────────────┤
//!                           │   free       │
//! heap_low_limit            ┴──────────────┘
//! ```

use core::fmt;
use kernel_info::memory::{KERNEL_DYNAMIC_BASE, KERNEL_DYNAMIC_LAST, PAGE_SIZE};
use kernel_memory_addresses::align_down;
use kernel_sync::IrqLock;
use kernel_vmem::page_fault::{self, PageFaultErrorCode, PageFaultKind};
use kernel_vmem::{
    FrameAlloc, PageTables64, PagingControl, PhysMapper, PhysicalAddress, VirtualAddress, VmemError,
};
use log::{debug, error, info, warn};

/// Alignment of [`AddressSpaceManager::alloc_static`] results.
const STATIC_ALIGN: u64 = 16;

/// Errors from address-space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressSpaceError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("address space was released")]
    Released,
    #[error("heap exhausted")]
    HeapExhausted,
    #[error(transparent)]
    Vmem(#[from] VmemError),
}

/// The address space of one task group.
///
/// A released space has no root; [`pml4_phys_addr`](Self::pml4_phys_addr)
/// then reports `0`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    heap_low_limit: VirtualAddress,
    heap_high_limit: VirtualAddress,
    root: Option<PhysicalAddress>,
}

impl AddressSpace {
    #[must_use]
    pub const fn heap_low_limit(&self) -> VirtualAddress {
        self.heap_low_limit
    }

    #[must_use]
    pub const fn heap_high_limit(&self) -> VirtualAddress {
        self.heap_high_limit
    }

    /// Physical address of the PML4, or `None` once released.
    #[must_use]
    pub const fn root(&self) -> Option<PhysicalAddress> {
        self.root
    }

    /// Physical address of the PML4, `0` once released.
    #[must_use]
    pub const fn pml4_phys_addr(&self) -> u64 {
        match self.root {
            Some(root) => root.as_u64(),
            None => 0,
        }
    }

    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.root.is_none()
    }

    /// Bytes still available between the two limits.
    #[must_use]
    pub const fn heap_remaining(&self) -> u64 {
        self.heap_high_limit.as_u64().saturating_sub(self.heap_low_limit.as_u64())
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pml4", &format_args!("{:#x}", self.pml4_phys_addr()))
            .field("heap_low_limit", &self.heap_low_limit)
            .field("heap_high_limit", &self.heap_high_limit)
            .finish()
    }
}

/// Outcome of [`AddressSpaceManager::resolve_page_fault`], for the
/// exception layer to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultResolution {
    /// A frame was mapped; resume the faulting instruction.
    Resolved,
    /// Ordinary demand fault, but no frame was left.
    OutOfMemory,
    /// Not resolvable; the faulting task must not continue.
    Fatal(PageFaultKind),
}

/// Creates, populates and releases address spaces.
///
/// Holds the collaborators by reference: the physical mapper, the shared
/// frame allocator behind its interrupts-off lock, and the CR3/TLB control.
/// On construction it builds the kernel's own page tables, which every task
/// address space links to.
pub struct AddressSpaceManager<'k, M, A, P> {
    mapper: &'k M,
    frames: &'k IrqLock<A>,
    paging: &'k P,
    kernel_root: PhysicalAddress,
}

impl<'k, M, A, P> AddressSpaceManager<'k, M, A, P>
where
    M: PhysMapper,
    A: FrameAlloc,
    P: PagingControl,
{
    /// Allocate and build the kernel page tables.
    ///
    /// # Errors
    /// [`AddressSpaceError::OutOfMemory`] if no frame block is free.
    pub fn new(mapper: &'k M, frames: &'k IrqLock<A>, paging: &'k P) -> Result<Self, AddressSpaceError> {
        let kernel_root = frames
            .lock()
            .alloc_consecutive_frames(PageTables64::SIZE)
            .ok_or(AddressSpaceError::OutOfMemory)?;

        // SAFETY: freshly allocated, owned block.
        if let Err(e) = unsafe { kernel_vmem::map_kernel_address_space(kernel_root, mapper) } {
            frames.lock().free_consecutive_frames(kernel_root, PageTables64::SIZE);
            return Err(e.into());
        }

        info!("kernel address space at {kernel_root}");
        Ok(Self {
            mapper,
            frames,
            paging,
            kernel_root,
        })
    }

    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    #[must_use]
    pub const fn mapper(&self) -> &'k M {
        self.mapper
    }

    #[must_use]
    pub const fn paging(&self) -> &'k P {
        self.paging
    }

    #[must_use]
    pub const fn frames(&self) -> &'k IrqLock<A> {
        self.frames
    }

    /// The kernel's own address space: rooted at the kernel tables, heap in
    /// the dynamic kernel region.
    ///
    /// The topmost dynamic page stays unused so the limit fits in a `u64`.
    #[must_use]
    pub const fn kernel_address_space(&self) -> AddressSpace {
        AddressSpace {
            heap_low_limit: VirtualAddress::new(KERNEL_DYNAMIC_BASE),
            heap_high_limit: VirtualAddress::new(align_down(KERNEL_DYNAMIC_LAST, PAGE_SIZE)),
            root: Some(self.kernel_root),
        }
    }

    /// Allocate a table block and build a fresh task address space in it.
    ///
    /// # Errors
    /// [`AddressSpaceError::OutOfMemory`] if no frame block is free.
    pub fn alloc_address_space(
        &self,
        heap_low_limit: VirtualAddress,
        heap_high_limit: VirtualAddress,
    ) -> Result<AddressSpace, AddressSpaceError> {
        debug_assert!(heap_low_limit <= heap_high_limit);

        let root = self
            .frames
            .lock()
            .alloc_consecutive_frames(PageTables64::SIZE)
            .ok_or_else(|| {
                warn!("no frames left for a new address space");
                AddressSpaceError::OutOfMemory
            })?;

        // SAFETY: freshly allocated, owned block; kernel_root was built in `new`.
        if let Err(e) = unsafe { kernel_vmem::map_elf_address_space(root, self.kernel_root, self.mapper) } {
            self.frames.lock().free_consecutive_frames(root, PageTables64::SIZE);
            return Err(e.into());
        }

        debug!("address space allocated at {root}, heap {heap_low_limit}..{heap_high_limit}");
        Ok(AddressSpace {
            heap_low_limit,
            heap_high_limit,
            root: Some(root),
        })
    }

    /// Free every present user page and the table block, then mark the space
    /// released. Releasing twice is a no-op. The kernel address space is
    /// never released.
    pub fn release_address_space(&self, space: &mut AddressSpace) {
        let Some(root) = space.root else {
            return;
        };
        if root == self.kernel_root {
            warn!("refusing to release the kernel address space");
            return;
        }

        // SAFETY: the space owns its block until this point.
        let tables = unsafe { kernel_vmem::tables_at(root, self.mapper) };
        let mut frames = self.frames.lock();
        let mut pages = 0usize;
        for frame in tables.user_frames() {
            frames.free_frame(frame);
            pages += 1;
        }
        frames.free_consecutive_frames(root, PageTables64::SIZE);
        drop(frames);

        space.root = None;
        info!("address space {root} released ({pages} pages)");
    }

    /// Bump-allocate `size` bytes downward from the heap top.
    ///
    /// Returns `None` if the heap would cross `heap_low_limit` or the space
    /// was released; the space is unchanged then.
    pub fn alloc_static(&self, space: &mut AddressSpace, size: u64) -> Option<VirtualAddress> {
        space.root?;

        let base = space.heap_high_limit.checked_sub(size)?.align_down(STATIC_ALIGN);
        if base < space.heap_low_limit {
            return None;
        }
        space.heap_high_limit = base;
        Some(base)
    }

    /// Reserve a page-aligned stack of at least `num_bytes` at the heap top,
    /// with one guard page directly below it.
    ///
    /// Returns the lowest address of the stack. Returns `None` and leaves
    /// the space unchanged if the stack plus guard would cross
    /// `heap_low_limit`.
    pub fn alloc_stack_and_mark_guard_page(
        &self,
        space: &mut AddressSpace,
        num_bytes: u64,
    ) -> Option<VirtualAddress> {
        let root = space.root?;

        let size = kernel_memory_addresses::align_up(num_bytes.max(1), PAGE_SIZE)?;
        let top = space.heap_high_limit.align_down(PAGE_SIZE);
        let base = top.checked_sub(size)?;
        let guard = base.checked_sub(PAGE_SIZE)?;
        if guard < space.heap_low_limit {
            return None;
        }

        // SAFETY: the space owns the tables at `root`.
        let displaced = match unsafe { kernel_vmem::map_stack_guard_page(guard, root, self.mapper) } {
            Ok(displaced) => displaced,
            Err(e) => {
                warn!("cannot place stack guard at {guard}: {e}");
                return None;
            }
        };
        if let Some(frame) = displaced {
            self.frames.lock().free_frame(frame);
            self.paging.invalidate_page(guard);
        }

        space.heap_high_limit = guard;
        debug!("stack {base}..{top}, guard at {guard}");
        Some(base)
    }

    /// Demand-map the page containing `va`, or return the frame already
    /// mapped there.
    ///
    /// # Errors
    /// - [`AddressSpaceError::Released`] for a released space.
    /// - [`AddressSpaceError::OutOfMemory`] if no frame is free.
    /// - [`AddressSpaceError::Vmem`] for guard pages and uncovered addresses.
    pub fn alloc_missing_page(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, AddressSpaceError> {
        let root = space.root.ok_or(AddressSpaceError::Released)?;
        let mut frames = self.frames.lock();
        // SAFETY: the space owns the tables at `root`; frames come from the shared pool.
        let res = unsafe { page_fault::alloc_missing_page(va, root, &mut *frames, self.mapper, self.paging) };
        drop(frames);

        res.map_err(|e| match e {
            VmemError::OutOfFrames => {
                warn!("out of frames while demand-mapping {va}");
                AddressSpaceError::OutOfMemory
            }
            other => other.into(),
        })
    }

    /// Classify a page fault and demand-map ordinary not-present pages.
    ///
    /// Never kills anything; the caller decides what a fatal outcome means.
    pub fn resolve_page_fault(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        err: PageFaultErrorCode,
    ) -> PageFaultResolution {
        let Some(root) = space.root else {
            error!("page fault at {va} in a released address space");
            return PageFaultResolution::Fatal(PageFaultKind::InvalidAddressSpace);
        };

        // SAFETY: the space owns the tables at `root`.
        let kind = unsafe { page_fault::classify(va, root, err, self.mapper) };
        if kind.is_fatal() {
            error!("page fault at {va} ({err:?}): {kind}");
            return PageFaultResolution::Fatal(kind);
        }

        match self.alloc_missing_page(space, va) {
            Ok(_) => PageFaultResolution::Resolved,
            Err(AddressSpaceError::OutOfMemory) => PageFaultResolution::OutOfMemory,
            Err(e) => {
                error!("page fault at {va} not resolvable: {e}");
                PageFaultResolution::Fatal(PageFaultKind::InvalidAddressSpace)
            }
        }
    }

    /// Store `value` at `va` inside `space`, which need not be the active
    /// address space. The target page is demand-mapped first.
    ///
    /// # Errors
    /// See [`alloc_missing_page`](Self::alloc_missing_page);
    /// [`VmemError::Unaligned`] if `va` is not 8-byte aligned.
    pub fn write_u64(&self, space: &AddressSpace, va: VirtualAddress, value: u64) -> Result<(), AddressSpaceError> {
        if !va.is_aligned(8) {
            return Err(VmemError::Unaligned.into());
        }
        let frame = self.alloc_missing_page(space, va)?;
        let pa = frame + va.offset_in(PAGE_SIZE);
        // SAFETY: `pa` lies inside a frame mapped into `space`.
        unsafe { *self.mapper.phys_to_mut::<u64>(pa) = value };
        Ok(())
    }
}
