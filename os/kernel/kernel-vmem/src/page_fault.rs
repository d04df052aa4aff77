//! # Page-fault classification and demand paging

use crate::page_table::PageTableEntry;
use crate::tables::get_page_for_virt_address;
use crate::{FrameAlloc, PagingControl, PhysMapper, VmemError};
use bitfield_struct::bitfield;
use core::fmt;
use kernel_info::memory::{PAGE_SIZE, USER_REGION_END, USER_REGION_START};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::debug;

/// Page-fault error code pushed by the CPU (Intel SDM Vol. 3A, §6.15).
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64,
}

/// What a page fault means for the faulting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFaultKind {
    /// No tables cover the address.
    InvalidAddressSpace,
    /// Not-present access to a stack guard page.
    StackOverflow,
    /// Ordinary demand-paging fault; resolvable.
    PageNotPresent,
    /// Write to a read-only page.
    ReadonlyViolation,
    /// User-mode access to a supervisor page.
    PrivilegeViolation,
    /// Reserved bit set in a paging structure.
    ReservedWriteViolation,
    /// Instruction fetch from a no-execute page.
    InstructionFetch,
    UnknownProtectionViolation,
}

impl PageFaultKind {
    /// Everything except [`PageNotPresent`](Self::PageNotPresent) ends the task.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::PageNotPresent)
    }
}

impl fmt::Display for PageFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidAddressSpace => "invalid address space",
            Self::StackOverflow => "stack overflow",
            Self::PageNotPresent => "page not present",
            Self::ReadonlyViolation => "write to read-only page",
            Self::PrivilegeViolation => "user access to supervisor page",
            Self::ReservedWriteViolation => "reserved bit violation",
            Self::InstructionFetch => "instruction fetch from no-execute page",
            Self::UnknownProtectionViolation => "unknown protection violation",
        })
    }
}

/// Classify a fault at `va` in the address space rooted at `root`.
///
/// A not-present fault is decided by the entry alone, so a write that hits
/// a guard page is a [`StackOverflow`](PageFaultKind::StackOverflow)
/// regardless of the `write` bit.
///
/// # Safety
/// See [`get_page_for_virt_address`].
pub unsafe fn classify<M: PhysMapper>(
    va: VirtualAddress,
    root: PhysicalAddress,
    err: PageFaultErrorCode,
    mapper: &M,
) -> PageFaultKind {
    let Some(entry) = (unsafe { get_page_for_virt_address(va, root, mapper) }) else {
        return PageFaultKind::InvalidAddressSpace;
    };
    let entry = *entry;

    if !err.present() {
        return if entry.stack_guard() {
            PageFaultKind::StackOverflow
        } else {
            PageFaultKind::PageNotPresent
        };
    }

    if err.user() && !entry.user() {
        PageFaultKind::PrivilegeViolation
    } else if err.write() && !entry.writable() {
        PageFaultKind::ReadonlyViolation
    } else if err.reserved_bit() {
        PageFaultKind::ReservedWriteViolation
    } else if err.instruction_fetch() {
        PageFaultKind::InstructionFetch
    } else {
        PageFaultKind::UnknownProtectionViolation
    }
}

/// Whether `va` lies in the private user region.
#[inline]
#[must_use]
pub fn is_user_address(va: VirtualAddress) -> bool {
    (USER_REGION_START..USER_REGION_END).contains(&va.as_u64())
}

/// Back the page containing `va` with a fresh zeroed frame.
///
/// The entry becomes present, writable and huge; user-accessible inside
/// the user region, global otherwise. The stale TLB entry is flushed.
///
/// # Errors
/// - [`VmemError::InvalidAddressSpace`] if no tables cover `va`.
/// - [`VmemError::GuardPage`] if the page is a stack guard.
/// - [`VmemError::OutOfFrames`] if the frame allocator is exhausted. The
///   entry is left untouched.
///
/// # Safety
/// See [`get_page_for_virt_address`]. `frames` must hand out frames
/// reachable through `mapper`.
pub unsafe fn alloc_missing_page<M, A, P>(
    va: VirtualAddress,
    root: PhysicalAddress,
    frames: &mut A,
    mapper: &M,
    paging: &P,
) -> Result<PhysicalAddress, VmemError>
where
    M: PhysMapper,
    A: FrameAlloc + ?Sized,
    P: PagingControl,
{
    let entry =
        unsafe { get_page_for_virt_address(va, root, mapper) }.ok_or(VmemError::InvalidAddressSpace)?;
    if entry.stack_guard() {
        return Err(VmemError::GuardPage);
    }
    if entry.present() {
        return Ok(entry.physical_address());
    }

    let frame = frames.alloc_frame().ok_or(VmemError::OutOfFrames)?;
    unsafe { mapper.zero_frame(frame) };

    let mut mapped = PageTableEntry::huge_page(frame);
    if is_user_address(va) {
        mapped.set_user(true);
    } else {
        mapped.set_global(true);
    }
    *entry = mapped;

    let page = va.align_down(PAGE_SIZE);
    paging.invalidate_page(page);
    debug!("demand-mapped {page} -> {frame}");
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpFrames, RecordingPaging, TestPhys};
    use crate::{map_elf_address_space, map_kernel_address_space, map_stack_guard_page};
    use kernel_info::memory::{FRAME_SIZE, KERNEL_DYNAMIC_BASE, KERNEL_STATIC_BASE};

    const KERNEL_ROOT: PhysicalAddress = PhysicalAddress::new(0);
    const TASK_ROOT: PhysicalAddress = PhysicalAddress::new(FRAME_SIZE);

    fn setup() -> (TestPhys, BumpFrames) {
        let ram = TestPhys::new(4);
        unsafe {
            map_kernel_address_space(KERNEL_ROOT, &ram).unwrap();
            map_elf_address_space(TASK_ROOT, KERNEL_ROOT, &ram).unwrap();
        }
        (ram, BumpFrames::new(2, 4))
    }

    fn err() -> PageFaultErrorCode {
        PageFaultErrorCode::new()
    }

    #[test]
    fn unmapped_user_page_is_demand_paged() {
        let (ram, mut frames) = setup();
        let paging = RecordingPaging::default();
        let va = VirtualAddress::new(0x0040_1234);

        let user_write = err().with_write(true).with_user(true);
        let kind = unsafe { classify(va, TASK_ROOT, user_write, &ram) };
        assert_eq!(kind, PageFaultKind::PageNotPresent);
        assert!(!kind.is_fatal());

        // Dirty the frame first: the mapping must hand out zeroed memory.
        unsafe { *ram.phys_to_mut::<u64>(PhysicalAddress::new(2 * FRAME_SIZE + 64)) = 0xdead };

        let frame = unsafe { alloc_missing_page(va, TASK_ROOT, &mut frames, &ram, &paging) }.unwrap();
        assert_eq!(frame.as_u64(), 2 * FRAME_SIZE);
        assert_eq!(unsafe { *ram.phys_to_mut::<u64>(PhysicalAddress::new(2 * FRAME_SIZE + 64)) }, 0);

        let e = unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.unwrap();
        assert!(e.present() && e.writable() && e.huge() && e.user() && !e.global());
        assert_eq!(paging.invalidations(), [VirtualAddress::new(0x0040_0000)]);
    }

    #[test]
    fn kernel_dynamic_page_is_global() {
        let (ram, mut frames) = setup();
        let paging = RecordingPaging::default();
        let va = VirtualAddress::new(KERNEL_DYNAMIC_BASE + FRAME_SIZE);

        unsafe { alloc_missing_page(va, TASK_ROOT, &mut frames, &ram, &paging) }.unwrap();
        let e = unsafe { get_page_for_virt_address(va, KERNEL_ROOT, &ram) }.unwrap();
        assert!(e.present() && e.global() && !e.user());
    }

    #[test]
    fn exhaustion_leaves_the_entry_alone() {
        let (ram, _) = setup();
        let mut frames = BumpFrames::new(4, 4);
        let paging = RecordingPaging::default();
        let va = VirtualAddress::new(0x0060_0000);

        let res = unsafe { alloc_missing_page(va, TASK_ROOT, &mut frames, &ram, &paging) };
        assert_eq!(res, Err(VmemError::OutOfFrames));
        let e = unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.unwrap();
        assert!(e.is_unused());
        assert!(paging.invalidations().is_empty());
    }

    #[test]
    fn write_to_guard_page_is_stack_overflow() {
        let (ram, mut frames) = setup();
        let va = VirtualAddress::new(0x0080_0000);
        unsafe { map_stack_guard_page(va, TASK_ROOT, &ram) }.unwrap();

        let kind = unsafe { classify(va + 8, TASK_ROOT, err().with_write(true), &ram) };
        assert_eq!(kind, PageFaultKind::StackOverflow);
        assert!(kind.is_fatal());

        let paging = RecordingPaging::default();
        let res = unsafe { alloc_missing_page(va, TASK_ROOT, &mut frames, &ram, &paging) };
        assert_eq!(res, Err(VmemError::GuardPage));
    }

    #[test]
    fn unmapped_region_is_invalid_address_space() {
        let (ram, _) = setup();
        let va = VirtualAddress::new(0x0000_1000_0000_0000);
        let kind = unsafe { classify(va, TASK_ROOT, err(), &ram) };
        assert_eq!(kind, PageFaultKind::InvalidAddressSpace);
    }

    #[test]
    fn protection_faults_on_present_pages() {
        let (ram, _) = setup();
        let present = err().with_present(true);

        // Static window: supervisor-only, writable.
        let kernel = VirtualAddress::new(KERNEL_STATIC_BASE);
        let kind = unsafe { classify(kernel, TASK_ROOT, present.with_user(true), &ram) };
        assert_eq!(kind, PageFaultKind::PrivilegeViolation);

        let kind = unsafe { classify(kernel, TASK_ROOT, present.with_reserved_bit(true), &ram) };
        assert_eq!(kind, PageFaultKind::ReservedWriteViolation);

        let kind = unsafe { classify(kernel, TASK_ROOT, present.with_instruction_fetch(true), &ram) };
        assert_eq!(kind, PageFaultKind::InstructionFetch);

        let kind = unsafe { classify(kernel, TASK_ROOT, present.with_protection_key(true), &ram) };
        assert_eq!(kind, PageFaultKind::UnknownProtectionViolation);

        // Read-only user page.
        let va = VirtualAddress::new(0x00a0_0000);
        let e = unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.unwrap();
        *e = PageTableEntry::huge_page(PhysicalAddress::new(3 * FRAME_SIZE))
            .with_user(true)
            .with_writable(false);
        let kind = unsafe { classify(va, TASK_ROOT, present.with_user(true).with_write(true), &ram) };
        assert_eq!(kind, PageFaultKind::ReadonlyViolation);
    }
}
