//! # Address-space tables
//!
//! One [`PageTables64`] block backs one address space. The block is placed
//! at a frame-aligned physical address (its *root*); the PML4 sits at
//! offset zero, so the root is also the value loaded into CR3. Every link
//! between levels is the root plus the `offset_of!` of the next table.

use crate::page_table::{PageTable, PageTableEntry};
use crate::{PagingControl, PhysMapper, VmemError};
use core::mem::offset_of;
use kernel_info::memory::{
    ENTRIES_PER_TABLE, KERNEL_DYNAMIC_PDPT_INDEX, KERNEL_PML4_INDEX, KERNEL_STATIC_PDPT_INDEX,
    PAGE_SIZE, USER_PDPT_INDEX, USER_PML4_INDEX,
};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use log::{debug, trace};

/// The paging structures of one address space.
///
/// ```text
/// offset  table                 linked from
/// 0x0000  pml4                  CR3
/// 0x1000  user_pdpt             pml4[0]
/// 0x2000  user_pde              user_pdpt[0]
/// 0x3000  kernel_pdpt           pml4[511]
/// 0x4000  kernel_static_pde     kernel_pdpt[510]
/// 0x5000  kernel_dynamic_pde    kernel_pdpt[511]  (kernel tables only)
/// ```
///
/// Task address spaces point `kernel_pdpt[511]` at the *kernel's*
/// `kernel_dynamic_pde`; their own copy of that table stays empty.
#[repr(C, align(4096))]
pub struct PageTables64 {
    pub pml4: PageTable,
    pub user_pdpt: PageTable,
    pub user_pde: PageTable,
    pub kernel_pdpt: PageTable,
    pub kernel_static_pde: PageTable,
    pub kernel_dynamic_pde: PageTable,
}

impl PageTables64 {
    /// Bytes occupied by one block.
    pub const SIZE: u64 = size_of::<Self>() as u64;

    fn clear(&mut self) {
        for table in [
            &mut self.pml4,
            &mut self.user_pdpt,
            &mut self.user_pde,
            &mut self.kernel_pdpt,
            &mut self.kernel_static_pde,
            &mut self.kernel_dynamic_pde,
        ] {
            table.zero();
        }
    }

    /// Frames backing present pages of the private user region.
    pub fn user_frames(&self) -> impl Iterator<Item = PhysicalAddress> + '_ {
        self.user_pde
            .iter()
            .filter(|e| e.present() && e.huge())
            .map(PageTableEntry::physical_address)
    }

    /// Map physical `0..1 GiB` as global, writable 2 MiB pages.
    fn fill_static_window(pde: &mut PageTable) {
        for (i, entry) in pde.iter_mut().enumerate() {
            let pa = PhysicalAddress::new(i as u64 * PAGE_SIZE);
            *entry = PageTableEntry::huge_page(pa).with_global(true);
        }
    }
}

const _: () = {
    assert!(offset_of!(PageTables64, pml4) == 0);
    assert!(PageTables64::SIZE == 6 * 4096);
    assert!(PageTables64::SIZE <= kernel_info::memory::FRAME_SIZE);
    assert!(ENTRIES_PER_TABLE == 512);
};

#[inline]
const fn table_pa(root: PhysicalAddress, offset: usize) -> PhysicalAddress {
    PhysicalAddress::new(root.as_u64() + offset as u64)
}

/// View the block rooted at `root`.
///
/// # Safety
/// `root` must be a [`PageTables64`]-sized, 4 KiB-aligned region reachable
/// through `mapper`, with no other live reference into it.
#[inline]
pub unsafe fn tables_at<'a, M: PhysMapper>(root: PhysicalAddress, mapper: &M) -> &'a mut PageTables64 {
    unsafe { mapper.phys_to_mut::<PageTables64>(root) }
}

/// Build the kernel's own tables at `root`: the static window and an empty
/// dynamic region, no user region.
///
/// # Errors
/// [`VmemError::Unaligned`] if `root` is not 4 KiB-aligned.
///
/// # Safety
/// See [`tables_at`].
pub unsafe fn map_kernel_address_space<M: PhysMapper>(
    root: PhysicalAddress,
    mapper: &M,
) -> Result<(), VmemError> {
    if !root.is_aligned(4096) {
        return Err(VmemError::Unaligned);
    }

    let t = unsafe { tables_at(root, mapper) };
    t.clear();

    t.pml4[KERNEL_PML4_INDEX] =
        PageTableEntry::table(table_pa(root, offset_of!(PageTables64, kernel_pdpt)));
    t.kernel_pdpt[KERNEL_STATIC_PDPT_INDEX] =
        PageTableEntry::table(table_pa(root, offset_of!(PageTables64, kernel_static_pde)));
    t.kernel_pdpt[KERNEL_DYNAMIC_PDPT_INDEX] =
        PageTableEntry::table(table_pa(root, offset_of!(PageTables64, kernel_dynamic_pde)));
    PageTables64::fill_static_window(&mut t.kernel_static_pde);

    debug!("kernel page tables built at {root}");
    Ok(())
}

/// Build a fresh task address space at `root`: zeroed tables, an empty
/// private user region, the static kernel window and a link to the shared
/// dynamic kernel region of the tables at `kernel_root`.
///
/// # Errors
/// [`VmemError::Unaligned`] if `root` is not 4 KiB-aligned.
///
/// # Safety
/// See [`tables_at`]. `kernel_root` must hold tables built by
/// [`map_kernel_address_space`].
pub unsafe fn map_elf_address_space<M: PhysMapper>(
    root: PhysicalAddress,
    kernel_root: PhysicalAddress,
    mapper: &M,
) -> Result<(), VmemError> {
    if !root.is_aligned(4096) {
        return Err(VmemError::Unaligned);
    }

    let t = unsafe { tables_at(root, mapper) };
    t.clear();

    t.pml4[USER_PML4_INDEX] =
        PageTableEntry::table(table_pa(root, offset_of!(PageTables64, user_pdpt))).with_user(true);
    t.user_pdpt[USER_PDPT_INDEX] =
        PageTableEntry::table(table_pa(root, offset_of!(PageTables64, user_pde))).with_user(true);

    t.pml4[KERNEL_PML4_INDEX] =
        PageTableEntry::table(table_pa(root, offset_of!(PageTables64, kernel_pdpt)));
    t.kernel_pdpt[KERNEL_STATIC_PDPT_INDEX] =
        PageTableEntry::table(table_pa(root, offset_of!(PageTables64, kernel_static_pde)));
    t.kernel_pdpt[KERNEL_DYNAMIC_PDPT_INDEX] = PageTableEntry::table(table_pa(
        kernel_root,
        offset_of!(PageTables64, kernel_dynamic_pde),
    ));
    PageTables64::fill_static_window(&mut t.kernel_static_pde);

    trace!("task page tables built at {root}");
    Ok(())
}

/// Walk PML4 → PDPT → PDE for `va`.
///
/// Returns `None` if the address is not canonical or an intermediate table
/// is absent (the address lies outside the regions this layout maps).
///
/// # Safety
/// `root` must hold tables built by this module, reachable through
/// `mapper`, and the returned entry must not alias another live reference.
pub unsafe fn get_page_for_virt_address<'a, M: PhysMapper>(
    va: VirtualAddress,
    root: PhysicalAddress,
    mapper: &M,
) -> Option<&'a mut PageTableEntry> {
    if !va.is_canonical() {
        return None;
    }

    let pml4 = unsafe { mapper.phys_to_mut::<PageTable>(root) };
    let e4 = pml4[va.pml4_index()];
    if !e4.present() || e4.huge() {
        return None;
    }

    let pdpt = unsafe { mapper.phys_to_mut::<PageTable>(e4.physical_address()) };
    let e3 = pdpt[va.pdpt_index()];
    if !e3.present() || e3.huge() {
        return None;
    }

    let pd = unsafe { mapper.phys_to_mut::<PageTable>(e3.physical_address()) };
    Some(&mut pd[va.pd_index()])
}

/// Turn the page at `va` into a stack guard: not present, tagged
/// `stack_guard`.
///
/// Returns the frame that was mapped there before, if any; the caller owns
/// it again and must flush the stale translation.
///
/// # Errors
/// - [`VmemError::Unaligned`] if `va` is not page-aligned.
/// - [`VmemError::InvalidAddressSpace`] if the tables do not cover `va`.
///
/// # Safety
/// See [`get_page_for_virt_address`].
pub unsafe fn map_stack_guard_page<M: PhysMapper>(
    va: VirtualAddress,
    root: PhysicalAddress,
    mapper: &M,
) -> Result<Option<PhysicalAddress>, VmemError> {
    if !va.is_aligned(PAGE_SIZE) {
        return Err(VmemError::Unaligned);
    }

    let entry =
        unsafe { get_page_for_virt_address(va, root, mapper) }.ok_or(VmemError::InvalidAddressSpace)?;
    let displaced = entry.present().then(|| entry.physical_address());
    *entry = PageTableEntry::guard();

    trace!("guard page at {va}");
    Ok(displaced)
}

/// Make the tables at `root` the active address space.
///
/// # Safety
/// See [`PagingControl::load_root`].
pub unsafe fn load_address_space<P: PagingControl>(root: PhysicalAddress, paging: &P) {
    debug!("loading address space {root}");
    unsafe { paging.load_root(root) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPhys;
    use kernel_info::memory::{FRAME_SIZE, KERNEL_DYNAMIC_BASE, KERNEL_STATIC_BASE};

    const KERNEL_ROOT: PhysicalAddress = PhysicalAddress::new(0);
    const TASK_ROOT: PhysicalAddress = PhysicalAddress::new(FRAME_SIZE);

    fn ram_with_kernel() -> TestPhys {
        let ram = TestPhys::new(4);
        unsafe { map_kernel_address_space(KERNEL_ROOT, &ram) }.unwrap();
        ram
    }

    #[test]
    fn elf_layout_links_user_and_kernel_regions() {
        let ram = ram_with_kernel();
        unsafe { map_elf_address_space(TASK_ROOT, KERNEL_ROOT, &ram) }.unwrap();

        let t = unsafe { tables_at(TASK_ROOT, &ram) };
        let user = t.pml4[0];
        assert!(user.present() && user.user() && user.writable());
        assert_eq!(user.physical_address().as_u64(), FRAME_SIZE + 0x1000);
        assert!(t.user_pdpt[0].user());
        assert_eq!(t.user_frames().count(), 0);

        // Only the two regions are mapped.
        assert_eq!(t.pml4.iter().filter(|e| e.present()).count(), 2);

        let dynamic = t.kernel_pdpt[511].physical_address();
        assert_eq!(dynamic.as_u64(), 0x5000, "links the kernel's dynamic PDE");
    }

    #[test]
    fn static_window_maps_low_physical_memory() {
        let ram = ram_with_kernel();
        unsafe { map_elf_address_space(TASK_ROOT, KERNEL_ROOT, &ram) }.unwrap();

        let va = VirtualAddress::new(KERNEL_STATIC_BASE + 3 * FRAME_SIZE + 0x1234);
        let e = unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.unwrap();
        assert!(e.present() && e.huge() && e.global() && !e.user());
        assert_eq!(e.physical_address().as_u64(), 3 * FRAME_SIZE);
    }

    #[test]
    fn dynamic_kernel_region_is_shared() {
        let ram = ram_with_kernel();
        unsafe { map_elf_address_space(TASK_ROOT, KERNEL_ROOT, &ram) }.unwrap();

        let va = VirtualAddress::new(KERNEL_DYNAMIC_BASE + 5 * FRAME_SIZE);
        let from_task = unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.unwrap();
        *from_task = PageTableEntry::huge_page(PhysicalAddress::new(2 * FRAME_SIZE));

        let from_kernel = unsafe { get_page_for_virt_address(va, KERNEL_ROOT, &ram) }.unwrap();
        assert!(from_kernel.present());
        assert_eq!(from_kernel.physical_address().as_u64(), 2 * FRAME_SIZE);
    }

    #[test]
    fn walk_outside_the_layout_finds_nothing() {
        let ram = ram_with_kernel();
        unsafe { map_elf_address_space(TASK_ROOT, KERNEL_ROOT, &ram) }.unwrap();

        // PML4[1]: never linked.
        let va = VirtualAddress::new(0x0000_0080_0000_0000);
        assert!(unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.is_none());
        // PDPT[1] of the user region: never linked.
        let va = VirtualAddress::new(0x4000_0000);
        assert!(unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.is_none());
        // Non-canonical.
        let va = VirtualAddress::new(0x0000_8000_0000_0000);
        assert!(unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.is_none());
        // The kernel tables have no user region at all.
        assert!(unsafe { get_page_for_virt_address(VirtualAddress::zero(), KERNEL_ROOT, &ram) }.is_none());
    }

    #[test]
    fn guard_page_displaces_an_existing_mapping() {
        let ram = ram_with_kernel();
        unsafe { map_elf_address_space(TASK_ROOT, KERNEL_ROOT, &ram) }.unwrap();

        let va = VirtualAddress::new(7 * FRAME_SIZE);
        let e = unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.unwrap();
        *e = PageTableEntry::huge_page(PhysicalAddress::new(3 * FRAME_SIZE)).with_user(true);

        let displaced = unsafe { map_stack_guard_page(va, TASK_ROOT, &ram) }.unwrap();
        assert_eq!(displaced, Some(PhysicalAddress::new(3 * FRAME_SIZE)));

        let e = unsafe { get_page_for_virt_address(va, TASK_ROOT, &ram) }.unwrap();
        assert!(!e.present());
        assert!(e.stack_guard());

        assert_eq!(
            unsafe { map_stack_guard_page(va + 1, TASK_ROOT, &ram) },
            Err(VmemError::Unaligned)
        );
    }

    #[test]
    fn load_address_space_goes_through_paging_control() {
        let paging = crate::testing::RecordingPaging::default();
        unsafe { load_address_space(TASK_ROOT, &paging) };
        assert_eq!(paging.loads(), [TASK_ROOT]);
    }
}
