//! # Static-window `PhysMapper`
//!
//! Every address space maps physical `0..1 GiB` at `KERNEL_STATIC_BASE`, so
//! the kernel reaches any frame below the bitmap ceiling by adding that
//! base. This holds no matter which address space is loaded, which is what
//! lets the kernel edit the tables of an inactive task group.
//!
//! ```rust
//! use kernel_alloc::phys_mapper::StaticMapPhysMapper;
//! use kernel_vmem::PhysicalAddress;
//!
//! let va = StaticMapPhysMapper::virt_for(PhysicalAddress::new(0x0040_0000));
//! assert_eq!(va.as_u64(), 0xffff_ffff_8040_0000);
//! ```

use kernel_info::memory::{KERNEL_STATIC_BASE, REGION_SIZE};
use kernel_vmem::{PhysMapper, PhysicalAddress, VirtualAddress};

/// [`PhysMapper`] through the kernel static window.
pub struct StaticMapPhysMapper;

impl StaticMapPhysMapper {
    /// Kernel virtual address of `pa`.
    #[inline]
    #[must_use]
    pub const fn virt_for(pa: PhysicalAddress) -> VirtualAddress {
        debug_assert!(pa.as_u64() < REGION_SIZE);
        VirtualAddress::new(KERNEL_STATIC_BASE + pa.as_u64())
    }
}

impl PhysMapper for StaticMapPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let ptr = Self::virt_for(pa).as_mut_ptr::<T>();
        // SAFETY: the caller guarantees `pa` holds a `T`; the window covers it.
        unsafe { &mut *ptr }
    }
}
