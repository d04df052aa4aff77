use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: Page-Map Level-4 Base Register (PCID disabled).
///
/// Holds the physical base of the active PML4 plus the two cache-control
/// bits for the walk. Writing CR3 switches address spaces and flushes every
/// non-global TLB entry.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: Reserved.
    #[bits(3)]
    __res0: u8,

    /// Bit 3: PWT: page-level write-through for the PML4 access.
    pub pwt: bool,

    /// Bit 4: PCD: page-level cache disable for the PML4 access.
    pub pcd: bool,

    /// Bits 5–11: Reserved.
    #[bits(7)]
    __res1: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–63: Reserved.
    #[bits(12)]
    __res2: u16,
}

impl Cr3 {
    /// Build a CR3 value pointing at `pml4`, with write-back caching.
    ///
    /// `pml4` must be 4 KiB-aligned.
    #[must_use]
    pub fn from_pml4(pml4: PhysicalAddress) -> Self {
        debug_assert!(pml4.is_aligned(4096), "PML4 base must be 4K-aligned");
        Self::new().with_pml4_base_4k(pml4.as_u64() >> 12)
    }

    /// Physical address of the PML4 this value points at.
    #[must_use]
    pub fn pml4(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
