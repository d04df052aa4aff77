use bitfield_struct::bitfield;
use core::ops::{Index, IndexMut};
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::PhysicalAddress;

/// One 64-bit entry of a PML4, PDPT or page directory.
///
/// | Bits  | Field         | Meaning |
/// |-------|---------------|---------|
/// | 0     | `present`     | Entry is valid |
/// | 1     | `writable`    | Writes allowed |
/// | 2     | `user`        | CPL3 access allowed |
/// | 3     | `write_through` | PWT |
/// | 4     | `cache_disable` | PCD |
/// | 5     | `accessed`    | Set by the CPU |
/// | 6     | `dirty`       | Set by the CPU on write (leaf only) |
/// | 7     | `huge`        | PS: PDE maps a 2 MiB page |
/// | 8     | `global`      | Survives CR3 reloads (leaf only) |
/// | 9     | `stack_guard` | Software: not-present stack guard page |
/// | 12–51 | address       | Physical base >> 12 |
/// | 63    | `no_execute`  | NX |
///
/// Bit 9 is ignored by the MMU, so a not-present entry can carry the guard
/// tag without changing how the hardware treats it.
///
/// ```rust
/// # use kernel_vmem::{PageTableEntry, PhysicalAddress};
/// let e = PageTableEntry::huge_page(PhysicalAddress::new(0x0060_0000));
/// assert!(e.present() && e.huge());
/// assert_eq!(e.physical_address().as_u64(), 0x0060_0000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,
    pub stack_guard: bool,

    #[bits(2)]
    __os_avail: u8,

    #[bits(40)]
    frame_4k: u64,

    #[bits(11)]
    __res: u16,

    pub no_execute: bool,
}

impl PageTableEntry {
    /// Present, writable pointer to a next-level table.
    #[must_use]
    pub fn table(pa: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_physical_address(pa)
    }

    /// Present, writable 2 MiB leaf.
    #[must_use]
    pub fn huge_page(pa: PhysicalAddress) -> Self {
        Self::table(pa).with_huge(true)
    }

    /// Not-present entry tagged as a stack guard.
    #[must_use]
    pub const fn guard() -> Self {
        Self::new().with_stack_guard(true)
    }

    #[must_use]
    pub fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_4k() << 12)
    }

    #[must_use]
    pub fn with_physical_address(self, pa: PhysicalAddress) -> Self {
        debug_assert!(pa.is_aligned(4096));
        self.with_frame_4k(pa.as_u64() >> 12)
    }

    pub fn set_physical_address(&mut self, pa: PhysicalAddress) {
        *self = self.with_physical_address(pa);
    }

    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }

    pub const fn clear(&mut self) {
        *self = Self::new();
    }
}

/// A 4 KiB-aligned paging structure of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Zero every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

const _: () = {
    assert!(size_of::<PageTableEntry>() == 8);
    assert!(size_of::<PageTable>() == 4096);
};
