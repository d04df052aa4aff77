use core::fmt;
use core::ops::{Add, Sub};

/// Virtual memory address.
///
/// Besides alignment helpers this type knows how the x86-64 walk slices an
/// address into table indices:
///
/// ```text
/// | 47‒39 | 38‒30 | 29‒21 | 20‒0          |
/// |  PML4 |  PDPT |   PD  | 2 MiB offset  |
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(crate::align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Option<Self> {
        match crate::align_up(self.0, align) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Offset within a granule of `align` bytes (power of two).
    #[inline]
    #[must_use]
    pub const fn offset_in(self, align: u64) -> u64 {
        self.0 & (align - 1)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_sub(self, rhs: u64) -> Option<Self> {
        match self.0.checked_sub(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// PML4 index (bits 47..39).
    #[inline]
    #[must_use]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1ff) as usize
    }

    /// PDPT index (bits 38..30).
    #[inline]
    #[must_use]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1ff) as usize
    }

    /// Page directory index (bits 29..21).
    #[inline]
    #[must_use]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1ff) as usize
    }

    /// Whether bits 63..48 are a sign extension of bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_ffff
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: u64) -> Self::Output {
        Self(self.0 - rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_of_kernel_dynamic_base() {
        let va = VirtualAddress::new(0xffff_ffff_c000_0000);
        assert_eq!(va.pml4_index(), 511);
        assert_eq!(va.pdpt_index(), 511);
        assert_eq!(va.pd_index(), 0);
        assert!(va.is_canonical());
    }

    #[test]
    fn indices_of_user_address() {
        let va = VirtualAddress::new(0x0000_0000_3fe0_0010);
        assert_eq!(va.pml4_index(), 0);
        assert_eq!(va.pdpt_index(), 0);
        assert_eq!(va.pd_index(), 511);
        assert_eq!(va.offset_in(0x20_0000), 0x10);
    }

    #[test]
    fn non_canonical_is_detected() {
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
    }

    #[test]
    fn checked_sub_underflows_to_none() {
        assert_eq!(VirtualAddress::new(4).checked_sub(8), None);
        assert_eq!(VirtualAddress::new(8).checked_sub(8), Some(VirtualAddress::zero()));
    }
}
