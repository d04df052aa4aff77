//! Host stand-ins for physical memory and the MMU.
//!
//! Compiled for this crate's tests and, through the `testing` feature, for
//! the tests of crates built on top of it.

use crate::{FrameAlloc, PagingControl, PhysMapper};
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::cell::RefCell;
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Zeroed, frame-aligned host buffer standing in for physical memory.
///
/// Physical address `pa` is byte `pa` of the buffer, so frame `i` starts at
/// `i * FRAME_SIZE`.
pub struct TestPhys {
    base: *mut u8,
    layout: Layout,
}

impl TestPhys {
    /// # Panics
    /// If the host cannot provide the buffer.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames * FRAME_SIZE as usize, FRAME_SIZE as usize)
            .expect("test RAM layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "test RAM allocation failed");
        Self { base, layout }
    }

    /// Number of frames backing this buffer.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.layout.size() as u64 / FRAME_SIZE
    }

    /// Read a word at a physical address.
    ///
    /// # Panics
    /// If `pa` is outside the buffer.
    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        unsafe { *self.phys_to_mut::<u64>(pa) }
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = pa.as_u64() as usize;
        assert!(off + size_of::<T>() <= self.layout.size(), "{pa} outside test RAM");
        unsafe { &mut *self.base.add(off).cast::<T>() }
    }
}

/// Hands out frames upward from `next`, reusing freed ones first.
pub struct BumpFrames {
    pub next: u64,
    pub end: u64,
    pub freed: Vec<PhysicalAddress>,
}

impl BumpFrames {
    pub const fn new(first_frame: u64, frames: u64) -> Self {
        Self {
            next: first_frame * FRAME_SIZE,
            end: frames * FRAME_SIZE,
            freed: Vec::new(),
        }
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        if let Some(pa) = self.freed.pop() {
            return Some(pa);
        }
        self.alloc_consecutive_frames(FRAME_SIZE)
    }

    fn alloc_consecutive_frames(&mut self, num_bytes: u64) -> Option<PhysicalAddress> {
        let size = num_bytes.div_ceil(FRAME_SIZE) * FRAME_SIZE;
        if self.next + size > self.end {
            return None;
        }
        let pa = PhysicalAddress::new(self.next);
        self.next += size;
        Some(pa)
    }

    fn free_frame(&mut self, pa: PhysicalAddress) {
        self.freed.push(pa);
    }

    fn free_consecutive_frames(&mut self, pa: PhysicalAddress, _num_bytes: u64) {
        self.freed.push(pa);
    }
}

/// [`PagingControl`] that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingPaging {
    loads: RefCell<Vec<PhysicalAddress>>,
    invalidations: RefCell<Vec<VirtualAddress>>,
}

impl RecordingPaging {
    #[must_use]
    pub fn loads(&self) -> Vec<PhysicalAddress> {
        self.loads.borrow().clone()
    }

    #[must_use]
    pub fn invalidations(&self) -> Vec<VirtualAddress> {
        self.invalidations.borrow().clone()
    }
}

impl PagingControl for RecordingPaging {
    unsafe fn load_root(&self, root: PhysicalAddress) {
        self.loads.borrow_mut().push(root);
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.borrow_mut().push(va);
    }
}
