//! # Bitmap frame allocator
//!
//! One bit per 2 MiB frame over the first [`MAX_PHYSICAL_MEMORY`] bytes of
//! physical memory; a set bit means *used*. Frames outside the range handed
//! to [`BitmapFrameAlloc::init`] stay permanently reserved, and so does
//! everything above the ceiling even if more memory is installed.

use core::ops::Range;
use kernel_info::memory::{FRAME_SIZE, MAX_FRAMES, MAX_PHYSICAL_MEMORY};
use kernel_vmem::{FrameAlloc, PhysicalAddress};
use log::{info, warn};

const WORDS: usize = MAX_FRAMES.div_ceil(64);

pub struct BitmapFrameAlloc {
    bitmap: [u64; WORDS],
    /// Frames released by `init`; frees outside this range are ignored.
    usable: Range<usize>,
}

impl Default for BitmapFrameAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapFrameAlloc {
    /// An allocator with every frame reserved. Call [`init`](Self::init).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bitmap: [u64::MAX; WORDS],
            usable: 0..0,
        }
    }

    /// Release the frames fully inside `[first_byte, last_byte]` and reserve
    /// all others.
    pub fn init(&mut self, first_byte: u64, last_byte: u64) {
        if last_byte >= MAX_PHYSICAL_MEMORY {
            warn!(
                "{} MiB of physical memory beyond the {} MiB frame bitmap is unusable",
                (last_byte - MAX_PHYSICAL_MEMORY + 1) >> 20,
                MAX_PHYSICAL_MEMORY >> 20
            );
        }

        let first = usize::try_from(first_byte.div_ceil(FRAME_SIZE)).unwrap_or(MAX_FRAMES);
        let end = usize::try_from(last_byte.saturating_add(1) / FRAME_SIZE).unwrap_or(MAX_FRAMES);
        let end = end.min(MAX_FRAMES);
        let first = first.min(end);

        self.bitmap = [u64::MAX; WORDS];
        self.usable = first..end;
        for frame in first..end {
            self.set_used(frame, false);
        }

        info!(
            "frame allocator: {} of {} frames usable ({} MiB)",
            end - first,
            MAX_FRAMES,
            ((end - first) as u64 * FRAME_SIZE) >> 20
        );
    }

    #[inline]
    const fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    #[inline]
    const fn set_used(&mut self, frame: usize, used: bool) {
        if used {
            self.bitmap[frame / 64] |= 1 << (frame % 64);
        } else {
            self.bitmap[frame / 64] &= !(1 << (frame % 64));
        }
    }

    #[inline]
    const fn frame_address(frame: usize) -> PhysicalAddress {
        PhysicalAddress::new(frame as u64 * FRAME_SIZE)
    }

    /// Frame index of `pa` if it is a frame this allocator hands out.
    fn frame_index(&self, pa: PhysicalAddress) -> Option<usize> {
        if !pa.is_aligned(FRAME_SIZE) {
            return None;
        }
        let frame = usize::try_from(pa.as_u64() / FRAME_SIZE).ok()?;
        self.usable.contains(&frame).then_some(frame)
    }

    #[must_use]
    pub fn is_frame_used(&self, pa: PhysicalAddress) -> bool {
        usize::try_from(pa.as_u64() / FRAME_SIZE)
            .ok()
            .filter(|&f| f < MAX_FRAMES)
            .is_none_or(|f| self.is_used(f))
    }

    /// First free frame, scanning from frame 0.
    pub fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        let word = self.bitmap.iter().position(|&w| w != u64::MAX)?;
        let frame = word * 64 + self.bitmap[word].trailing_ones() as usize;
        if frame >= MAX_FRAMES {
            return None;
        }
        self.set_used(frame, true);
        Some(Self::frame_address(frame))
    }

    /// First run of `ceil(num_bytes / FRAME_SIZE)` free frames.
    ///
    /// A run that turns out too short restarts the scan just past the used
    /// frame that ended it.
    pub fn alloc_consecutive_frames(&mut self, num_bytes: u64) -> Option<PhysicalAddress> {
        let count = usize::try_from(num_bytes.div_ceil(FRAME_SIZE)).ok()?;
        if count == 0 || count > MAX_FRAMES {
            return None;
        }

        let mut start = 0;
        'scan: while start + count <= MAX_FRAMES {
            for frame in start..start + count {
                if self.is_used(frame) {
                    start = frame + 1;
                    continue 'scan;
                }
            }

            for frame in start..start + count {
                self.set_used(frame, true);
            }
            return Some(Self::frame_address(start));
        }
        None
    }

    /// Mark one frame free. Addresses outside the usable range are ignored.
    pub fn free_frame(&mut self, pa: PhysicalAddress) {
        if let Some(frame) = self.frame_index(pa) {
            self.set_used(frame, false);
        }
    }

    /// Mark a run of frames free, frame by frame.
    pub fn free_consecutive_frames(&mut self, pa: PhysicalAddress, num_bytes: u64) {
        let count = num_bytes.div_ceil(FRAME_SIZE);
        for i in 0..count {
            self.free_frame(pa + i * FRAME_SIZE);
        }
    }

    /// Frames currently marked used, reserved ones included. O(n).
    #[must_use]
    pub fn get_used_frames_count(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum::<usize>() - (WORDS * 64 - MAX_FRAMES)
    }

    #[must_use]
    pub const fn get_total_frames_count(&self) -> usize {
        MAX_FRAMES
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        Self::alloc_frame(self)
    }

    fn alloc_consecutive_frames(&mut self, num_bytes: u64) -> Option<PhysicalAddress> {
        Self::alloc_consecutive_frames(self, num_bytes)
    }

    fn free_frame(&mut self, pa: PhysicalAddress) {
        Self::free_frame(self, pa);
    }

    fn free_consecutive_frames(&mut self, pa: PhysicalAddress, num_bytes: u64) {
        Self::free_consecutive_frames(self, pa, num_bytes);
    }
}
