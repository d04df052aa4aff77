//! # Memory Layout

/// Size of one physical frame in bytes.
///
/// Frames are handed out as whole 2 MiB units because every mapping in the
/// system is a PDE-level huge page; there is no PTE level.
pub const FRAME_SIZE: u64 = 2 * 1024 * 1024;

/// Size of one virtual page. Identical to [`FRAME_SIZE`].
pub const PAGE_SIZE: u64 = FRAME_SIZE;

/// Highest amount of physical memory the frame bitmap can describe.
///
/// Frames above this line are never handed out, regardless of how much
/// memory is actually installed.
pub const MAX_PHYSICAL_MEMORY: u64 = 128 * 1024 * 1024;

/// Number of frames tracked by the frame bitmap.
pub const MAX_FRAMES: usize = (MAX_PHYSICAL_MEMORY / FRAME_SIZE) as usize;

/// Number of entries in every paging structure.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Size of one region addressed by a single PDPT entry.
pub const REGION_SIZE: u64 = 1024 * 1024 * 1024;

/// First address of the private per-group user region.
pub const USER_REGION_START: u64 = 0;

/// End (exclusive) of the private per-group user region.
pub const USER_REGION_END: u64 = USER_REGION_START + REGION_SIZE;

/// Base of the static kernel window. Physical address `pa` (below 1 GiB)
/// is reachable at `KERNEL_STATIC_BASE + pa` in every address space.
pub const KERNEL_STATIC_BASE: u64 = 0xffff_ffff_8000_0000;

/// Base of the demand-paged kernel region (kernel stacks, kernel heap).
pub const KERNEL_DYNAMIC_BASE: u64 = 0xffff_ffff_c000_0000;

/// End (inclusive) of the dynamic kernel region.
pub const KERNEL_DYNAMIC_LAST: u64 = 0xffff_ffff_ffff_ffff;

/// PML4 slot shared by all kernel mappings.
pub const KERNEL_PML4_INDEX: usize = 511;

/// PDPT slot of the static window inside the kernel PDPT.
pub const KERNEL_STATIC_PDPT_INDEX: usize = 510;

/// PDPT slot of the dynamic region inside the kernel PDPT.
pub const KERNEL_DYNAMIC_PDPT_INDEX: usize = 511;

/// PML4 and PDPT slot of the user region.
pub const USER_PML4_INDEX: usize = 0;

/// PDPT slot of the user region.
pub const USER_PDPT_INDEX: usize = 0;

const _: () = {
    assert!(FRAME_SIZE.is_power_of_two());
    assert!(MAX_PHYSICAL_MEMORY.is_multiple_of(FRAME_SIZE));
    assert!(MAX_PHYSICAL_MEMORY <= REGION_SIZE, "static window must cover every frame");
    assert!(REGION_SIZE == ENTRIES_PER_TABLE as u64 * PAGE_SIZE);
    assert!(KERNEL_DYNAMIC_BASE - KERNEL_STATIC_BASE == REGION_SIZE);
    assert!(KERNEL_DYNAMIC_LAST - KERNEL_DYNAMIC_BASE == REGION_SIZE - 1);
};
