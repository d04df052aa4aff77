//! # Task Limits

/// Maximum number of tasks admitted to the run queue at the same time.
///
/// The idle task does not count against this limit.
pub const MAX_TASKS: usize = 64;

/// Capacity of each task group's open-file table.
pub const MAX_OPEN_FILES: usize = 16;

/// Stack size of the idle task (one page; the guard page comes on top).
pub const IDLE_STACK_SIZE: u64 = crate::memory::PAGE_SIZE;

/// Default stack size for kernel-mode tasks.
pub const KERNEL_TASK_STACK_SIZE: u64 = crate::memory::PAGE_SIZE;

const _: () = {
    assert!(MAX_TASKS > 0);
    assert!(MAX_OPEN_FILES > 0);
};
