//! # Tasks and Scheduling
//!
//! Preemptive round-robin multitasking on a single CPU.
//!
//! * [`Task`]: one schedulable context (saved [`CpuState`], stack, wait list
//!   of tasks waiting for it to finish, shared [`TaskGroupData`]).
//! * [`TaskGroupData`]: what the threads of one process share (address
//!   space, working directory, open files, parent task id).
//! * [`TaskList`]: ordered list of task ids; the run queue and every wait
//!   list.
//! * [`RoundRobinScheduler`]: the run queue plus an idle fallback.
//! * [`TaskManager`]: the facade the interrupt and syscall layers call.
//!
//! ## Control flow
//!
//! ```text
//! timer IRQ ──► trampoline ──► TaskManager::schedule(frame)
//!                                 │ save frame into current task
//!                                 │ RoundRobinScheduler::pick_next_task
//!                                 │ load CR3 if the group changed
//!                                 ▼
//!               trampoline ◄── &next.context ── iretq into next task
//! ```
//!
//! Wait lists hold [`TaskId`]s, never references. Ids are not reused, so a
//! list entry for a task that has since been destroyed is simply skipped.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;
mod context;
mod error;
mod manager;
pub mod primitives;
mod scheduler;
mod task;
mod task_group;
mod task_list;

pub use context::CpuState;
pub use error::TaskError;
pub use manager::{EntryPoints, SleepToken, TaskManager, TaskServices};
pub use primitives::{Signal, TaskRequest};
pub use scheduler::RoundRobinScheduler;
pub use task::{Task, TaskId, TaskState};
pub use task_group::{FileHandle, GroupResources, OpenFileTable, TaskGroupData};
pub use task_list::TaskList;
