use crate::{CpuState, TaskError, TaskGroupData, TaskList};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::num::NonZeroU64;
use kernel_alloc::{AddressSpaceError, AddressSpaceManager};
use kernel_vmem::{FrameAlloc, PagingControl, PhysMapper, PhysicalAddress, VirtualAddress};

/// Task identifier. Zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Blocked,
}

/// One schedulable execution context.
///
/// Built by a task factory with [`Task::new`] or [`Task::with_new_stack`],
/// then handed to [`TaskManager::add_task`](crate::TaskManager::add_task),
/// which assigns the id and primes the saved context through
/// [`prepare`](Self::prepare).
pub struct Task {
    id: Option<TaskId>,
    state: TaskState,
    entrypoint: VirtualAddress,
    args: u64,
    is_user_space: bool,
    stack_addr: VirtualAddress,
    stack_size: u64,
    context: CpuState,
    root: Option<PhysicalAddress>,
    pub(crate) finish_waiters: TaskList,
    group: Arc<TaskGroupData>,
}

impl Task {
    /// A task that will run `entrypoint(args)` on the stack
    /// `stack_addr..stack_addr + stack_size`, which must already be
    /// reserved in `group`'s address space.
    #[must_use]
    pub fn new(
        entrypoint: VirtualAddress,
        args: u64,
        is_user_space: bool,
        stack_addr: VirtualAddress,
        stack_size: u64,
        group: Arc<TaskGroupData>,
    ) -> Box<Self> {
        Box::new(Self {
            id: None,
            state: TaskState::Running,
            entrypoint,
            args,
            is_user_space,
            stack_addr,
            stack_size,
            context: CpuState::default(),
            root: None,
            finish_waiters: TaskList::new(),
            group,
        })
    }

    /// Like [`new`](Self::new), reserving a guarded stack of at least
    /// `stack_size` bytes in `group` first.
    ///
    /// # Errors
    /// [`TaskError::Memory`] if the group's heap cannot hold the stack.
    pub fn with_new_stack<M, A, P>(
        asm: &AddressSpaceManager<'_, M, A, P>,
        group: &Arc<TaskGroupData>,
        entrypoint: VirtualAddress,
        args: u64,
        is_user_space: bool,
        stack_size: u64,
    ) -> Result<Box<Self>, TaskError>
    where
        M: PhysMapper,
        A: FrameAlloc,
        P: PagingControl,
    {
        let (stack_addr, stack_size) = group
            .alloc_stack(asm, stack_size)
            .ok_or(AddressSpaceError::HeapExhausted)?;
        Ok(Self::new(
            entrypoint,
            args,
            is_user_space,
            stack_addr,
            stack_size,
            Arc::clone(group),
        ))
    }

    /// Assign `id` and build the context the first switch into this task
    /// restores.
    ///
    /// The topmost stack word receives `exit_point`, so returning from the
    /// entry function lands there; `rsp` points at that word as if the
    /// entry function had just been called.
    ///
    /// # Errors
    /// [`TaskError::Memory`] if the stack page cannot be mapped.
    pub fn prepare<M, A, P>(
        &mut self,
        id: TaskId,
        exit_point: VirtualAddress,
        asm: &AddressSpaceManager<'_, M, A, P>,
    ) -> Result<(), TaskError>
    where
        M: PhysMapper,
        A: FrameAlloc,
        P: PagingControl,
    {
        let space = self.group.address_space();
        let top = self
            .stack_addr
            .checked_add(self.stack_size)
            .ok_or(AddressSpaceError::HeapExhausted)?;
        let return_slot = top - 8;
        asm.write_u64(&space, return_slot, exit_point.as_u64())?;

        self.id = Some(id);
        self.context = CpuState::initial(
            self.entrypoint.as_u64(),
            return_slot.as_u64(),
            self.args,
            self.is_user_space,
        );
        self.root = space.root();
        Ok(())
    }

    /// The id, once admitted.
    #[must_use]
    pub const fn id(&self) -> Option<TaskId> {
        self.id
    }

    #[must_use]
    pub const fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) const fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    #[must_use]
    pub const fn entrypoint(&self) -> VirtualAddress {
        self.entrypoint
    }

    #[must_use]
    pub const fn args(&self) -> u64 {
        self.args
    }

    #[must_use]
    pub const fn is_user_space(&self) -> bool {
        self.is_user_space
    }

    #[must_use]
    pub const fn stack_addr(&self) -> VirtualAddress {
        self.stack_addr
    }

    #[must_use]
    pub const fn stack_size(&self) -> u64 {
        self.stack_size
    }

    /// Saved register state; what the next switch into this task restores.
    #[must_use]
    pub const fn context(&self) -> &CpuState {
        &self.context
    }

    pub(crate) const fn context_mut(&mut self) -> &mut CpuState {
        &mut self.context
    }

    /// Page-table root to load before running this task.
    #[must_use]
    pub const fn root(&self) -> Option<PhysicalAddress> {
        self.root
    }

    #[must_use]
    pub const fn group(&self) -> &Arc<TaskGroupData> {
        &self.group
    }

    /// Tasks waiting for this one to finish.
    #[must_use]
    pub const fn finish_waiters(&self) -> &TaskList {
        &self.finish_waiters
    }

    /// Whether this task created `other`'s process.
    #[must_use]
    pub fn is_parent_of(&self, other: &Self) -> bool {
        self.id.is_some() && other.group.parent_task_id() == self.id
    }

    #[must_use]
    pub fn is_in_group(&self, group: &Arc<TaskGroupData>) -> bool {
        Arc::ptr_eq(&self.group, group)
    }

    pub(crate) fn into_group(self) -> Arc<TaskGroupData> {
        self.group
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("entrypoint", &self.entrypoint)
            .field("user", &self.is_user_space)
            .field("stack", &format_args!("{}+{:#x}", self.stack_addr, self.stack_size))
            .finish_non_exhaustive()
    }
}
