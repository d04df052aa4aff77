use crate::{TaskError, TaskId};
use alloc::string::String;
use alloc::sync::Arc;
use kernel_alloc::{AddressSpace, AddressSpaceManager};
use kernel_info::memory::PAGE_SIZE;
use kernel_info::tasks::MAX_OPEN_FILES;
use kernel_memory_addresses::align_up;
use kernel_sync::IrqLock;
use kernel_vmem::{FrameAlloc, PagingControl, PhysMapper, PhysicalAddress, VirtualAddress};
use log::{debug, info};

/// Opaque handle of an open file, owned by the VFS layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u64);

impl FileHandle {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Fixed-capacity descriptor table. Descriptors are slot indices; the
/// lowest free slot is handed out first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileTable {
    slots: [Option<FileHandle>; MAX_OPEN_FILES],
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_OPEN_FILES],
        }
    }

    /// Store `handle` and return its descriptor.
    ///
    /// # Errors
    /// [`TaskError::FileTableFull`] if every slot is taken.
    pub fn insert(&mut self, handle: FileHandle) -> Result<usize, TaskError> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(TaskError::FileTableFull)?;
        self.slots[fd] = Some(handle);
        Ok(fd)
    }

    pub fn remove(&mut self, fd: usize) -> Option<FileHandle> {
        self.slots.get_mut(fd).and_then(Option::take)
    }

    #[must_use]
    pub fn get(&self, fd: usize) -> Option<FileHandle> {
        self.slots.get(fd).copied().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Empty the table, yielding every handle in descriptor order.
    pub fn drain(&mut self) -> impl Iterator<Item = FileHandle> + '_ {
        self.slots.iter_mut().filter_map(Option::take)
    }
}

/// The mutable part of a task group.
#[derive(Debug)]
pub struct GroupResources {
    pub address_space: AddressSpace,
    pub cwd: String,
    pub files: OpenFileTable,
}

/// What the threads of one process share.
///
/// Held as `Arc<TaskGroupData>` by every [`Task`](crate::Task) of the
/// group. The task manager tears the group down when it drops the last
/// task: every open file is closed, then the address space is released.
#[derive(Debug)]
pub struct TaskGroupData {
    parent_task_id: Option<TaskId>,
    resources: IrqLock<GroupResources>,
}

impl TaskGroupData {
    /// A new group owning `address_space`.
    ///
    /// `parent_task_id` is the task that created the process, if any.
    #[must_use]
    pub fn new(address_space: AddressSpace, cwd: impl Into<String>, parent_task_id: Option<TaskId>) -> Arc<Self> {
        Arc::new(Self {
            parent_task_id,
            resources: IrqLock::new(GroupResources {
                address_space,
                cwd: cwd.into(),
                files: OpenFileTable::new(),
            }),
        })
    }

    #[must_use]
    pub const fn parent_task_id(&self) -> Option<TaskId> {
        self.parent_task_id
    }

    #[must_use]
    pub fn address_space(&self) -> AddressSpace {
        self.resources.lock().address_space
    }

    /// Page-table root of the group's address space.
    #[must_use]
    pub fn root(&self) -> Option<PhysicalAddress> {
        self.resources.lock().address_space.root()
    }

    pub fn with_resources<R>(&self, f: impl FnOnce(&mut GroupResources) -> R) -> R {
        self.resources.with_lock(f)
    }

    #[must_use]
    pub fn cwd(&self) -> String {
        self.resources.lock().cwd.clone()
    }

    pub fn set_cwd(&self, cwd: impl Into<String>) {
        self.resources.lock().cwd = cwd.into();
    }

    /// Register an open file and return its descriptor.
    ///
    /// # Errors
    /// [`TaskError::FileTableFull`] if the table has no free slot.
    pub fn open_file(&self, handle: FileHandle) -> Result<usize, TaskError> {
        self.resources.lock().files.insert(handle)
    }

    pub fn close_file(&self, fd: usize) -> Option<FileHandle> {
        self.resources.lock().files.remove(fd)
    }

    #[must_use]
    pub fn file(&self, fd: usize) -> Option<FileHandle> {
        self.resources.lock().files.get(fd)
    }

    /// Static memory from the group's heap (the `brk` path).
    pub fn alloc_static<M, A, P>(&self, asm: &AddressSpaceManager<'_, M, A, P>, size: u64) -> Option<VirtualAddress>
    where
        M: PhysMapper,
        A: FrameAlloc,
        P: PagingControl,
    {
        self.with_resources(|r| asm.alloc_static(&mut r.address_space, size))
    }

    /// A guarded stack of at least `num_bytes` in the group's heap.
    ///
    /// Returns the lowest stack address and the page-rounded size.
    pub fn alloc_stack<M, A, P>(
        &self,
        asm: &AddressSpaceManager<'_, M, A, P>,
        num_bytes: u64,
    ) -> Option<(VirtualAddress, u64)>
    where
        M: PhysMapper,
        A: FrameAlloc,
        P: PagingControl,
    {
        let size = align_up(num_bytes.max(1), PAGE_SIZE)?;
        let base = self.with_resources(|r| asm.alloc_stack_and_mark_guard_page(&mut r.address_space, size))?;
        Some((base, size))
    }

    /// Tear the group down: close every file through `close`, then release
    /// the address space.
    ///
    /// Returns the root that was released, or `None` if nothing was (the
    /// kernel group, or a space that was already released).
    pub fn destroy<M, A, P>(
        self,
        asm: &AddressSpaceManager<'_, M, A, P>,
        mut close: impl FnMut(FileHandle),
    ) -> Option<PhysicalAddress>
    where
        M: PhysMapper,
        A: FrameAlloc,
        P: PagingControl,
    {
        let mut res = self.resources.into_inner();

        let mut closed = 0usize;
        for handle in res.files.drain() {
            close(handle);
            closed += 1;
        }
        debug!("closed {closed} files of group {:?}", res.address_space);

        let root = res.address_space.root();
        asm.release_address_space(&mut res.address_space);
        let released = root.filter(|_| res.address_space.is_released());
        if let Some(root) = released {
            info!("task group at {root} destroyed");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_reuse_the_lowest_free_slot() {
        let mut t = OpenFileTable::new();
        for i in 0..MAX_OPEN_FILES {
            assert_eq!(t.insert(FileHandle::new(100 + i as u64)), Ok(i));
        }
        assert_eq!(t.insert(FileHandle::new(999)), Err(TaskError::FileTableFull));

        assert_eq!(t.remove(3), Some(FileHandle::new(103)));
        assert_eq!(t.remove(3), None);
        assert_eq!(t.remove(MAX_OPEN_FILES), None);
        assert_eq!(t.insert(FileHandle::new(7)), Ok(3));
        assert_eq!(t.get(3), Some(FileHandle::new(7)));
    }

    #[test]
    fn drain_empties_in_descriptor_order() {
        let mut t = OpenFileTable::new();
        t.insert(FileHandle::new(1)).unwrap();
        t.insert(FileHandle::new(2)).unwrap();
        t.remove(0);
        t.insert(FileHandle::new(3)).unwrap();

        let drained: Vec<_> = t.drain().collect();
        assert_eq!(drained, [FileHandle::new(3), FileHandle::new(2)]);
        assert!(t.is_empty());
    }
}
