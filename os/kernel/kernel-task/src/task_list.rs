use crate::TaskId;
use alloc::vec::Vec;
use kernel_info::tasks::MAX_TASKS;

/// Bounded, ordered list of task ids.
///
/// Used as the scheduler's run queue and as every wait list (finish
/// waiters, sleepers, blocking I/O). Holds ids rather than references, so
/// an entry can outlive its task; consumers check validity when they use it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskList {
    ids: Vec<TaskId>,
    capacity: usize,
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskList {
    /// Empty list holding up to [`MAX_TASKS`] ids.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_capacity(MAX_TASKS)
    }

    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::new(),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ids.len() >= self.capacity
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `id`.
    ///
    /// # Errors
    /// Hands `id` back if the list is full.
    pub fn push_back(&mut self, id: TaskId) -> Result<(), TaskId> {
        if self.is_full() {
            return Err(id);
        }
        self.ids.push(id);
        Ok(())
    }

    /// Unlink `id`, keeping the order of the rest.
    pub fn remove(&mut self, id: TaskId) -> bool {
        match self.position(id) {
            Some(i) => {
                self.ids.remove(i);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: TaskId) -> bool {
        self.ids.contains(&id)
    }

    #[must_use]
    pub fn position(&self, id: TaskId) -> Option<usize> {
        self.ids.iter().position(|&x| x == id)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<TaskId> {
        self.ids.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ids.iter().copied()
    }

    /// Every id once, starting at `start` and wrapping around.
    pub fn iter_circular(&self, start: usize) -> impl Iterator<Item = TaskId> + '_ {
        let len = self.ids.len();
        (0..len).map(move |i| self.ids[(start + i) % len])
    }

    /// Empty the list, returning its ids in order.
    pub fn take_all(&mut self) -> Vec<TaskId> {
        core::mem::take(&mut self.ids)
    }

    /// Move every id of `other` to the back of this list, dropping ids that
    /// do not fit.
    pub fn append(&mut self, other: &mut Self) -> usize {
        let mut dropped = 0;
        for id in other.take_all() {
            if self.push_back(id).is_err() {
                dropped += 1;
            }
        }
        dropped
    }
}
