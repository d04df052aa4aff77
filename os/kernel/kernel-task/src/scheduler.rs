use crate::{Task, TaskId, TaskList, TaskState};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use kernel_info::tasks::MAX_TASKS;
use log::{debug, trace};

/// Round-robin run queue with an idle fallback.
///
/// The queue order lives in a [`TaskList`]; the tasks themselves are owned
/// by an id-keyed map. The resume cursor is the id of the last picked task,
/// never a position or a reference, so removing any task leaves nothing
/// dangling.
///
/// ```text
///  run_queue:  T1 ─► T2 ─► T3 ─► (wrap)
///                    ▲
///                 cursor   next pick scans T3, T1, T2
/// ```
///
/// The idle task is owned separately and never enqueued.
pub struct RoundRobinScheduler {
    run_queue: TaskList,
    tasks: BTreeMap<TaskId, Box<Task>>,
    idle: Option<Box<Task>>,
    cursor: Option<TaskId>,
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinScheduler {
    /// Scheduler admitting up to [`MAX_TASKS`] tasks.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_capacity(MAX_TASKS)
    }

    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            run_queue: TaskList::with_capacity(capacity),
            tasks: BTreeMap::new(),
            idle: None,
            cursor: None,
        }
    }

    /// Install the fallback task, returning the previous one.
    pub fn set_idle(&mut self, idle: Box<Task>) -> Option<Box<Task>> {
        debug_assert!(idle.id().is_some());
        self.idle.replace(idle)
    }

    #[must_use]
    pub fn idle(&self) -> Option<&Task> {
        self.idle.as_deref()
    }

    #[must_use]
    pub fn idle_id(&self) -> Option<TaskId> {
        self.idle.as_ref().and_then(|t| t.id())
    }

    /// Admit a prepared task at the back of the queue.
    ///
    /// # Errors
    /// Hands the task back if the queue is full or the task has no id.
    pub fn add(&mut self, task: Box<Task>) -> Result<(), Box<Task>> {
        let Some(id) = task.id() else {
            return Err(task);
        };
        if self.tasks.contains_key(&id) || self.run_queue.push_back(id).is_err() {
            return Err(task);
        }
        self.tasks.insert(id, task);
        debug!("task {id} admitted ({} queued)", self.count());
        Ok(())
    }

    /// Unlink and return the task. Resets the cursor to the head of the
    /// queue if it pointed at the removed task.
    pub fn remove(&mut self, id: TaskId) -> Option<Box<Task>> {
        let task = self.tasks.remove(&id)?;
        self.run_queue.remove(id);
        if self.cursor == Some(id) {
            self.cursor = None;
        }
        debug!("task {id} removed ({} queued)", self.count());
        Some(task)
    }

    /// Swap the task stored under `id` for `task`, keeping its place in the
    /// queue. Returns the old task.
    pub fn replace(&mut self, id: TaskId, task: Box<Task>) -> Result<Box<Task>, Box<Task>> {
        if task.id() != Some(id) {
            return Err(task);
        }
        match self.tasks.get_mut(&id) {
            Some(slot) => Ok(core::mem::replace(slot, task)),
            None => Err(task),
        }
    }

    /// Next `Running` task after the cursor, wrapping around; the idle task
    /// if none is running.
    ///
    /// Returns `None` only before an idle task is installed.
    pub fn pick_next_task(&mut self) -> Option<&mut Task> {
        let start = self
            .cursor
            .and_then(|id| self.run_queue.position(id))
            .map_or(0, |i| i + 1);

        let next = self
            .run_queue
            .iter_circular(start)
            .find(|id| self.tasks.get(id).is_some_and(|t| t.state() == TaskState::Running));

        match next {
            Some(id) => {
                trace!("picked task {id}");
                self.cursor = Some(id);
                self.tasks.get_mut(&id).map(|t| &mut **t)
            }
            None => {
                trace!("nothing runnable, picked idle");
                self.idle.as_deref_mut()
            }
        }
    }

    /// Queued task by id. The idle task is not found here.
    #[must_use]
    pub fn get_by_tid(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id).map(|t| &**t)
    }

    pub fn get_by_tid_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id).map(|t| &mut **t)
    }

    /// Queued task or idle task by id.
    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        match self.idle.as_deref() {
            Some(idle) if idle.id() == Some(id) => Some(idle),
            _ => self.get_by_tid(id),
        }
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        if self.idle_id() == Some(id) {
            return self.idle.as_deref_mut();
        }
        self.get_by_tid_mut(id)
    }

    /// Whether `id` is still admitted.
    #[must_use]
    pub fn is_valid_task(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Number of queued tasks, idle excluded.
    #[must_use]
    pub fn count(&self) -> usize {
        self.run_queue.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.run_queue.capacity()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.run_queue.is_full()
    }

    /// Queued tasks in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> + '_ {
        self.run_queue.iter().filter_map(|id| self.get_by_tid(id))
    }
}
