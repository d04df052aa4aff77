use crate::primitives::KILL_FAILED;
use crate::{
    CpuState, FileHandle, RoundRobinScheduler, Signal, Task, TaskError, TaskGroupData, TaskId, TaskList,
    TaskRequest, TaskState,
};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_alloc::{AddressSpaceManager, PageFaultResolution};
use kernel_info::tasks::{IDLE_STACK_SIZE, MAX_TASKS};
use kernel_vmem::page_fault::PageFaultErrorCode;
use kernel_vmem::{FrameAlloc, PagingControl, PhysMapper, PhysicalAddress, VirtualAddress};
use log::{debug, info, trace, warn};

/// Identifies one armed sleep timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SleepToken(u64);

impl SleepToken {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Collaborators outside the task core.
pub trait TaskServices {
    /// Close a file left open by a destroyed task group.
    fn close_file(&mut self, handle: FileHandle);

    /// Arrange for [`TaskManager::on_timer_expired`] to be called with
    /// `token` after `millis`. Returns `false` if no timer is available.
    fn arm_timer(&mut self, millis: u64, token: SleepToken) -> bool;

    /// Called once per timer tick, before scheduling.
    fn acknowledge_tick(&mut self) {}

    /// Next sleep timer that has expired since the last call.
    fn poll_expired(&mut self) -> Option<SleepToken> {
        None
    }
}

/// Code addresses the manager plants into new tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoints {
    /// Entry of the idle task.
    pub idle: VirtualAddress,
    /// Return address of kernel-mode tasks.
    pub kernel_exit: VirtualAddress,
    /// Return address of user-mode tasks; must be reachable from ring 3.
    pub user_exit: VirtualAddress,
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl EntryPoints {
    /// The idle loop and epilogue of this crate, with a caller-supplied
    /// user-mode epilogue.
    #[must_use]
    pub fn native(user_exit: VirtualAddress) -> Self {
        use crate::primitives::{idle, task_epilogue};
        Self {
            idle: VirtualAddress::new(idle as usize as u64),
            kernel_exit: VirtualAddress::new(task_epilogue as usize as u64),
            user_exit,
        }
    }
}

/// Admission, blocking, switching and teardown of tasks.
///
/// Constructed once at bring-up and passed by reference; in the kernel
/// image it sits behind an [`IrqLock`](kernel_sync::IrqLock) shared with
/// the interrupt trampolines.
///
/// Exactly one task is current between [`schedule`](Self::schedule) calls.
/// When the current task is destroyed or replaced, there is briefly no
/// current task, and the next switch does not save the outgoing frame.
pub struct TaskManager<'k, M, A, P, S> {
    asm: &'k AddressSpaceManager<'k, M, A, P>,
    services: S,
    scheduler: RoundRobinScheduler,
    kernel_group: Option<Arc<TaskGroupData>>,
    current: Option<TaskId>,
    next_id: u64,
    entry_points: EntryPoints,
    active_root: Option<PhysicalAddress>,
    sleepers: Vec<(SleepToken, TaskList)>,
    next_sleep_token: u64,
}

impl<'k, M, A, P, S> TaskManager<'k, M, A, P, S>
where
    M: PhysMapper,
    A: FrameAlloc,
    P: PagingControl,
    S: TaskServices,
{
    #[must_use]
    pub const fn new(asm: &'k AddressSpaceManager<'k, M, A, P>, services: S, entry_points: EntryPoints) -> Self {
        Self::with_capacity(asm, services, entry_points, MAX_TASKS)
    }

    /// Manager whose scheduler admits at most `capacity` tasks.
    #[must_use]
    pub const fn with_capacity(
        asm: &'k AddressSpaceManager<'k, M, A, P>,
        services: S,
        entry_points: EntryPoints,
        capacity: usize,
    ) -> Self {
        Self {
            asm,
            services,
            scheduler: RoundRobinScheduler::with_capacity(capacity),
            kernel_group: None,
            current: None,
            next_id: 1,
            entry_points,
            active_root: None,
            sleepers: Vec::new(),
            next_sleep_token: 1,
        }
    }

    /// Create the kernel task group and the idle task.
    ///
    /// Must run before [`add_task`](Self::add_task). Calling it again
    /// returns the existing idle task.
    ///
    /// # Errors
    /// [`TaskError::Memory`] if the idle stack cannot be allocated.
    pub fn install_multitasking(&mut self) -> Result<TaskId, TaskError> {
        if let Some(id) = self.scheduler.idle_id() {
            warn!("multitasking already installed");
            return Ok(id);
        }

        let group = TaskGroupData::new(self.asm.kernel_address_space(), "/", None);
        let mut idle = Task::with_new_stack(self.asm, &group, self.entry_points.idle, 0, false, IDLE_STACK_SIZE)?;
        let id = self.allocate_id();
        idle.prepare(id, self.entry_points.kernel_exit, self.asm)?;

        self.scheduler.set_idle(idle);
        self.kernel_group = Some(group);
        info!("multitasking installed, idle task {id}");
        Ok(id)
    }

    /// The kernel's own task group, once installed.
    #[must_use]
    pub const fn kernel_group(&self) -> Option<&Arc<TaskGroupData>> {
        self.kernel_group.as_ref()
    }

    #[must_use]
    pub const fn address_space_manager(&self) -> &'k AddressSpaceManager<'k, M, A, P> {
        self.asm
    }

    #[must_use]
    pub const fn scheduler(&self) -> &RoundRobinScheduler {
        &self.scheduler
    }

    #[must_use]
    pub const fn services(&self) -> &S {
        &self.services
    }

    pub const fn services_mut(&mut self) -> &mut S {
        &mut self.services
    }

    /// Root currently loaded in CR3, as far as the manager knows.
    #[must_use]
    pub const fn active_root(&self) -> Option<PhysicalAddress> {
        self.active_root
    }

    const fn allocate_id(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        match TaskId::new(id) {
            Some(id) => id,
            None => unreachable!(),
        }
    }

    /// Assign an id, prime the task's context and queue it.
    ///
    /// On any failure the task is destroyed, which tears its group down if
    /// this was the group's only task.
    ///
    /// # Errors
    /// - [`TaskError::NotInstalled`] before [`install_multitasking`](Self::install_multitasking).
    /// - [`TaskError::SchedulerFull`] at capacity.
    /// - [`TaskError::Memory`] if the stack cannot be primed.
    pub fn add_task(&mut self, mut task: Box<Task>) -> Result<TaskId, TaskError> {
        if self.scheduler.idle().is_none() {
            warn!("add_task before install_multitasking");
            self.destroy_task(task);
            return Err(TaskError::NotInstalled);
        }

        let id = self.allocate_id();
        let exit = self.exit_point(&task);
        if let Err(e) = task.prepare(id, exit, self.asm) {
            warn!("cannot prepare task {id}: {e}");
            self.destroy_task(task);
            return Err(e);
        }

        match self.scheduler.add(task) {
            Ok(()) => Ok(id),
            Err(task) => {
                warn!("scheduler full, dropping task {id}");
                self.destroy_task(task);
                Err(TaskError::SchedulerFull)
            }
        }
    }

    const fn exit_point(&self, task: &Task) -> VirtualAddress {
        if task.is_user_space() {
            self.entry_points.user_exit
        } else {
            self.entry_points.kernel_exit
        }
    }

    /// Replace the current task's image with `task`: same id, same place in
    /// the queue, same finish waiters. The old task is dropped without
    /// waking anyone, and its frame is not saved on the next switch.
    ///
    /// # Errors
    /// - [`TaskError::NotInstalled`] if there is no current task.
    /// - [`TaskError::IdleTask`] if the idle task is current.
    /// - [`TaskError::Memory`] if the stack cannot be primed.
    ///
    /// `task` is destroyed on error.
    pub fn replace_current_task(&mut self, mut task: Box<Task>) -> Result<TaskId, TaskError> {
        let check = match self.current {
            None => Err(TaskError::NotInstalled),
            Some(id) if Some(id) == self.scheduler.idle_id() => Err(TaskError::IdleTask),
            Some(id) if !self.scheduler.is_valid_task(id) => Err(TaskError::UnknownTask(id)),
            Some(id) => Ok(id),
        };
        let id = match check {
            Ok(id) => id,
            Err(e) => {
                self.destroy_task(task);
                return Err(e);
            }
        };

        let exit = self.exit_point(&task);
        if let Err(e) = task.prepare(id, exit, self.asm) {
            self.destroy_task(task);
            return Err(e);
        }

        if let Some(old) = self.scheduler.get_by_tid_mut(id) {
            task.finish_waiters = core::mem::take(&mut old.finish_waiters);
        }
        match self.scheduler.replace(id, task) {
            Ok(old) => {
                self.current = None;
                self.release_group(old.into_group());
                debug!("task {id} replaced");
                Ok(id)
            }
            Err(task) => {
                self.destroy_task(task);
                Err(TaskError::UnknownTask(id))
            }
        }
    }

    /// Timer entry point: run expired sleep timers, then [`schedule`](Self::schedule).
    pub fn timer_tick<'a>(&'a mut self, frame: &'a CpuState) -> &'a CpuState {
        self.services.acknowledge_tick();
        while let Some(token) = self.services.poll_expired() {
            self.on_timer_expired(token);
        }
        self.schedule(frame)
    }

    /// Save `frame` into the current task and return the context of the
    /// next one. Returns `frame` unchanged before installation.
    pub fn schedule<'a>(&'a mut self, frame: &'a CpuState) -> &'a CpuState {
        if self.scheduler.idle().is_none() {
            return frame;
        }
        self.save_current(frame);
        self.resume_next(frame)
    }

    fn save_current(&mut self, frame: &CpuState) {
        if let Some(task) = self.current.and_then(|id| self.scheduler.task_mut(id)) {
            *task.context_mut() = *frame;
        }
    }

    fn resume_next<'a>(&'a mut self, frame: &'a CpuState) -> &'a CpuState {
        match self.pick_next_task_and_load_address_space() {
            Some(id) => self.scheduler.task(id).map_or(frame, Task::context),
            None => frame,
        }
    }

    /// Make the scheduler's next pick current, loading its page tables if
    /// they differ from the active ones.
    pub fn pick_next_task_and_load_address_space(&mut self) -> Option<TaskId> {
        let next = self.scheduler.pick_next_task()?;
        let id = next.id()?;
        let root = next.root();

        if self.current != Some(id) {
            trace!("switching to task {id}");
        }
        self.current = Some(id);

        if let Some(root) = root
            && self.active_root != Some(root)
        {
            // SAFETY: every task root was built by the address-space manager
            // and maps the kernel.
            unsafe { kernel_vmem::load_address_space(root, self.asm.paging()) };
            self.active_root = Some(root);
            debug!("loaded address space {root} for task {id}");
        }
        Some(id)
    }

    #[must_use]
    pub fn get_current_task(&self) -> Option<&Task> {
        self.current.and_then(|id| self.scheduler.task(id))
    }

    #[must_use]
    pub const fn current_task_id(&self) -> Option<TaskId> {
        self.current
    }

    /// Task group of the current task.
    #[must_use]
    pub fn current_group(&self) -> Option<&Arc<TaskGroupData>> {
        self.get_current_task().map(Task::group)
    }

    /// Grow the current group's heap by `size` bytes (the `brk` path).
    pub fn alloc_static_for_current(&self, size: u64) -> Option<VirtualAddress> {
        self.current_group()?.alloc_static(self.asm, size)
    }

    /// Page-fault entry point: resolve a fault at `va` in the current
    /// task's address space.
    ///
    /// A fatal outcome leaves the task alone; the exception layer decides
    /// whether to kill it or stop the kernel.
    pub fn handle_page_fault(&self, va: VirtualAddress, err: PageFaultErrorCode) -> PageFaultResolution {
        let space = self
            .current_group()
            .map_or_else(|| self.asm.kernel_address_space(), |g| g.address_space());
        self.asm.resolve_page_fault(&space, va, err)
    }

    fn current_killable(&self) -> Result<TaskId, TaskError> {
        let id = self.current.ok_or(TaskError::NotInstalled)?;
        if Some(id) == self.scheduler.idle_id() {
            warn!("refusing to terminate the idle task");
            return Err(TaskError::IdleTask);
        }
        Ok(id)
    }

    /// Destroy the current task.
    ///
    /// # Errors
    /// [`TaskError::IdleTask`] or [`TaskError::NotInstalled`].
    pub fn kill_current_task(&mut self) -> Result<(), TaskError> {
        let id = self.current_killable()?;
        self.kill_task(id, Signal::Kill)
    }

    /// Destroy task `id`.
    ///
    /// # Errors
    /// [`TaskError::UnknownTask`] for ids that are not queued;
    /// [`TaskError::IdleTask`] for the idle task.
    pub fn kill_task(&mut self, id: TaskId, signal: Signal) -> Result<(), TaskError> {
        if Some(id) == self.scheduler.idle_id() {
            warn!("refusing to {signal:?} the idle task");
            return Err(TaskError::IdleTask);
        }
        let Some(task) = self.scheduler.remove(id) else {
            warn!("{signal:?}: no task {id}");
            return Err(TaskError::UnknownTask(id));
        };
        if self.current == Some(id) {
            self.current = None;
        }
        self.destroy_task(task);
        Ok(())
    }

    /// Destroy the current task's group and every task descended from it.
    ///
    /// Returns the number of tasks destroyed.
    ///
    /// # Errors
    /// [`TaskError::IdleTask`] or [`TaskError::NotInstalled`].
    pub fn kill_current_task_group(&mut self) -> Result<usize, TaskError> {
        let id = self.current_killable()?;
        let doomed = self.collect_process_tree(id);

        for &id in &doomed {
            if let Some(task) = self.scheduler.remove(id) {
                self.destroy_task(task);
            }
        }
        self.current = None;
        info!("task group of {id} killed ({} tasks)", doomed.len());
        Ok(doomed.len())
    }

    /// The group of `id` plus every task whose ancestry leads into it.
    fn collect_process_tree(&self, id: TaskId) -> Vec<TaskId> {
        let Some(group) = self.scheduler.get_by_tid(id).map(Task::group) else {
            return Vec::new();
        };
        let mut doomed: Vec<TaskId> = self
            .scheduler
            .iter()
            .filter(|t| t.is_in_group(group))
            .filter_map(Task::id)
            .collect();

        loop {
            let children: Vec<TaskId> = self
                .scheduler
                .iter()
                .filter(|t| t.id().is_some_and(|id| !doomed.contains(&id)))
                .filter(|t| {
                    doomed
                        .iter()
                        .filter_map(|&d| self.scheduler.get_by_tid(d))
                        .any(|d| d.is_parent_of(t))
                })
                .filter_map(Task::id)
                .collect();
            if children.is_empty() {
                return doomed;
            }
            doomed.extend(children);
        }
    }

    /// Block the current task until `id` finishes.
    ///
    /// Returns `false` without blocking if `id` is unknown, is the caller
    /// itself, or is the idle task.
    pub fn wait(&mut self, id: TaskId) -> bool {
        let Some(current) = self.current else {
            return false;
        };
        if current == id || Some(current) == self.scheduler.idle_id() {
            return false;
        }
        let Some(target) = self.scheduler.get_by_tid_mut(id) else {
            warn!("task {current} waits for unknown task {id}");
            return false;
        };
        if target.finish_waiters.push_back(current).is_err() {
            return false;
        }
        self.set_state(current, TaskState::Blocked);
        debug!("task {current} waits for {id}");
        true
    }

    /// Put the current task on `list` and mark it blocked.
    ///
    /// Returns `false` for the idle task, with no current task, or if
    /// `list` is full.
    pub fn block_current_task(&mut self, list: &mut TaskList) -> bool {
        let Some(id) = self.current else {
            return false;
        };
        if Some(id) == self.scheduler.idle_id() || list.push_back(id).is_err() {
            return false;
        }
        self.set_state(id, TaskState::Blocked);
        debug!("task {id} blocked");
        true
    }

    /// Empty `list`, marking every task on it running. Ids of tasks that
    /// no longer exist are skipped. Returns the number woken.
    pub fn unblock_tasks(&mut self, list: &mut TaskList) -> usize {
        let mut woken = 0;
        for id in list.take_all() {
            match self.scheduler.get_by_tid_mut(id) {
                Some(task) => {
                    task.set_state(TaskState::Running);
                    woken += 1;
                }
                None => debug!("skipping stale waiter {id}"),
            }
        }
        woken
    }

    fn set_state(&mut self, id: TaskId, state: TaskState) {
        if let Some(task) = self.scheduler.get_by_tid_mut(id) {
            task.set_state(state);
        }
    }

    /// Block the current task for `millis` and switch away.
    ///
    /// If no timer can be armed the task keeps running.
    pub fn sleep_current_task<'a>(&'a mut self, frame: &'a CpuState, millis: u64) -> &'a CpuState {
        let token = SleepToken(self.next_sleep_token);
        self.next_sleep_token += 1;

        let mut list = TaskList::with_capacity(1);
        if self.block_current_task(&mut list) {
            if self.services.arm_timer(millis, token) {
                self.sleepers.push((token, list));
            } else {
                warn!("no timer for a {millis} ms sleep");
                self.unblock_tasks(&mut list);
            }
        }
        self.schedule(frame)
    }

    /// Wake whoever sleeps on `token`. Returns the number woken.
    pub fn on_timer_expired(&mut self, token: SleepToken) -> usize {
        let Some(pos) = self.sleepers.iter().position(|(t, _)| *t == token) else {
            return 0;
        };
        let (_, mut list) = self.sleepers.swap_remove(pos);
        self.unblock_tasks(&mut list)
    }

    /// Carry out a request the current task made through the task control
    /// gate, returning the frame to resume.
    pub fn dispatch<'a>(&'a mut self, frame: &'a CpuState, request: TaskRequest) -> &'a CpuState {
        match request {
            TaskRequest::Yield => self.schedule(frame),
            TaskRequest::Sleep { millis } => self.sleep_current_task(frame, millis),
            TaskRequest::Exit { code } => {
                let id = self.current;
                if self.kill_current_task().is_ok() {
                    debug!("task {id:?} exited with {code}");
                }
                self.schedule(frame)
            }
            TaskRequest::ExitGroup { code } => {
                let id = self.current;
                if self.kill_current_task_group().is_ok() {
                    debug!("task group of {id:?} exited with {code}");
                }
                self.schedule(frame)
            }
            TaskRequest::Kill { task, signal } => {
                self.save_current(frame);
                let killed = TaskId::new(task).is_some_and(|id| {
                    match Signal::from_raw(signal).and_then(|s| self.kill_task(id, s)) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("kill {id}/{signal}: {e}");
                            false
                        }
                    }
                });
                self.finish_request(frame, if killed { 0 } else { KILL_FAILED })
            }
            TaskRequest::Wait { task } => {
                self.save_current(frame);
                let waiting = TaskId::new(task).is_some_and(|id| self.wait(id));
                self.finish_request(frame, u64::from(waiting))
            }
        }
    }

    /// Store `result` in the caller's `rax` and resume it if it is still
    /// runnable, otherwise switch away.
    fn finish_request<'a>(&'a mut self, frame: &'a CpuState, result: u64) -> &'a CpuState {
        let current = self.current.and_then(|id| self.scheduler.task_mut(id));
        let runnable = match current {
            Some(task) => {
                task.context_mut().rax = result;
                task.state() == TaskState::Running
            }
            None => false,
        };
        if runnable {
            return self.get_current_task().map_or(frame, Task::context);
        }
        self.resume_next(frame)
    }

    /// Wake the task's finish waiters and drop it, tearing its group down if
    /// it was the last member.
    fn destroy_task(&mut self, mut task: Box<Task>) {
        let mut waiters = core::mem::take(&mut task.finish_waiters);
        let woken = self.unblock_tasks(&mut waiters);
        if let Some(id) = task.id() {
            debug!("task {id} destroyed, {woken} waiters woken");
        }
        self.release_group(task.into_group());
    }

    fn release_group(&mut self, group: Arc<TaskGroupData>) {
        let Some(group) = Arc::into_inner(group) else {
            return;
        };
        let services = &mut self.services;
        let released = group.destroy(self.asm, |handle| services.close_file(handle));
        if released.is_some() && released == self.active_root {
            self.active_root = None;
        }
    }
}
