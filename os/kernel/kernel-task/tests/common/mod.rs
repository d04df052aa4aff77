#![allow(dead_code)]

use kernel_alloc::{AddressSpaceManager, BitmapFrameAlloc};
use kernel_info::memory::{FRAME_SIZE, USER_REGION_END};
use kernel_sync::IrqLock;
use kernel_task::{
    CpuState, EntryPoints, FileHandle, SleepToken, Task, TaskGroupData, TaskId, TaskManager, TaskServices,
};
use kernel_vmem::VirtualAddress;
use kernel_vmem::testing::{RecordingPaging, TestPhys};
use std::collections::VecDeque;
use std::sync::Arc;

pub const RAM_FRAMES: u64 = 24;

pub const ENTRY: EntryPoints = EntryPoints {
    idle: VirtualAddress::new(0xffff_ffff_8010_0000),
    kernel_exit: VirtualAddress::new(0xffff_ffff_8010_1000),
    user_exit: VirtualAddress::new(0x0000_0000_0020_0000),
};

pub const USER_ENTRY: VirtualAddress = VirtualAddress::new(0x0000_0000_0040_0000);

pub type Asm<'m> = AddressSpaceManager<'m, TestPhys, BitmapFrameAlloc, RecordingPaging>;
pub type Manager<'m> = TaskManager<'m, TestPhys, BitmapFrameAlloc, RecordingPaging, RecordingServices>;

/// Host stand-in for RAM, the frame bitmap and CR3.
pub struct Machine {
    pub phys: TestPhys,
    pub frames: IrqLock<BitmapFrameAlloc>,
    pub paging: RecordingPaging,
}

impl Machine {
    pub fn new() -> Self {
        let mut frames = BitmapFrameAlloc::new();
        frames.init(FRAME_SIZE, RAM_FRAMES * FRAME_SIZE - 1);
        Self {
            phys: TestPhys::new(RAM_FRAMES as usize),
            frames: IrqLock::new(frames),
            paging: RecordingPaging::default(),
        }
    }

    pub fn asm(&self) -> Asm<'_> {
        AddressSpaceManager::new(&self.phys, &self.frames, &self.paging).unwrap()
    }

    pub fn used_frames(&self) -> usize {
        self.frames.lock().get_used_frames_count()
    }
}

#[derive(Debug, Default)]
pub struct RecordingServices {
    pub closed: Vec<FileHandle>,
    pub armed: Vec<(u64, SleepToken)>,
    pub expired: VecDeque<SleepToken>,
    pub no_timer: bool,
    pub ticks: usize,
}

impl TaskServices for RecordingServices {
    fn close_file(&mut self, handle: FileHandle) {
        self.closed.push(handle);
    }

    fn arm_timer(&mut self, millis: u64, token: SleepToken) -> bool {
        if self.no_timer {
            return false;
        }
        self.armed.push((millis, token));
        true
    }

    fn acknowledge_tick(&mut self) {
        self.ticks += 1;
    }

    fn poll_expired(&mut self) -> Option<SleepToken> {
        self.expired.pop_front()
    }
}

/// Installed manager admitting at most `capacity` tasks. The idle task is #1.
pub fn manager<'m>(asm: &'m Asm<'m>, capacity: usize) -> Manager<'m> {
    let mut m = TaskManager::with_capacity(asm, RecordingServices::default(), ENTRY, capacity);
    assert_eq!(m.install_multitasking().unwrap(), tid(1));
    m
}

pub fn tid(n: u64) -> TaskId {
    TaskId::new(n).unwrap()
}

/// One timer tick with an empty trap frame; returns the new current task.
pub fn tick(m: &mut Manager<'_>) -> Option<u64> {
    let frame = CpuState::default();
    m.timer_tick(&frame);
    m.current_task_id().map(TaskId::get)
}

pub fn ticks(m: &mut Manager<'_>, n: usize) -> Vec<u64> {
    (0..n).map(|_| tick(m).unwrap()).collect()
}

/// Tick until `id` is current.
pub fn run_until(m: &mut Manager<'_>, id: TaskId) {
    for _ in 0..=m.scheduler().count() {
        if m.current_task_id() == Some(id) {
            return;
        }
        tick(m);
    }
    assert_eq!(m.current_task_id(), Some(id), "task never became current");
}

pub fn kernel_task(m: &Manager<'_>, entry: u64) -> Box<Task> {
    Task::with_new_stack(
        m.address_space_manager(),
        m.kernel_group().unwrap(),
        VirtualAddress::new(entry),
        entry,
        false,
        4096,
    )
    .unwrap()
}

pub fn user_group(asm: &Asm<'_>, parent: Option<TaskId>) -> Arc<TaskGroupData> {
    let space = asm
        .alloc_address_space(VirtualAddress::new(0x0020_0000), VirtualAddress::new(USER_REGION_END))
        .unwrap();
    TaskGroupData::new(space, "/home", parent)
}

pub fn user_task(asm: &Asm<'_>, group: &Arc<TaskGroupData>) -> Box<Task> {
    Task::with_new_stack(asm, group, USER_ENTRY, 0, true, 4096).unwrap()
}

/// A new user process with `threads` tasks and the given open files. The
/// returned tasks hold the only references to the group.
pub fn user_process(asm: &Asm<'_>, parent: Option<TaskId>, threads: usize, files: &[u64]) -> Vec<Box<Task>> {
    let group = user_group(asm, parent);
    for &f in files {
        group.open_file(FileHandle::new(f)).unwrap();
    }
    (0..threads).map(|_| user_task(asm, &group)).collect()
}
