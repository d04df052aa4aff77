//! Interrupt trampolines for the timer and the task control gate.
//!
//! Both stubs save every general-purpose register on top of the frame the
//! CPU pushed, hand a pointer to the resulting [`CpuState`] to the
//! installed [`TrapHandler`], switch `rsp` to whatever record it returns
//! and `iretq` out of it. Returning a different task's saved context is the
//! context switch.
//!
//! The IDT gates themselves are set up by the interrupt layer; it points
//! the timer vector at [`timer_interrupt_entry`] and
//! [`TASK_CONTROL_VECTOR`](crate::primitives::TASK_CONTROL_VECTOR) at
//! [`task_control_entry`] (DPL 3).

use crate::primitives::TaskRequest;
use crate::{CpuState, TaskManager, TaskServices};
use core::arch::naked_asm;
use core::ptr;
use kernel_sync::{InstallOnce, IrqLock};
use kernel_vmem::{FrameAlloc, PagingControl, PhysMapper};
use log::warn;

/// What the trampolines call into.
pub trait TrapHandler: Sync {
    fn on_timer(&self, frame: &CpuState) -> *const CpuState;
    fn on_task_request(&self, frame: &mut CpuState) -> *const CpuState;
}

static HANDLER: InstallOnce<&'static dyn TrapHandler> = InstallOnce::new();

/// Route both trampolines to `handler`. Only the first call takes effect.
pub fn install_trap_handler(handler: &'static dyn TrapHandler) -> bool {
    HANDLER.install(handler).is_ok()
}

impl<M, A, P, S> TrapHandler for IrqLock<TaskManager<'static, M, A, P, S>>
where
    M: PhysMapper + Sync,
    A: FrameAlloc + Send,
    P: PagingControl + Sync,
    S: TaskServices + Send,
{
    fn on_timer(&self, frame: &CpuState) -> *const CpuState {
        let mut manager = self.lock();
        ptr::from_ref(manager.timer_tick(frame))
    }

    fn on_task_request(&self, frame: &mut CpuState) -> *const CpuState {
        let Some(request) = TaskRequest::decode(frame) else {
            warn!("unknown task request {:#x}", frame.rdi);
            frame.rax = u64::MAX;
            return ptr::from_ref(frame);
        };
        let mut manager = self.lock();
        ptr::from_ref(manager.dispatch(frame, request))
    }
}

extern "C" fn timer_trap(frame: *mut CpuState) -> *const CpuState {
    // SAFETY: the trampoline passes the record it just pushed.
    let frame = unsafe { &*frame };
    HANDLER.get().map_or(ptr::from_ref(frame), |h| h.on_timer(frame))
}

extern "C" fn task_control_trap(frame: *mut CpuState) -> *const CpuState {
    // SAFETY: as above.
    let frame = unsafe { &mut *frame };
    match HANDLER.get() {
        Some(h) => h.on_task_request(frame),
        None => ptr::from_ref(frame),
    }
}

macro_rules! trampoline {
    ($name:ident, $target:ident) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            naked_asm!(
                "cli",
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                // rdi := &CpuState
                "mov rdi, rsp",
                "and rsp, -16",
                "call {target}",
                // Resume whichever record came back.
                "mov rsp, rax",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rbp",
                "pop rdi",
                "pop rsi",
                "pop rdx",
                "pop rcx",
                "pop rbx",
                "pop rax",
                "iretq",
                target = sym $target,
            )
        }
    };
}

trampoline!(timer_interrupt_entry, timer_trap);
trampoline!(task_control_entry, task_control_trap);
