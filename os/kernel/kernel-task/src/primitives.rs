//! Task control requests.
//!
//! A running task enters the kernel through software interrupt
//! [`TASK_CONTROL_VECTOR`] with the request in `rdi` and its operands in
//! `rsi` and `rdx`. The result comes back in `rax`.
//!
//! | `rdi` | Request      | `rsi`  | `rdx`  | `rax` on return |
//! |-------|--------------|--------|--------|-----------------|
//! | 0     | yield        |        |        | unchanged       |
//! | 1     | sleep        | millis |        | unchanged       |
//! | 2     | exit         | code   |        | (no return)     |
//! | 3     | exit group   | code   |        | (no return)     |
//! | 4     | kill         | task   | signal | 0 or `u64::MAX` |
//! | 5     | wait         | task   |        | 1 or 0          |

use crate::{CpuState, TaskError};

/// IDT vector of the task control gate.
pub const TASK_CONTROL_VECTOR: u8 = 0x81;

/// `rax` of a failed kill request.
pub const KILL_FAILED: u64 = u64::MAX;

/// The signals a task may send. Only termination is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Signal {
    Kill = 9,
}

impl Signal {
    /// # Errors
    /// [`TaskError::UnsupportedSignal`] for anything but [`Signal::Kill`].
    pub const fn from_raw(raw: u64) -> Result<Self, TaskError> {
        match raw {
            9 => Ok(Self::Kill),
            other => Err(TaskError::UnsupportedSignal(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRequest {
    Yield,
    Sleep { millis: u64 },
    Exit { code: u64 },
    ExitGroup { code: u64 },
    Kill { task: u64, signal: u64 },
    Wait { task: u64 },
}

impl TaskRequest {
    pub const YIELD: u64 = 0;
    pub const SLEEP: u64 = 1;
    pub const EXIT: u64 = 2;
    pub const EXIT_GROUP: u64 = 3;
    pub const KILL: u64 = 4;
    pub const WAIT: u64 = 5;

    /// Read the request a task left in its registers.
    #[must_use]
    pub const fn decode(frame: &CpuState) -> Option<Self> {
        let (a, b) = (frame.rsi, frame.rdx);
        Some(match frame.rdi {
            Self::YIELD => Self::Yield,
            Self::SLEEP => Self::Sleep { millis: a },
            Self::EXIT => Self::Exit { code: a },
            Self::EXIT_GROUP => Self::ExitGroup { code: a },
            Self::KILL => Self::Kill { task: a, signal: b },
            Self::WAIT => Self::Wait { task: a },
            _ => return None,
        })
    }

    /// `(rdi, rsi, rdx)` for this request.
    #[must_use]
    pub const fn encode(self) -> (u64, u64, u64) {
        match self {
            Self::Yield => (Self::YIELD, 0, 0),
            Self::Sleep { millis } => (Self::SLEEP, millis, 0),
            Self::Exit { code } => (Self::EXIT, code, 0),
            Self::ExitGroup { code } => (Self::EXIT_GROUP, code, 0),
            Self::Kill { task, signal } => (Self::KILL, task, signal),
            Self::Wait { task } => (Self::WAIT, task, 0),
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use native::*;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod native {
    use super::{Signal, TaskRequest};
    use crate::TaskId;
    use core::arch::{asm, naked_asm};

    fn request(req: TaskRequest) -> u64 {
        let (op, a, b) = req.encode();
        let ret: u64;
        unsafe {
            asm!(
                "int 0x81",
                in("rdi") op,
                in("rsi") a,
                in("rdx") b,
                lateout("rax") ret,
            );
        }
        ret
    }

    /// Body of the idle task: halt until the next interrupt, forever.
    pub extern "C" fn idle(_: u64) -> ! {
        loop {
            unsafe { asm!("sti", "hlt", options(nomem, nostack)) };
        }
    }

    /// Give up the rest of this time slice.
    pub fn yield_now() {
        request(TaskRequest::Yield);
    }

    pub fn msleep(millis: u64) {
        request(TaskRequest::Sleep { millis });
    }

    /// Terminate the calling task.
    pub fn exit(code: u64) -> ! {
        request(TaskRequest::Exit { code });
        unreachable!("exited task was resumed")
    }

    /// Terminate every task of the calling process and its descendants.
    pub fn exit_group(code: u64) -> ! {
        request(TaskRequest::ExitGroup { code });
        unreachable!("exited task group was resumed")
    }

    pub fn kill(task: TaskId, signal: Signal) -> bool {
        request(TaskRequest::Kill {
            task: task.get(),
            signal: signal as u64,
        }) != super::KILL_FAILED
    }

    /// Block until `task` finishes. `false` if there is no such task.
    pub fn wait(task: TaskId) -> bool {
        request(TaskRequest::Wait { task: task.get() }) == 1
    }

    /// Return address planted at the top of every kernel task's stack: a
    /// task returning from its entry function exits with its return value.
    #[unsafe(naked)]
    pub extern "C" fn task_epilogue() -> ! {
        naked_asm!(
            "mov rsi, rax",
            "mov edi, {exit}",
            "xor edx, edx",
            "int 0x81",
            "2: hlt",
            "jmp 2b",
            exit = const TaskRequest::EXIT,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_takes_task_in_rsi_and_signal_in_rdx() {
        assert_eq!(TaskRequest::Kill { task: 4, signal: 9 }.encode(), (4, 4, 9));

        let frame = CpuState {
            rdi: TaskRequest::SLEEP,
            rsi: 250,
            rdx: 0xdead,
            ..CpuState::default()
        };
        assert_eq!(TaskRequest::decode(&frame), Some(TaskRequest::Sleep { millis: 250 }));
    }

    #[test]
    fn unknown_requests_and_signals_are_rejected() {
        let frame = CpuState {
            rdi: 42,
            ..CpuState::default()
        };
        assert_eq!(TaskRequest::decode(&frame), None);
        assert_eq!(Signal::from_raw(9), Ok(Signal::Kill));
        assert_eq!(Signal::from_raw(15), Err(TaskError::UnsupportedSignal(15)));
    }
}
