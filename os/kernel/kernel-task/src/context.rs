use kernel_registers::rflags::Rflags;

/// Saved register state of a task, laid out exactly as the interrupt
/// trampolines leave it on the stack.
///
/// ```text
/// lower address                               higher address
/// r15 r14 r13 r12 r11 r10 r9 r8 rbp rdi rsi rdx rcx rbx rax │ rip cs rflags rsp ss
/// └──────────── pushed by the trampoline ─────────────────┘ └── pushed by the CPU ──┘
/// ```
///
/// The trampoline passes a pointer to this record to the scheduler and
/// `iretq`s out of whichever record it gets back, so the field order is
/// load-bearing.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuState {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl CpuState {
    pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
    pub const KERNEL_DATA_SELECTOR: u64 = 0x10;
    pub const USER_CODE_SELECTOR: u64 = 0x1b;
    pub const USER_DATA_SELECTOR: u64 = 0x23;

    /// Initial state of a task: enter `rip` with `rsp` and the first
    /// argument in `rdi`, interrupts enabled.
    #[must_use]
    pub const fn initial(rip: u64, rsp: u64, arg: u64, user: bool) -> Self {
        let (cs, ss) = if user {
            (Self::USER_CODE_SELECTOR, Self::USER_DATA_SELECTOR)
        } else {
            (Self::KERNEL_CODE_SELECTOR, Self::KERNEL_DATA_SELECTOR)
        };
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: arg,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip,
            cs,
            rflags: Rflags::initial_task_flags().into_bits(),
            rsp,
            ss,
        }
    }

    /// Whether this frame was taken in ring 3.
    #[must_use]
    pub const fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

const _: () = {
    assert!(size_of::<CpuState>() == 20 * 8);
    assert!(core::mem::offset_of!(CpuState, rax) == 14 * 8);
    assert!(core::mem::offset_of!(CpuState, rip) == 15 * 8);
    assert!(core::mem::offset_of!(CpuState, ss) == 19 * 8);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_and_user_frames() {
        let k = CpuState::initial(0x1000, 0x2000, 7, false);
        assert_eq!((k.cs, k.ss), (0x08, 0x10));
        assert_eq!(k.rdi, 7);
        assert_eq!(k.rflags, 0x202);
        assert!(!k.is_user());

        let u = CpuState::initial(0x1000, 0x2000, 0, true);
        assert_eq!((u.cs, u.ss), (0x1b, 0x23));
        assert!(u.is_user());
    }
}
