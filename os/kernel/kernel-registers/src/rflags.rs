use bitfield_struct::bitfield;

/// RFLAGS as stored in a trap frame.
///
/// Only the bits the scheduler sets up for a fresh task are named; the rest
/// are carried through untouched.
#[bitfield(u64)]
pub struct Rflags {
    /// Bit 0: Carry.
    pub carry: bool,

    /// Bit 1: Reserved, always 1.
    #[bits(default = true)]
    pub always_one: bool,

    /// Bits 2–7: Arithmetic status flags.
    #[bits(6)]
    pub status: u8,

    /// Bit 8: Trap (single-step).
    pub trap: bool,

    /// Bit 9: IF: maskable interrupts enabled.
    pub interrupt_enable: bool,

    /// Bit 10: Direction.
    pub direction: bool,

    /// Bit 11: Overflow.
    pub overflow: bool,

    /// Bits 12–13: I/O privilege level.
    #[bits(2)]
    pub iopl: u8,

    /// Bits 14–63: Remaining system flags.
    #[bits(50)]
    pub system: u64,
}

impl Rflags {
    /// Flags a freshly created task starts with: interrupts enabled, IOPL 0.
    #[must_use]
    pub const fn initial_task_flags() -> Self {
        Self::new().with_interrupt_enable(true)
    }
}
