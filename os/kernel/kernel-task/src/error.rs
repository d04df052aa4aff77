use crate::TaskId;
use kernel_alloc::AddressSpaceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("scheduler is full")]
    SchedulerFull,
    #[error("no task with id {0}")]
    UnknownTask(TaskId),
    #[error("open-file table is full")]
    FileTableFull,
    #[error("multitasking is not installed")]
    NotInstalled,
    #[error("operation not permitted on the idle task")]
    IdleTask,
    #[error("unsupported signal {0}")]
    UnsupportedSignal(u64),
    #[error(transparent)]
    Memory(#[from] AddressSpaceError),
}
