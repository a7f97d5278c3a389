use thiserror::Error;

use crate::drivers::ata::pio::AtaError;

/// Kernel-wide error type for fallible operations.
///
/// Resource exhaustion and lookup failures are reported through this enum and
/// handled by the caller; invariant violations are asserted instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("no free swap slot")]
    OutOfSwap,
    #[error("kernel stack allocation failed")]
    StackAllocation,
    #[error("file descriptor table is full")]
    FdTableFull,
    #[error("bad file descriptor")]
    BadFd,
    #[error("no such file")]
    NoSuchFile,
    #[error("virtual address already mapped")]
    AlreadyMapped,
    #[error("address or length not page aligned")]
    Misaligned,
    #[error("page fault could not be handled")]
    FaultUnhandled,
    #[error("invalid executable")]
    InvalidExecutable,
    #[error("out of kernel memory")]
    OutOfMemory,
    #[error("disk error: {0}")]
    Disk(AtaError),
}

impl From<AtaError> for KernelError {
    fn from(e: AtaError) -> Self {
        KernelError::Disk(e)
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
