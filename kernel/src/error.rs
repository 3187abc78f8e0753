//! Kernel-wide error type.
//!
//! Internal APIs return `Result<T, KernelError>` instead of sentinel
//! pointers or magic integers. The syscall boundary ([`crate::syscall::errno`])
//! and the exception dispatcher ([`crate::interrupts`]) each have their own
//! mapping from `KernelError` to their respective ABI.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// PMM, heap, or pool exhaustion.
    AllocationFailure,
    /// Bad syscall numbers, out-of-range user pointers, malformed signatures.
    InvalidArgument,
    /// Path resolution, PID lookup, device lookup.
    NotFound,
    /// File/dir create over an existing name.
    AlreadyExists,
    /// ELF PT_INTERP, unsupported architecture/endian/type.
    NotSupported,
    /// Disk PIO timed out or returned a bad status.
    IoFailure,
    /// Device access/trust check failed.
    PermissionDenied,
    /// Non-blocking read with no data (currently not exposed to userland).
    WouldBlock,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::AllocationFailure => "allocation failure",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::NotFound => "not found",
            KernelError::AlreadyExists => "already exists",
            KernelError::NotSupported => "not supported",
            KernelError::IoFailure => "I/O failure",
            KernelError::PermissionDenied => "permission denied",
            KernelError::WouldBlock => "would block",
        };
        f.write_str(s)
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
