//! # Kernel Error Codes
//!
//! Unified error type for every fallible kernel operation. Syscall wrappers
//! hand these back to tasks; `to_errno()` gives the negative-style code a
//! C-ABI caller would see.

use core::fmt;

/// Errors reported by the kernel.
///
/// Values are grouped by category and stay positive; [`KernelError::to_errno`]
/// negates them for syscall returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KernelError {
    // === General (1-15) ===
    /// Argument was unset or out of range.
    InvalidArgument = 1,
    /// The operation would have blocked and the caller asked not to.
    WouldBlock = 2,
    /// The kernel has not been initialised yet.
    NotStarted = 3,
    /// A blocking call was made with preemption disabled.
    AtomicContext = 4,

    // === Resources (16-31) ===
    /// Every task slot is occupied.
    NoFreeSlot = 16,
    /// A stack, kent, queue slot or record could not be allocated.
    OutOfMemory = 17,

    // === Tasks (32-47) ===
    /// The caller has no child matching the wait filter.
    NoChild = 32,
    /// No live task with that pid.
    NoSuchTask = 33,

    // === Devices (48-63) ===
    /// Unknown or unregistered device.
    BadDevice = 48,
}

impl KernelError {
    /// Negative code returned across the syscall boundary.
    #[inline]
    pub const fn to_errno(self) -> isize {
        -(self as i32 as isize)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::WouldBlock => "operation would block",
            Self::NotStarted => "kernel not started",
            Self::AtomicContext => "blocking call in atomic context",
            Self::NoFreeSlot => "no free task slot",
            Self::OutOfMemory => "out of memory",
            Self::NoChild => "no matching child",
            Self::NoSuchTask => "no such task",
            Self::BadDevice => "bad device",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convenience alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;
