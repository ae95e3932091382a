//! # KentOS Configuration
//!
//! Compile-time constants governing the scheduler, the kevent subsystem and
//! the kent arena. All limits are fixed at compile time; there is no dynamic
//! allocation anywhere in the kernel.

/// Size of the task table, including the idle task in slot 0.
/// Each spawned task also takes one `STACK_SIZE` stack from the port's pool.
pub const MAX_TASKS: usize = 8;

/// SysTick frequency in Hz. One tick is one scheduler pass.
pub const TICK_HZ: u32 = 1000;

/// Per-task stack size in bytes. Must hold the deepest call chain plus the
/// hardware exception frame (32 bytes) and the software-saved R4–R11 (32 bytes).
pub const STACK_SIZE: usize = 1024;

/// System clock frequency in Hz (STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Depth of each per-kind kevent queue. Must be a power of two.
pub const KEVENT_QUEUE_DEPTH: usize = 16;

/// Depth of the shared overflow queue used when a per-kind queue is full.
/// Must be a power of two.
pub const KEVENT_OVERFLOW_DEPTH: usize = 8;

/// Number of kevent kinds (device, task, file).
pub const KEVENT_KINDS: usize = 3;

/// Listener slots per kevent kind.
pub const MAX_LISTENERS: usize = 8;

/// Number of devices that can be registered with the kernel.
pub const MAX_DEVICES: usize = 4;

/// Wait-queue slots per kernel mutex. A full queue degrades `lock` to spinning.
pub const MUTEX_WAITERS: usize = MAX_TASKS;

/// Capacity of the kent arena: the root, every task, every device, and every
/// kevent that can be in flight at once.
pub const KENT_CAPACITY: usize =
    1 + MAX_TASKS + MAX_DEVICES + KEVENT_KINDS * KEVENT_QUEUE_DEPTH + KEVENT_OVERFLOW_DEPTH;

/// Size of each direction's ring buffer in a character device.
pub const DEVICE_BUFFER_SIZE: usize = 64;
