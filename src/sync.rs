//! # Synchronization Primitives
//!
//! Interrupt-safe critical sections and spin locks for the kernel.
//! All shared kernel state is reached inside a critical section so task
//! code and interrupt handlers never observe it half-updated.

pub use critical_section::CriticalSection;

/// Spin lock with a non-blocking `try_lock`. Used for wait queues and any
/// structure that interrupt handlers may touch.
pub type SpinLock<T> = spin::Mutex<T>;

/// Execute a closure within a critical section (interrupts disabled).
///
/// On target this is backed by `cortex-m`'s single-core implementation
/// (PRIMASK); host tests use the `std` implementation of `critical-section`.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
///
/// Keep critical sections short: every tick and device interrupt waits on them.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
