//! # Syscalls
//!
//! The task-facing API. The kernel lives in a [`KernelCell`], a global
//! guarded by a critical section; each syscall enters it, runs one
//! non-blocking kernel step and leaves. A step that parks the task asks the
//! port for a switch, and on Cortex-M the pended PendSV fires as soon as
//! the critical section ends, so the wrapper's next line runs only once the
//! task has been scheduled again. Wrappers that can be woken early (by a
//! kevent for something else, or while polling) loop until their step
//! reports `Done`.
//!
//! ```text
//! task ──► syscall::read(&KERNEL, &UART, buf)
//!            loop {
//!              critical section {
//!                data buffered? ──► Done(n)
//!                else wait_device_step() ──► IOWAIT, PendSV pended
//!              }                         ◄── switch happens here
//!            }
//! ```

use core::cell::RefCell;

use critical_section::Mutex;

use crate::arch::{Port, TaskEntry};
use crate::device::{CharDevice, DeviceId};
use crate::error::{KernelError, KernelResult};
use crate::kernel::{Kernel, Step, WaitOptions};
use crate::kevent::DeviceFlags;
use crate::mutex::{KMutex, LockStep};
use crate::sync;
use crate::task::{Pid, TaskInfo, WaitFilter};

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

/// Home of the kernel. Place one in a `static`; it stays empty until
/// [`KernelCell::init`].
pub struct KernelCell<P: Port> {
    inner: Mutex<RefCell<Option<Kernel<P>>>>,
}

impl<P: Port> KernelCell<P> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(None)),
        }
    }

    /// Build the kernel around `port`. Replaces any previous instance.
    pub fn init(&self, port: P) -> KernelResult<()> {
        let kernel = Kernel::new(port)?;
        sync::critical_section(|cs| {
            self.inner.borrow_ref_mut(cs).replace(kernel);
        });
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        sync::critical_section(|cs| self.inner.borrow_ref(cs).is_some())
    }

    /// Run `f` on the kernel inside a critical section.
    ///
    /// Must not be nested: `f` may not call back into the same cell.
    pub fn with<R>(&self, f: impl FnOnce(&mut Kernel<P>) -> R) -> KernelResult<R> {
        sync::critical_section(|cs| {
            let mut kernel = self.inner.borrow_ref_mut(cs);
            kernel.as_mut().map(f).ok_or(KernelError::NotStarted)
        })
    }
}

impl<P: Port> Default for KernelCell<P> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Task lifecycle
// ---------------------------------------------------------------------------

/// Create a task running `entry` as a child of the caller.
pub fn spawn<P: Port>(cell: &KernelCell<P>, entry: TaskEntry) -> KernelResult<Pid> {
    cell.with(|kernel| kernel.spawn(entry))?
}

/// Terminate the calling task. Never returns.
pub fn exit<P: Port>(cell: &KernelCell<P>, status: i32) -> ! {
    if let Err(err) = cell.with(|kernel| kernel.exit_current(status)).and_then(|res| res) {
        log::warn!("exit({}) failed: {}", status, err);
    }
    loop {
        core::hint::spin_loop();
    }
}

/// Block until a child matching `filter` has exited and reap it.
///
/// Returns the child's pid and exit status. Fails with `NoChild` when no
/// matching child exists, and with `WouldBlock` under `NOHANG` when the
/// matching children are all still running.
pub fn wait_for_child<P: Port>(
    cell: &KernelCell<P>,
    filter: WaitFilter,
    options: WaitOptions,
) -> KernelResult<(Pid, i32)> {
    loop {
        if let Step::Done(reaped) = cell.with(|kernel| kernel.wait_child_step(filter, options))?? {
            return Ok(reaped);
        }
    }
}

/// Sleep for at least `millis` milliseconds (rounded down to whole ticks).
pub fn sleep<P: Port>(cell: &KernelCell<P>, millis: u32) -> KernelResult<()> {
    cell.with(|kernel| kernel.sleep_current(millis))?
}

pub fn yield_now<P: Port>(cell: &KernelCell<P>) -> KernelResult<()> {
    cell.with(|kernel| kernel.yield_now())
}

pub fn getpid<P: Port>(cell: &KernelCell<P>) -> KernelResult<Pid> {
    cell.with(|kernel| kernel.current())
}

pub fn uptime_ticks<P: Port>(cell: &KernelCell<P>) -> KernelResult<u64> {
    cell.with(|kernel| kernel.uptime_ticks())
}

pub fn task_info<P: Port>(cell: &KernelCell<P>, pid: Pid) -> KernelResult<TaskInfo> {
    cell.with(|kernel| kernel.task_info(pid))?
}

/// Enter a section in which the tick does not preempt the caller. Nests.
pub fn preempt_disable<P: Port>(cell: &KernelCell<P>) -> KernelResult<()> {
    cell.with(|kernel| kernel.preempt_disable())
}

pub fn preempt_enable<P: Port>(cell: &KernelCell<P>) -> KernelResult<()> {
    cell.with(|kernel| kernel.preempt_enable())
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// Lock `mutex`, sleeping in LOCKWAIT while another task holds it.
///
/// Fails with `AtomicContext` if the mutex is held and preemption is
/// disabled.
pub fn lock<P: Port>(cell: &KernelCell<P>, mutex: &KMutex) -> KernelResult<()> {
    match cell.with(|kernel| kernel.mutex_lock_step(mutex))?? {
        // A blocked caller resumes only after the holder handed the lock over
        LockStep::Acquired | LockStep::Blocked => Ok(()),
        LockStep::Spin => {
            while !mutex.try_lock() {
                core::hint::spin_loop();
            }
            Ok(())
        }
    }
}

#[inline]
pub fn try_lock(mutex: &KMutex) -> bool {
    mutex.try_lock()
}

/// Release `mutex`. A waiting task gets it and runs next.
pub fn unlock<P: Port>(cell: &KernelCell<P>, mutex: &KMutex) -> KernelResult<()> {
    cell.with(|kernel| kernel.mutex_unlock(mutex))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

pub fn register_device<P: Port>(cell: &KernelCell<P>) -> KernelResult<DeviceId> {
    cell.with(|kernel| kernel.register_device())?
}

/// Read at least one byte from `device`, sleeping in IOWAIT while its
/// input buffer is empty. Returns the number of bytes read.
pub fn read<P: Port, const N: usize>(
    cell: &KernelCell<P>,
    device: &CharDevice<N>,
    buf: &mut [u8],
) -> KernelResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    loop {
        // The buffer check and the listener registration share one critical
        // section, so a receive interrupt cannot slip in between them.
        let step = cell.with(|kernel| match device.try_read(buf) {
            0 => kernel
                .wait_device_step(device.id(), DeviceFlags::RX)
                .map(retry_after),
            n => Ok(Step::Done(n)),
        })??;
        if let Step::Done(n) = step {
            return Ok(n);
        }
    }
}

/// Queue at least one byte of `data` for `device`, sleeping in IOWAIT while
/// its output buffer is full. Returns the number of bytes queued.
pub fn write<P: Port, const N: usize>(
    cell: &KernelCell<P>,
    device: &CharDevice<N>,
    data: &[u8],
) -> KernelResult<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    loop {
        let step = cell.with(|kernel| match device.try_write(data) {
            0 => kernel
                .wait_device_step(device.id(), DeviceFlags::TX)
                .map(retry_after),
            n => Ok(Step::Done(n)),
        })??;
        if let Step::Done(n) = step {
            return Ok(n);
        }
    }
}

/// A device wait never finishes the transfer itself; go round again.
fn retry_after(step: Step<()>) -> Step<usize> {
    match step {
        Step::Blocked => Step::Blocked,
        Step::Done(()) | Step::Polling => Step::Polling,
    }
}

/// Interrupt side: buffer received bytes and wake readers.
pub fn receive<P: Port, const N: usize>(
    cell: &KernelCell<P>,
    device: &CharDevice<N>,
    data: &[u8],
) -> KernelResult<usize> {
    let stored = device.receive(data);
    if stored > 0 {
        dispatch_device_kevent(cell, device.id(), DeviceFlags::RX)?;
    }
    Ok(stored)
}

/// Interrupt side: take bytes to send and wake writers waiting for room.
pub fn transmit<P: Port, const N: usize>(
    cell: &KernelCell<P>,
    device: &CharDevice<N>,
    buf: &mut [u8],
) -> KernelResult<usize> {
    let taken = device.transmit(buf);
    if taken > 0 {
        dispatch_device_kevent(cell, device.id(), DeviceFlags::TX)?;
    }
    Ok(taken)
}

/// Report a device state change and run a scheduler pass, so a task woken
/// by it is switched to when the interrupt returns. Safe to call from
/// interrupt handlers.
pub fn dispatch_device_kevent<P: Port>(
    cell: &KernelCell<P>,
    device: DeviceId,
    flags: DeviceFlags,
) -> KernelResult<()> {
    cell.with(|kernel| kernel.signal_device(device, flags))?
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Tick entry for the timer interrupt handler.
pub fn tick<P: Port>(cell: &KernelCell<P>) -> KernelResult<()> {
    cell.with(|kernel| kernel.tick())
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
