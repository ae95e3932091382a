//! # Kernel Mutex
//!
//! Sleeping mutual exclusion for task context.
//!
//! - `try_lock` is a single test-and-set and is safe from interrupts.
//! - `lock` queues the caller in FIFO order and parks it in LOCKWAIT.
//! - `unlock` hands the lock to the oldest waiter and switches to it at
//!   once, without going through the scheduler's table scan; the lock flag
//!   stays set across the hand-off, so the waiter owns the mutex when it
//!   resumes.
//!
//! When the wait queue is full, `lock` degrades to spinning on the flag.
//! The holder still gets preempted by the tick, so spinning makes progress.
//! A contended `lock` with preemption disabled fails with `AtomicContext`:
//! the holder could never run to release it.

use core::sync::atomic::{AtomicBool, Ordering};

use heapless::Deque;

use crate::arch::Port;
use crate::config::MUTEX_WAITERS;
use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::sync::SpinLock;
use crate::task::{Pid, TaskState};

/// A kernel mutex. Place it in a `static` and share it between tasks.
pub struct KMutex {
    locked: AtomicBool,
    waiters: SpinLock<Deque<Pid, MUTEX_WAITERS>>,
}

/// Result of [`Kernel::mutex_lock_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStep {
    /// The caller owns the mutex now.
    Acquired,
    /// The caller is queued in LOCKWAIT; it owns the mutex once resumed.
    Blocked,
    /// The wait queue is full; the caller must spin on `try_lock`.
    Spin,
}

impl KMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: SpinLock::new(Deque::new()),
        }
    }

    /// Take the mutex if it is free. Never blocks.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Clear the flag. Only for a holder with no waiter to hand off to.
    #[inline]
    pub(crate) fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Fill the wait queue with dummy pids.
    #[cfg(test)]
    pub(crate) fn fill_wait_queue(&self) {
        let mut waiters = self.waiters.lock();
        while waiters.push_back(0).is_ok() {}
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port> Kernel<P> {
    /// One attempt at locking `mutex` for the current task.
    ///
    /// Taking a free mutex always works; waiting for a held one fails with
    /// `AtomicContext` inside an atomic section.
    pub fn mutex_lock_step(&mut self, mutex: &KMutex) -> KernelResult<LockStep> {
        if mutex.try_lock() {
            return Ok(LockStep::Acquired);
        }
        self.check_preemptible("mutex lock")?;

        let pid = self.current();
        if mutex.waiters.lock().push_back(pid).is_err() {
            log::warn!("task {} spinning: mutex wait queue full", pid);
            return Ok(LockStep::Spin);
        }

        self.sched.block_current(TaskState::LockWait);
        self.schedule();
        Ok(LockStep::Blocked)
    }

    /// Release `mutex`, handing it to the oldest waiter if there is one.
    pub fn mutex_unlock(&mut self, mutex: &KMutex) {
        debug_assert!(mutex.is_locked(), "unlock of an unlocked mutex");

        let next = mutex.waiters.lock().pop_front();
        match next {
            Some(waiter) => {
                debug_assert_eq!(self.task_state(waiter), Some(TaskState::LockWait));
                self.sched.hand_off(waiter);
            }
            None => mutex.release(),
        }
    }
}
