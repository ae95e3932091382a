//! # Architecture Abstraction Layer
//!
//! The [`Port`] trait is the kernel's only route to the hardware: stack
//! memory, initial register frames, context switching and the tick timer.
//! `cortex_m4` implements it for ARM Cortex-M4; host tests use `mock`.

use crate::task::Pid;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

#[cfg(test)]
pub mod mock;

/// Task entry point. A task that returns exits with status 0.
pub type TaskEntry = extern "C" fn();

/// Saved execution context of a task.
///
/// Only the stack pointer lives here; the registers themselves are pushed
/// onto the task's own stack by the port.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub stack_pointer: usize,
}

impl TaskContext {
    pub const EMPTY: Self = Self { stack_pointer: 0 };
}

/// A task stack handed out by the port: `[base, base + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub base: usize,
    pub size: usize,
}

impl StackRegion {
    /// One past the highest address; stacks grow down from here.
    #[inline]
    pub const fn top(&self) -> usize {
        self.base + self.size
    }
}

/// Hardware services consumed by the kernel.
pub trait Port {
    /// Take a stack from the port's pool. `None` when memory is exhausted.
    fn allocate_stack(&mut self) -> Option<StackRegion>;

    /// Return a stack obtained from `allocate_stack`.
    fn free_stack(&mut self, stack: StackRegion);

    /// Lay out an initial frame on `stack` so the first switch to the
    /// returned context starts executing `entry`.
    fn init_task_stack(&mut self, stack: &StackRegion, entry: TaskEntry) -> TaskContext;

    /// Suspend `from` and resume `to`. The outgoing stack pointer is written
    /// back into `from`. Ports may defer the switch until the current
    /// critical section ends.
    fn switch_context(&mut self, from: Pid, from_ctx: &mut TaskContext, to: Pid, to_ctx: &TaskContext);

    /// Start the periodic tick at `hz`.
    fn init_periodic_timer(&mut self, hz: u32);

    /// Body of the idle task.
    fn idle_entry(&self) -> TaskEntry;
}
