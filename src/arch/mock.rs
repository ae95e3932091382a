//! Host-side port for unit tests. Records context switches instead of
//! performing them and hands out fake stack addresses.

use heapless::Vec;

use super::{Port, StackRegion, TaskContext, TaskEntry};
use crate::config::{MAX_TASKS, STACK_SIZE};
use crate::task::Pid;

const STACK_BASE: usize = 0x2000_0000;

pub struct MockPort {
    /// (from, to) of every switch, oldest first.
    pub switches: Vec<(Pid, Pid), 256>,
    pub stacks_in_use: [bool; MAX_TASKS],
    /// Makes `allocate_stack` fail.
    pub fail_alloc: bool,
    pub timer_hz: Option<u32>,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            switches: Vec::new(),
            stacks_in_use: [false; MAX_TASKS],
            fail_alloc: false,
            timer_hz: None,
        }
    }

    pub fn stacks_used(&self) -> usize {
        self.stacks_in_use.iter().filter(|used| **used).count()
    }

    pub fn last_switch(&self) -> Option<(Pid, Pid)> {
        self.switches.last().copied()
    }
}

extern "C" fn mock_idle() {}

impl Port for MockPort {
    fn allocate_stack(&mut self) -> Option<StackRegion> {
        if self.fail_alloc {
            return None;
        }
        let slot = self.stacks_in_use.iter().position(|used| !used)?;
        self.stacks_in_use[slot] = true;
        Some(StackRegion {
            base: STACK_BASE + slot * STACK_SIZE,
            size: STACK_SIZE,
        })
    }

    fn free_stack(&mut self, stack: StackRegion) {
        let slot = (stack.base - STACK_BASE) / STACK_SIZE;
        assert!(self.stacks_in_use[slot], "double free of stack {}", slot);
        self.stacks_in_use[slot] = false;
    }

    fn init_task_stack(&mut self, stack: &StackRegion, _entry: TaskEntry) -> TaskContext {
        TaskContext {
            stack_pointer: stack.top() - 64,
        }
    }

    fn switch_context(&mut self, from: Pid, _from_ctx: &mut TaskContext, to: Pid, _to_ctx: &TaskContext) {
        self.switches.push((from, to)).ok();
    }

    fn init_periodic_timer(&mut self, hz: u32) {
        self.timer_hz = Some(hz);
    }

    fn idle_entry(&self) -> TaskEntry {
        mock_idle
    }
}
