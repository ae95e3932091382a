//! # Scheduler
//!
//! Task table and round-robin selection for KentOS.
//!
//! ## Scheduling Algorithm
//!
//! Each pass (driven by [`Kernel::schedule`](crate::kernel::Kernel::schedule)):
//! 1. **Demote**: a task still RUNNING goes back to QUEUE
//! 2. **Scan**: walk the table from the slot after the current pid,
//!    wrapping, for the first task that can run (QUEUE, RUNNING, or SLEEP
//!    whose deadline passed)
//! 3. **Idle**: if nothing qualifies, pick the idle task in slot 0
//! 4. **Stamp**: mark the pick RUNNING and record the tick
//!
//! Starting the scan after the current pid gives every ready task one turn
//! per cycle; the idle task never takes part in the scan.

use crate::arch::{Port, StackRegion, TaskContext};
use crate::config::MAX_TASKS;
use crate::task::{Pid, TaskControlBlock, TaskInfo, TaskState, IDLE_PID};

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// Task table plus the state every scheduler pass reads and writes.
///
/// ## Design Notes
///
/// - All tasks are stored inline in a fixed-size array (no heap)
/// - `current_task` tracks the pid of the running task
/// - The idle task (pid 0) is always present as a fallback
pub struct Scheduler<P: Port> {
    /// Hardware port.
    pub port: P,

    /// Fixed-size array of TCBs. Slot 0 is the idle task.
    pub tasks: [TaskControlBlock; MAX_TASKS],

    /// Pid of the running task.
    pub current_task: Pid,

    /// Monotonic tick counter.
    pub tick_count: u64,

    /// Set when a pass was requested inside an atomic section.
    pub needs_reschedule: bool,

    /// Nesting depth of atomic (non-preemptible) sections.
    pub atomic_depth: usize,
}

impl<P: Port> Scheduler<P> {
    /// Create a scheduler with an empty table. The kernel installs the idle
    /// task in slot 0.
    pub const fn new(port: P) -> Self {
        Self {
            port,
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            current_task: IDLE_PID,
            tick_count: 0,
            needs_reschedule: false,
            atomic_depth: 0,
        }
    }

    /// First free slot after the idle slot.
    pub fn free_slot(&self) -> Option<Pid> {
        (1..MAX_TASKS).find(|&pid| !self.tasks[pid].active)
    }

    /// Pick the next task and make it current.
    ///
    /// Returns `(previous, next)`. Does not switch contexts.
    pub fn select_next(&mut self) -> (Pid, Pid) {
        let prev = self.current_task;
        if self.tasks[prev].state == TaskState::Running {
            self.tasks[prev].state = TaskState::Queue;
        }

        let now = self.tick_count;
        let next = (1..MAX_TASKS)
            .map(|offset| (prev + offset) % MAX_TASKS)
            .filter(|&pid| pid != IDLE_PID)
            .find(|&pid| self.tasks[pid].can_run(now))
            .or_else(|| {
                // `prev` itself is last in line
                (prev != IDLE_PID && self.tasks[prev].can_run(now)).then_some(prev)
            })
            .unwrap_or(IDLE_PID);

        self.make_current(next);
        log::trace!("schedule: {} -> {} at tick {}", prev, next, now);
        (prev, next)
    }

    /// Mark `pid` RUNNING and current, stamping the tick.
    fn make_current(&mut self, pid: Pid) {
        let now = self.tick_count;
        let task = &mut self.tasks[pid];
        task.state = TaskState::Running;
        task.last_tick = now;
        self.current_task = pid;
    }

    /// Hand the CPU straight to `pid`, bypassing the table scan.
    ///
    /// Used by mutex release: the waiter becomes runnable and is switched to
    /// immediately, ahead of every other ready task. Inside an atomic
    /// section the waiter is only made runnable and the switch is left to
    /// the pass that runs when the section ends.
    pub fn hand_off(&mut self, pid: Pid) {
        let prev = self.current_task;
        self.tasks[pid].state = TaskState::Queue;
        if self.atomic_depth > 0 {
            self.needs_reschedule = true;
            log::trace!("hand-off {} -> {} deferred", prev, pid);
            return;
        }
        if self.tasks[prev].state == TaskState::Running {
            self.tasks[prev].state = TaskState::Queue;
        }
        self.make_current(pid);
        log::trace!("hand-off: {} -> {}", prev, pid);
        self.switch_context(prev, pid);
    }

    /// Perform the port-level switch if the pick changed.
    pub fn switch_context(&mut self, prev: Pid, next: Pid) {
        if prev == next {
            return;
        }
        let to = self.tasks[next].context;
        self.port
            .switch_context(prev, &mut self.tasks[prev].context, next, &to);
    }

    /// Move the running task into a blocked or sleeping state.
    pub fn block_current(&mut self, state: TaskState) {
        let current = self.current_task;
        self.tasks[current].state = state;
    }

    /// Free a slot whose kent was destroyed: return its stack and clear it.
    pub fn release_slot(&mut self, pid: Pid) {
        let stack: Option<StackRegion> = self.tasks[pid].stack.take();
        if let Some(stack) = stack {
            self.port.free_stack(stack);
        }
        self.tasks[pid] = TaskControlBlock::empty();
        log::debug!("task {} released", pid);
    }

    /// Pids of the live (non-DEAD) children of `parent`.
    pub fn live_children(&self, parent: Pid) -> impl Iterator<Item = Pid> + '_ {
        self.tasks
            .iter()
            .filter(move |t| t.is_alive() && t.parent == parent && t.pid != parent)
            .map(|t| t.pid)
    }

    /// Get a reference to the current task's TCB.
    pub fn current_tcb(&self) -> &TaskControlBlock {
        &self.tasks[self.current_task]
    }

    /// Get a mutable reference to the current task's TCB.
    pub fn current_tcb_mut(&mut self) -> &mut TaskControlBlock {
        &mut self.tasks[self.current_task]
    }

    pub fn context_of(&self, pid: Pid) -> TaskContext {
        self.tasks[pid].context
    }

    pub fn info(&self, pid: Pid) -> Option<TaskInfo> {
        let task = self.tasks.get(pid)?;
        task.active.then(|| task.info())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockPort;
    use crate::kent::KentId;

    /// Scheduler with the idle task and `count` ready tasks in slots 1..=count.
    fn scheduler_with(count: usize) -> Scheduler<MockPort> {
        let mut sched = Scheduler::new(MockPort::new());
        for pid in 0..=count {
            let stack = sched.port.allocate_stack().unwrap();
            let ctx = TaskContext {
                stack_pointer: stack.top(),
            };
            sched.tasks[pid].init(pid, IDLE_PID, KentId::ROOT, stack, ctx);
        }
        sched.tasks[IDLE_PID].state = TaskState::Running;
        sched
    }

    #[test]
    fn test_round_robin_cycle() {
        let mut sched = scheduler_with(4);
        let mut order = heapless::Vec::<Pid, 16>::new();
        for _ in 0..8 {
            let (_, next) = sched.select_next();
            order.push(next).unwrap();
        }
        assert_eq!(order.as_slice(), &[1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_scan_starts_after_current() {
        let mut sched = scheduler_with(5);
        sched.current_task = 3;
        sched.tasks[3].state = TaskState::Running;
        let mut order = heapless::Vec::<Pid, 16>::new();
        for _ in 0..5 {
            order.push(sched.select_next().1).unwrap();
        }
        assert_eq!(order.as_slice(), &[4, 5, 1, 2, 3]);
    }

    #[test]
    fn test_never_selects_blocked_or_dead() {
        let mut sched = scheduler_with(5);
        sched.tasks[1].state = TaskState::Dead;
        sched.tasks[2].state = TaskState::IoWait;
        sched.tasks[3].state = TaskState::LockWait;
        sched.tasks[4].state = TaskState::WaitPid;
        for _ in 0..6 {
            let (_, next) = sched.select_next();
            assert_eq!(next, 5);
        }
    }

    #[test]
    fn test_idle_when_nothing_runnable() {
        let mut sched = scheduler_with(2);
        sched.tasks[1].state = TaskState::IoWait;
        sched.tasks[2].state = TaskState::Sleep;
        sched.tasks[2].sleep_ticks = 10;
        assert_eq!(sched.select_next(), (IDLE_PID, IDLE_PID));
        assert_eq!(sched.tasks[IDLE_PID].state, TaskState::Running);
    }

    #[test]
    fn test_current_keeps_cpu_when_alone() {
        let mut sched = scheduler_with(1);
        assert_eq!(sched.select_next().1, 1);
        assert_eq!(sched.select_next(), (1, 1));
        assert_eq!(sched.tasks[1].state, TaskState::Running);
    }

    #[test]
    fn test_sleeper_wakes_at_deadline() {
        let mut sched = scheduler_with(1);
        sched.tasks[1].state = TaskState::Sleep;
        sched.tasks[1].sleep_ticks = 3;
        sched.tasks[1].last_tick = 0;

        for tick in 0..3 {
            sched.tick_count = tick;
            assert_eq!(sched.select_next().1, IDLE_PID);
        }
        sched.tick_count = 3;
        assert_eq!(sched.select_next().1, 1);
        assert_eq!(sched.tasks[1].last_tick, 3);
    }

    #[test]
    fn test_hand_off_switches_directly() {
        let mut sched = scheduler_with(3);
        sched.select_next(); // 1 running
        sched.tasks[3].state = TaskState::LockWait;

        sched.hand_off(3);
        assert_eq!(sched.current_task, 3);
        assert_eq!(sched.tasks[3].state, TaskState::Running);
        assert_eq!(sched.tasks[1].state, TaskState::Queue);
        assert_eq!(sched.port.last_switch(), Some((1, 3)));
    }

    #[test]
    fn test_hand_off_deferred_in_atomic_section() {
        let mut sched = scheduler_with(3);
        sched.select_next(); // 1 running
        sched.tasks[3].state = TaskState::LockWait;
        let switches = sched.port.switches.len();

        sched.atomic_depth = 1;
        sched.hand_off(3);
        assert_eq!(sched.current_task, 1);
        assert_eq!(sched.tasks[1].state, TaskState::Running);
        assert_eq!(sched.tasks[3].state, TaskState::Queue);
        assert!(sched.needs_reschedule);
        assert_eq!(sched.port.switches.len(), switches);
    }

    #[test]
    fn test_release_slot_returns_stack() {
        let mut sched = scheduler_with(2);
        assert_eq!(sched.port.stacks_used(), 3);
        sched.release_slot(2);
        assert_eq!(sched.port.stacks_used(), 2);
        assert!(!sched.tasks[2].active);
        assert_eq!(sched.free_slot(), Some(2));
    }
}
