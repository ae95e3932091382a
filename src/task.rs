//! # Task Control Block
//!
//! Defines the task model for KentOS. A task is a slot in the fixed-size
//! task table: its saved context, its stack, its place in the kent tree,
//! and the bookkeeping for whatever it is blocked on.
//!
//! ## Lifetime
//!
//! The table holds one reference on each live task's kent. When a task
//! exits, that reference moves into a [`DeadChild`] record on its parent's
//! pending list; the parent drops it when it reaps the child, and the
//! kent's destroy callback then frees the stack and the slot.

use heapless::Deque;

use crate::arch::{StackRegion, TaskContext};
use crate::config::MAX_TASKS;
use crate::kent::KentId;
use crate::kevent::{DeviceFlags, ListenerId};
use crate::sync::SpinLock;

/// Task identifier: the task's index in the task table.
pub type Pid = usize;

/// Pid of the idle task, which also owns everything spawned before the
/// scheduler starts.
pub const IDLE_PID: Pid = 0;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task in the scheduler's state machine.
///
/// ```text
///                 ┌───────── preempt / yield ─────────┐
///                 ▼                                   │
///   spawn ──► ┌───────┐      schedule()         ┌─────────┐ ──exit──► Dead
///             │ Queue │ ──────────────────────► │ Running │
///             └───────┘                         └─────────┘
///                 ▲  deadline / kevent / handoff     │ sleep, read, lock, wait
///                 └──── Sleep · IoWait · LockWait · WaitPid ◄┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Exited, or a free slot.
    Dead,
    /// Currently executing on the CPU.
    Running,
    /// Ready to run.
    Queue,
    /// Sleeping until `sleep_ticks` have passed since `last_tick`.
    Sleep,
    /// Blocked on a device kevent.
    IoWait,
    /// Blocked in a mutex wait queue.
    LockWait,
    /// Waiting for a child to exit.
    WaitPid,
}

/// Which children a `wait_for_child` call accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFilter {
    Any,
    Pid(Pid),
}

impl WaitFilter {
    #[inline]
    pub fn matches(self, pid: Pid) -> bool {
        match self {
            WaitFilter::Any => true,
            WaitFilter::Pid(wanted) => wanted == pid,
        }
    }
}

/// Durable record of a child's death, kept on the parent's pending list.
///
/// Owns the child's table reference until the parent reaps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadChild {
    pub pid: Pid,
    pub status: i32,
    pub kent: KentId,
}

/// What an IOWAIT task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoWait {
    pub device: usize,
    pub direction: DeviceFlags,
}

/// Read-only snapshot of a task, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: Pid,
    pub parent: Pid,
    pub state: TaskState,
    pub last_tick: u64,
    pub pending_children: usize,
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB).
///
/// TCBs live inline in the scheduler's table; a slot with `active == false`
/// is free.
pub struct TaskControlBlock {
    /// Index in the task table.
    pub pid: Pid,

    /// Pid of the spawning task.
    pub parent: Pid,

    /// This task's kent. `None` for a free slot.
    pub kent: Option<KentId>,

    pub state: TaskState,

    /// Saved stack pointer. Updated on every context switch.
    pub context: TaskContext,

    /// Stack handed out by the port. Returned when the kent is destroyed.
    pub stack: Option<StackRegion>,

    /// Sleep length in ticks, measured from `last_tick`.
    pub sleep_ticks: u64,

    /// Tick at which the task was last scheduled or went to sleep.
    pub last_tick: u64,

    /// Status passed to `exit`.
    pub exit_status: i32,

    /// Children that exited and have not been reaped yet, oldest first.
    pub dead_children: SpinLock<Deque<DeadChild, MAX_TASKS>>,

    /// Filter of the pending `wait_for_child`, while in WAITPID.
    pub wait_filter: WaitFilter,

    /// Task-kind listener registered while in WAITPID.
    pub child_listener: Option<ListenerId>,

    /// Device and direction waited on while in IOWAIT.
    pub io_wait: Option<IoWait>,

    /// Whether this slot holds a task.
    pub active: bool,
}

impl TaskControlBlock {
    /// An unallocated slot.
    pub const EMPTY: Self = Self::empty();

    pub const fn empty() -> Self {
        Self {
            pid: 0,
            parent: 0,
            kent: None,
            state: TaskState::Dead,
            context: TaskContext::EMPTY,
            stack: None,
            sleep_ticks: 0,
            last_tick: 0,
            exit_status: 0,
            dead_children: SpinLock::new(Deque::new()),
            wait_filter: WaitFilter::Any,
            child_listener: None,
            io_wait: None,
            active: false,
        }
    }

    /// Fill a free slot for a newly spawned task, ready to run.
    pub fn init(
        &mut self,
        pid: Pid,
        parent: Pid,
        kent: KentId,
        stack: StackRegion,
        context: TaskContext,
    ) {
        *self = Self::empty();
        self.pid = pid;
        self.parent = parent;
        self.kent = Some(kent);
        self.stack = Some(stack);
        self.context = context;
        self.state = TaskState::Queue;
        self.active = true;
    }

    /// Whether the scheduler may pick this task at tick `now`.
    ///
    /// QUEUE and RUNNING always qualify; SLEEP once its deadline passed.
    pub fn can_run(&self, now: u64) -> bool {
        if !self.active {
            return false;
        }
        match self.state {
            TaskState::Queue | TaskState::Running => true,
            TaskState::Sleep => now.wrapping_sub(self.last_tick) >= self.sleep_ticks,
            TaskState::Dead | TaskState::IoWait | TaskState::LockWait | TaskState::WaitPid => {
                false
            }
        }
    }

    /// Whether the task is alive (allocated and not exited).
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.active && self.state != TaskState::Dead
    }

    /// Append a dead child. The list holds one slot per possible task, so it
    /// cannot fill up.
    pub fn push_dead_child(&self, record: DeadChild) {
        let mut list = self.dead_children.lock();
        if list.push_back(record).is_err() {
            debug_assert!(false, "dead-child list overflow");
        }
    }

    /// Remove the oldest dead child accepted by `filter`, keeping the rest
    /// in order.
    pub fn take_dead_child(&self, filter: WaitFilter) -> Option<DeadChild> {
        let mut list = self.dead_children.lock();
        let mut found = None;
        for _ in 0..list.len() {
            let Some(rec) = list.pop_front() else { break };
            if found.is_none() && filter.matches(rec.pid) {
                found = Some(rec);
            } else {
                list.push_back(rec).ok();
            }
        }
        found
    }

    /// Remove every dead child.
    pub fn drain_dead_children(&self) -> Deque<DeadChild, MAX_TASKS> {
        core::mem::take(&mut *self.dead_children.lock())
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            pid: self.pid,
            parent: self.parent,
            state: self.state,
            last_tick: self.last_tick,
            pending_children: self.dead_children.lock().len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn live_task(pid: Pid) -> TaskControlBlock {
        let mut tcb = TaskControlBlock::empty();
        tcb.init(
            pid,
            IDLE_PID,
            KentId::ROOT,
            StackRegion { base: 0x1000, size: 256 },
            TaskContext { stack_pointer: 0x1100 },
        );
        tcb
    }

    fn record(pid: Pid, status: i32) -> DeadChild {
        DeadChild {
            pid,
            status,
            kent: KentId::ROOT,
        }
    }

    #[test]
    fn test_tcb_initialization() {
        let tcb = TaskControlBlock::empty();
        assert!(!tcb.active);
        assert!(!tcb.can_run(0));

        let tcb = live_task(3);
        assert!(tcb.active);
        assert_eq!(tcb.state, TaskState::Queue);
        assert_eq!(tcb.pid, 3);
        assert_eq!(tcb.context.stack_pointer, 0x1100);
    }

    #[test]
    fn test_can_run_by_state() {
        let mut tcb = live_task(1);
        for (state, runnable) in [
            (TaskState::Queue, true),
            (TaskState::Running, true),
            (TaskState::Dead, false),
            (TaskState::IoWait, false),
            (TaskState::LockWait, false),
            (TaskState::WaitPid, false),
        ] {
            tcb.state = state;
            assert_eq!(tcb.can_run(100), runnable, "{:?}", state);
        }
    }

    #[test]
    fn test_sleep_deadline() {
        let mut tcb = live_task(1);
        tcb.state = TaskState::Sleep;
        tcb.last_tick = 10;
        tcb.sleep_ticks = 5;
        assert!(!tcb.can_run(10));
        assert!(!tcb.can_run(14));
        assert!(tcb.can_run(15));
        assert!(tcb.can_run(40));
    }

    #[test]
    fn test_dead_children_fifo() {
        let tcb = live_task(1);
        tcb.push_dead_child(record(4, 40));
        tcb.push_dead_child(record(5, 50));
        tcb.push_dead_child(record(6, 60));

        assert_eq!(tcb.take_dead_child(WaitFilter::Any), Some(record(4, 40)));
        assert_eq!(tcb.take_dead_child(WaitFilter::Pid(6)), Some(record(6, 60)));
        assert_eq!(tcb.take_dead_child(WaitFilter::Pid(6)), None);
        assert_eq!(tcb.take_dead_child(WaitFilter::Any), Some(record(5, 50)));
        assert_eq!(tcb.take_dead_child(WaitFilter::Any), None);
    }

    #[test]
    fn test_filtered_take_keeps_order() {
        let tcb = live_task(1);
        tcb.push_dead_child(record(2, 0));
        tcb.push_dead_child(record(3, 0));
        tcb.push_dead_child(record(4, 0));
        tcb.take_dead_child(WaitFilter::Pid(3));

        let rest = tcb.drain_dead_children();
        let pids: heapless::Vec<Pid, MAX_TASKS> = rest.iter().map(|r| r.pid).collect();
        assert_eq!(pids.as_slice(), &[2, 4]);
    }
}
