//! # Kernel
//!
//! The kernel object: the scheduler and its task table, the kent tree, the
//! kevent bus and the device registry, plus the operations tasks reach
//! through syscalls.
//!
//! Every operation here is non-blocking. An operation that has to wait
//! moves the current task out of RUNNING and runs a scheduler pass, which
//! asks the port to switch away; the syscall layer (`syscall.rs`) loops
//! around these steps, and the suspension itself happens in the port once
//! the critical section ends.
//!
//! ## Scheduling pass
//!
//! ```text
//! tick() / syscall
//!   └─► schedule()
//!         ├─► enter atomic section
//!         ├─► bus.process_all()      ← listeners may wake IOWAIT/WAITPID tasks
//!         ├─► sched.select_next()    ← round-robin scan, idle fallback
//!         ├─► leave atomic section
//!         └─► sched.switch_context() ← only suspension point
//! ```

use crate::arch::{Port, TaskEntry};
use crate::config::{MAX_DEVICES, TICK_HZ};
use crate::error::{KernelError, KernelResult};
use crate::kent::{KentId, KentOwner, KentTree};
use crate::kevent::{Kevent, KeventBus, KeventKind, KeventPayload, ListenerAction};
use crate::scheduler::Scheduler;
use crate::task::{DeadChild, Pid, TaskInfo, TaskState, WaitFilter, IDLE_PID};

bitflags::bitflags! {
    /// Options for [`Kernel::wait_child_step`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u8 {
        /// Return `WouldBlock` instead of waiting.
        const NOHANG = 1 << 0;
    }
}

/// Outcome of one non-blocking step of a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T> {
    /// Finished.
    Done(T),
    /// The task was put to sleep on a kevent listener; retry once resumed.
    Blocked,
    /// No listener could be registered; the task yielded and should retry.
    Polling,
}

/// The kernel.
pub struct Kernel<P: Port> {
    pub sched: Scheduler<P>,
    pub kents: KentTree<Scheduler<P>>,
    pub bus: KeventBus<Scheduler<P>>,
    pub(crate) devices: [Option<KentId>; MAX_DEVICES],
}

/// Destroy callback for task kents: give back the stack and the slot.
fn destroy_task<P: Port>(sched: &mut Scheduler<P>, owner: KentOwner) {
    if let KentOwner::Task(pid) = owner {
        sched.release_slot(pid);
    }
}

/// Destroy callback for kevent and device kents, which own nothing else.
pub(crate) fn destroy_plain<P: Port>(_sched: &mut Scheduler<P>, _owner: KentOwner) {}

/// Task-kind listener installed by a parent blocked in WAITPID.
fn on_child_exit<P: Port>(event: &Kevent, waiter: usize, sched: &mut Scheduler<P>) -> ListenerAction {
    let KeventPayload::Task { pid, parent, .. } = event.payload else {
        return ListenerAction::CONTINUE;
    };
    let task = &mut sched.tasks[waiter];
    if parent != waiter || task.state != TaskState::WaitPid || !task.wait_filter.matches(pid) {
        return ListenerAction::CONTINUE;
    }
    task.state = TaskState::Queue;
    task.child_listener = None;
    log::trace!("task {} woken by exit of {}", waiter, pid);
    ListenerAction::REMOVE
}

impl<P: Port> Kernel<P> {
    /// Build a kernel around `port`, installing the idle task in slot 0 as
    /// the running task. Code executing before the scheduler starts runs as
    /// the idle task.
    pub fn new(port: P) -> KernelResult<Self> {
        let mut kernel = Self {
            sched: Scheduler::new(port),
            kents: KentTree::new(),
            bus: KeventBus::new(),
            devices: [None; MAX_DEVICES],
        };

        let stack = kernel
            .sched
            .port
            .allocate_stack()
            .ok_or(KernelError::OutOfMemory)?;
        let entry = kernel.sched.port.idle_entry();
        let context = kernel.sched.port.init_task_stack(&stack, entry);
        let kent = kernel.kents.init(
            Some(KentId::ROOT),
            KentOwner::Task(IDLE_PID),
            Some(destroy_task::<P>),
        )?;

        let idle = &mut kernel.sched.tasks[IDLE_PID];
        idle.init(IDLE_PID, IDLE_PID, kent, stack, context);
        idle.state = TaskState::Running;
        log::debug!("kernel initialised, {} ticks/s", TICK_HZ);
        Ok(kernel)
    }

    /// Start the tick timer.
    pub fn start_timer(&mut self) {
        self.sched.port.init_periodic_timer(TICK_HZ);
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Run one scheduler pass and switch to its pick.
    ///
    /// Inside an atomic section the pass is deferred until the section ends.
    pub fn schedule(&mut self) {
        if self.sched.atomic_depth > 0 {
            self.sched.needs_reschedule = true;
            return;
        }

        self.sched.atomic_depth += 1;
        let kents = &mut self.kents;
        self.bus
            .process_all(&mut self.sched, |sched, event| kents.put(event.kent, sched));
        let (prev, next) = self.sched.select_next();
        self.sched.needs_reschedule = false;
        self.sched.atomic_depth -= 1;

        self.sched.switch_context(prev, next);
    }

    /// Timer interrupt entry: advance the clock and preempt.
    pub fn tick(&mut self) {
        self.sched.tick_count = self.sched.tick_count.wrapping_add(1);
        self.schedule();
    }

    /// Enter an atomic section. Nests.
    pub fn preempt_disable(&mut self) {
        self.sched.atomic_depth += 1;
    }

    /// Leave an atomic section, running any pass requested inside it.
    pub fn preempt_enable(&mut self) {
        debug_assert!(self.sched.atomic_depth > 0, "unbalanced preempt_enable");
        self.sched.atomic_depth = self.sched.atomic_depth.saturating_sub(1);
        if self.sched.atomic_depth == 0 && self.sched.needs_reschedule {
            self.schedule();
        }
    }

    /// Give up the CPU, staying runnable.
    pub fn yield_now(&mut self) {
        self.schedule();
    }

    /// Refuse to park the current task while preemption is disabled: the
    /// pass would be deferred and the task would keep running while
    /// recorded as blocked.
    pub(crate) fn check_preemptible(&self, call: &str) -> KernelResult<()> {
        if self.sched.atomic_depth > 0 {
            log::warn!(
                "task {}: {} with preemption disabled",
                self.sched.current_task,
                call
            );
            return Err(KernelError::AtomicContext);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Create a task running `entry`, as a child of the current task.
    ///
    /// Fails with `NoFreeSlot` when the table is full and `OutOfMemory` when
    /// no stack or kent is available; nothing is left allocated on failure.
    pub fn spawn(&mut self, entry: TaskEntry) -> KernelResult<Pid> {
        let pid = self.sched.free_slot().ok_or(KernelError::NoFreeSlot)?;
        let parent = self.sched.current_task;
        let parent_kent = self.sched.tasks[parent].kent;

        let stack = self
            .sched
            .port
            .allocate_stack()
            .ok_or(KernelError::OutOfMemory)?;
        let kent = match self
            .kents
            .init(parent_kent, KentOwner::Task(pid), Some(destroy_task::<P>))
        {
            Ok(kent) => kent,
            Err(err) => {
                self.sched.port.free_stack(stack);
                return Err(err);
            }
        };

        let context = self.sched.port.init_task_stack(&stack, entry);
        self.sched.tasks[pid].init(pid, parent, kent, stack, context);
        log::debug!("task {} spawned by {}", pid, parent);
        Ok(pid)
    }

    /// Terminate the current task with `status` and switch away.
    ///
    /// The death is always recorded on the parent's pending list; a task
    /// kevent is dispatched on top so a parent blocked in WAITPID wakes in
    /// this same pass. Children of the idle task, and orphans, are reaped
    /// on the spot.
    pub fn exit_current(&mut self, status: i32) -> KernelResult<()> {
        let pid = self.sched.current_task;
        if pid == IDLE_PID {
            return Err(KernelError::InvalidArgument);
        }
        let kent = self.sched.tasks[pid].kent.ok_or(KernelError::NoSuchTask)?;

        // Nobody can wait for our dead children any more
        let mut orphans = self.sched.tasks[pid].drain_dead_children();
        while let Some(record) = orphans.pop_front() {
            self.kents.put(record.kent, &mut self.sched);
        }

        let parent = self.sched.tasks[pid].parent;
        let task = &mut self.sched.tasks[pid];
        task.state = TaskState::Dead;
        task.exit_status = status;
        log::debug!("task {} exited with {}", pid, status);

        if parent == IDLE_PID || !self.sched.tasks[parent].is_alive() {
            self.kents.put(kent, &mut self.sched);
        } else {
            self.sched.tasks[parent].push_dead_child(DeadChild { pid, status, kent });
            self.notify_exit(pid, parent, status, kent);
        }

        // An atomic section cannot outlive the task that opened it
        if self.sched.atomic_depth > 0 {
            log::warn!("task {} exited with preemption disabled", pid);
            self.sched.atomic_depth = 0;
        }
        self.schedule();
        Ok(())
    }

    /// Dispatch the task-exit kevent, or wake a waiting parent directly when
    /// the kevent cannot be created or queued.
    fn notify_exit(&mut self, pid: Pid, parent: Pid, status: i32, child_kent: KentId) {
        let payload = KeventPayload::Task { pid, parent, status };
        let queued = match self
            .kents
            .init(Some(child_kent), KentOwner::Kevent, Some(destroy_plain::<P>))
        {
            Ok(kent) => match self.bus.dispatch(Kevent { kent, payload }) {
                Ok(()) => true,
                Err(event) => {
                    self.kents.put(event.kent, &mut self.sched);
                    false
                }
            },
            Err(_) => {
                log::warn!("no kent for exit kevent of task {}", pid);
                false
            }
        };

        let waiter = &mut self.sched.tasks[parent];
        if !queued && waiter.state == TaskState::WaitPid && waiter.wait_filter.matches(pid) {
            if let Some(id) = waiter.child_listener.take() {
                self.bus.remove_listener(KeventKind::Task, id);
            }
            waiter.state = TaskState::Queue;
        }
    }

    /// One step of `wait_for_child` for the current task.
    ///
    /// Reaps the oldest matching dead child if there is one. Otherwise, with
    /// live matching children, registers a one-shot task listener and blocks
    /// in WAITPID; if no listener slot is free it yields instead and the
    /// caller polls again.
    pub fn wait_child_step(
        &mut self,
        filter: WaitFilter,
        options: WaitOptions,
    ) -> KernelResult<Step<(Pid, i32)>> {
        let pid = self.sched.current_task;

        if let Some(record) = self.sched.tasks[pid].take_dead_child(filter) {
            self.kents.put(record.kent, &mut self.sched);
            log::debug!("task {} reaped {} (status {})", pid, record.pid, record.status);
            return Ok(Step::Done((record.pid, record.status)));
        }

        if !self.sched.live_children(pid).any(|child| filter.matches(child)) {
            return Err(KernelError::NoChild);
        }
        if options.contains(WaitOptions::NOHANG) {
            return Err(KernelError::WouldBlock);
        }
        self.check_preemptible("wait_for_child")?;

        match self
            .bus
            .add_listener(KeventKind::Task, on_child_exit::<P>, pid)
        {
            Ok(id) => {
                let task = self.sched.current_tcb_mut();
                task.wait_filter = filter;
                task.child_listener = Some(id);
                self.sched.block_current(TaskState::WaitPid);
                self.schedule();
                Ok(Step::Blocked)
            }
            Err(_) => {
                log::warn!("task {} polling for children: no listener slot", pid);
                self.schedule();
                Ok(Step::Polling)
            }
        }
    }

    /// Put the current task to sleep for `millis` (rounded down to ticks).
    ///
    /// No event wakes a sleeper; the scheduler's scan picks it up once the
    /// ticks have passed. Fails with `AtomicContext` inside an atomic section.
    pub fn sleep_current(&mut self, millis: u32) -> KernelResult<()> {
        self.check_preemptible("sleep")?;
        let ticks = millis_to_ticks(millis);
        let now = self.sched.tick_count;
        let task = self.sched.current_tcb_mut();
        task.sleep_ticks = ticks;
        task.last_tick = now;
        self.sched.block_current(TaskState::Sleep);
        self.schedule();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn current(&self) -> Pid {
        self.sched.current_task
    }

    pub fn uptime_ticks(&self) -> u64 {
        self.sched.tick_count
    }

    pub fn task_info(&self, pid: Pid) -> KernelResult<TaskInfo> {
        self.sched.info(pid).ok_or(KernelError::NoSuchTask)
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        self.sched.info(pid).map(|info| info.state)
    }
}

/// Convert milliseconds to ticks, rounding down.
pub const fn millis_to_ticks(millis: u32) -> u64 {
    millis as u64 * TICK_HZ as u64 / 1000
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
