//! # Device Wait Protocol
//!
//! How tasks block on I/O. Drivers report state changes from their
//! interrupt handlers with [`Kernel::dispatch_device_kevent`]; a task that
//! finds nothing to read (or no room to write) registers a device listener
//! keyed on the device and direction and parks in IOWAIT until a matching
//! kevent arrives.
//!
//! [`CharDevice`] is the glue for a byte-stream device: one ring buffer per
//! direction, each behind a critical section so the interrupt side and the
//! task side can both touch it.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::arch::Port;
use crate::error::{KernelError, KernelResult};
use crate::kent::{KentId, KentOwner};
use crate::kernel::{destroy_plain, Kernel, Step};
use crate::kevent::{DeviceFlags, Kevent, KeventKind, KeventPayload, ListenerAction};
use crate::ringbuf::RingBuffer;
use crate::scheduler::Scheduler;
use crate::sync;
use crate::task::{IoWait, TaskState};

/// Index of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub usize);

/// Device-kind listener installed by a task entering IOWAIT.
fn on_device_ready<P: Port>(event: &Kevent, waiter: usize, sched: &mut Scheduler<P>) -> ListenerAction {
    let KeventPayload::Device { device, flags } = event.payload else {
        return ListenerAction::CONTINUE;
    };
    let task = &mut sched.tasks[waiter];
    let Some(wait) = task.io_wait else {
        return ListenerAction::CONTINUE;
    };
    if task.state != TaskState::IoWait
        || wait.device != device
        || !flags.intersects(wait.direction | DeviceFlags::ERR)
    {
        return ListenerAction::CONTINUE;
    }

    task.state = TaskState::Queue;
    task.io_wait = None;
    log::trace!("task {} woken by device {} ({:?})", waiter, device, flags);
    ListenerAction::REMOVE
}

impl<P: Port> Kernel<P> {
    /// Give a new device a kent under the root.
    pub fn register_device(&mut self) -> KernelResult<DeviceId> {
        let slot = self
            .devices
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::OutOfMemory)?;
        let kent = self.kents.init(
            Some(KentId::ROOT),
            KentOwner::Device(slot),
            Some(destroy_plain::<P>),
        )?;
        self.devices[slot] = Some(kent);
        log::debug!("device {} registered", slot);
        Ok(DeviceId(slot))
    }

    /// Drop the registry's reference. Kevents still in flight keep the
    /// kent alive until they are processed.
    pub fn unregister_device(&mut self, device: DeviceId) -> KernelResult<()> {
        let kent = self
            .devices
            .get_mut(device.0)
            .and_then(Option::take)
            .ok_or(KernelError::BadDevice)?;
        self.kents.put(kent, &mut self.sched);
        Ok(())
    }

    fn device_kent(&self, device: DeviceId) -> KernelResult<KentId> {
        self.devices
            .get(device.0)
            .copied()
            .flatten()
            .ok_or(KernelError::BadDevice)
    }

    /// Report a device state change. Interrupt-safe: never blocks.
    ///
    /// Fails with `OutOfMemory` when no kent is free or the kevent queues
    /// are full; the notification is lost but the data stays in the
    /// device, so a task polling it still sees it.
    pub fn dispatch_device_kevent(&mut self, device: DeviceId, flags: DeviceFlags) -> KernelResult<()> {
        let parent = self.device_kent(device)?;
        self.dispatch_kevent(
            parent,
            KeventPayload::Device {
                device: device.0,
                flags,
            },
        )
    }

    /// Interrupt entry for drivers: report a device state change, then run a
    /// scheduler pass so a task woken by it can run without waiting for the
    /// next tick. Inside an atomic section the pass is deferred as usual.
    pub fn signal_device(&mut self, device: DeviceId, flags: DeviceFlags) -> KernelResult<()> {
        self.dispatch_device_kevent(device, flags)?;
        self.schedule();
        Ok(())
    }

    /// Report a file state change on behalf of the current task.
    pub fn dispatch_file_kevent(&mut self, handle: usize, flags: DeviceFlags) -> KernelResult<()> {
        let parent = self.sched.current_tcb().kent.ok_or(KernelError::NoSuchTask)?;
        self.dispatch_kevent(parent, KeventPayload::File { handle, flags })
    }

    fn dispatch_kevent(&mut self, parent: KentId, payload: KeventPayload) -> KernelResult<()> {
        let kent = self
            .kents
            .init(Some(parent), KentOwner::Kevent, Some(destroy_plain::<P>))?;
        self.bus.dispatch(Kevent { kent, payload }).map_err(|event| {
            self.kents.put(event.kent, &mut self.sched);
            KernelError::OutOfMemory
        })
    }

    /// Park the current task until `device` reports `direction` (or an
    /// error). Yields instead when no listener slot is free.
    pub fn wait_device_step(&mut self, device: DeviceId, direction: DeviceFlags) -> KernelResult<Step<()>> {
        self.device_kent(device)?;
        self.check_preemptible("device wait")?;
        let pid = self.current();

        match self
            .bus
            .add_listener(KeventKind::Device, on_device_ready::<P>, pid)
        {
            Ok(_) => {
                self.sched.current_tcb_mut().io_wait = Some(IoWait {
                    device: device.0,
                    direction,
                });
                self.sched.block_current(TaskState::IoWait);
                self.schedule();
                Ok(Step::Blocked)
            }
            Err(_) => {
                log::warn!("task {} polling device {}: no listener slot", pid, device.0);
                self.schedule();
                Ok(Step::Polling)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Character device
// ---------------------------------------------------------------------------

/// Byte-stream device with one ring buffer per direction.
///
/// The driver's interrupt handler calls [`CharDevice::receive`] with
/// incoming bytes and [`CharDevice::transmit`] to fetch outgoing ones; tasks
/// use [`CharDevice::try_read`] / [`CharDevice::try_write`], or the blocking
/// wrappers in `syscall.rs`.
pub struct CharDevice<const N: usize> {
    id: DeviceId,
    rx: Mutex<RefCell<RingBuffer<N>>>,
    tx: Mutex<RefCell<RingBuffer<N>>>,
}

impl<const N: usize> CharDevice<N> {
    pub const fn new(id: DeviceId) -> Self {
        Self {
            id,
            rx: Mutex::new(RefCell::new(RingBuffer::new())),
            tx: Mutex::new(RefCell::new(RingBuffer::new())),
        }
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Task side: take buffered input.
    pub fn try_read(&self, buf: &mut [u8]) -> usize {
        sync::critical_section(|cs| self.rx.borrow_ref_mut(cs).read(buf))
    }

    /// Task side: queue output.
    pub fn try_write(&self, data: &[u8]) -> usize {
        sync::critical_section(|cs| self.tx.borrow_ref_mut(cs).write(data))
    }

    /// Interrupt side: store received bytes. Returns how many fitted.
    pub fn receive(&self, data: &[u8]) -> usize {
        sync::critical_section(|cs| self.rx.borrow_ref_mut(cs).write(data))
    }

    /// Interrupt side: fetch bytes to send. Returns how many were taken.
    pub fn transmit(&self, buf: &mut [u8]) -> usize {
        sync::critical_section(|cs| self.tx.borrow_ref_mut(cs).read(buf))
    }

    pub fn rx_pending(&self) -> usize {
        sync::critical_section(|cs| self.rx.borrow_ref(cs).len())
    }

    pub fn tx_free(&self) -> usize {
        sync::critical_section(|cs| self.tx.borrow_ref(cs).free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockPort;
    use crate::config::MAX_LISTENERS;
    use crate::kernel::tests::{kernel, noop_task, run_until};
    use crate::task::IDLE_PID;

    #[test]
    fn test_reader_wakes_on_matching_device_kevent() {
        let mut kernel = kernel();
        let uart = kernel.register_device().unwrap();
        let spi = kernel.register_device().unwrap();
        let reader = kernel.spawn(noop_task).unwrap();
        run_until(&mut kernel, reader);

        assert_eq!(kernel.wait_device_step(uart, DeviceFlags::RX), Ok(Step::Blocked));
        assert_eq!(kernel.task_state(reader), Some(TaskState::IoWait));
        assert_eq!(kernel.current(), IDLE_PID);

        // Wrong device, then wrong direction: still waiting
        kernel.dispatch_device_kevent(spi, DeviceFlags::RX).unwrap();
        kernel.dispatch_device_kevent(uart, DeviceFlags::TX).unwrap();
        kernel.tick();
        assert_eq!(kernel.task_state(reader), Some(TaskState::IoWait));

        kernel.dispatch_device_kevent(uart, DeviceFlags::RX).unwrap();
        kernel.tick();
        assert_eq!(kernel.current(), reader);
        assert_eq!(kernel.bus.listener_count(KeventKind::Device), 0);
    }

    #[test]
    fn test_error_wakes_any_direction() {
        let mut kernel = kernel();
        let uart = kernel.register_device().unwrap();
        let writer = kernel.spawn(noop_task).unwrap();
        run_until(&mut kernel, writer);

        kernel.wait_device_step(uart, DeviceFlags::TX).unwrap();
        kernel.dispatch_device_kevent(uart, DeviceFlags::ERR).unwrap();
        kernel.tick();
        assert_eq!(kernel.current(), writer);
    }

    #[test]
    fn test_device_kevent_pins_device_kent() {
        let mut kernel = kernel();
        let uart = kernel.register_device().unwrap();
        let kent = kernel.device_kent(uart).unwrap();

        kernel.dispatch_device_kevent(uart, DeviceFlags::RX).unwrap();
        assert_eq!(kernel.kents.count(kent), Some(2));

        kernel.unregister_device(uart).unwrap();
        assert!(kernel.kents.is_live(kent));
        assert_eq!(
            kernel.dispatch_device_kevent(uart, DeviceFlags::RX),
            Err(KernelError::BadDevice)
        );

        kernel.tick();
        assert!(!kernel.kents.is_live(kent));
    }

    #[test]
    fn test_signal_device_wakes_reader_without_tick() {
        let mut kernel = kernel();
        let uart = kernel.register_device().unwrap();
        let reader = kernel.spawn(noop_task).unwrap();
        run_until(&mut kernel, reader);
        kernel.wait_device_step(uart, DeviceFlags::RX).unwrap();
        assert_eq!(kernel.current(), IDLE_PID);

        kernel.signal_device(uart, DeviceFlags::RX).unwrap();
        assert_eq!(kernel.current(), reader);
        assert_eq!(kernel.uptime_ticks(), 0);
    }

    #[test]
    fn test_wait_polls_when_listener_table_full() {
        fn ignore(_event: &Kevent, _extra: usize, _sched: &mut Scheduler<MockPort>) -> ListenerAction {
            ListenerAction::CONTINUE
        }

        let mut kernel = kernel();
        let uart = kernel.register_device().unwrap();
        let reader = kernel.spawn(noop_task).unwrap();
        run_until(&mut kernel, reader);
        for _ in 0..MAX_LISTENERS {
            kernel.bus.add_listener(KeventKind::Device, ignore, 0).unwrap();
        }

        assert_eq!(kernel.wait_device_step(uart, DeviceFlags::RX), Ok(Step::Polling));
        // Still runnable, so it keeps retrying its read
        assert_eq!(kernel.task_state(reader), Some(TaskState::Running));
        assert_eq!(kernel.sched.tasks[reader].io_wait, None);

        kernel.dispatch_device_kevent(uart, DeviceFlags::RX).unwrap();
        kernel.tick();
        assert_eq!(kernel.current(), reader);
        assert_eq!(kernel.wait_device_step(uart, DeviceFlags::RX), Ok(Step::Polling));
        assert_eq!(kernel.bus.listener_count(KeventKind::Device), MAX_LISTENERS);
    }

    #[test]
    fn test_wait_refused_with_preemption_disabled() {
        let mut kernel = kernel();
        let uart = kernel.register_device().unwrap();
        let reader = kernel.spawn(noop_task).unwrap();
        run_until(&mut kernel, reader);

        kernel.preempt_disable();
        assert_eq!(
            kernel.wait_device_step(uart, DeviceFlags::RX),
            Err(KernelError::AtomicContext)
        );
        assert_eq!(kernel.current(), reader);
        assert_eq!(kernel.bus.listener_count(KeventKind::Device), 0);
        kernel.preempt_enable();
    }

    #[test]
    fn test_unknown_device() {
        let mut kernel = kernel();
        assert_eq!(
            kernel.wait_device_step(DeviceId(3), DeviceFlags::RX),
            Err(KernelError::BadDevice)
        );
        assert_eq!(
            kernel.dispatch_device_kevent(DeviceId(99), DeviceFlags::RX),
            Err(KernelError::BadDevice)
        );
    }

    #[test]
    fn test_file_kevent_reaches_file_listeners() {
        fn count(event: &Kevent, _extra: usize, sched: &mut Scheduler<MockPort>) -> ListenerAction {
            assert_eq!(event.kind(), KeventKind::File);
            sched.tasks[IDLE_PID].exit_status += 1;
            ListenerAction::CONTINUE
        }

        let mut kernel = kernel();
        kernel.bus.add_listener(KeventKind::File, count, 0).unwrap();
        kernel.dispatch_file_kevent(5, DeviceFlags::RX).unwrap();
        let uart = kernel.register_device().unwrap();
        kernel.dispatch_device_kevent(uart, DeviceFlags::RX).unwrap();
        kernel.schedule();
        assert_eq!(kernel.sched.tasks[IDLE_PID].exit_status, 1);
    }

    #[test]
    fn test_char_device_buffers() {
        let dev = CharDevice::<4>::new(DeviceId(0));
        assert_eq!(dev.receive(b"hello"), 4);
        assert_eq!(dev.rx_pending(), 4);

        let mut buf = [0u8; 8];
        assert_eq!(dev.try_read(&mut buf), 4);
        assert_eq!(&buf[..4], b"hell");

        assert_eq!(dev.try_write(b"ok"), 2);
        assert_eq!(dev.tx_free(), 2);
        assert_eq!(dev.transmit(&mut buf), 2);
        assert_eq!(&buf[..2], b"ok");
    }
}
