//! # Kernel Events (kevents)
//!
//! Typed broadcast messages carried from interrupt context to task context.
//! Producers (device interrupt handlers, exiting tasks) hand a [`Kevent`] to
//! [`KeventBus::dispatch`], which never blocks. Once per scheduler pass
//! [`KeventBus::process_all`] drains the queues and runs the listeners
//! registered for each event's kind, in registration order.
//!
//! ## Queues
//!
//! Each kind has a bounded lock-free MPMC queue. When a kind's queue is
//! full the event goes to a shared overflow queue, which the next pass
//! moves back into the per-kind queues behind the events already there. When both are
//! full the event is handed back to the producer, which releases it: kevent
//! delivery is best-effort, and every consumer has a polling fallback.
//!
//! ## Ownership
//!
//! A queued kevent owns one reference on its kent (whose parent is the
//! originating task or device). `process_all` passes each event to a
//! release callback after its listeners ran; the kernel drops the kent
//! reference there.

use bitflags::bitflags;
use heapless::mpmc::MpMcQueue;
use heapless::Vec;

use crate::atomic::AtomicCounter;
use crate::config::{KEVENT_KINDS, KEVENT_OVERFLOW_DEPTH, KEVENT_QUEUE_DEPTH, MAX_LISTENERS};
use crate::error::{KernelError, KernelResult};
use crate::kent::KentId;
use crate::sync::SpinLock;
use crate::task::Pid;

/// Routing class of a kevent. Listeners subscribe per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeventKind {
    Device = 0,
    Task = 1,
    File = 2,
}

impl KeventKind {
    pub const ALL: [KeventKind; KEVENT_KINDS] = [Self::Device, Self::Task, Self::File];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Device state change carried by a device or file kevent, and the
    /// direction a blocked reader or writer waits for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u8 {
        /// Data became available to read.
        const RX = 1 << 0;
        /// Room became available to write.
        const TX = 1 << 1;
        /// The device reported an error.
        const ERR = 1 << 2;
    }
}

bitflags! {
    /// What the bus does after a listener returns.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListenerAction: u8 {
        /// Skip the remaining listeners for this event.
        const STOP = 1 << 0;
        /// Unregister this listener.
        const REMOVE = 1 << 1;
    }
}

impl ListenerAction {
    /// Keep the listener and carry on.
    pub const CONTINUE: Self = Self::empty();
}

/// Event body. The kind is implied by the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeventPayload {
    Device { device: usize, flags: DeviceFlags },
    Task { pid: Pid, parent: Pid, status: i32 },
    File { handle: usize, flags: DeviceFlags },
}

/// A queued event and the kent reference it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kevent {
    pub kent: KentId,
    pub payload: KeventPayload,
}

impl Kevent {
    pub const fn kind(&self) -> KeventKind {
        match self.payload {
            KeventPayload::Device { .. } => KeventKind::Device,
            KeventPayload::Task { .. } => KeventKind::Task,
            KeventPayload::File { .. } => KeventKind::File,
        }
    }
}

/// Listener callback: the event, the listener's `extra` word, and the
/// context passed to `process_all`.
pub type ListenerFn<C> = fn(&Kevent, usize, &mut C) -> ListenerAction;

/// Registration token returned by [`KeventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

struct Listener<C> {
    id: ListenerId,
    callback: ListenerFn<C>,
    extra: usize,
}

type ListenerTable<C> = [Vec<Listener<C>, MAX_LISTENERS>; KEVENT_KINDS];

/// Per-kind event queues, the overflow queue, and the listener lists.
pub struct KeventBus<C> {
    queues: [MpMcQueue<Kevent, KEVENT_QUEUE_DEPTH>; KEVENT_KINDS],
    overflow: MpMcQueue<Kevent, KEVENT_OVERFLOW_DEPTH>,
    listeners: SpinLock<ListenerTable<C>>,
    next_listener: AtomicCounter,
    dropped: AtomicCounter,
}

impl<C> KeventBus<C> {
    pub const fn new() -> Self {
        Self {
            queues: [const { MpMcQueue::new() }; KEVENT_KINDS],
            overflow: MpMcQueue::new(),
            listeners: SpinLock::new([const { Vec::new() }; KEVENT_KINDS]),
            next_listener: AtomicCounter::new(0),
            dropped: AtomicCounter::new(0),
        }
    }

    /// Queue an event. Never blocks; safe from interrupt context.
    ///
    /// Returns the event back when both its kind's queue and the overflow
    /// queue are full. The caller owns it again and must release its kent.
    pub fn dispatch(&self, event: Kevent) -> Result<(), Kevent> {
        let event = match self.queues[event.kind().index()].enqueue(event) {
            Ok(()) => {
                log::trace!("kevent {:?} queued", event.payload);
                return Ok(());
            }
            Err(event) => event,
        };

        match self.overflow.enqueue(event) {
            Ok(()) => {
                log::trace!("kevent {:?} queued on overflow", event.payload);
                Ok(())
            }
            Err(event) => {
                self.dropped.increment();
                log::warn!("kevent {:?} dropped: queues full", event.payload);
                Err(event)
            }
        }
    }

    /// Drain every queue, running listeners for each event.
    ///
    /// Overflowed events are always newer than everything in their kind's
    /// queue, so the per-kind queues are emptied first, the overflow is moved
    /// back into them, and they are emptied again. Each event is handed to
    /// `release` after its listeners ran.
    pub fn process_all(&self, ctx: &mut C, mut release: impl FnMut(&mut C, Kevent)) {
        self.drain_queues(ctx, &mut release);

        let mut moved = false;
        while let Some(event) = self.overflow.dequeue() {
            moved = true;
            if let Err(event) = self.queues[event.kind().index()].enqueue(event) {
                self.deliver(&event, ctx);
                release(ctx, event);
            }
        }

        if moved {
            self.drain_queues(ctx, &mut release);
        }
    }

    fn drain_queues(&self, ctx: &mut C, release: &mut impl FnMut(&mut C, Kevent)) {
        for kind in KeventKind::ALL {
            while let Some(event) = self.queues[kind.index()].dequeue() {
                self.deliver(&event, ctx);
                release(ctx, event);
            }
        }
    }

    fn deliver(&self, event: &Kevent, ctx: &mut C) {
        let mut listeners = self.listeners.lock();
        let list = &mut listeners[event.kind().index()];

        let mut i = 0;
        while i < list.len() {
            let action = (list[i].callback)(event, list[i].extra, ctx);
            if action.contains(ListenerAction::REMOVE) {
                list.remove(i);
            } else {
                i += 1;
            }
            if action.contains(ListenerAction::STOP) {
                break;
            }
        }
    }

    /// Subscribe `callback` to events of `kind`. Listeners run in
    /// registration order.
    pub fn add_listener(
        &self,
        kind: KeventKind,
        callback: ListenerFn<C>,
        extra: usize,
    ) -> KernelResult<ListenerId> {
        let id = ListenerId(self.next_listener.increment());
        let mut listeners = self.listeners.lock();
        listeners[kind.index()]
            .push(Listener { id, callback, extra })
            .map_err(|_| KernelError::OutOfMemory)?;
        Ok(id)
    }

    /// Unsubscribe a listener. Returns `false` if it was already gone
    /// (for example after returning `REMOVE`).
    pub fn remove_listener(&self, kind: KeventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let list = &mut listeners[kind.index()];
        match list.iter().position(|l| l.id == id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: KeventKind) -> usize {
        self.listeners.lock()[kind.index()].len()
    }

    /// Events refused by `dispatch` since boot.
    pub fn dropped(&self) -> usize {
        self.dropped.get()
    }
}

impl<C> Default for KeventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records (listener tag, event) pairs in call order.
    #[derive(Default)]
    struct Seen {
        calls: Vec<(usize, KeventPayload), 64>,
        released: usize,
    }

    fn device_event(device: usize) -> Kevent {
        Kevent {
            kent: KentId::ROOT,
            payload: KeventPayload::Device {
                device,
                flags: DeviceFlags::RX,
            },
        }
    }

    fn task_event(pid: Pid) -> Kevent {
        Kevent {
            kent: KentId::ROOT,
            payload: KeventPayload::Task {
                pid,
                parent: 0,
                status: 0,
            },
        }
    }

    fn keep(event: &Kevent, extra: usize, seen: &mut Seen) -> ListenerAction {
        seen.calls.push((extra, event.payload)).ok();
        ListenerAction::CONTINUE
    }

    fn once(event: &Kevent, extra: usize, seen: &mut Seen) -> ListenerAction {
        seen.calls.push((extra, event.payload)).ok();
        ListenerAction::REMOVE
    }

    fn stop(event: &Kevent, extra: usize, seen: &mut Seen) -> ListenerAction {
        seen.calls.push((extra, event.payload)).ok();
        ListenerAction::STOP
    }

    fn count_release(seen: &mut Seen, _event: Kevent) {
        seen.released += 1;
    }

    #[test]
    fn test_listener_sees_only_its_kind() {
        let bus: KeventBus<Seen> = KeventBus::new();
        let mut seen = Seen::default();
        bus.add_listener(KeventKind::Task, keep, 7).unwrap();

        bus.dispatch(device_event(0)).unwrap();
        bus.dispatch(task_event(3)).unwrap();
        bus.process_all(&mut seen, count_release);

        assert_eq!(seen.calls.len(), 1);
        assert_eq!(seen.calls[0], (7, task_event(3).payload));
        assert_eq!(seen.released, 2);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus: KeventBus<Seen> = KeventBus::new();
        let mut seen = Seen::default();
        bus.add_listener(KeventKind::Device, keep, 1).unwrap();
        bus.add_listener(KeventKind::Device, keep, 2).unwrap();
        bus.add_listener(KeventKind::Device, keep, 3).unwrap();

        bus.dispatch(device_event(0)).unwrap();
        bus.process_all(&mut seen, count_release);

        let tags: Vec<usize, 8> = seen.calls.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_removed_listener_never_runs_again() {
        let bus: KeventBus<Seen> = KeventBus::new();
        let mut seen = Seen::default();
        bus.add_listener(KeventKind::Device, once, 1).unwrap();

        bus.dispatch(device_event(0)).unwrap();
        bus.dispatch(device_event(1)).unwrap();
        bus.process_all(&mut seen, count_release);

        assert_eq!(seen.calls.len(), 1);
        assert_eq!(bus.listener_count(KeventKind::Device), 0);
        assert_eq!(seen.released, 2);
    }

    #[test]
    fn test_stop_skips_later_listeners() {
        let bus: KeventBus<Seen> = KeventBus::new();
        let mut seen = Seen::default();
        bus.add_listener(KeventKind::Device, stop, 1).unwrap();
        bus.add_listener(KeventKind::Device, keep, 2).unwrap();

        bus.dispatch(device_event(0)).unwrap();
        bus.process_all(&mut seen, count_release);

        assert_eq!(seen.calls.len(), 1);
        assert_eq!(seen.calls[0].0, 1);
        // STOP alone keeps the listener registered
        assert_eq!(bus.listener_count(KeventKind::Device), 2);
    }

    #[test]
    fn test_remove_listener_by_token() {
        let bus: KeventBus<Seen> = KeventBus::new();
        let id = bus.add_listener(KeventKind::File, keep, 0).unwrap();
        assert!(bus.remove_listener(KeventKind::File, id));
        assert!(!bus.remove_listener(KeventKind::File, id));
    }

    #[test]
    fn test_listener_table_full() {
        let bus: KeventBus<Seen> = KeventBus::new();
        for i in 0..MAX_LISTENERS {
            bus.add_listener(KeventKind::Task, keep, i).unwrap();
        }
        assert_eq!(
            bus.add_listener(KeventKind::Task, keep, 99),
            Err(KernelError::OutOfMemory)
        );
    }

    #[test]
    fn test_overflow_then_drop() {
        let bus: KeventBus<Seen> = KeventBus::new();
        let mut seen = Seen::default();
        bus.add_listener(KeventKind::Device, keep, 0).unwrap();

        for device in 0..KEVENT_QUEUE_DEPTH + KEVENT_OVERFLOW_DEPTH {
            bus.dispatch(device_event(device)).unwrap();
        }
        let refused = device_event(999);
        assert_eq!(bus.dispatch(refused), Err(refused));
        assert_eq!(bus.dropped(), 1);

        // One pass delivers the queued events, then the overflowed ones, in order
        bus.process_all(&mut seen, count_release);
        assert_eq!(seen.calls.len(), KEVENT_QUEUE_DEPTH + KEVENT_OVERFLOW_DEPTH);
        for (i, (_, payload)) in seen.calls.iter().enumerate() {
            assert_eq!(*payload, device_event(i).payload);
        }
        assert_eq!(seen.released, KEVENT_QUEUE_DEPTH + KEVENT_OVERFLOW_DEPTH);
    }
}
