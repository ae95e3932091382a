//! # Kernel Entities (kents)
//!
//! Hierarchical reference counting for every long-lived kernel object.
//! Tasks, devices and in-flight kevents each own one kent in a fixed-size
//! arena; a kent holds a counted reference on its parent, so a parent can
//! never be destroyed while any descendant is alive.
//!
//! ```text
//!   root ──► idle task ──► task 1 ──► task 3
//!     │                       └────► kevent (task 3 exited)
//!     └────► device 0 ──► kevent (RX)
//! ```
//!
//! Instead of embedding a header in a larger struct and casting back out of
//! it, each kent records an owner tag ([`KentOwner`]) that names the table
//! slot holding the real object. When a count reaches zero the owner's
//! destroy callback runs with a caller-supplied context, then the parent is
//! released in turn.

use crate::atomic::AtomicCounter;
use crate::config::KENT_CAPACITY;
use crate::error::{KernelError, KernelResult};
use crate::task::Pid;

/// Handle to a kent in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KentId(u16);

impl KentId {
    /// The root kent. Never destroyed.
    pub const ROOT: KentId = KentId(0);

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a kent stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KentOwner {
    Root,
    Task(Pid),
    Device(usize),
    Kevent,
}

/// Destroy callback, run once when a kent's count drops to zero.
pub type DestroyFn<C> = fn(&mut C, KentOwner);

struct KentNode<C> {
    parent: Option<KentId>,
    count: AtomicCounter,
    owner: KentOwner,
    destroy: DestroyFn<C>,
}

fn destroy_root<C>(_ctx: &mut C, _owner: KentOwner) {}

/// Fixed-capacity arena of kents.
///
/// `C` is the context handed to destroy callbacks (the scheduler, for the
/// kernel's own tree), so callbacks can release whatever the owner holds.
pub struct KentTree<C> {
    nodes: [Option<KentNode<C>>; KENT_CAPACITY],
    live: usize,
}

impl<C> KentTree<C> {
    /// Create an arena holding only the root kent.
    pub fn new() -> Self {
        let mut nodes = [const { None }; KENT_CAPACITY];
        nodes[KentId::ROOT.index()] = Some(KentNode {
            parent: None,
            count: AtomicCounter::new(1),
            owner: KentOwner::Root,
            destroy: destroy_root::<C> as DestroyFn<C>,
        });
        Self { nodes, live: 1 }
    }

    /// Create a kent under `parent` with a count of one.
    ///
    /// Fails with `InvalidArgument` if the parent or destroy callback is
    /// unset, or the parent is not a live kent, and with `OutOfMemory` when
    /// the arena is full. On success the parent gains one reference.
    pub fn init(
        &mut self,
        parent: Option<KentId>,
        owner: KentOwner,
        destroy: Option<DestroyFn<C>>,
    ) -> KernelResult<KentId> {
        let parent = parent.ok_or(KernelError::InvalidArgument)?;
        let destroy = destroy.ok_or(KernelError::InvalidArgument)?;
        if !self.is_live(parent) {
            return Err(KernelError::InvalidArgument);
        }

        let slot = self
            .nodes
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::OutOfMemory)?;

        self.node(parent).count.increment();
        self.nodes[slot] = Some(KentNode {
            parent: Some(parent),
            count: AtomicCounter::new(1),
            owner,
            destroy,
        });
        self.live += 1;
        Ok(KentId(slot as u16))
    }

    /// Take another reference. Safe from interrupt context.
    pub fn get(&self, id: KentId) {
        self.node(id).count.increment();
    }

    /// Drop a reference. When the count reaches zero the owner's destroy
    /// callback runs, the slot is freed, and the parent is released the same
    /// way, walking up the tree until some ancestor stays alive.
    pub fn put(&mut self, id: KentId, ctx: &mut C) {
        let mut next = Some(id);
        while let Some(id) = next {
            if self.node(id).count.decrement() != 0 {
                return;
            }
            assert!(id != KentId::ROOT, "root kent released");

            let Some(node) = self.nodes[id.index()].take() else {
                return;
            };
            self.live -= 1;
            (node.destroy)(ctx, node.owner);
            next = node.parent;
        }
    }

    /// Current reference count, or `None` for a free slot.
    pub fn count(&self, id: KentId) -> Option<usize> {
        self.slot(id).map(|node| node.count.get())
    }

    pub fn parent(&self, id: KentId) -> Option<KentId> {
        self.slot(id).and_then(|node| node.parent)
    }

    pub fn owner(&self, id: KentId) -> Option<KentOwner> {
        self.slot(id).map(|node| node.owner)
    }

    #[inline]
    pub fn is_live(&self, id: KentId) -> bool {
        self.slot(id).is_some()
    }

    /// Number of live kents, root included.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    fn slot(&self, id: KentId) -> Option<&KentNode<C>> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn node(&self, id: KentId) -> &KentNode<C> {
        match self.slot(id) {
            Some(node) => node,
            None => panic!("use of freed kent {}", id.index()),
        }
    }
}

impl<C> Default for KentTree<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = heapless::Vec<KentOwner, 16>;

    fn record(log: &mut Log, owner: KentOwner) {
        log.push(owner).ok();
    }

    #[test]
    fn test_init_requires_parent_and_destroy() {
        let mut tree: KentTree<Log> = KentTree::new();
        assert_eq!(
            tree.init(None, KentOwner::Kevent, Some(record)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            tree.init(Some(KentId::ROOT), KentOwner::Kevent, None),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(tree.live(), 1);
    }

    #[test]
    fn test_init_counts_parent() {
        let mut tree: KentTree<Log> = KentTree::new();
        let task = tree
            .init(Some(KentId::ROOT), KentOwner::Task(1), Some(record))
            .unwrap();
        assert_eq!(tree.count(task), Some(1));
        assert_eq!(tree.count(KentId::ROOT), Some(2));
        assert_eq!(tree.parent(task), Some(KentId::ROOT));
    }

    #[test]
    fn test_destroyed_exactly_at_zero() {
        let mut tree: KentTree<Log> = KentTree::new();
        let mut log = Log::new();
        let task = tree
            .init(Some(KentId::ROOT), KentOwner::Task(1), Some(record))
            .unwrap();

        tree.get(task);
        tree.get(task);
        tree.put(task, &mut log);
        tree.put(task, &mut log);
        assert!(log.is_empty());
        assert!(tree.is_live(task));

        tree.put(task, &mut log);
        assert_eq!(log.as_slice(), &[KentOwner::Task(1)]);
        assert!(!tree.is_live(task));
        assert_eq!(tree.count(KentId::ROOT), Some(1));
    }

    #[test]
    fn test_child_keeps_parent_alive() {
        let mut tree: KentTree<Log> = KentTree::new();
        let mut log = Log::new();
        let parent = tree
            .init(Some(KentId::ROOT), KentOwner::Task(1), Some(record))
            .unwrap();
        let child = tree
            .init(Some(parent), KentOwner::Task(2), Some(record))
            .unwrap();

        // Dropping the parent's own reference leaves the child's
        tree.put(parent, &mut log);
        assert!(tree.is_live(parent));
        assert_eq!(tree.count(parent), Some(1));

        // Child destruction cascades exactly one put into the parent
        tree.put(child, &mut log);
        assert_eq!(log.as_slice(), &[KentOwner::Task(2), KentOwner::Task(1)]);
        assert_eq!(tree.live(), 1);
    }

    #[test]
    fn test_arena_exhaustion() {
        let mut tree: KentTree<Log> = KentTree::new();
        for _ in 1..KENT_CAPACITY {
            tree.init(Some(KentId::ROOT), KentOwner::Kevent, Some(record))
                .unwrap();
        }
        assert_eq!(
            tree.init(Some(KentId::ROOT), KentOwner::Kevent, Some(record)),
            Err(KernelError::OutOfMemory)
        );
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut tree: KentTree<Log> = KentTree::new();
        let mut log = Log::new();
        let first = tree
            .init(Some(KentId::ROOT), KentOwner::Kevent, Some(record))
            .unwrap();
        tree.put(first, &mut log);
        let second = tree
            .init(Some(KentId::ROOT), KentOwner::Kevent, Some(record))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(tree.owner(second), Some(KentOwner::Kevent));
    }
}
