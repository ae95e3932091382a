//! # Atomic Counter
//!
//! Interrupt-safe counter for a single core. Every update runs inside a
//! critical section, so an interrupt handler never sees a half-done
//! read-modify-write and the counter does not depend on the target having
//! atomic instructions.

use core::cell::Cell;

use critical_section::Mutex;

use crate::sync;

/// Counter whose increments and decrements cannot be torn by an interrupt.
pub struct AtomicCounter {
    value: Mutex<Cell<usize>>,
}

impl AtomicCounter {
    pub const fn new(value: usize) -> Self {
        Self {
            value: Mutex::new(Cell::new(value)),
        }
    }

    /// Increment and return the new value.
    pub fn increment(&self) -> usize {
        sync::critical_section(|cs| {
            let cell = self.value.borrow(cs);
            let next = cell.get() + 1;
            cell.set(next);
            next
        })
    }

    /// Decrement and return the new value.
    ///
    /// Decrementing zero is a programming error.
    pub fn decrement(&self) -> usize {
        sync::critical_section(|cs| {
            let cell = self.value.borrow(cs);
            let current = cell.get();
            debug_assert!(current > 0, "atomic counter underflow");
            let next = current.saturating_sub(1);
            cell.set(next);
            next
        })
    }

    pub fn get(&self) -> usize {
        sync::critical_section(|cs| self.value.borrow(cs).get())
    }

    pub fn set(&self, value: usize) {
        sync::critical_section(|cs| self.value.borrow(cs).set(value));
    }
}

impl core::fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicCounter").field(&self.get()).finish()
    }
}
