//! # KentOS
//!
//! A small preemptive kernel for single-core ARM Cortex-M4
//! microcontrollers, built around reference-counted kernel entities
//! ("kents") and an interrupt-to-task event bus ("kevents").
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! ├────────────────────────────────────────────────────────┤
//! │                Syscalls (syscall.rs)                    │
//! │   spawn · exit · wait_for_child · sleep · lock · read   │
//! ├──────────────┬────────────────────┬───────────────────┤
//! │  Kernel      │   Kevent bus       │  Sync Primitives  │
//! │  kernel.rs   │   kevent.rs        │  mutex.rs         │
//! │  ─ tick()    │   ─ dispatch()     │  atomic.rs        │
//! │  ─ schedule()│   ─ process_all()  │  sync.rs          │
//! │  device.rs   │   kent.rs          │  ringbuf.rs       │
//! ├──────────────┴────────────────────┴───────────────────┤
//! │          Scheduler + Task Model (scheduler.rs, task.rs) │
//! │        TCB · TaskState · round-robin · idle fallback    │
//! ├────────────────────────────────────────────────────────┤
//! │      Port trait (arch/mod.rs) · arch/cortex_m4.rs       │
//! │    PendSV · SysTick · Context Switch · Stack Pool       │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Kents
//!
//! Every task, device and in-flight kevent owns a node in the kent tree.
//! A node holds a reference on its parent, so a kevent keeps its device (or
//! exiting task) alive until it has been processed, and a dead task's slot
//! is reused only once its parent has reaped it.
//!
//! ## Kevents
//!
//! Interrupt handlers never block: they enqueue a kevent and return. The
//! next scheduler pass delivers queued kevents to listeners, which wake the
//! tasks waiting on them.
//!
//! ## Memory Model
//!
//! - **No heap**: All state is statically sized
//! - **No `alloc`**: Pure `core` plus `heapless` containers
//! - **Fixed-size tables**: tasks, kents, listeners and queues
//! - **Critical sections**: `critical-section` guards the global kernel

#![no_std]

pub mod arch;
pub mod atomic;
pub mod config;
pub mod device;
pub mod error;
pub mod kent;
pub mod kernel;
pub mod kevent;
pub mod mutex;
pub mod ringbuf;
pub mod scheduler;
pub mod sync;
pub mod syscall;
pub mod task;

pub use error::{KernelError, KernelResult};
