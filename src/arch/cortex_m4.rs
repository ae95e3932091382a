//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements [`Port`] with a static stack pool, context switching via
//! PendSV and the SysTick tick.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): Used by the kernel and interrupt handlers
//! - **PSP** (Process Stack Pointer): Used by tasks in Thread mode
//!
//! On exception entry, the hardware automatically stacks R0–R3, R12, LR, PC,
//! and xPSR onto the process stack. The PendSV handler manually saves and
//! restores R4–R11, which completes the full context save/restore.
//!
//! The kernel only ever *requests* a switch: `switch_context` pends PendSV,
//! which runs once the kernel's critical section ends. By then several
//! passes may have run, so PendSV does not trust the pair it was asked for.
//! The port remembers which task is really on the CPU, saves the outgoing
//! stack pointer into that task's TCB and resumes whatever the scheduler
//! currently calls `current_task`.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: Priority 0xFF (lowest)
//! - PendSV: Priority 0xFF (lowest)
//!
//! Both are set to the lowest priority so PendSV never preempts a device
//! interrupt handler and never nests inside SysTick.

use core::arch::{asm, naked_asm};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SYST;

use super::{Port, StackRegion, TaskContext, TaskEntry};
use crate::config::{MAX_TASKS, STACK_SIZE, SYSTEM_CLOCK_HZ};
use crate::error::KernelResult;
use crate::syscall::{self, KernelCell};
use crate::task::{Pid, IDLE_PID};

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

/// The kernel, as seen by tasks and by the exception handlers below.
pub static KERNEL: KernelCell<CortexM4Port> = KernelCell::new();

// ---------------------------------------------------------------------------
// Stack pool
// ---------------------------------------------------------------------------

#[repr(C, align(8))]
struct StackPool([[u8; STACK_SIZE]; MAX_TASKS]);

/// Backing memory for every task stack. Slots are handed out by
/// `CortexM4Port::allocate_stack`; nothing else touches this memory.
static mut STACKS: StackPool = StackPool([[0; STACK_SIZE]; MAX_TASKS]);

fn stack_pool_base() -> usize {
    // SAFETY: only the address is taken.
    unsafe { core::ptr::addr_of_mut!(STACKS) as usize }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

pub struct CortexM4Port {
    used: [bool; MAX_TASKS],
    syst: Option<SYST>,
    /// Task whose registers are live on the CPU.
    on_cpu: Pid,
}

impl CortexM4Port {
    pub fn new(syst: SYST) -> Self {
        Self {
            used: [false; MAX_TASKS],
            syst: Some(syst),
            on_cpu: IDLE_PID,
        }
    }
}

impl Port for CortexM4Port {
    fn allocate_stack(&mut self) -> Option<StackRegion> {
        let slot = self.used.iter().position(|used| !used)?;
        self.used[slot] = true;
        Some(StackRegion {
            base: stack_pool_base() + slot * STACK_SIZE,
            size: STACK_SIZE,
        })
    }

    fn free_stack(&mut self, stack: StackRegion) {
        let slot = (stack.base - stack_pool_base()) / STACK_SIZE;
        if let Some(used) = self.used.get_mut(slot) {
            *used = false;
        }
    }

    /// Lay out the frame PendSV (or `start_first_task`) expects.
    ///
    /// ```text
    /// [Hardware stacked frame]
    ///   xPSR  (Thumb bit set)
    ///   PC    (task entry point)
    ///   LR    (task_exit)
    ///   R12, R3, R2, R1, R0 (0)
    /// [Software saved context]
    ///   R11 .. R4 (0)          <- stack_pointer after init
    /// ```
    fn init_task_stack(&mut self, stack: &StackRegion, entry: TaskEntry) -> TaskContext {
        // Align to 8 bytes (AAPCS requirement)
        let aligned_top = stack.top() & !0x07;
        // 16 registers: 8 hardware-stacked + 8 software-saved
        let frame_ptr = (aligned_top - 16 * 4) as *mut u32;

        // SAFETY: the frame lies inside a stack slot owned by this task.
        unsafe {
            for i in 0..13 {
                *frame_ptr.add(i) = 0; // R4–R11, R0–R3, R12
            }
            *frame_ptr.add(13) = task_exit as usize as u32; // LR
            *frame_ptr.add(14) = entry as usize as u32; // PC
            *frame_ptr.add(15) = 0x0100_0000; // xPSR
        }

        TaskContext {
            stack_pointer: frame_ptr as usize,
        }
    }

    fn switch_context(&mut self, _from: Pid, _from_ctx: &mut TaskContext, _to: Pid, _to_ctx: &TaskContext) {
        trigger_pendsv();
    }

    fn init_periodic_timer(&mut self, hz: u32) {
        match self.syst.as_mut() {
            Some(syst) => configure_systick(syst, hz),
            None => log::warn!("no SysTick peripheral, running without a tick"),
        }
    }

    fn idle_entry(&self) -> TaskEntry {
        idle_task
    }
}

/// A task returning from its entry function lands here.
extern "C" fn task_exit() {
    syscall::exit(&KERNEL, 0)
}

extern "C" fn idle_task() {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Create the kernel. Code running between `init` and [`start`] acts as
/// the idle task, so the tasks it spawns are children of idle.
pub fn init(syst: SYST) -> KernelResult<()> {
    KERNEL.init(CortexM4Port::new(syst))
}

/// Start the tick and enter the idle task. **Does not return.**
///
/// The first SysTick picks the first spawned task.
pub fn start() -> ! {
    cortex_m::interrupt::disable();
    set_interrupt_priorities();

    let first_sp = KERNEL.with(|kernel| {
        kernel.start_timer();
        let current = kernel.current();
        kernel.sched.port.on_cpu = current;
        kernel.sched.context_of(current).stack_pointer
    });

    match first_sp {
        // SAFETY: the frame was laid out by `init_task_stack`.
        Ok(sp) => unsafe { start_first_task(sp as *const u32) },
        Err(_) => loop {
            cortex_m::asm::wfi();
        },
    }
}

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `hz` from the processor clock.
pub fn configure_systick(syst: &mut SYST, hz: u32) {
    let reload = SYSTEM_CLOCK_HZ / hz - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pend a PendSV exception to perform a context switch.
///
/// Sets the PENDSVSET bit in the Interrupt Control and State Register (ICSR).
#[inline]
pub fn trigger_pendsv() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// First task launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and jump into the task whose frame is at
/// `psp`, enabling interrupts on the way.
///
/// # Safety
/// Must only be called once, with a frame built by `init_task_stack`.
pub unsafe fn start_first_task(psp: *const u32) -> ! {
    asm!(
        // Skip the software-saved R4–R11
        "adds r0, #32",
        "msr psp, r0",

        // Thread mode on PSP (CONTROL.SPSEL = 1)
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unwind the hardware frame by hand
        "pop {{r0-r3, r12}}",
        "pop {{r4}}",          // LR (task_exit)
        "pop {{r5}}",          // PC (entry)
        "pop {{r6}}",          // xPSR, discarded
        "mov lr, r4",

        "cpsie i",
        "bx r5",

        in("r0") psp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the switch the kernel requested.
///
/// ## Sequence
/// 1. Save R4–R11 onto the outgoing task's stack (PSP)
/// 2. `swap_context` stores that PSP and returns the incoming task's
/// 3. Restore R4–R11 from the incoming task's stack
/// 4. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
///
/// # Safety
/// Called directly by the NVIC; follows the exception entry/exit convention.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",

        "bl {swap}",               // r0 = swap_context(r0)

        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",

        // Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
        "ldr r0, =0xFFFFFFFD",
        "bx r0",

        swap = sym swap_context,
    );
}

/// Record the outgoing stack pointer and pick up the incoming one.
extern "C" fn swap_context(psp: usize) -> usize {
    KERNEL
        .with(|kernel| {
            let sched = &mut kernel.sched;
            let from = sched.port.on_cpu;
            let to = sched.current_task;
            sched.tasks[from].context.stack_pointer = psp;
            sched.port.on_cpu = to;
            sched.tasks[to].context.stack_pointer
        })
        .unwrap_or(psp)
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: advances the clock and preempts.
#[no_mangle]
pub extern "C" fn SysTick() {
    // Before `init` there is nothing to tick
    let _ = syscall::tick(&KERNEL);
}
