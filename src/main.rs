//! # KentOS Example Firmware
//!
//! Exercises the kernel with a handful of tasks:
//!
//! | Task | Behavior |
//! |------|----------|
//! | `supervisor` | Spawns workers, reaps them with `wait_for_child`, repeats |
//! | `worker` | Bumps a counter under the shared mutex, sleeps, exits |
//! | `echo` | Blocks in `read` on the UART and writes every byte back |
//! | `loopback` | Stands in for the UART interrupt: feeds input, drains output |
//!
//! The idle task runs whenever everything else is sleeping or blocked.

#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "arm", target_os = "none"), no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::sync::atomic::{AtomicU32, Ordering};

    use cortex_m_rt::entry;
    use panic_halt as _;

    use kentos::arch::cortex_m4::{self, KERNEL};
    use kentos::config::DEVICE_BUFFER_SIZE;
    use kentos::device::{CharDevice, DeviceId};
    use kentos::kernel::WaitOptions;
    use kentos::mutex::KMutex;
    use kentos::syscall;
    use kentos::task::WaitFilter;

    static UART: CharDevice<DEVICE_BUFFER_SIZE> = CharDevice::new(DeviceId(0));
    static COUNTER_LOCK: KMutex = KMutex::new();
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    const WORKERS: usize = 3;

    extern "C" fn worker() {
        for _ in 0..10 {
            if syscall::lock(&KERNEL, &COUNTER_LOCK).is_ok() {
                let seen = COUNTER.load(Ordering::Relaxed);
                // Widen the race window; the mutex keeps the update whole
                let _ = syscall::yield_now(&KERNEL);
                COUNTER.store(seen + 1, Ordering::Relaxed);
                let _ = syscall::unlock(&KERNEL, &COUNTER_LOCK);
            }
            let _ = syscall::sleep(&KERNEL, 5);
        }
        let pid = syscall::getpid(&KERNEL).unwrap_or(0);
        syscall::exit(&KERNEL, pid as i32)
    }

    extern "C" fn supervisor() {
        loop {
            for _ in 0..WORKERS {
                if syscall::spawn(&KERNEL, worker).is_err() {
                    break;
                }
            }
            while let Ok((pid, status)) =
                syscall::wait_for_child(&KERNEL, WaitFilter::Any, WaitOptions::empty())
            {
                log::info!("worker {} exited with {}", pid, status);
            }
            log::info!("counter at {}", COUNTER.load(Ordering::Relaxed));
            let _ = syscall::sleep(&KERNEL, 1000);
        }
    }

    extern "C" fn echo() {
        let mut buf = [0u8; 16];
        loop {
            match syscall::read(&KERNEL, &UART, &mut buf) {
                Ok(n) => {
                    let mut sent = 0;
                    while sent < n {
                        match syscall::write(&KERNEL, &UART, &buf[sent..n]) {
                            Ok(written) => sent += written,
                            Err(_) => break,
                        }
                    }
                }
                Err(_) => {
                    let _ = syscall::sleep(&KERNEL, 100);
                }
            }
        }
    }

    extern "C" fn loopback() {
        let mut out = [0u8; 16];
        loop {
            let _ = syscall::receive(&KERNEL, &UART, b"kent\n");
            let _ = syscall::transmit(&KERNEL, &UART, &mut out);
            let _ = syscall::sleep(&KERNEL, 250);
        }
    }

    /// Firmware entry point. Initializes the kernel, registers the UART,
    /// creates the tasks and starts scheduling. Does not return.
    #[entry]
    fn main() -> ! {
        let Some(cp) = cortex_m::Peripherals::take() else {
            halt();
        };
        if cortex_m4::init(cp.SYST).is_err() {
            halt();
        }

        match syscall::register_device(&KERNEL) {
            Ok(id) if id == UART.id() => {}
            _ => halt(),
        }

        for task in [supervisor as extern "C" fn(), echo, loopback] {
            if syscall::spawn(&KERNEL, task).is_err() {
                halt();
            }
        }

        cortex_m4::start()
    }

    fn halt() -> ! {
        loop {
            cortex_m::asm::wfi();
        }
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {
    eprintln!("kentos: firmware image, build for thumbv7em-none-eabi");
}
