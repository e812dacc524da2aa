//! Shared scaffolding for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use muproc::{Config, Kernel, ProcHandle};

/// A kernel with `ncpus` CPUs and default resource limits.
pub fn kernel(ncpus: usize) -> Arc<Kernel> {
    Kernel::new(Config {
        ncpus,
        ..Config::default()
    })
    .expect("kernel construction")
}

/// A kernel with explicit limits.
pub fn kernel_with(config: Config) -> Arc<Kernel> {
    Kernel::new(config).expect("kernel construction")
}

/// Block the test thread until the workload raises `flag`.
pub fn await_flag(flag: &AtomicBool, what: &str) {
    await_flag_for(flag, what, Duration::from_secs(30));
}

pub fn await_flag_for(flag: &AtomicBool, what: &str, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Park the calling process until kernel teardown, exiting if killed.
pub fn idle(p: &ProcHandle) {
    loop {
        if p.sleep_ticks(u64::MAX).is_err() {
            p.exit();
        }
    }
}
