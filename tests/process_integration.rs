//! Process lifecycle integration tests: fork, exit, wait, kill, exec and
//! the resource-exhaustion rollback paths.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use muproc::{program, Config, KernelError, ProcState, PAGE_SIZE};

#[test]
fn fork_exit_wait_roundtrip() {
    let kernel = common::kernel(2);
    let child_ran = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let (child_flag, done_flag) = (Arc::clone(&child_ran), Arc::clone(&done));
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    // Fork child: the argument register came back zeroed.
                    child_flag.store(true, Ordering::SeqCst);
                    return;
                }
                let pid = p.fork().expect("fork");
                assert_ne!(pid, p.pid());
                let reaped = p.wait().expect("wait");
                assert_eq!(reaped, pid);
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "parent to reap its child");
    assert!(child_ran.load(Ordering::SeqCst));
    kernel.shutdown();
}

#[test]
fn wait_without_children_fails_immediately() {
    let kernel = common::kernel(1);
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    kernel
        .userinit(
            "init",
            program(move |p, _| {
                assert_eq!(p.wait().err(), Some(KernelError::NotFound));
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "childless wait to fail");
    kernel.shutdown();
}

#[test]
fn zombie_is_reaped_exactly_once() {
    let kernel = common::kernel(2);
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let k = Arc::clone(&kernel);
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    return;
                }
                let pid = p.fork().expect("fork");
                // Let the child run to completion; it lingers as a zombie
                // until we reap it.
                while k.proc_state(pid) != Some(ProcState::Zombie) {
                    p.yield_now();
                }
                assert_eq!(p.wait().expect("wait"), pid);
                assert_eq!(k.proc_state(pid), None);
                assert_eq!(p.wait().err(), Some(KernelError::NotFound));
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "zombie reap");
    kernel.shutdown();
}

#[test]
fn kill_is_advisory_and_wakes_sleepers() {
    let kernel = common::kernel(2);
    let interrupted = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let (int_flag, done_flag) = (Arc::clone(&interrupted), Arc::clone(&done));
    let k = Arc::clone(&kernel);
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    // Sleep far past the end of the test; only a kill can
                    // get us out early.
                    match p.sleep_ticks(1_000_000) {
                        Err(KernelError::Interrupted) => {
                            int_flag.store(true, Ordering::SeqCst);
                        }
                        other => panic!("sleep survived: {:?}", other),
                    }
                    return;
                }
                let pid = p.fork().expect("fork");
                while k.proc_state(pid) != Some(ProcState::Sleeping) {
                    p.yield_now();
                }
                k.kill(pid).expect("kill");
                assert_eq!(p.wait().expect("wait"), pid);
                assert_eq!(k.kill(9999).err(), Some(KernelError::NotFound));
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "killed sleeper to be reaped");
    assert!(interrupted.load(Ordering::SeqCst));
    kernel.shutdown();
}

#[test]
fn exec_replaces_the_image() {
    let kernel = common::kernel(2);
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let worker_arg = Arc::new(AtomicUsize::new(0));
    let seen_arg = Arc::clone(&worker_arg);
    let worker = program(move |p, arg| {
        assert_eq!(p.name(), "worker");
        seen_arg.store(arg, Ordering::SeqCst);
    });
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    let err = p.exec("worker", Arc::clone(&worker), 42);
                    panic!("exec failed: {:?}", err);
                }
                let pid = p.fork().expect("fork");
                assert_eq!(p.wait().expect("wait"), pid);
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "exec'd worker to finish");
    assert_eq!(worker_arg.load(Ordering::SeqCst), 42);
    kernel.shutdown();
}

#[test]
fn orphans_are_reparented_to_init() {
    let kernel = common::kernel(2);
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let init_pid = Arc::new(AtomicU32::new(0));
    let init_pid_seen = Arc::clone(&init_pid);
    let grandchild = Arc::new(AtomicU32::new(0));
    let grandchild_cell = Arc::clone(&grandchild);
    // Distinguishes the two arg==0 entrants: the middle child always runs
    // (and bumps this) before it forks the grandchild.
    let generation = Arc::new(AtomicUsize::new(0));
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                match arg {
                    0 => {
                        if generation.fetch_add(1, Ordering::SeqCst) == 0 {
                            // Middle child: fork a grandchild and vanish,
                            // leaving it an orphan.
                            p.fork().expect("inner fork");
                            return;
                        }
                        // Grandchild: spin until init adopts us.
                        loop {
                            let ppid = p.ppid();
                            if ppid == Some(init_pid_seen.load(Ordering::SeqCst)) {
                                grandchild_cell.store(p.pid(), Ordering::SeqCst);
                                return;
                            }
                            p.yield_now();
                        }
                    }
                    _ => {
                        init_pid.store(p.pid(), Ordering::SeqCst);
                        let child = p.fork().expect("fork");
                        // Reap the middle child, then the adopted orphan.
                        let first = p.wait().expect("first wait");
                        let second = p.wait().expect("second wait");
                        assert!(first == child || second == child);
                        done_flag.store(true, Ordering::SeqCst);
                        common::idle(p);
                    }
                }
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "orphan adoption");
    assert_ne!(grandchild.load(Ordering::SeqCst), 0);
    kernel.shutdown();
}

#[test]
fn process_table_has_fixed_capacity() {
    let kernel = common::kernel(2);
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let forked = Arc::new(AtomicUsize::new(0));
    let forked_count = Arc::clone(&forked);
    let k = Arc::clone(&kernel);
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    common::idle(p);
                    return;
                }
                let mut n = 0;
                loop {
                    match p.fork() {
                        Ok(_) => n += 1,
                        Err(KernelError::OutOfMemory) => break,
                        Err(e) => panic!("unexpected fork error: {:?}", e),
                    }
                }
                forked_count.store(n, Ordering::SeqCst);
                assert_eq!(k.live_count(), muproc::NPROC);
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "table exhaustion");
    assert_eq!(forked.load(Ordering::SeqCst), muproc::NPROC - 1);
    kernel.shutdown();
}

#[test]
fn failed_fork_rolls_the_embryo_back() {
    // Room for exactly two address spaces: init plus one child.
    let kernel = common::kernel_with(Config {
        ncpus: 2,
        max_spaces: 2,
        ..Config::default()
    });
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let k = Arc::clone(&kernel);
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    common::idle(p);
                    return;
                }
                p.fork().expect("first fork");
                assert_eq!(p.fork().err(), Some(KernelError::OutOfMemory));
                // The embryo was rolled back: two live processes, two
                // spaces, and the failed slot's stack returned.
                assert_eq!(k.live_count(), 2);
                assert_eq!(k.vm().live_spaces(), 2);
                assert_eq!(k.stacks().available(), k.stacks().capacity() - 2);
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "fork rollback");
    kernel.shutdown();
}

#[test]
fn stack_pool_exhaustion_is_recoverable() {
    let kernel = common::kernel_with(Config {
        ncpus: 2,
        stack_pool: 3,
        ..Config::default()
    });
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let k = Arc::clone(&kernel);
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    common::idle(p);
                    return;
                }
                let a = p.fork().expect("fork a");
                let _b = p.fork().expect("fork b");
                assert_eq!(p.fork().err(), Some(KernelError::OutOfMemory));
                // Reaping a child recycles its stack.
                k.kill(a).expect("kill");
                assert_eq!(p.wait().expect("wait"), a);
                p.fork().expect("fork after reap");
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "stack pool recovery");
    kernel.shutdown();
}

#[test]
fn grow_and_descriptors_and_procdump() {
    let kernel = common::kernel(1);
    let done = Arc::new(AtomicBool::new(false));
    let done_flag = Arc::clone(&done);
    let k = Arc::clone(&kernel);
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    loop {
                        if p.killed() {
                            p.exit();
                        }
                        p.yield_now();
                    }
                }
                assert_eq!(p.pid(), 1);
                assert_eq!(p.grow(100).expect("grow"), PAGE_SIZE);
                assert_eq!(p.space_size(), Some(PAGE_SIZE + 100));
                assert_eq!(p.grow(-(PAGE_SIZE as isize * 4)).err(),
                    Some(KernelError::InvalidArgument));

                let fd = p.open("/tmp/a").expect("open");
                assert_eq!(fd, 0);
                assert_eq!(p.dup(fd).expect("dup"), 1);
                assert_eq!(k.fs().live_files(), 1);

                // A forked child holds the same file alive.
                let pid = p.fork().expect("fork");
                p.close(0).expect("close 0");
                p.close(1).expect("close 1");
                assert_eq!(p.close(1).err(), Some(KernelError::NotFound));
                assert_eq!(p.close(muproc::NOFILE).err(),
                    Some(KernelError::InvalidArgument));
                assert_eq!(k.fs().live_files(), 1);

                let dump = k.procdump();
                assert!(dump.contains("init"));
                assert!(dump.contains("running"));

                k.kill(pid).expect("kill");
                assert_eq!(p.wait().expect("wait"), pid);
                assert_eq!(k.fs().live_files(), 0);
                done_flag.store(true, Ordering::SeqCst);
                common::idle(p);
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&done, "descriptor bookkeeping");
    kernel.shutdown();
}

#[test]
fn shutdown_stops_a_cpu_bound_process() {
    let kernel = common::kernel(1);
    let spinning = Arc::new(AtomicBool::new(false));
    let spin_flag = Arc::clone(&spinning);
    kernel
        .userinit(
            "init",
            program(move |p, _| {
                // Never sleeps, never exits; just hammers kernel entry
                // points. Teardown has to stop it at one of them.
                loop {
                    spin_flag.store(true, Ordering::SeqCst);
                    if p.killed() {
                        p.exit();
                    }
                    let _ = p.name();
                }
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    common::await_flag(&spinning, "init to start spinning");
    // The point is that this returns at all.
    kernel.shutdown();
    assert_eq!(kernel.live_count(), 0);
}

#[test]
fn shutdown_stops_busy_processes_on_every_cpu() {
    let kernel = common::kernel(4);
    let running = Arc::new(AtomicUsize::new(0));
    let running_count = Arc::clone(&running);
    kernel
        .userinit(
            "init",
            program(move |p, arg| {
                if arg == 0 {
                    running_count.fetch_add(1, Ordering::SeqCst);
                    loop {
                        p.yield_now();
                    }
                }
                for _ in 0..3 {
                    p.fork().expect("fork");
                }
                loop {
                    p.yield_now();
                }
            }),
            1,
        )
        .expect("userinit");
    kernel.start().expect("start");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while running.load(Ordering::SeqCst) < 3 {
        assert!(std::time::Instant::now() < deadline, "workers never spun up");
        std::thread::yield_now();
    }
    kernel.shutdown();
    assert_eq!(kernel.live_count(), 0);
}

#[test]
fn double_userinit_is_rejected() {
    let kernel = common::kernel(1);
    kernel
        .userinit("init", program(|p, _| common::idle(p)), 1)
        .expect("userinit");
    assert_eq!(
        kernel
            .userinit("other", program(|_, _| {}), 0)
            .err(),
        Some(KernelError::AlreadyExists)
    );
    kernel.shutdown();
}
