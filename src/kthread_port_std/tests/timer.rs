//! Asynchronous timer interrupts
#![cfg(unix)]
use kthread::{PortTimer, PRI_DEFAULT};
use kthread_port_std::{run, Config};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

mod common;
use common::Trace;

const PERIOD: Duration = Duration::from_millis(1);

/// Spin until `flag` is set or a generous deadline passes. Returns the flag.
fn spin_until(flag: &AtomicBool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::hint::spin_loop();
    }
    flag.load(Ordering::SeqCst)
}

#[test]
fn busy_thread_is_preempted() {
    let (ran, stats) = run(Config::new().with_timer_period(PERIOD), |kernel| {
        let flag = Arc::new(AtomicBool::new(false));

        let flag2 = Arc::clone(&flag);
        kernel
            .thread_create("peer", PRI_DEFAULT, move || {
                flag2.store(true, Ordering::SeqCst)
            })
            .unwrap();

        // Never yields. Only the time slice lets the peer run.
        let ran = spin_until(&flag);
        (ran, kernel.stats())
    });

    assert!(ran);
    assert!(stats.kernel >= 4, "{stats:?}");
}

#[test]
fn sleeper_preempts_busy_thread() {
    let trace = run(Config::new().with_timer_period(PERIOD), |kernel| {
        let trace = Trace::new();
        let flag = Arc::new(AtomicBool::new(false));
        trace.push("main");

        let (t, flag2) = (trace.clone(), Arc::clone(&flag));
        kernel
            .thread_create("sleeper", PRI_DEFAULT + 10, move || {
                kernel.sleep(3);
                t.push("sleeper");
                flag2.store(true, Ordering::SeqCst);
            })
            .unwrap();

        assert!(spin_until(&flag));
        assert!(kernel.port().current_tick() >= 3);
        trace.get()
    });

    assert_eq!(trace, ["main", "sleeper"]);
}

#[test]
fn idle_waits_for_the_timer() {
    let elapsed = run(Config::new().with_timer_period(PERIOD), |kernel| {
        let start = Instant::now();
        kernel.sleep(20);
        assert!(kernel.port().current_tick() >= 20);
        start.elapsed()
    });

    // The clock follows real time
    assert!(elapsed >= PERIOD * 20, "{elapsed:?}");
}

#[test]
#[should_panic(expected = "deadlock")]
fn deadlock_with_timer() {
    run(Config::new().with_timer_period(PERIOD), |kernel| {
        kernel.thread_block();
    });
}
