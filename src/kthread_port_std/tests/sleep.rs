//! Timed sleep
use kthread::{PortTimer, PRI_DEFAULT};
use kthread_port_std::{advance_ticks, interrupt, run, Config};

mod common;
use common::Trace;

#[test]
fn wakes_in_tick_order() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();

        for ticks in [5, 3, 8] {
            let t = trace.clone();
            kernel
                .thread_create("sleeper", PRI_DEFAULT + 10, move || {
                    kernel.sleep(ticks);
                    t.push(ticks);
                })
                .unwrap();
        }
        assert_eq!(kernel.sleeper_count(), 3);
        assert_eq!(kernel.next_wake_tick(), Some(3));

        advance_ticks(kernel, 2);
        assert!(trace.get().is_empty());

        advance_ticks(kernel, 1);
        assert_eq!(trace.get(), [3]);
        assert_eq!(kernel.next_wake_tick(), Some(5));

        advance_ticks(kernel, 2);
        assert_eq!(trace.get(), [3, 5]);
        assert_eq!(kernel.next_wake_tick(), Some(8));

        advance_ticks(kernel, 3);
        assert_eq!(kernel.next_wake_tick(), None);

        trace.get()
    });

    assert_eq!(trace, [3, 5, 8]);
}

#[test]
fn idle_thread_advances_the_clock() {
    run(Config::new(), |kernel| {
        let start = kernel.port().current_tick();
        kernel.sleep(10);
        assert_eq!(kernel.port().current_tick(), start + 10);

        // Every tick went to the idle thread
        let stats = kernel.stats();
        assert_eq!((stats.idle, stats.kernel, stats.user), (10, 0, 0));
    });
}

#[test]
fn zero_ticks_returns_immediately() {
    run(Config::new(), |kernel| {
        kernel.sleep(0);
        kernel.sleep_until(kernel.port().current_tick());
        assert_eq!(kernel.port().current_tick(), 0);
        assert_eq!(kernel.next_wake_tick(), None);
    });
}

#[test]
fn simultaneous_wakeups_run_by_priority() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();

        for priority in [PRI_DEFAULT + 4, PRI_DEFAULT + 14] {
            let t = trace.clone();
            kernel
                .thread_create("sleeper", priority, move || {
                    kernel.sleep_until(5);
                    t.push(priority);
                })
                .unwrap();
        }

        kernel.sleep_until(6);
        trace.get()
    });

    assert_eq!(trace, [PRI_DEFAULT + 14, PRI_DEFAULT + 4]);
}

#[test]
#[should_panic(expected = "interrupt context")]
fn sleep_in_interrupt() {
    run(Config::new(), |kernel| {
        interrupt(kernel, |kernel| kernel.sleep(1));
    });
}
