//! Condition variables
use kthread::{Condvar, Lock, PRI_DEFAULT};
use kthread_port_std::{run, Config, StdKernel, StdPort};
use std::sync::Arc;

mod common;
use common::Trace;

struct Shared {
    lock: Lock<'static, StdPort>,
    cv: Condvar<'static, StdPort>,
}

impl Shared {
    fn new(kernel: &'static StdKernel) -> Arc<Self> {
        Arc::new(Self {
            lock: Lock::new(kernel),
            cv: Condvar::new(kernel),
        })
    }
}

/// Create a thread that waits on `shared.cv` and logs its priority when woken.
fn spawn_waiter(kernel: &'static StdKernel, trace: &Trace<u8>, shared: &Arc<Shared>, priority: u8) {
    let (t, shared) = (trace.clone(), Arc::clone(shared));
    kernel
        .thread_create("waiter", priority, move || {
            shared.lock.acquire();
            shared.cv.wait(&shared.lock);
            t.push(priority);
            shared.lock.release();
        })
        .unwrap();
}

#[test]
fn signal_wakes_one() {
    run(Config::new(), |kernel| {
        let trace = Trace::new();
        let shared = Shared::new(kernel);

        spawn_waiter(kernel, &trace, &shared, PRI_DEFAULT + 5);
        spawn_waiter(kernel, &trace, &shared, PRI_DEFAULT + 5);
        assert_eq!(shared.cv.waiter_count(), 2);

        shared.lock.acquire();
        shared.cv.signal(&shared.lock);
        shared.lock.release();
        assert_eq!(trace.len(), 1);
        assert_eq!(shared.cv.waiter_count(), 1);

        shared.lock.acquire();
        shared.cv.signal(&shared.lock);
        shared.lock.release();
        assert_eq!(trace.len(), 2);

        // Nobody is waiting. The signal is lost.
        shared.lock.acquire();
        shared.cv.signal(&shared.lock);
        shared.lock.release();
        assert_eq!(shared.cv.waiter_count(), 0);
    });
}

#[test]
fn signal_wakes_in_priority_order() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();
        let shared = Shared::new(kernel);

        for priority in [35, 45, 40] {
            spawn_waiter(kernel, &trace, &shared, priority);
        }

        for _ in 0..3 {
            shared.lock.acquire();
            shared.cv.signal(&shared.lock);
            shared.lock.release();
        }

        trace.get()
    });

    assert_eq!(trace, [45, 40, 35]);
}

#[test]
fn signal_honors_donated_priority() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();
        let shared = Shared::new(kernel);
        let other = Arc::new(Lock::new(kernel));

        // A waits on the condition variable while holding `other`
        let (t, s, o) = (trace.clone(), Arc::clone(&shared), Arc::clone(&other));
        let a = kernel
            .thread_create("A", 35, move || {
                o.acquire();
                s.lock.acquire();
                s.cv.wait(&s.lock);
                t.push("A");
                s.lock.release();
                o.release();
            })
            .unwrap();

        let (t, s) = (trace.clone(), Arc::clone(&shared));
        kernel
            .thread_create("B", 40, move || {
                s.lock.acquire();
                s.cv.wait(&s.lock);
                t.push("B");
                s.lock.release();
            })
            .unwrap();

        // C blocks on `other` and lends A its priority
        let (t, o) = (trace.clone(), Arc::clone(&other));
        kernel
            .thread_create("C", 50, move || {
                o.acquire();
                t.push("C");
                o.release();
            })
            .unwrap();

        let info = kernel.thread_info(a).unwrap();
        assert_eq!((info.base_priority, info.effective_priority), (35, 50));

        for _ in 0..2 {
            shared.lock.acquire();
            shared.cv.signal(&shared.lock);
            shared.lock.release();
        }

        trace.get()
    });

    // A went in first with a lower base priority than B
    assert_eq!(trace, ["A", "C", "B"]);
}

#[test]
fn broadcast_wakes_all() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();
        let shared = Shared::new(kernel);

        for priority in [35, 45, 40, 45] {
            spawn_waiter(kernel, &trace, &shared, priority);
        }

        shared.lock.acquire();
        shared.cv.broadcast(&shared.lock);
        assert_eq!(shared.cv.waiter_count(), 0);

        // They are all waiting for the lock now, lending us their priority
        assert_eq!(kernel.thread_get_priority(), 45);
        shared.lock.release();

        trace.get()
    });

    assert_eq!(trace, [45, 45, 40, 35]);
}

#[test]
#[should_panic(expected = "requires the lock to be held")]
fn wait_without_lock() {
    run(Config::new(), |kernel| {
        let shared = Shared::new(kernel);
        shared.cv.wait(&shared.lock);
    });
}

#[test]
#[should_panic(expected = "requires the lock to be held")]
fn signal_without_lock() {
    run(Config::new(), |kernel| {
        let shared = Shared::new(kernel);
        shared.cv.signal(&shared.lock);
    });
}
