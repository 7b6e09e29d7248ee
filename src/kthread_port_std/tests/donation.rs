//! Priority donation
use kthread::{Lock, MAX_DONATION_DEPTH, PRI_DEFAULT};
use kthread_port_std::{run, Config, StdKernel, StdPort};
use std::sync::Arc;

mod common;
use common::Trace;

type SharedLock = Arc<Lock<'static, StdPort>>;

/// Create a thread that acquires `lock`, logs `name`, and releases it.
fn spawn_contender(
    kernel: &'static StdKernel,
    trace: &Trace<&'static str>,
    lock: &SharedLock,
    name: &'static str,
    priority: u8,
) {
    let (t, lock) = (trace.clone(), Arc::clone(lock));
    kernel
        .thread_create(name, priority, move || {
            lock.acquire();
            t.push(name);
            lock.release();
        })
        .unwrap();
}

#[test]
fn donate_one() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();
        let lock = Arc::new(Lock::new(kernel));
        lock.acquire();

        spawn_contender(kernel, &trace, &lock, "acquire1", PRI_DEFAULT + 1);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 1);

        spawn_contender(kernel, &trace, &lock, "acquire2", PRI_DEFAULT + 2);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 2);

        lock.release();
        trace.push("main");
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT);

        trace.get()
    });

    assert_eq!(trace, ["acquire2", "acquire1", "main"]);
}

#[test]
fn donation_is_returned_on_release() {
    run(Config::new(), |kernel| {
        kernel.thread_set_priority(1);

        let trace = Trace::new();
        let lock = Arc::new(Lock::new(kernel));
        lock.acquire();

        spawn_contender(kernel, &trace, &lock, "high", 10);
        assert_eq!(kernel.thread_get_priority(), 10);
        let info = kernel.thread_info(kernel.current_tid()).unwrap();
        assert_eq!((info.base_priority, info.effective_priority), (1, 10));

        lock.release();
        assert_eq!(trace.get(), ["high"]);
        assert_eq!(kernel.thread_get_priority(), 1);
    });
}

#[test]
fn donate_multiple() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();
        let a = Arc::new(Lock::new(kernel));
        let b = Arc::new(Lock::new(kernel));
        a.acquire();
        b.acquire();

        spawn_contender(kernel, &trace, &a, "a", PRI_DEFAULT + 1);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 1);

        spawn_contender(kernel, &trace, &b, "b", PRI_DEFAULT + 2);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 2);

        // Only the donation through `b` goes away
        b.release();
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 1);

        a.release();
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT);

        trace.get()
    });

    assert_eq!(trace, ["b", "a"]);
}

#[test]
fn lowering_base_priority_keeps_donation() {
    run(Config::new(), |kernel| {
        let trace = Trace::new();
        let lock = Arc::new(Lock::new(kernel));
        lock.acquire();

        spawn_contender(kernel, &trace, &lock, "donor", PRI_DEFAULT + 10);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 10);

        kernel.thread_set_priority(PRI_DEFAULT - 10);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 10);
        assert!(trace.get().is_empty());

        lock.release();
        assert_eq!(trace.get(), ["donor"]);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT - 10);
    });
}

/// Thread `i` (priority `i + 1`) holds `locks[i]` and waits for
/// `locks[i - 1]`. The main thread holds `locks[0]`. A donation travels at most
/// `MAX_DONATION_DEPTH` links.
#[test]
fn chain_is_bounded() {
    const CHAIN_LEN: usize = MAX_DONATION_DEPTH + 1;

    let trace = run(Config::new(), |kernel| {
        kernel.thread_set_priority(1);

        let trace = Trace::new();
        let locks: Vec<SharedLock> = (0..=CHAIN_LEN)
            .map(|_| Arc::new(Lock::new(kernel)))
            .collect();
        locks[0].acquire();

        let mut tids = Vec::new();
        for i in 1..=CHAIN_LEN {
            let t = trace.clone();
            let (own, next) = (Arc::clone(&locks[i]), Arc::clone(&locks[i - 1]));
            let tid = kernel
                .thread_create("link", i as u8 + 1, move || {
                    own.acquire();
                    next.acquire();
                    t.push(i);
                    next.release();
                    own.release();
                })
                .unwrap();
            tids.push(tid);

            // Every link so far is within reach
            if i <= MAX_DONATION_DEPTH {
                assert_eq!(kernel.thread_get_priority(), i as u8 + 1);
            }
        }

        // The last link raised the first thread but not us
        let priority_of = |i: usize| kernel.thread_info(tids[i]).unwrap().effective_priority;
        assert_eq!(kernel.thread_get_priority(), CHAIN_LEN as u8);
        for i in 0..CHAIN_LEN {
            assert_eq!(priority_of(i), CHAIN_LEN as u8 + 1, "link {}", i + 1);
        }

        locks[0].release();
        assert_eq!(kernel.thread_get_priority(), 1);

        trace.get()
    });

    assert_eq!(trace, (1..=CHAIN_LEN).collect::<Vec<_>>());
}

/// A donor that gets a donation of its own while waiting passes it on.
#[test]
fn nested_donation() {
    let trace = run(Config::new(), |kernel| {
        let trace = Trace::new();
        let a = Arc::new(Lock::new(kernel));
        let b = Arc::new(Lock::new(kernel));
        a.acquire();

        {
            let (t, a, b) = (trace.clone(), Arc::clone(&a), Arc::clone(&b));
            kernel
                .thread_create("medium", PRI_DEFAULT + 1, move || {
                    b.acquire();
                    a.acquire();
                    t.push("medium");
                    a.release();
                    b.release();
                    t.push("medium done");
                })
                .unwrap();
        }
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 1);

        spawn_contender(kernel, &trace, &b, "high", PRI_DEFAULT + 2);
        assert_eq!(kernel.thread_get_priority(), PRI_DEFAULT + 2);

        a.release();
        trace.push("main");

        trace.get()
    });

    assert_eq!(trace, ["medium", "high", "medium done", "main"]);
}
