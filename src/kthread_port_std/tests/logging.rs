//! Trace logging of the scheduler and the lock machinery
use kthread::{Lock, PRI_DEFAULT};
use kthread_port_std::{run, Config};
use std::sync::{Arc, Mutex, PoisonError};

/// Keeps every message logged by `kthread`.
struct Recorder(Mutex<Vec<String>>);

impl log::Log for Recorder {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.target().starts_with("kthread")
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let mut messages = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            messages.push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static RECORDER: Recorder = Recorder(Mutex::new(Vec::new()));

#[test]
fn donation_is_traced() {
    // `run` tries to install `env_logger`, which fails after this
    log::set_logger(&RECORDER).unwrap();
    log::set_max_level(log::LevelFilter::Trace);

    run(Config::new(), |kernel| {
        let lock = Arc::new(Lock::new(kernel));
        lock.acquire();

        let lock2 = Arc::clone(&lock);
        kernel
            .thread_create("contender", PRI_DEFAULT + 1, move || {
                lock2.acquire();
                lock2.release();
            })
            .unwrap();

        lock.release();
    });

    let messages = RECORDER.0.lock().unwrap().clone();
    for expected in [
        "acquired lock",
        "waits for lock",
        "donates to",
        "raising",
        "blocks",
        "is unblocked",
        "released lock",
    ] {
        assert!(
            messages.iter().any(|message| message.contains(expected)),
            "no message contains {expected:?}"
        );
    }
}
