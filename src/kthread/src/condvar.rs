//! Condition variables
use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    thread::{unlock_cpu_and_check_preemption, ThreadIdx},
    Kernel, Lock, Port, Semaphore,
};

/// A condition variable, used together with a [`Lock`].
///
/// Each waiter blocks on a semaphore of its own. [`signal`](Condvar::signal)
/// picks the waiter whose thread has the highest effective priority at the
/// time of the call, earliest waiter first among equals.
///
/// Signals aren't remembered: a signal with no waiters does nothing.
pub struct Condvar<'k, P: Port> {
    kernel: &'k Kernel<P>,
    waiters: CpuLockCell<P, Vec<Arc<Waiter<'k, P>>>>,
}

struct Waiter<'k, P: Port> {
    sema: Semaphore<'k, P>,
    thread: ThreadIdx,
}

impl<'k, P: Port> Condvar<'k, P> {
    pub const fn new(kernel: &'k Kernel<P>) -> Self {
        Self {
            kernel,
            waiters: CpuLockCell::new(Vec::new()),
        }
    }

    /// Atomically release `lock` and wait for a signal, then reacquire `lock`
    /// before returning.
    ///
    /// Panics if the current thread doesn't hold `lock` or if called from an
    /// interrupt context.
    pub fn wait(&self, lock: &Lock<'k, P>) {
        self.kernel.expect_thread_context("Condvar::wait");
        assert!(
            lock.held_by_current_thread(),
            "`Condvar::wait` requires the lock to be held"
        );

        let waiter = {
            let mut cpu_lock = self.kernel.lock_cpu();
            let st = self.kernel.state.read(&*cpu_lock);
            let running = st.running;
            let priority = st.thread(running).effective_priority;

            // Go after every waiter of an equal or higher priority
            let waiters = self.waiters.read(&*cpu_lock);
            let pos = waiters
                .iter()
                .position(|w| st.thread(w.thread).effective_priority < priority)
                .unwrap_or(waiters.len());

            let waiter = Arc::new(Waiter {
                sema: Semaphore::new(self.kernel, 0),
                thread: running,
            });
            self.waiters
                .write(&mut *cpu_lock)
                .insert(pos, Arc::clone(&waiter));
            waiter
        };

        lock.release();
        waiter.sema.down();
        lock.acquire();
    }

    /// Wake up one waiter, if any.
    ///
    /// Panics if the current thread doesn't hold `lock`.
    pub fn signal(&self, lock: &Lock<'k, P>) {
        self.expect_lock_held(lock);

        let mut cpu_lock = self.kernel.lock_cpu();
        if self.signal_locked(cpu_lock.borrow_mut()) {
            unlock_cpu_and_check_preemption(self.kernel, cpu_lock);
        }
    }

    /// Wake up all waiters.
    ///
    /// Panics if the current thread doesn't hold `lock`.
    pub fn broadcast(&self, lock: &Lock<'k, P>) {
        self.expect_lock_held(lock);

        let mut cpu_lock = self.kernel.lock_cpu();
        let mut woken = false;
        while self.signal_locked(cpu_lock.borrow_mut()) {
            woken = true;
        }

        if woken {
            unlock_cpu_and_check_preemption(self.kernel, cpu_lock);
        }
    }

    /// Get the number of threads waiting for a signal.
    pub fn waiter_count(&self) -> usize {
        let cpu_lock = self.kernel.lock_cpu();
        self.waiters.read(&*cpu_lock).len()
    }

    #[track_caller]
    fn expect_lock_held(&self, lock: &Lock<'k, P>) {
        assert!(
            lock.held_by_current_thread(),
            "signaling a condition variable requires the lock to be held"
        );
    }

    /// Wake up the highest-priority waiter. Returns `false` if there was none.
    fn signal_locked(&self, mut cpu_lock: CpuLockTokenRefMut<'_, P>) -> bool {
        let chosen = {
            let st = self.kernel.state.read(&*cpu_lock);
            let mut best: Option<(usize, crate::Priority)> = None;
            for (i, waiter) in self.waiters.read(&*cpu_lock).iter().enumerate() {
                let priority = st.thread(waiter.thread).effective_priority;
                if best.map_or(true, |(_, best_priority)| priority > best_priority) {
                    best = Some((i, priority));
                }
            }
            best
        };

        let Some((pos, _)) = chosen else {
            return false;
        };

        let waiter = self.waiters.write(&mut *cpu_lock).remove(pos);
        waiter.sema.up_locked(cpu_lock);
        true
    }
}

impl<P: Port> fmt::Debug for Condvar<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match klock::lock_cpu(self.kernel.port()) {
            Ok(cpu_lock) => f
                .debug_struct("Condvar")
                .field("waiters", &self.waiters.read(&*cpu_lock).len())
                .finish(),
            Err(_) => f.write_str("Condvar { < locked > }"),
        }
    }
}
