//! Semaphores
use core::fmt;

use crate::{
    klock::{CpuLockCell, CpuLockToken, CpuLockTokenRefMut},
    thread::{block_current, make_ready, unlock_cpu_and_check_preemption},
    wait::WaitSet,
    Kernel, Port,
};

/// A counting semaphore: a nonnegative value with two atomic operations.
///
///  - [`down`](Self::down) waits for the value to become positive, then
///    decrements it.
///  - [`up`](Self::up) increments the value and wakes up the highest-priority
///    waiter, if any.
///
/// The waiter is chosen by the effective priority it has at the time of the
/// wake-up, so a priority raised by donation while waiting is honored.
pub struct Semaphore<'k, P: Port> {
    kernel: &'k Kernel<P>,
    value: CpuLockCell<P, usize>,
    waiters: CpuLockCell<P, WaitSet>,
}

impl<'k, P: Port> Semaphore<'k, P> {
    /// Construct a semaphore with the initial value `value`.
    pub const fn new(kernel: &'k Kernel<P>, value: usize) -> Self {
        Self {
            kernel,
            value: CpuLockCell::new(value),
            waiters: CpuLockCell::new(WaitSet::new()),
        }
    }

    /// Wait for the value to become positive, then decrement it.
    ///
    /// May block, so it panics in an interrupt context.
    pub fn down(&self) {
        self.kernel.expect_thread_context("Semaphore::down");
        let mut lock = self.kernel.lock_cpu();
        self.down_locked(lock.borrow_mut());
    }

    /// Decrement the value if it's positive. Returns `true` on success.
    ///
    /// Never blocks, so it's usable from an interrupt handler.
    pub fn try_down(&self) -> bool {
        let mut lock = self.kernel.lock_cpu();
        self.try_down_locked(lock.borrow_mut())
    }

    /// Increment the value and wake up the highest-priority waiter. The caller
    /// yields if the woken thread outranks it (or, in an interrupt context,
    /// on interrupt return).
    pub fn up(&self) {
        let mut lock = self.kernel.lock_cpu();
        self.up_locked(lock.borrow_mut());
        unlock_cpu_and_check_preemption(self.kernel, lock);
    }

    /// Get the current value.
    pub fn value(&self) -> usize {
        let lock = self.kernel.lock_cpu();
        *self.value.read(&*lock)
    }

    pub(crate) fn kernel(&self) -> &'k Kernel<P> {
        self.kernel
    }

    pub(crate) fn down_locked(&self, mut lock: CpuLockTokenRefMut<'_, P>) {
        while !self.try_down_locked(lock.borrow_mut()) {
            self.wait_locked(lock.borrow_mut());
        }
    }

    pub(crate) fn try_down_locked(&self, mut lock: CpuLockTokenRefMut<'_, P>) -> bool {
        let value = self.value.write(&mut *lock);
        if *value > 0 {
            *value -= 1;
            true
        } else {
            false
        }
    }

    /// Add the running thread to the waiters and block it. Returns after
    /// [`up_locked`](Self::up_locked) has woken it up. The value might have
    /// been taken by someone else by then.
    pub(crate) fn wait_locked(&self, mut lock: CpuLockTokenRefMut<'_, P>) {
        let running = self.kernel.state.read(&*lock).running;
        self.waiters.write(&mut *lock).push(running);
        block_current(self.kernel, lock);
    }

    /// Wake up the highest-priority waiter and increment the value. Doesn't
    /// check for preemption.
    pub(crate) fn up_locked(&self, mut lock: CpuLockTokenRefMut<'_, P>) {
        let woken = {
            let st = self.kernel.state.read(&*lock);
            self.waiters
                .read(&*lock)
                .highest_priority_position(|thread| st.thread(thread).effective_priority)
        };

        if let Some(pos) = woken {
            let thread = self.waiters.write(&mut *lock).remove(pos);
            make_ready(self.kernel.state.write(&mut *lock), thread);
        }

        *self.value.write(&mut *lock) += 1;
    }

    pub(crate) fn waiters<'a>(&'a self, lock: &'a CpuLockToken<P>) -> &'a WaitSet {
        self.waiters.read(lock)
    }
}

impl<P: Port> fmt::Debug for Semaphore<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Don't try to take CPU Lock if it's already active
        match crate::klock::lock_cpu(self.kernel.port()) {
            Ok(lock) => f
                .debug_struct("Semaphore")
                .field("value", self.value.read(&*lock))
                .field("waiters", &self.waiters.read(&*lock).len())
                .finish(),
            Err(_) => f.write_str("Semaphore { < locked > }"),
        }
    }
}
