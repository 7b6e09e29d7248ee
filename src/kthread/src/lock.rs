//! Locks
use alloc::vec::Vec;
use core::fmt;

use crate::{
    donation,
    klock::{self, CpuLockTokenRefMut},
    thread::{unlock_cpu_and_check_preemption, ThreadIdx},
    Kernel, Port, Semaphore, Tid,
};

/// Identifies a lock in [`SchedulerState::locks`](crate::state::SchedulerState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LockKey(pub(crate) usize);

/// *Lock control block* - the part of a lock's state that the donation walk
/// needs to reach from a waiting thread.
#[derive(Debug)]
pub(crate) struct LockCb {
    pub(crate) owner: Option<ThreadIdx>,
}

/// A mutual exclusion lock with priority donation.
///
/// A lock is a [`Semaphore`] with an initial value of one plus an owner. Only
/// the owner may release it, and it's not recursive.
///
/// A thread that blocks in [`acquire`](Self::acquire) lends its effective
/// priority to the owner (and transitively to whoever the owner is waiting
/// for) until the owner releases the lock.
pub struct Lock<'k, P: Port> {
    sema: Semaphore<'k, P>,
    key: LockKey,
}

impl<'k, P: Port> Lock<'k, P> {
    /// Construct an unowned lock.
    pub fn new(kernel: &'k Kernel<P>) -> Self {
        let mut lock = kernel.lock_cpu();
        let key = LockKey(
            kernel
                .state
                .write(&mut *lock)
                .locks
                .insert(LockCb { owner: None }),
        );
        Self {
            sema: Semaphore::new(kernel, 1),
            key,
        }
    }

    fn kernel(&self) -> &'k Kernel<P> {
        self.sema.kernel()
    }

    /// Acquire the lock, blocking until it's available.
    ///
    /// Panics if the current thread already holds the lock or if called from
    /// an interrupt context.
    pub fn acquire(&self) {
        let kernel = self.kernel();
        kernel.expect_thread_context("Lock::acquire");

        let mut lock = kernel.lock_cpu();
        self.expect_not_owner(lock.borrow_mut());

        while !self.sema.try_down_locked(lock.borrow_mut()) {
            let st = kernel.state.write(&mut *lock);
            let running = st.running;
            log::trace!("{:?} waits for lock {}", st.thread(running).tid, self.key.0);
            donation::donate(st, running, self.key);

            self.sema.wait_locked(lock.borrow_mut());
        }

        self.take_ownership(lock.borrow_mut());
    }

    /// Acquire the lock if it's available. Returns `true` on success.
    ///
    /// Never blocks. In an interrupt context, the lock goes to the interrupted
    /// thread.
    pub fn try_acquire(&self) -> bool {
        let kernel = self.kernel();

        let mut lock = kernel.lock_cpu();
        self.expect_not_owner(lock.borrow_mut());

        if self.sema.try_down_locked(lock.borrow_mut()) {
            self.take_ownership(lock.borrow_mut());
            true
        } else {
            false
        }
    }

    /// Release the lock. The current thread gives up the priority donated
    /// through this lock and yields if it's no longer the highest-priority
    /// thread.
    ///
    /// Panics if the current thread doesn't hold the lock.
    pub fn release(&self) {
        let kernel = self.kernel();
        kernel.expect_thread_context("Lock::release");

        let mut lock = kernel.lock_cpu();
        let st = kernel.state.write(&mut *lock);
        let running = st.running;
        assert_eq!(
            st.lock_cb(self.key).owner,
            Some(running),
            "{:?} released a lock it doesn't hold",
            st.thread(running).tid
        );

        donation::remove_donors_for(st, running, self.key);
        donation::refresh_priority(st, running);
        st.lock_cb_mut(self.key).owner = None;
        log::trace!("{:?} released lock {}", st.thread(running).tid, self.key.0);

        self.sema.up_locked(lock.borrow_mut());

        unlock_cpu_and_check_preemption(kernel, lock);
    }

    /// Return `true` if the current thread holds the lock.
    pub fn held_by_current_thread(&self) -> bool {
        let kernel = self.kernel();
        let lock = kernel.lock_cpu();
        let st = kernel.state.read(&*lock);
        st.lock_cb(self.key).owner == Some(st.running)
    }

    /// Get the holder of the lock.
    pub fn owner(&self) -> Option<Tid> {
        let kernel = self.kernel();
        let lock = kernel.lock_cpu();
        let st = kernel.state.read(&*lock);
        st.lock_cb(self.key).owner.map(|thread| st.thread(thread).tid)
    }

    #[track_caller]
    fn expect_not_owner(&self, lock: CpuLockTokenRefMut<'_, P>) {
        let st = self.kernel().state.read(&*lock);
        let running = st.running;
        assert!(
            st.lock_cb(self.key).owner != Some(running),
            "{:?} tried to acquire a lock it already holds",
            st.thread(running).tid
        );
    }

    /// Make the running thread the owner. The threads still waiting for the
    /// lock become its donors.
    fn take_ownership(&self, mut lock: CpuLockTokenRefMut<'_, P>) {
        let remaining_waiters: Vec<ThreadIdx> = self.sema.waiters(&*lock).iter().collect();

        let st = self.kernel().state.write(&mut *lock);
        let running = st.running;
        st.lock_cb_mut(self.key).owner = Some(running);
        log::trace!("{:?} acquired lock {}", st.thread(running).tid, self.key.0);

        let cb = st.thread_mut(running);
        cb.waiting_on = None;
        for waiter in remaining_waiters {
            if !cb.donors.contains(&waiter) {
                cb.donors.push(waiter);
            }
        }

        donation::refresh_priority(st, running);
    }
}

impl<P: Port> Drop for Lock<'_, P> {
    fn drop(&mut self) {
        let kernel = self.kernel();
        let Ok(mut lock) = klock::lock_cpu(kernel.port()) else {
            log::warn!("a lock was dropped with CPU Lock active; its entry is leaked");
            return;
        };

        let in_use = !self.sema.waiters(&*lock).is_empty()
            || kernel.state.read(&*lock).lock_cb(self.key).owner.is_some();
        if in_use {
            log::warn!("a lock was dropped while held or waited for; its entry is leaked");
            return;
        }

        kernel.state.write(&mut *lock).locks.remove(self.key.0);
    }
}

impl<P: Port> fmt::Debug for Lock<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kernel = self.kernel();
        match klock::lock_cpu(kernel.port()) {
            Ok(lock) => {
                let st = kernel.state.read(&*lock);
                f.debug_struct("Lock")
                    .field("key", &self.key.0)
                    .field(
                        "owner",
                        &st.lock_cb(self.key).owner.map(|thread| st.thread(thread).tid),
                    )
                    .finish()
            }
            Err(_) => f.write_str("Lock { < locked > }"),
        }
    }
}
