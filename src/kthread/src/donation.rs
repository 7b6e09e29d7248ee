//! Priority donation
//!
//! A thread that blocks on a [`Lock`](crate::Lock) records the lock in its
//! `waiting_on` field and joins the holder's `donors`. The holder's effective
//! priority is the maximum of its base priority and its donors' effective
//! priorities. A raise is carried along the chain of holders (a holder may
//! itself be waiting on another lock) for at most [`MAX_DONATION_DEPTH`]
//! links.
//!
//! When a lock is released, the holder drops exactly the donors that were
//! waiting on that lock and recomputes its effective priority from the rest.
use core::mem;

use crate::{
    cfg::MAX_DONATION_DEPTH,
    lock::LockKey,
    state::SchedulerState,
    thread::ThreadIdx,
    Port,
};

/// Register `donor` as blocked on `lock` and donate its priority to the
/// holder, if any.
pub(crate) fn donate<P: Port>(st: &mut SchedulerState<P>, donor: ThreadIdx, lock: LockKey) {
    st.thread_mut(donor).waiting_on = Some(lock);

    let Some(holder) = st.lock_cb(lock).owner else {
        return;
    };
    log::trace!(
        "{:?} donates to {:?} (lock {})",
        st.thread(donor).tid,
        st.thread(holder).tid,
        lock.0
    );

    let donors = &mut st.thread_mut(holder).donors;
    if !donors.contains(&donor) {
        donors.push(donor);
    }

    propagate(st, donor);
}

/// Walk the chain `thread → holder of thread.waiting_on → ...`, raising each
/// holder to the effective priority of its predecessor in the chain.
pub(crate) fn propagate<P: Port>(st: &mut SchedulerState<P>, mut thread: ThreadIdx) {
    for _ in 0..MAX_DONATION_DEPTH {
        let cb = st.thread(thread);
        let Some(lock) = cb.waiting_on else {
            break;
        };
        let Some(holder) = st.lock_cb(lock).owner else {
            break;
        };

        let priority = cb.effective_priority;
        if st.thread(holder).effective_priority < priority {
            log::trace!(
                "raising {:?} to priority {} (lock {})",
                st.thread(holder).tid,
                priority,
                lock.0
            );
            st.set_effective_priority(holder, priority);
        }

        thread = holder;
    }
}

/// Remove the donors of `holder` that are waiting on `lock`.
pub(crate) fn remove_donors_for<P: Port>(
    st: &mut SchedulerState<P>,
    holder: ThreadIdx,
    lock: LockKey,
) {
    let mut donors = mem::take(&mut st.thread_mut(holder).donors);
    donors.retain(|&donor| st.thread(donor).waiting_on != Some(lock));
    st.thread_mut(holder).donors = donors;
}

/// Recompute the effective priority of `thread` from its base priority and
/// its donors.
pub(crate) fn refresh_priority<P: Port>(st: &mut SchedulerState<P>, thread: ThreadIdx) {
    let cb = st.thread(thread);
    let priority = cb
        .donors
        .iter()
        .map(|&donor| st.thread(donor).effective_priority)
        .fold(cb.base_priority, core::cmp::max);

    st.set_effective_priority(thread, priority);
}
