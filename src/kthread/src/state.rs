//! The scheduler state
use alloc::{sync::Arc, vec::Vec};
use core::num::NonZeroU32;
use slab::Slab;

use crate::{
    cfg::{Priority, PRI_DEFAULT},
    lock::{LockCb, LockKey},
    sleep::SleepQueue,
    thread::{readyqueue::ReadyQueue, ThreadAttr, ThreadCb, ThreadIdx, ThreadSt, Tid},
    Port,
};

/// Timer tick totals, by the kind of thread that was running.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Ticks spent in the idle thread.
    pub idle: u64,
    /// Ticks spent in kernel threads.
    pub kernel: u64,
    /// Ticks spent in threads with [`ThreadFlags::USER`](crate::ThreadFlags::USER).
    pub user: u64,
}

/// Everything the scheduler owns. Only reachable through
/// [`Kernel::state`](crate::Kernel), i.e., with CPU Lock held.
pub(crate) struct SchedulerState<P: Port> {
    /// Thread control blocks of all live threads, including the ones waiting
    /// for reclamation.
    pub(crate) threads: Slab<ThreadCb<P>>,

    pub(crate) ready_queue: ReadyQueue,

    pub(crate) sleep_queue: SleepQueue,

    /// The owner of every lock, for the donation walk.
    pub(crate) locks: Slab<LockCb>,

    /// The thread in the Running state.
    pub(crate) running: ThreadIdx,

    /// The idle thread. Set by the idle thread itself when it starts.
    pub(crate) idle: Option<ThreadIdx>,

    /// Dying threads whose pages are released at the start of the next
    /// `schedule`.
    pub(crate) destruction_req: Vec<ThreadIdx>,

    next_tid: NonZeroU32,

    /// The number of ticks since the running thread was scheduled.
    pub(crate) thread_ticks: u32,

    /// Set when an interrupt handler wants the interrupted thread to yield
    /// once the handler returns.
    pub(crate) yield_on_return: bool,

    pub(crate) stats: TickStats,
}

impl<P: Port> SchedulerState<P> {
    /// Construct the state with the calling context registered as the running
    /// initial thread.
    pub(crate) fn new(initial_thread_state: Arc<P::ThreadState>) -> Self {
        let mut this = Self {
            threads: Slab::new(),
            ready_queue: ReadyQueue::new(),
            sleep_queue: SleepQueue::new(),
            locks: Slab::new(),
            running: ThreadIdx(0),
            idle: None,
            destruction_req: Vec::new(),
            next_tid: Tid::INITIAL.0,
            thread_ticks: 0,
            yield_on_return: false,
            stats: TickStats::default(),
        };

        let tid = this.allocate_tid();
        debug_assert_eq!(tid, Tid::INITIAL);

        let attr = ThreadAttr::new("main").with_priority(PRI_DEFAULT);
        let mut initial = ThreadCb::new(tid, &attr, initial_thread_state, None);
        initial.st = ThreadSt::Running;
        this.running = ThreadIdx(this.threads.insert(initial));

        this
    }

    pub(crate) fn allocate_tid(&mut self) -> Tid {
        let tid = Tid(self.next_tid);
        self.next_tid = self
            .next_tid
            .checked_add(1)
            .unwrap_or_else(|| panic!("thread identifiers exhausted"));
        tid
    }

    #[inline]
    pub(crate) fn thread(&self, thread: ThreadIdx) -> &ThreadCb<P> {
        &self.threads[thread.0]
    }

    #[inline]
    pub(crate) fn thread_mut(&mut self, thread: ThreadIdx) -> &mut ThreadCb<P> {
        &mut self.threads[thread.0]
    }

    #[inline]
    pub(crate) fn running_thread(&self) -> &ThreadCb<P> {
        self.thread(self.running)
    }

    #[inline]
    pub(crate) fn lock_cb(&self, lock: LockKey) -> &LockCb {
        &self.locks[lock.0]
    }

    #[inline]
    pub(crate) fn lock_cb_mut(&mut self, lock: LockKey) -> &mut LockCb {
        &mut self.locks[lock.0]
    }

    /// Find a live thread by its identifier.
    pub(crate) fn find(&self, tid: Tid) -> Option<ThreadIdx> {
        self.threads
            .iter()
            .find(|(_, cb)| cb.tid == tid)
            .map(|(i, _)| ThreadIdx(i))
    }

    /// Assign a new effective priority. A thread in the ready queue is moved to
    /// the back of its new level.
    pub(crate) fn set_effective_priority(&mut self, thread: ThreadIdx, priority: Priority) {
        let is_idle = self.idle == Some(thread);
        let cb = self.thread_mut(thread);
        let old_priority = core::mem::replace(&mut cb.effective_priority, priority);

        if old_priority == priority {
            return;
        }

        log::trace!(
            "{:?}: effective priority {old_priority} -> {priority}",
            cb.tid
        );

        // The idle thread can be Ready without being in the ready queue
        if cb.st == ThreadSt::Ready && !is_idle {
            self.ready_queue.reorder(thread, old_priority, priority);
        }
    }

    /// Choose the thread to run next: the front of the ready queue, or the
    /// idle thread if the queue is empty.
    pub(crate) fn next_thread_to_run(&mut self) -> ThreadIdx {
        match (self.ready_queue.pop_front(), self.idle) {
            (Some(thread), _) => thread,
            (None, Some(idle)) => idle,
            (None, None) => panic!("no thread to run and the idle thread hasn't started"),
        }
    }
}
