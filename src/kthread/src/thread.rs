//! Threads
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use arrayvec::ArrayString;
use core::{fmt, mem::ManuallyDrop, num::NonZeroU32};

use crate::{
    cfg::{self, Priority, PRI_DEFAULT, THREAD_NAME_LEN, TIME_SLICE},
    donation,
    error::CreateThreadError,
    klock::{CpuLockGuard, CpuLockTokenRefMut},
    state::{SchedulerState, TickStats},
    Kernel, Port, Semaphore,
};

pub(crate) mod readyqueue;

/// The index of a thread control block in the thread arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ThreadIdx(pub(crate) usize);

/// A thread identifier. Identifiers are allocated in increasing order,
/// starting at 1, and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub(crate) NonZeroU32);

impl Tid {
    /// The identifier of the initial thread.
    pub const INITIAL: Self = Self(NonZeroU32::MIN);

    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Tid({})", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A thread's display name.
pub type ThreadName = ArrayString<THREAD_NAME_LEN>;

/// Thread state machine
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                  create
///                     |
///                     v
///                .---------.   unblock    .-------.
///                | Blocked |------------->| Ready |
///                '---------'              '-------'
///                     ^              schedule | ^
///                     |                       | |
///               block |                       v | yield, preempt
///                     |                  .---------.
///                     '------------------| Running |
///                                        '---------'
///                                             |
///                                             | exit
///                                             v
///                                         .-------.
///                                         | Dying |
///                                         '-------'
/// ```
)]
///
/// </center>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadSt {
    /// The thread is executing on the CPU. Exactly one thread is in this
    /// state.
    Running,

    /// The thread is in the ready queue, or is the idle thread waiting to be
    /// chosen.
    Ready,

    /// The thread is waiting for an event: a semaphore, a lock, the sleep
    /// queue, or an explicit [`Kernel::thread_unblock`].
    Blocked,

    /// The thread has exited. Its page is released after the next context
    /// switch.
    Dying,
}

bitflags::bitflags! {
    /// Properties of a thread.
    pub struct ThreadFlags: u8 {
        /// The thread runs a user address space. Its ticks are accounted to
        /// [`TickStats::user`].
        const USER = 1 << 0;
    }
}

/// The creation parameters of a thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr<'a> {
    /// The display name. Truncated to [`THREAD_NAME_LEN`] bytes.
    pub name: &'a str,
    pub priority: Priority,
    pub flags: ThreadFlags,
}

impl<'a> ThreadAttr<'a> {
    pub const fn new(name: &'a str) -> Self {
        Self {
            name,
            priority: PRI_DEFAULT,
            flags: ThreadFlags::empty(),
        }
    }

    pub const fn with_priority(self, priority: Priority) -> Self {
        Self { priority, ..self }
    }

    pub const fn with_flags(self, flags: ThreadFlags) -> Self {
        Self { flags, ..self }
    }
}

/// A snapshot of a thread's scheduling state, as returned by
/// [`Kernel::thread_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub name: ThreadName,
    pub st: ThreadSt,
    pub base_priority: Priority,
    /// The priority used for scheduling. Never lower than `base_priority`.
    pub effective_priority: Priority,
    pub flags: ThreadFlags,
}

/// *Thread control block* - the state data of a thread.
pub(crate) struct ThreadCb<P: Port> {
    /// The save area used by the port's context switch.
    pub(crate) port_thread_state: Arc<P::ThreadState>,

    pub(crate) tid: Tid,

    pub(crate) name: ThreadName,

    pub(crate) st: ThreadSt,

    pub(crate) flags: ThreadFlags,

    /// The priority last set by the owner or given at creation.
    pub(crate) base_priority: Priority,

    /// The thread's effective priority. It's calculated based on
    /// `base_priority` and may be temporarily elevated by donors:
    ///
    /// ```rust,ignore
    /// thread.base_priority.max(donors.map(|d| d.effective_priority).max())
    /// ```
    ///
    /// The effective priority determines the thread's position within the
    /// ready queue. Use [`SchedulerState::set_effective_priority`] to update
    /// it so that a Ready thread is moved accordingly.
    pub(crate) effective_priority: Priority,

    /// The lock this thread is blocked trying to acquire.
    pub(crate) waiting_on: Option<crate::lock::LockKey>,

    /// Threads blocked on a lock held by this thread.
    pub(crate) donors: Vec<ThreadIdx>,

    /// `None` for the initial thread, which runs on memory the kernel didn't
    /// allocate.
    pub(crate) page: Option<P::Page>,
}

impl<P: Port> ThreadCb<P> {
    pub(crate) fn new(
        tid: Tid,
        attr: &ThreadAttr<'_>,
        port_thread_state: Arc<P::ThreadState>,
        page: Option<P::Page>,
    ) -> Self {
        Self {
            port_thread_state,
            tid,
            name: truncate_name(attr.name),
            st: ThreadSt::Blocked,
            flags: attr.flags,
            base_priority: attr.priority,
            effective_priority: attr.priority,
            waiting_on: None,
            donors: Vec::new(),
            page,
        }
    }

    pub(crate) fn info(&self) -> ThreadInfo {
        ThreadInfo {
            tid: self.tid,
            name: self.name,
            st: self.st,
            base_priority: self.base_priority,
            effective_priority: self.effective_priority,
            flags: self.flags,
        }
    }
}

impl<P: Port> fmt::Debug for ThreadCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("waiting_on", &self.waiting_on)
            .field("donors", &self.donors)
            .finish()
    }
}

/// Copy as much of `name` as fits in a [`ThreadName`] without splitting a
/// character.
fn truncate_name(name: &str) -> ThreadName {
    let mut out = ThreadName::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

/// These associate functions implement the thread operations available to
/// thread bodies and to the timer interrupt handler.
impl<P: Port> Kernel<P> {
    /// Create a thread with the default flags and start it.
    ///
    /// The new thread preempts the caller if its priority is higher.
    pub fn thread_create(
        &'static self,
        name: &str,
        priority: Priority,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<Tid, CreateThreadError> {
        self.thread_create_with(&ThreadAttr::new(name).with_priority(priority), f)
    }

    /// Create a thread and start it.
    ///
    /// Returns [`CreateThreadError::OutOfMemory`] if the port can't supply a
    /// page. Panics if `attr.priority` is out of range.
    pub fn thread_create_with(
        &'static self,
        attr: &ThreadAttr<'_>,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<Tid, CreateThreadError> {
        assert!(
            cfg::is_valid_priority(attr.priority),
            "priority {} is out of range",
            attr.priority
        );

        let page = self
            .port()
            .alloc_page()
            .ok_or(CreateThreadError::OutOfMemory)?;
        let port_thread_state = Arc::new(self.port().new_thread_state());

        let mut lock = self.lock_cpu();

        let st = self.state.write(&mut *lock);
        let tid = st.allocate_tid();
        let cb = ThreadCb::new(tid, attr, Arc::clone(&port_thread_state), Some(page));
        let thread = ThreadIdx(st.threads.insert(cb));

        // Safety: CPU Lock active, the state is fresh
        unsafe {
            self.port().initialize_thread_state(
                &port_thread_state,
                Box::new(move || {
                    thread_entry(self, f);
                }),
            )
        };

        log::debug!(
            "{tid:?} ({:?}) created with priority {}",
            attr.name,
            attr.priority
        );

        make_ready(self.state.write(&mut *lock), thread);

        // If the new thread has a higher priority, switch to it
        unlock_cpu_and_check_preemption(self, lock);

        Ok(tid)
    }

    /// Put the current thread to sleep until [`thread_unblock`] is called on
    /// it.
    ///
    /// [`thread_unblock`]: Self::thread_unblock
    pub fn thread_block(&self) {
        self.expect_thread_context("thread_block");
        let mut lock = self.lock_cpu();
        block_current(self, lock.borrow_mut());
    }

    /// Transition a Blocked thread to Ready. Doesn't preempt the caller.
    ///
    /// Panics if the thread doesn't exist or isn't Blocked.
    pub fn thread_unblock(&self, tid: Tid) {
        let mut lock = self.lock_cpu();
        let st = self.state.write(&mut *lock);
        let Some(thread) = st.find(tid) else {
            panic!("{tid:?} does not exist");
        };
        make_ready(st, thread);
    }

    /// Yield the CPU. The current thread goes to the back of its priority
    /// level in the ready queue.
    pub fn thread_yield(&self) {
        self.expect_thread_context("thread_yield");
        let mut lock = self.lock_cpu();
        yield_current(self, lock.borrow_mut());
    }

    /// Terminate the current thread. Its page is released by the next
    /// `schedule`.
    ///
    /// Panics if the current thread is the idle thread or holds a lock.
    pub fn thread_exit(&self) -> ! {
        self.expect_thread_context("thread_exit");

        // The guard must not be dropped. The next thread inherits CPU Lock.
        let mut guard = ManuallyDrop::new(self.lock_cpu());
        let lock = guard.borrow_mut();

        let st = self.state.read(&*lock);
        let running = st.running;
        let cb = st.thread(running);
        assert!(st.idle != Some(running), "the idle thread may not exit");
        assert!(
            !st.locks.iter().any(|(_, lock_cb)| lock_cb.owner == Some(running)),
            "{:?} exited while holding a lock",
            cb.tid
        );
        log::debug!("{:?} ({}) exiting", cb.tid, cb.name);

        do_schedule(self, lock, ThreadSt::Dying);

        unreachable!("a dying thread was resumed");
    }

    /// Set the current thread's base priority. The effective priority is
    /// recomputed from the current donors, and the thread yields if it's no
    /// longer the highest-priority thread.
    pub fn thread_set_priority(&self, priority: Priority) {
        self.expect_thread_context("thread_set_priority");
        assert!(
            cfg::is_valid_priority(priority),
            "priority {priority} is out of range"
        );

        let mut lock = self.lock_cpu();
        let st = self.state.write(&mut *lock);
        let running = st.running;
        st.thread_mut(running).base_priority = priority;
        donation::refresh_priority(st, running);

        unlock_cpu_and_check_preemption(self, lock);
    }

    /// Get the current thread's effective priority.
    pub fn thread_get_priority(&self) -> Priority {
        let lock = self.lock_cpu();
        self.state.read(&*lock).running_thread().effective_priority
    }

    /// Get the identifier of the running thread.
    pub fn current_tid(&self) -> Tid {
        let lock = self.lock_cpu();
        self.state.read(&*lock).running_thread().tid
    }

    /// Get the name of the running thread.
    pub fn current_name(&self) -> ThreadName {
        let lock = self.lock_cpu();
        self.state.read(&*lock).running_thread().name
    }

    /// Get a snapshot of a live thread. Returns `None` once the thread has
    /// been reclaimed.
    pub fn thread_info(&self, tid: Tid) -> Option<ThreadInfo> {
        let lock = self.lock_cpu();
        let st = self.state.read(&*lock);
        st.find(tid).map(|thread| st.thread(thread).info())
    }

    /// Get snapshots of all live threads in creation order.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        let lock = self.lock_cpu();
        let mut infos: Vec<_> = self
            .state
            .read(&*lock)
            .threads
            .iter()
            .map(|(_, cb)| cb.info())
            .collect();
        infos.sort_by_key(|info| info.tid);
        infos
    }

    /// Account a timer tick to the running thread. Requests a yield on
    /// interrupt return once the thread has used up its time slice.
    ///
    /// Must be called from an interrupt context.
    pub fn thread_tick(&self) {
        assert!(
            self.port().is_interrupt_context(),
            "`thread_tick` must be called from an interrupt context"
        );

        let mut lock = self.lock_cpu();
        let st = self.state.write(&mut *lock);
        let running = st.running;

        if st.idle == Some(running) {
            st.stats.idle += 1;
        } else if st.thread(running).flags.contains(ThreadFlags::USER) {
            st.stats.user += 1;
        } else {
            st.stats.kernel += 1;
        }

        st.thread_ticks += 1;
        if st.thread_ticks >= TIME_SLICE {
            st.yield_on_return = true;
        }
    }

    /// Perform the yield requested by an interrupt handler, if any. The port
    /// calls this after leaving an interrupt context.
    pub fn return_from_interrupt(&self) {
        self.expect_thread_context("return_from_interrupt");

        let mut lock = self.lock_cpu();
        if core::mem::take(&mut self.state.write(&mut *lock).yield_on_return) {
            log::trace!("yielding on interrupt return");
            yield_current(self, lock.borrow_mut());
        }
    }

    /// Get the tick statistics.
    pub fn stats(&self) -> TickStats {
        let lock = self.lock_cpu();
        self.state.read(&*lock).stats
    }

    /// Log the tick statistics.
    pub fn print_stats(&self) {
        let TickStats { idle, kernel, user } = self.stats();
        log::info!("Thread: {idle} idle ticks, {kernel} kernel ticks, {user} user ticks");
    }
}

/// The first function executed by a thread created by
/// [`Kernel::thread_create_with`].
fn thread_entry<P: Port>(kernel: &'static Kernel<P>, f: impl FnOnce()) -> ! {
    // Safety: We were entered from `switch_context`, so CPU Lock is active.
    // The guard that activated it belongs to the thread that switched to us,
    // which can't use it until it's switched back in, at which point CPU Lock
    // is active again.
    unsafe { kernel.port().leave_cpu_lock() };

    log::debug!("{:?} is now running", kernel.current_tid());

    f();

    kernel.thread_exit()
}

/// The body of the idle thread. Runs when no other thread is ready.
///
/// It's initially put on the ready queue by [`Kernel::start`]. It runs once to
/// register itself and signal `started`; after that it never appears in the
/// ready queue and is only chosen as a special case by `next_thread_to_run`.
pub(crate) fn idle_main<P: Port>(kernel: &'static Kernel<P>, started: Arc<Semaphore<'static, P>>) {
    {
        let mut lock = kernel.lock_cpu();
        let st = kernel.state.write(&mut *lock);
        st.idle = Some(st.running);
    }

    started.up();
    drop(started);

    loop {
        // Let someone else run
        {
            let mut lock = kernel.lock_cpu();
            block_current(kernel, lock.borrow_mut());
        }

        // Re-enable interrupts and wait for the next one
        P::wait_for_interrupt(kernel);
    }
}

/// Transition a Blocked thread into the Ready state.
pub(crate) fn make_ready<P: Port>(st: &mut SchedulerState<P>, thread: ThreadIdx) {
    let cb = st.thread_mut(thread);
    assert_eq!(cb.st, ThreadSt::Blocked, "{:?} is not blocked", cb.tid);
    cb.st = ThreadSt::Ready;

    let pri = cb.effective_priority;
    log::trace!("{:?} is unblocked at priority {pri}", cb.tid);
    st.ready_queue.push_back(thread, pri);
}

/// Transition the running thread into the Blocked state. Returns when the
/// thread is woken up and scheduled again.
///
/// The caller is responsible for putting the thread somewhere it can be woken
/// up from.
pub(crate) fn block_current<P: Port>(kernel: &Kernel<P>, lock: CpuLockTokenRefMut<'_, P>) {
    log::trace!("{:?} blocks", kernel.state.read(&*lock).running_thread().tid);
    do_schedule(kernel, lock, ThreadSt::Blocked);
}

/// Move the running thread to the back of the ready queue (unless it's the
/// idle thread) and schedule.
pub(crate) fn yield_current<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    let st = kernel.state.write(&mut *lock);
    let running = st.running;

    if st.idle != Some(running) {
        let pri = st.thread(running).effective_priority;
        st.ready_queue.push_back(running, pri);
    }

    do_schedule(kernel, lock, ThreadSt::Ready);
}

/// Relinquish CPU Lock. If there's a Ready thread with a higher priority than
/// the running one, yield first (in a thread context) or request a yield on
/// interrupt return (in an interrupt context).
///
/// Operations that transition a thread into the Ready state or lower the
/// running thread's priority should call this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockGuard<'_, P>,
) {
    let st = kernel.state.write(&mut *lock);
    let running = st.running_thread();
    let has_preempting_thread = running.st == ThreadSt::Running
        && st
            .ready_queue
            .highest_priority()
            .map_or(false, |pri| pri > running.effective_priority);

    if !has_preempting_thread {
        return;
    }

    if kernel.port().is_interrupt_context() {
        st.yield_on_return = true;
    } else {
        yield_current(kernel, lock.borrow_mut());
    }
}

/// Release the pages of dead threads, transition the running thread into
/// `status`, and switch to the next thread.
fn do_schedule<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>, status: ThreadSt) {
    debug_assert!(kernel.port().is_cpu_lock_active());
    let st = kernel.state.write(&mut *lock);
    debug_assert_eq!(st.running_thread().st, ThreadSt::Running);

    for victim in core::mem::take(&mut st.destruction_req) {
        let cb = st.threads.remove(victim.0);
        log::debug!("{:?} ({}) reclaimed", cb.tid, cb.name);
        if let Some(page) = cb.page {
            // Safety: The thread has switched away from this page for good
            unsafe { kernel.port().free_page(page) };
        }
    }

    let running = st.running;
    st.thread_mut(running).st = status;
    schedule(kernel, lock);
}

/// Choose the next thread and switch to it.
///
/// The running thread must already be out of the Running state.
fn schedule<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    let st = kernel.state.write(&mut *lock);
    let curr = st.running;
    let curr_st = st.thread(curr).st;
    debug_assert_ne!(curr_st, ThreadSt::Running);

    let next = st.next_thread_to_run();
    st.thread_mut(next).st = ThreadSt::Running;
    st.running = next;
    st.thread_ticks = 0;

    if curr == next {
        return;
    }

    log::trace!(
        "switching from {:?} to {:?}",
        st.thread(curr).tid,
        st.thread(next).tid
    );

    let to = Arc::clone(&st.thread(next).port_thread_state);

    if curr_st == ThreadSt::Dying {
        // We're still running on the dying thread's stack, so its page can't
        // be released until the next `schedule`
        st.destruction_req.push(curr);

        // Safety: CPU Lock active. A Dying thread is never chosen again.
        unsafe { kernel.port().exit_and_switch(&to) }
    } else {
        let from = Arc::clone(&st.thread(curr).port_thread_state);

        // Safety: CPU Lock active. `from` belongs to the calling thread, and
        // `next != curr`.
        unsafe { kernel.port().switch_context(&from, &to) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_truncation() {
        assert_eq!(truncate_name("main").as_str(), "main");
        assert_eq!(
            truncate_name("a-very-long-thread-name").as_str(),
            "a-very-long-thr"
        );
        // A multi-byte character that would straddle the limit is dropped
        assert_eq!(
            truncate_name("fourteen-bytes\u{e9}").as_str(),
            "fourteen-bytes"
        );
    }

    #[test]
    fn attr_builder() {
        let attr = ThreadAttr::new("worker")
            .with_priority(40)
            .with_flags(ThreadFlags::USER);
        assert_eq!(attr.name, "worker");
        assert_eq!(attr.priority, 40);
        assert!(attr.flags.contains(ThreadFlags::USER));
        assert_eq!(ThreadAttr::new("x").priority, PRI_DEFAULT);
    }

    #[test]
    fn tid_format() {
        assert_eq!(Tid::INITIAL.get(), 1);
        assert_eq!(format!("{:?}", Tid::INITIAL), "Tid(1)");
        assert_eq!(format!("{}", Tid::INITIAL), "1");
    }
}
