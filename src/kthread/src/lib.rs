//! A single-CPU thread scheduler and synchronization layer for small kernels.
//!
//! The kernel decides which thread runs next on one CPU, blocks and wakes
//! threads, and provides [semaphores](Semaphore), [locks](Lock) with priority
//! donation, [condition variables](Condvar), and a tick-based sleep queue.
//!
//! # Ports
//!
//! Everything that depends on the hardware (or the host) is reached through a
//! [`Port`]: the CPU Lock (interrupt masking), the context switch, the page
//! allocator, and the timer. `kthread_port_std` is a port that runs the kernel
//! on a hosted environment.
//!
//! # Contexts
//!
//! Code runs either in a *thread context* or an *interrupt context*. Blocking
//! operations ([`Semaphore::down`], [`Lock::acquire`], [`Condvar::wait`],
//! [`Kernel::sleep`]) are only allowed in a thread context. Calling them from
//! an interrupt context is a precondition violation and panics.
//!
//! # Critical sections
//!
//! All scheduler state lives in cells that can only be opened by the token
//! carried by a CPU Lock guard. Every operation that mutates the ready queue,
//! the sleep queue, a wait set, or a priority field does so with CPU Lock
//! held, which makes it atomic with respect to timer interrupts.
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
extern crate alloc;

use alloc::{boxed::Box, sync::Arc};

pub mod cfg;
mod condvar;
mod donation;
mod error;
mod klock;
mod lock;
mod semaphore;
mod sleep;
mod state;
mod thread;
mod utils;
mod wait;

pub use self::{
    cfg::{Priority, Tick, MAX_DONATION_DEPTH, PRI_DEFAULT, PRI_MAX, PRI_MIN, TIME_SLICE},
    condvar::Condvar,
    error::{BadContextError, CreateThreadError},
    lock::Lock,
    semaphore::Semaphore,
    state::TickStats,
    thread::{ThreadAttr, ThreadFlags, ThreadInfo, ThreadName, ThreadSt, Tid},
};

/// The entry point handed to [`PortThreading::initialize_thread_state`].
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Implemented by a port. Provides CPU Lock and the context switch.
///
/// # Safety
///
/// The methods marked `unsafe` are only meant to be called by the kernel.
/// Implementations must uphold the documented contracts; the kernel's memory
/// safety depends on there being at most one thread executing kernel code at
/// any point.
pub unsafe trait PortThreading: Send + Sync + Sized + 'static {
    /// The save area of a thread. The kernel keeps one per thread and passes
    /// it back to [`switch_context`](Self::switch_context).
    type ThreadState: Send + Sync + 'static;

    /// Create a save area. For the initial thread this represents the
    /// execution context that called [`Kernel::init`]. That is always the
    /// first save area created, and it's created on that execution context.
    fn new_thread_state(&self) -> Self::ThreadState;

    /// Arrange for `entry` to be called when the thread owning `state` is
    /// switched to for the first time.
    ///
    /// The entry point starts with CPU Lock active because it is entered from
    /// inside [`switch_context`](Self::switch_context).
    ///
    /// # Safety
    ///
    /// CPU Lock active. `state` hasn't been initialized before.
    unsafe fn initialize_thread_state(&self, state: &Arc<Self::ThreadState>, entry: ThreadEntry);

    /// Save the current context to `from` and resume `to`. Returns when some
    /// thread switches back to `from`, still with CPU Lock active.
    ///
    /// # Safety
    ///
    /// CPU Lock active. `from` must be the save area of the calling thread and
    /// `to` must be a different one. Never reentered.
    unsafe fn switch_context(&self, from: &Arc<Self::ThreadState>, to: &Arc<Self::ThreadState>);

    /// Discard the current context and resume `to`.
    ///
    /// # Safety
    ///
    /// CPU Lock active. The calling thread must never be resumed again.
    unsafe fn exit_and_switch(&self, to: &Arc<Self::ThreadState>) -> !;

    /// Activate CPU Lock. Returns `true` iff CPU Lock was inactive before the
    /// call.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the kernel.
    unsafe fn try_enter_cpu_lock(&self) -> bool;

    /// Deactivate CPU Lock.
    ///
    /// # Safety
    ///
    /// CPU Lock active, and it's the kernel that activated it.
    unsafe fn leave_cpu_lock(&self);

    fn is_cpu_lock_active(&self) -> bool;

    /// Return `true` while an interrupt handler is executing.
    fn is_interrupt_context(&self) -> bool;
}

/// Implemented by a port. Provides the memory that backs thread control
/// blocks and stacks.
///
/// # Safety
///
/// See [`PortThreading`].
pub unsafe trait PortMemory: PortThreading {
    /// A zeroed, fixed-size block suitable as a thread control block and
    /// stack.
    type Page: Send + Sync + 'static;

    /// Allocate a page. Returns `None` when memory is exhausted.
    fn alloc_page(&self) -> Option<Self::Page>;

    /// Return a page obtained from [`alloc_page`](Self::alloc_page).
    ///
    /// # Safety
    ///
    /// No code may be executing on the stack contained in `page`.
    unsafe fn free_page(&self, page: Self::Page);
}

/// Implemented by a port. Provides the timer.
pub trait PortTimer: PortThreading {
    /// Get the number of timer ticks since boot.
    fn current_tick(&self) -> Tick;

    /// Halt until the next interrupt arrives and let it run. Called by the
    /// idle thread with CPU Lock inactive.
    ///
    /// The port's timer interrupt handler is expected to call
    /// [`Kernel::thread_tick`], [`Kernel::awake`] (when
    /// [`Kernel::next_wake_tick`] is due), and, after leaving the interrupt
    /// context, [`Kernel::return_from_interrupt`].
    fn wait_for_interrupt(kernel: &'static Kernel<Self>)
    where
        Self: Port;
}

/// The complete set of capabilities the kernel requires from a port.
pub trait Port: PortThreading + PortMemory + PortTimer {}

impl<T: PortThreading + PortMemory + PortTimer> Port for T {}

/// A kernel instance.
///
/// Created by [`Kernel::init`] and never destroyed. All operations are methods
/// of this type or of the synchronization objects bound to it.
pub struct Kernel<P: Port> {
    port: P,
    pub(crate) state: klock::CpuLockCell<P, state::SchedulerState<P>>,
}

impl<P: Port> Kernel<P> {
    /// Adopt the calling execution context as the initial thread, named
    /// `"main"`, and return the kernel.
    ///
    /// Scheduling isn't fully operational until [`start`](Self::start) creates
    /// the idle thread.
    pub fn init(port: P) -> &'static Self {
        let initial_thread_state = Arc::new(port.new_thread_state());
        let state = state::SchedulerState::new(initial_thread_state);

        log::debug!("kernel initialized; the initial thread is {:?}", Tid::INITIAL);

        Box::leak(Box::new(Self {
            port,
            state: klock::CpuLockCell::new(state),
        }))
    }

    /// Create the idle thread and wait until it has started.
    ///
    /// Panics if the idle thread cannot be allocated.
    pub fn start(&'static self) {
        let idle_started = Arc::new(Semaphore::new(self, 0));
        let started = Arc::clone(&idle_started);

        let attr = ThreadAttr::new("idle").with_priority(PRI_MIN);
        if let Err(e) = self.thread_create_with(&attr, move || thread::idle_main(self, started)) {
            panic!("failed to create the idle thread: {e}");
        }

        idle_started.down();
        log::debug!("kernel started");
    }

    /// Get the port this kernel runs on.
    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Acquire CPU Lock on behalf of a public operation. Nested acquisition
    /// is a precondition violation.
    pub(crate) fn lock_cpu(&self) -> klock::CpuLockGuard<'_, P> {
        match klock::lock_cpu(&self.port) {
            Ok(lock) => lock,
            Err(BadContextError::BadContext) => panic!("CPU Lock is already active"),
        }
    }

    /// Panic if the current context is an interrupt context.
    #[track_caller]
    pub(crate) fn expect_thread_context(&self, operation: &str) {
        assert!(
            !self.port.is_interrupt_context(),
            "`{operation}` may not be called from an interrupt context"
        );
    }
}
