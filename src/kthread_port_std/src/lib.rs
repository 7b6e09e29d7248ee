#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use kthread::{Kernel, PortMemory, PortThreading, PortTimer, ThreadEntry, Tick};
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc, Mutex, PoisonError,
    },
    thread,
    time::Duration,
};

mod baton;

#[cfg(unix)]
#[path = "timer_unix.rs"]
mod timer;
#[cfg(not(unix))]
#[path = "timer_unsupported.rs"]
mod timer;

pub use self::baton::Baton;

/// Used by tests
#[doc(hidden)]
pub extern crate env_logger;

/// The size of a page returned by [`PortMemory::alloc_page`].
pub const PAGE_SIZE: usize = 4096;

/// The kernel type provided by this port.
pub type StdKernel = Kernel<StdPort>;

/// Simulator options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The number of pages that can be allocated at the same time, `None` for
    /// unlimited. Every thread except the initial one uses a page, including
    /// the idle thread.
    pub max_threads: Option<usize>,

    /// Fail the run with a `"deadlock"` panic when the idle thread is
    /// scheduled and no thread is sleeping, i.e., when nothing can ever become
    /// ready again. When disabled, the idle thread keeps advancing the timer.
    pub detect_deadlock: bool,

    /// Deliver a timer interrupt to the running thread at this period, in
    /// real time, from a background timer thread. `None` (the default) leaves
    /// the clock virtual: it advances only through [`timer_interrupt`] and
    /// the idle thread.
    ///
    /// Requires a Unix host.
    pub timer_period: Option<Duration>,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            max_threads: None,
            detect_deadlock: true,
            timer_period: None,
        }
    }

    pub const fn with_max_threads(self, max_threads: usize) -> Self {
        Self {
            max_threads: Some(max_threads),
            ..self
        }
    }

    pub const fn with_detect_deadlock(self, detect_deadlock: bool) -> Self {
        Self {
            detect_deadlock,
            ..self
        }
    }

    pub const fn with_timer_period(self, timer_period: Duration) -> Self {
        Self {
            timer_period: Some(timer_period),
            ..self
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// The outcome of a run, reported by the OS thread that ended it.
enum Event {
    Finished(Box<dyn Any + Send>),
    Aborted(Box<dyn Any + Send>),
}

/// The unwinding payload used to discard the OS thread of an exited kernel
/// thread. Once the unwinding is complete, `next` is granted.
struct ThreadExit {
    next: Arc<ThreadState>,
}

/// The save area of a kernel thread.
#[derive(Debug)]
pub struct ThreadState {
    baton: Baton,
    /// The backing OS thread, `0` until it starts.
    os_thread: AtomicUsize,
    /// Unparks the OS thread after a timer interrupt. Present only when
    /// [`Config::timer_period`] is set.
    resume: Option<timer::ResumeChannel>,
}

/// The CPU flags, shared with the OS threads and the timer.
#[derive(Debug, Default)]
struct Cpu {
    lock: AtomicBool,
    interrupt_context: AtomicBool,
    irq: timer::IrqLine,
}

/// The port.
pub struct StdPort {
    config: Config,
    cpu: Arc<Cpu>,
    initial_thread_adopted: AtomicBool,
    tick: AtomicU64,
    pages_in_use: AtomicUsize,
    events: SpinMutex<mpsc::Sender<Event>>,
}

impl StdPort {
    fn new(config: Config, events: mpsc::Sender<Event>) -> Self {
        Self {
            config,
            cpu: Arc::default(),
            initial_thread_adopted: AtomicBool::new(false),
            tick: AtomicU64::new(0),
            pages_in_use: AtomicUsize::new(0),
            events: SpinMutex::new(events),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the number of pages currently allocated.
    pub fn pages_in_use(&self) -> usize {
        self.pages_in_use.load(Ordering::SeqCst)
    }
}

unsafe impl PortThreading for StdPort {
    type ThreadState = ThreadState;

    fn new_thread_state(&self) -> Self::ThreadState {
        let state = ThreadState {
            baton: Baton::new(),
            os_thread: AtomicUsize::new(0),
            resume: self.config.timer_period.map(|_| timer::ResumeChannel::new()),
        };

        // The first one is the initial thread's, created by `Kernel::init` on
        // the calling OS thread
        if !self.initial_thread_adopted.swap(true, Ordering::SeqCst) {
            timer::adopt_current_thread(&self.cpu, &state);
            timer::set_running(&self.cpu, &state);
        }

        state
    }

    unsafe fn initialize_thread_state(&self, state: &Arc<Self::ThreadState>, entry: ThreadEntry) {
        let state = Arc::clone(state);
        let cpu = Arc::clone(&self.cpu);
        let events = self.events.lock().clone();

        log::trace!("initialize_thread_state({:p})", Arc::as_ptr(&state));

        let spawn_result = thread::Builder::new()
            .name("kthread-worker".into())
            .spawn(move || {
                timer::adopt_current_thread(&cpu, &state);
                state.baton.wait();
                timer::set_running(&cpu, &state);

                run_kernel_thread(entry, &cpu, &events);

                timer::retire_current_thread(&cpu);
            });

        if let Err(e) = spawn_result {
            panic!("failed to spawn an OS thread: {e}");
        }
    }

    unsafe fn switch_context(&self, from: &Arc<Self::ThreadState>, to: &Arc<Self::ThreadState>) {
        log::trace!(
            "switch_context({:p} -> {:p})",
            Arc::as_ptr(from),
            Arc::as_ptr(to)
        );
        debug_assert!(self.is_cpu_lock_active());
        timer::set_running(&self.cpu, to);
        to.baton.grant();
        timer::end_handoff(&self.cpu);
        from.baton.wait();
        debug_assert!(self.is_cpu_lock_active());
    }

    unsafe fn exit_and_switch(&self, to: &Arc<Self::ThreadState>) -> ! {
        log::trace!("exit_and_switch(-> {:p})", Arc::as_ptr(to));
        timer::set_running(&self.cpu, to);
        panic::resume_unwind(Box::new(ThreadExit {
            next: Arc::clone(to),
        }))
    }

    unsafe fn try_enter_cpu_lock(&self) -> bool {
        !self.cpu.lock.swap(true, Ordering::SeqCst)
    }

    unsafe fn leave_cpu_lock(&self) {
        let was_active = self.cpu.lock.swap(false, Ordering::SeqCst);
        debug_assert!(was_active);
    }

    fn is_cpu_lock_active(&self) -> bool {
        self.cpu.lock.load(Ordering::SeqCst)
    }

    fn is_interrupt_context(&self) -> bool {
        self.cpu.interrupt_context.load(Ordering::SeqCst)
    }
}

unsafe impl PortMemory for StdPort {
    type Page = Box<[u8]>;

    fn alloc_page(&self) -> Option<Self::Page> {
        let max_threads = self.config.max_threads.unwrap_or(usize::MAX);
        if self
            .pages_in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max_threads).then_some(n + 1)
            })
            .is_err()
        {
            log::debug!("alloc_page: all {max_threads} pages are in use");
            return None;
        }

        Some(vec![0u8; PAGE_SIZE].into_boxed_slice())
    }

    unsafe fn free_page(&self, page: Self::Page) {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        drop(page);
        self.pages_in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PortTimer for StdPort {
    fn current_tick(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    fn wait_for_interrupt(kernel: &'static StdKernel) {
        let config = &kernel.port().config;
        if config.detect_deadlock && kernel.next_wake_tick().is_none() {
            panic!("deadlock: every thread is blocked and none of them is sleeping");
        }

        match config.timer_period {
            // The timer thread interrupts the sleep
            Some(period) => thread::sleep(period),
            None => timer_interrupt(kernel),
        }
    }
}

/// Run `handler` in an interrupt context, then let the kernel carry out the
/// yield it requested, if any.
///
/// Panics if called from an interrupt context or with CPU Lock active.
pub fn interrupt(kernel: &'static StdKernel, handler: impl FnOnce(&'static StdKernel)) {
    let port = kernel.port();
    assert!(!port.is_interrupt_context(), "interrupts don't nest");
    assert!(
        !port.is_cpu_lock_active(),
        "interrupts are masked while CPU Lock is active"
    );

    port.cpu.interrupt_context.store(true, Ordering::SeqCst);
    handler(kernel);
    port.cpu.interrupt_context.store(false, Ordering::SeqCst);

    kernel.return_from_interrupt();
}

/// The timer interrupt. Advances the tick count by one, accounts the tick to
/// the running thread, and wakes up the threads whose sleep is over.
pub fn timer_interrupt(kernel: &'static StdKernel) {
    interrupt(kernel, |kernel| {
        let now = kernel.port().tick.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("timer_interrupt({now})");

        kernel.thread_tick();

        if kernel.next_wake_tick().map_or(false, |tick| tick <= now) {
            kernel.awake(now);
        }
    });
}

/// Deliver `count` timer interrupts.
pub fn advance_ticks(kernel: &'static StdKernel, count: Tick) {
    for _ in 0..count {
        timer_interrupt(kernel);
    }
}

/// The body of the OS thread backing a kernel thread other than the initial
/// one.
fn run_kernel_thread(entry: ThreadEntry, cpu: &Cpu, events: &mpsc::Sender<Event>) {
    let payload: Box<dyn Any + Send> = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        // `entry` ends with `thread_exit`
        Ok(()) => Box::new("a kernel thread returned without exiting"),
        Err(payload) => payload,
    };

    match payload.downcast::<ThreadExit>() {
        Ok(exit) => {
            // The unwinding is done. Let the next thread run.
            exit.next.baton.grant();
        }
        Err(payload) => {
            timer::halt(cpu);
            let _ = events.send(Event::Aborted(payload));
        }
    }
}

/// Boot a kernel, run `f` as its initial thread (`"main"`), and return the
/// result.
///
/// Panics with the original payload if any kernel thread panics, including
/// a precondition violation detected by the kernel or a deadlock detected by
/// the idle thread. The initial thread must not call
/// [`thread_exit`](Kernel::thread_exit).
pub fn run<R: Send + 'static>(
    config: Config,
    f: impl FnOnce(&'static StdKernel) -> R + Send + 'static,
) -> R {
    static RUN_LOCK: Mutex<()> = Mutex::new(());
    let _run_guard = RUN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let _ = env_logger::try_init();

    let (send, recv) = mpsc::channel();
    let port = StdPort::new(config, send.clone());
    let cpu = Arc::clone(&port.cpu);
    let main_cpu = Arc::clone(&cpu);

    log::trace!("starting the main thread");
    let spawn_result = thread::Builder::new()
        .name("kthread-main".into())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                let kernel = Kernel::init(port);
                kernel.start();
                let _timer = config
                    .timer_period
                    .map(|period| timer::Timer::start(kernel, period));
                f(kernel)
            }));
            timer::retire_current_thread(&main_cpu);

            let event = match result {
                Ok(output) => Event::Finished(Box::new(output)),
                Err(payload) if payload.is::<ThreadExit>() => {
                    Event::Aborted(Box::new("the main thread exited"))
                }
                Err(payload) => Event::Aborted(payload),
            };
            let _ = send.send(event);
        });

    if let Err(e) = spawn_result {
        panic!("failed to spawn the main thread: {e}");
    }

    match recv.recv() {
        Ok(Event::Finished(output)) => match output.downcast::<R>() {
            Ok(output) => *output,
            Err(_) => unreachable!(),
        },
        Ok(Event::Aborted(payload)) => {
            log::debug!("the run was aborted");
            timer::halt(&cpu);
            panic::resume_unwind(payload)
        }
        // The port holds a sender for as long as the kernel exists
        Err(mpsc::RecvError) => unreachable!(),
    }
}
