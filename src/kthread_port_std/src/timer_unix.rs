//! Asynchronous timer interrupts
//!
//! The timer thread delivers a tick every period by sending [`SIGNAL_TIMER`]
//! to the OS thread of the running kernel thread. If that thread can take an
//! interrupt (CPU Lock inactive, no interrupt handler running), the signal
//! handler parks it, and a short-lived interrupt thread runs
//! [`timer_interrupt`] on its behalf. When the tick causes a context switch,
//! the interrupt thread performs the switch in place of the parked thread and
//! stays blocked until that thread is scheduled again. The parked thread is
//! unparked after that and carries on from where it was interrupted.
//!
//! A thread that can't take an interrupt declines it, and the tick is
//! skipped. Ticks are counted only when delivered.
use std::{
    cell::Cell,
    os::raw::c_int,
    panic::{self, AssertUnwindSafe},
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering},
        mpsc, Arc, Once,
    },
    thread,
    time::Duration,
};

use spin::Mutex as SpinMutex;

use crate::{timer_interrupt, Cpu, Event, StdKernel, ThreadState};

const SIGNAL_TIMER: c_int = libc::SIGUSR1;

const ACK_IDLE: u8 = 0;
const ACK_REQUESTED: u8 = 1;
const ACK_DECLINED: u8 = 2;
const ACK_PARKED: u8 = 3;

/// Interrupt delivery state shared by the timer thread and the signal
/// handler.
#[derive(Debug, Default)]
pub(crate) struct IrqLine {
    /// The OS thread of the running kernel thread. `0` if it hasn't started
    /// yet or has terminated.
    running_os_thread: AtomicUsize,
    ack: AtomicU8,
    /// The socket that unparks the thread parked by the last accepted tick.
    parked_resume_sink: AtomicI32,
    /// Set from the moment a thread is parked until its interrupt thread has
    /// either unparked it or switched to another thread.
    in_progress: AtomicBool,
    stop: AtomicBool,
    /// Held while signaling an OS thread. OS threads backing kernel threads
    /// take it before terminating.
    signal_lock: SpinMutex<()>,
}

/// The socket pair a parked OS thread waits on.
#[derive(Debug)]
pub(crate) struct ResumeChannel {
    /// `[source, sink]`
    socks: [c_int; 2],
}

impl ResumeChannel {
    pub(crate) fn new() -> Self {
        let mut socks = [0; 2];
        if let Err(e) = ok_or_errno(unsafe {
            libc::socketpair(libc::PF_LOCAL, libc::SOCK_STREAM, 0, socks.as_mut_ptr())
        }) {
            panic!("failed to create a resume channel: {e}");
        }
        Self { socks }
    }
}

impl Drop for ResumeChannel {
    fn drop(&mut self) {
        for sock in self.socks {
            unsafe { libc::close(sock) };
        }
    }
}

#[derive(Clone, Copy)]
struct Local {
    cpu: *const Cpu,
    socks: [c_int; 2],
}

thread_local! {
    /// Set on the OS threads backing kernel threads.
    static LOCAL: Cell<Option<Local>> = const { Cell::new(None) };

    /// Set on an interrupt thread until it hands the CPU to another thread.
    static HANDOFF_PENDING: Cell<bool> = const { Cell::new(false) };
}

fn current_os_thread() -> usize {
    unsafe { libc::pthread_self() as usize }
}

/// Make the calling OS thread the one backing `state`. `cpu` must outlive
/// the OS thread.
pub(crate) fn adopt_current_thread(cpu: &Arc<Cpu>, state: &ThreadState) {
    let Some(resume) = &state.resume else {
        return;
    };
    state.os_thread.store(current_os_thread(), Ordering::SeqCst);
    LOCAL.with(|local| {
        local.set(Some(Local {
            cpu: Arc::as_ptr(cpu),
            socks: resume.socks,
        }))
    });
}

/// Direct the next timer interrupts to the OS thread backing `state`.
pub(crate) fn set_running(cpu: &Cpu, state: &ThreadState) {
    cpu.irq
        .running_os_thread
        .store(state.os_thread.load(Ordering::SeqCst), Ordering::SeqCst);
}

/// Called after a context switch has handed the CPU to the next thread. On
/// an interrupt thread this lets the timer deliver the next tick.
pub(crate) fn end_handoff(cpu: &Cpu) {
    if HANDOFF_PENDING.with(|pending| pending.replace(false)) {
        cpu.irq.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Stop the calling OS thread from receiving timer interrupts. Must be called
/// by an OS thread backing a kernel thread before it terminates.
pub(crate) fn retire_current_thread(cpu: &Cpu) {
    let irq = &cpu.irq;
    let _signaling = irq.signal_lock.lock();
    let _ = irq.running_os_thread.compare_exchange(
        current_os_thread(),
        0,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
}

/// Stop delivering timer interrupts.
pub(crate) fn halt(cpu: &Cpu) {
    cpu.irq.stop.store(true, Ordering::SeqCst);
}

/// The timer thread. It's stopped and joined on drop.
pub(crate) struct Timer {
    cpu: Arc<Cpu>,
    stop_send: Option<mpsc::Sender<()>>,
    join_handle: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub(crate) fn start(kernel: &'static StdKernel, period: Duration) -> Self {
        static SIGNAL_HANDLER: Once = Once::new();
        SIGNAL_HANDLER.call_once(register_signal_handler);

        let cpu = Arc::clone(&kernel.port().cpu);
        let events = kernel.port().events.lock().clone();
        let (stop_send, stop_recv) = mpsc::channel::<()>();

        log::trace!("starting the timer thread");
        let spawn_result = thread::Builder::new()
            .name("kthread-timer".into())
            .spawn(move || loop {
                match stop_recv.recv_timeout(period) {
                    Err(mpsc::RecvTimeoutError::Timeout)
                        if !kernel.port().cpu.irq.stop.load(Ordering::SeqCst) =>
                    {
                        deliver(kernel, &events);
                    }
                    _ => break,
                }
            });

        match spawn_result {
            Ok(join_handle) => Self {
                cpu,
                stop_send: Some(stop_send),
                join_handle: Some(join_handle),
            },
            Err(e) => panic!("failed to spawn the timer thread: {e}"),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        log::trace!("stopping the timer thread");
        halt(&self.cpu);
        self.stop_send = None;
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.join();
        }
        log::trace!("stopped the timer thread");
    }
}

/// Deliver a timer tick to the running kernel thread.
fn deliver(kernel: &'static StdKernel, events: &mpsc::Sender<Event>) {
    let irq = &kernel.port().cpu.irq;
    if irq.in_progress.load(Ordering::SeqCst) {
        // The previous tick is still being handled
        return;
    }

    let Some(resume_sink) = park_running_thread(irq) else {
        return;
    };

    irq.in_progress.store(true, Ordering::SeqCst);

    let events = events.clone();
    let spawn_result = thread::Builder::new()
        .name("kthread-irq".into())
        .spawn(move || {
            HANDOFF_PENDING.with(|pending| pending.set(true));
            let result = panic::catch_unwind(AssertUnwindSafe(|| timer_interrupt(kernel)));

            // Either nothing was switched, or the parked thread has been
            // scheduled again
            resume(resume_sink);
            end_handoff(&kernel.port().cpu);

            if let Err(payload) = result {
                let _ = events.send(Event::Aborted(payload));
            }
        });

    if let Err(e) = spawn_result {
        log::warn!("dropping a timer tick: failed to spawn an interrupt thread: {e}");
        resume(resume_sink);
        irq.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Signal the OS thread of the running kernel thread and wait until its
/// signal handler has either parked it or declined the interrupt. Returns the
/// socket that unparks it.
fn park_running_thread(irq: &IrqLine) -> Option<c_int> {
    let _signaling = irq.signal_lock.lock();

    let target = irq.running_os_thread.load(Ordering::SeqCst);
    if target == 0 {
        return None;
    }

    irq.ack.store(ACK_REQUESTED, Ordering::SeqCst);
    let result = unsafe { libc::pthread_kill(target as libc::pthread_t, SIGNAL_TIMER) };
    if result != 0 {
        irq.ack.store(ACK_IDLE, Ordering::SeqCst);
        log::warn!("failed to signal a kernel thread: {}", errno::Errno(result));
        return None;
    }

    let ack = loop {
        match irq.ack.load(Ordering::SeqCst) {
            ACK_REQUESTED if !irq.stop.load(Ordering::SeqCst) => thread::yield_now(),
            ack => break ack,
        }
    };
    irq.ack.store(ACK_IDLE, Ordering::SeqCst);

    (ack == ACK_PARKED).then(|| irq.parked_resume_sink.load(Ordering::SeqCst))
}

fn register_signal_handler() {
    if let Err(e) = ok_or_errno(unsafe {
        libc::sigaction(
            SIGNAL_TIMER,
            &libc::sigaction {
                sa_sigaction: timer_signal_handler as libc::sighandler_t,
                // Blocking calls interrupted by a declined tick are restarted
                sa_flags: libc::SA_RESTART,
                ..std::mem::zeroed()
            },
            null_mut(),
        )
    }) {
        panic!("failed to register the timer signal handler: {e}");
    }
}

/// The signal handler for `SIGNAL_TIMER`.
extern "C" fn timer_signal_handler(_signo: c_int) {
    let saved_errno = errno::errno();

    if let Some(local) = LOCAL.try_with(Cell::get).ok().flatten() {
        // Safety: `adopt_current_thread`'s caller keeps it alive
        let cpu = unsafe { &*local.cpu };
        let irq = &cpu.irq;

        if irq.ack.load(Ordering::SeqCst) == ACK_REQUESTED {
            let can_take = !irq.stop.load(Ordering::SeqCst)
                && !cpu.lock.load(Ordering::SeqCst)
                && !cpu.interrupt_context.load(Ordering::SeqCst)
                && irq.running_os_thread.load(Ordering::SeqCst) == current_os_thread();

            if can_take {
                irq.parked_resume_sink.store(local.socks[1], Ordering::SeqCst);
                irq.ack.store(ACK_PARKED, Ordering::SeqCst);
                park(local.socks[0]);
            } else {
                irq.ack.store(ACK_DECLINED, Ordering::SeqCst);
            }
        }
    }

    errno::set_errno(saved_errno);
}

/// Block until a token arrives at `source`. Async-signal-safe.
fn park(source: c_int) {
    loop {
        match isize_ok_or_errno(unsafe { libc::recv(source, (&mut 0u8) as *mut u8 as _, 1, 0) }) {
            Ok(1) => break,
            Ok(0) | Err(errno::Errno(libc::EAGAIN)) | Err(errno::Errno(libc::EINTR)) => continue,
            // Unwinding out of a signal handler isn't an option
            _ => unsafe { libc::abort() },
        }
    }
}

fn resume(sink: c_int) {
    if let Err(e) = isize_ok_or_errno(unsafe { libc::send(sink, &0u8 as *const u8 as _, 1, 0) }) {
        panic!("failed to unpark a kernel thread: {e}");
    }
}

fn isize_ok_or_errno(x: isize) -> Result<isize, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}

fn ok_or_errno(x: c_int) -> Result<c_int, errno::Errno> {
    if x >= 0 {
        Ok(x)
    } else {
        Err(errno::errno())
    }
}
