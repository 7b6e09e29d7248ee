//! Timed sleep
use alloc::vec::Vec;

use crate::{
    cfg::Tick,
    thread::{block_current, make_ready, unlock_cpu_and_check_preemption, ThreadIdx},
    Kernel, Port,
};

/// Threads blocked until a tick count is reached.
///
/// The earliest wake-up tick is cached so that the timer interrupt handler
/// can tell whether [`Kernel::awake`] has anything to do without scanning.
#[derive(Debug, Default)]
pub(crate) struct SleepQueue {
    sleepers: Vec<Sleeper>,
    next_wake_tick: Option<Tick>,
}

#[derive(Debug, Clone, Copy)]
struct Sleeper {
    thread: ThreadIdx,
    wakeup_tick: Tick,
}

impl SleepQueue {
    pub(crate) const fn new() -> Self {
        Self {
            sleepers: Vec::new(),
            next_wake_tick: None,
        }
    }

    pub(crate) fn push(&mut self, thread: ThreadIdx, wakeup_tick: Tick) {
        self.sleepers.push(Sleeper {
            thread,
            wakeup_tick,
        });
        self.next_wake_tick = Some(
            self.next_wake_tick
                .map_or(wakeup_tick, |tick| tick.min(wakeup_tick)),
        );
    }

    /// Remove every sleeper whose wake-up tick is at or before `current_tick`
    /// and return them in the order they went to sleep.
    pub(crate) fn take_due(&mut self, current_tick: Tick) -> Vec<ThreadIdx> {
        if self.next_wake_tick.map_or(true, |tick| tick > current_tick) {
            return Vec::new();
        }

        let mut due = Vec::new();
        let mut next_wake_tick: Option<Tick> = None;
        self.sleepers.retain(|sleeper| {
            if sleeper.wakeup_tick <= current_tick {
                due.push(sleeper.thread);
                false
            } else {
                next_wake_tick = Some(
                    next_wake_tick.map_or(sleeper.wakeup_tick, |tick| tick.min(sleeper.wakeup_tick)),
                );
                true
            }
        });
        self.next_wake_tick = next_wake_tick;

        due
    }

    #[inline]
    pub(crate) fn next_wake_tick(&self) -> Option<Tick> {
        self.next_wake_tick
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.sleepers.len()
    }
}

/// These associate functions implement the timed sleep.
impl<P: Port> Kernel<P> {
    /// Block the current thread for at least `ticks` timer ticks. Returns
    /// immediately if `ticks` is zero.
    pub fn sleep(&self, ticks: Tick) {
        self.expect_thread_context("sleep");
        if ticks == 0 {
            return;
        }

        let now = self.port().current_tick();
        self.sleep_until(now.saturating_add(ticks));
    }

    /// Block the current thread until the tick count reaches `wakeup_tick`.
    /// Returns immediately if it already has.
    pub fn sleep_until(&self, wakeup_tick: Tick) {
        self.expect_thread_context("sleep_until");

        let mut lock = self.lock_cpu();

        // The tick count can't advance while CPU Lock is active
        if wakeup_tick <= self.port().current_tick() {
            return;
        }

        let st = self.state.write(&mut *lock);
        let running = st.running;
        assert!(st.idle != Some(running), "the idle thread may not sleep");

        log::trace!(
            "{:?} sleeping until tick {wakeup_tick}",
            st.thread(running).tid
        );

        st.sleep_queue.push(running, wakeup_tick);
        block_current(self, lock.borrow_mut());
    }

    /// Wake up every thread whose wake-up tick is at or before `current_tick`.
    /// The interrupted thread yields on interrupt return if one of them
    /// outranks it.
    ///
    /// Must be called from an interrupt context.
    pub fn awake(&self, current_tick: Tick) {
        assert!(
            self.port().is_interrupt_context(),
            "`awake` must be called from an interrupt context"
        );

        let mut lock = self.lock_cpu();
        let st = self.state.write(&mut *lock);
        for thread in st.sleep_queue.take_due(current_tick) {
            make_ready(st, thread);
        }

        unlock_cpu_and_check_preemption(self, lock);
    }

    /// Get the earliest wake-up tick among the sleeping threads.
    pub fn next_wake_tick(&self) -> Option<Tick> {
        let lock = self.lock_cpu();
        self.state.read(&*lock).sleep_queue.next_wake_tick()
    }

    /// Get the number of sleeping threads.
    pub fn sleeper_count(&self) -> usize {
        let lock = self.lock_cpu();
        self.state.read(&*lock).sleep_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn wakes_in_tick_order() {
        let mut queue = SleepQueue::new();
        queue.push(ThreadIdx(0), 5);
        queue.push(ThreadIdx(1), 3);
        queue.push(ThreadIdx(2), 8);
        assert_eq!(queue.next_wake_tick(), Some(3));

        assert!(queue.take_due(2).is_empty());
        assert_eq!(queue.take_due(3), [ThreadIdx(1)]);
        assert_eq!(queue.next_wake_tick(), Some(5));
        assert_eq!(queue.take_due(5), [ThreadIdx(0)]);
        assert_eq!(queue.next_wake_tick(), Some(8));
        assert_eq!(queue.take_due(8), [ThreadIdx(2)]);
        assert_eq!(queue.next_wake_tick(), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn simultaneous_wake_keeps_arrival_order() {
        let mut queue = SleepQueue::new();
        queue.push(ThreadIdx(4), 10);
        queue.push(ThreadIdx(2), 7);
        queue.push(ThreadIdx(9), 10);
        assert_eq!(queue.take_due(12), [ThreadIdx(4), ThreadIdx(2), ThreadIdx(9)]);
    }

    /// Random pushes and timer advances against a plain list.
    #[quickcheck]
    fn matches_reference(bytecode: Vec<u8>) {
        let _ = env_logger::try_init();

        let mut subject = SleepQueue::new();
        let mut reference: Vec<(ThreadIdx, Tick)> = Vec::new();
        let mut now: Tick = 0;
        let mut next_thread = 0;

        for instr in bytecode.chunks_exact(2) {
            let amount = Tick::from(instr[1] % 16);
            if instr[0] % 2 == 0 {
                let thread = ThreadIdx(next_thread);
                next_thread += 1;
                log::trace!("    push {thread:?} until {}", now + amount);
                subject.push(thread, now + amount);
                reference.push((thread, now + amount));
            } else {
                now += amount;
                log::trace!("    advance to {now}");
                let expected: Vec<_> = reference
                    .iter()
                    .filter(|&&(_, tick)| tick <= now)
                    .map(|&(thread, _)| thread)
                    .collect();
                reference.retain(|&(_, tick)| tick > now);
                assert_eq!(subject.take_due(now), expected);
            }

            assert_eq!(subject.len(), reference.len());
            assert_eq!(
                subject.next_wake_tick(),
                reference.iter().map(|&(_, tick)| tick).min()
            );
        }
    }
}
