//! Wait sets
use alloc::vec::Vec;

use crate::{cfg::Priority, thread::ThreadIdx};

/// The threads blocked on a semaphore, in arrival order.
///
/// The order of insertion is kept so that the wake-up choice among threads of
/// equal priority is first-come first-served. Priorities aren't cached here
/// because donation can change them while the threads are waiting.
#[derive(Debug, Default)]
pub(crate) struct WaitSet {
    waiters: Vec<ThreadIdx>,
}

impl WaitSet {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn push(&mut self, thread: ThreadIdx) {
        debug_assert!(!self.waiters.contains(&thread));
        self.waiters.push(thread);
    }

    /// Find the position of the waiter with the highest priority according to
    /// `priority_of`. The earliest arrival wins among equals.
    pub(crate) fn highest_priority_position(
        &self,
        mut priority_of: impl FnMut(ThreadIdx) -> Priority,
    ) -> Option<usize> {
        let mut best: Option<(usize, Priority)> = None;
        for (i, &thread) in self.waiters.iter().enumerate() {
            let pri = priority_of(thread);
            if best.map_or(true, |(_, best_pri)| pri > best_pri) {
                best = Some((i, pri));
            }
        }
        best.map(|(i, _)| i)
    }

    pub(crate) fn remove(&mut self, position: usize) -> ThreadIdx {
        self.waiters.remove(position)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ThreadIdx> + '_ {
        self.waiters.iter().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earliest_of_highest() {
        let priorities = [10, 30, 20, 30];
        let mut set = WaitSet::new();
        for i in 0..priorities.len() {
            set.push(ThreadIdx(i));
        }

        let pos = set.highest_priority_position(|t| priorities[t.0]);
        assert_eq!(pos, Some(1));
        assert_eq!(set.remove(1), ThreadIdx(1));

        let pos = set.highest_priority_position(|t| priorities[t.0]);
        assert_eq!(set.remove(pos.unwrap()), ThreadIdx(3));

        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            [ThreadIdx(0), ThreadIdx(2)]
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn empty() {
        let set = WaitSet::new();
        assert!(set.is_empty());
        assert_eq!(set.highest_priority_position(|_| unreachable!()), None);
    }
}
