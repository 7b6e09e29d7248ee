//! Thread ready queue
//!
//! One FIFO per priority level plus a bitmap of the non-empty levels. The
//! front of the highest non-empty level is the next thread to run.
use alloc::collections::VecDeque;
use core::{array, fmt};

use super::ThreadIdx;
use crate::{
    cfg::{Priority, NUM_PRIORITY_LEVELS},
    utils::PrioBitmap,
};

pub(crate) struct ReadyQueue {
    queues: [VecDeque<ThreadIdx>; NUM_PRIORITY_LEVELS],
    bitmap: PrioBitmap,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self {
            queues: array::from_fn(|_| VecDeque::new()),
            bitmap: PrioBitmap::new(),
        }
    }

    /// Get the highest priority among the queued threads.
    #[inline]
    pub(crate) fn highest_priority(&self) -> Option<Priority> {
        self.bitmap.find_highest().map(|pri| pri as Priority)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.bitmap.find_highest().is_none()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Insert a thread at the back of the level `pri`.
    ///
    /// The thread must not be in the queue already.
    pub(crate) fn push_back(&mut self, thread: ThreadIdx, pri: Priority) {
        debug_assert!(!self.queues.iter().any(|q| q.contains(&thread)));
        let pri = pri as usize;
        self.queues[pri].push_back(thread);
        self.bitmap.set(pri);
    }

    /// Remove and return the front of the highest non-empty level.
    pub(crate) fn pop_front(&mut self) -> Option<ThreadIdx> {
        let pri = self.bitmap.find_highest()?;
        let queue = &mut self.queues[pri];

        // There must be at least one element, because the bitmap indicated so
        let thread = queue.pop_front();
        debug_assert!(thread.is_some());

        if queue.is_empty() {
            self.bitmap.clear(pri);
        }

        thread
    }

    /// Remove `thread`, which was inserted with priority `pri`. Returns
    /// `false` if it wasn't found there.
    pub(crate) fn remove(&mut self, thread: ThreadIdx, pri: Priority) -> bool {
        let pri = pri as usize;
        let queue = &mut self.queues[pri];
        let Some(pos) = queue.iter().position(|&t| t == thread) else {
            return false;
        };
        queue.remove(pos);

        if queue.is_empty() {
            self.bitmap.clear(pri);
        }
        true
    }

    /// Move a thread between levels after its effective priority changed from
    /// `old_pri` to `new_pri`. The thread is placed at the back of the new
    /// level.
    pub(crate) fn reorder(&mut self, thread: ThreadIdx, old_pri: Priority, new_pri: Priority) {
        if old_pri == new_pri {
            return;
        }

        let found = self.remove(thread, old_pri);
        debug_assert!(found, "{thread:?} is not in the ready queue at level {old_pri}");
        self.push_back(thread, new_pri);
    }

    /// Iterate over the queued threads in the order they would be chosen.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = ThreadIdx> + '_ {
        self.queues.iter().rev().flat_map(|q| q.iter().cloned())
    }
}

impl fmt::Debug for ReadyQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ReadyQueue ")?;
        f.debug_map()
            .entries(
                self.queues
                    .iter()
                    .enumerate()
                    .filter(|(_, q)| !q.is_empty()),
            )
            .finish()
    }
}
