//! Compile-time kernel parameters
//!
//! A larger [`Priority`] value means a more urgent thread.

/// A thread priority in `PRI_MIN..=PRI_MAX`.
pub type Priority = u8;

/// A point in time measured in timer ticks since boot.
pub type Tick = u64;

/// The lowest priority. Used by the idle thread.
pub const PRI_MIN: Priority = 0;

/// The priority of the initial thread.
pub const PRI_DEFAULT: Priority = 31;

/// The highest priority.
pub const PRI_MAX: Priority = 63;

/// The number of priority levels.
pub(crate) const NUM_PRIORITY_LEVELS: usize = PRI_MAX as usize + 1;

/// The number of timer ticks a thread may run before it's forced to yield to
/// another thread of the same priority.
pub const TIME_SLICE: u32 = 4;

/// The maximum number of `waiting_on` links followed by a single donation.
pub const MAX_DONATION_DEPTH: usize = 8;

/// The maximum length of a thread name in bytes. Longer names are truncated.
pub const THREAD_NAME_LEN: usize = 15;

#[inline]
pub(crate) fn is_valid_priority(priority: Priority) -> bool {
    (PRI_MIN..=PRI_MAX).contains(&priority)
}
