//! Provides `PrioBitmap`, a bit array supporting constant-time lookup of the
//! highest set bit.
use core::fmt;

use crate::cfg::NUM_PRIORITY_LEVELS;

const _: () = assert!(NUM_PRIORITY_LEVELS <= u64::BITS as usize);

/// A set of priority levels. Bit `i` corresponds to priority `i`.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PrioBitmap {
    bits: u64,
}

impl PrioBitmap {
    pub(crate) const fn new() -> Self {
        Self { bits: 0 }
    }

    /// Get the bit at the specified position.
    pub(crate) fn get(&self, i: usize) -> bool {
        assert!(i < NUM_PRIORITY_LEVELS);
        self.bits & (1 << i) != 0
    }

    /// Clear the bit at the specified position.
    pub(crate) fn clear(&mut self, i: usize) {
        assert!(i < NUM_PRIORITY_LEVELS);
        self.bits &= !(1 << i);
    }

    /// Set the bit at the specified position.
    pub(crate) fn set(&mut self, i: usize) {
        assert!(i < NUM_PRIORITY_LEVELS);
        self.bits |= 1 << i;
    }

    /// Get the position of the most significant set bit.
    pub(crate) fn find_highest(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some((u64::BITS - 1 - self.bits.leading_zeros()) as usize)
        }
    }
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set()
            .entries((0..NUM_PRIORITY_LEVELS).filter(|&i| self.get(i)))
            .finish()
    }
}
