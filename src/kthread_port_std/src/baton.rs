//! Execution permits for the OS threads backing kernel threads
use std::sync::{Condvar, Mutex, PoisonError};

/// The right to execute, handed from one OS thread to another.
///
/// Each kernel thread owns a baton, and its OS thread only runs while it
/// holds the baton. A grant that happens before the matching `wait` isn't
/// lost.
#[derive(Debug, Default)]
pub struct Baton {
    held: Mutex<bool>,
    cv: Condvar,
}

impl Baton {
    pub const fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Hand the baton to its owner.
    pub fn grant(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(!*held, "the baton was granted twice");
        *held = true;
        self.cv.notify_one();
    }

    /// Block the calling OS thread until the baton is granted, then take it.
    pub fn wait(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while !*held {
            held = self.cv.wait(held).unwrap_or_else(PoisonError::into_inner);
        }
        *held = false;
    }
}
