//! Utilities shared by the kernel tests
#![allow(dead_code)]
use std::sync::{Arc, Mutex};

/// An append-only event log shared between kernel threads.
///
/// Only one kernel thread runs at a time, and none of them switches contexts
/// while holding the inner mutex, so the mutex is never contended. With an
/// asynchronous timer a thread can be preempted inside `push`; the timer
/// tests only push while no other thread can run.
pub struct Trace<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Trace<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Trace<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, event: T) {
        self.0.lock().unwrap().push(event);
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl<T: Clone> Trace<T> {
    pub fn get(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}
