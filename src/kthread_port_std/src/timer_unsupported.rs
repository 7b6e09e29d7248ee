//! Asynchronous timer interrupts aren't available on this host
use std::{sync::Arc, time::Duration};

use crate::{Cpu, StdKernel, ThreadState};

#[derive(Debug, Default)]
pub(crate) struct IrqLine;

#[derive(Debug)]
pub(crate) struct ResumeChannel;

impl ResumeChannel {
    pub(crate) fn new() -> Self {
        Self
    }
}

pub(crate) fn adopt_current_thread(_: &Arc<Cpu>, _: &ThreadState) {}

pub(crate) fn set_running(_: &Cpu, _: &ThreadState) {}

pub(crate) fn end_handoff(_: &Cpu) {}

pub(crate) fn retire_current_thread(_: &Cpu) {}

pub(crate) fn halt(_: &Cpu) {}

pub(crate) struct Timer;

impl Timer {
    pub(crate) fn start(_: &'static StdKernel, _: Duration) -> Self {
        panic!("`Config::timer_period` requires a Unix host")
    }
}
