//! A three state atomic flag for run-once transitions.
//!
//! Cleanup hooks, buffer returns and the final frame of a streamed message must each happen
//! exactly once even when close and abort race. [`AtomicTransition`] lets the single winner of a
//! compare-and-swap run the transition while everybody else observes it as started or done.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Transition {
    NotStarted = 0,
    InProgress = 1,
    Done = 2,
}

impl Transition {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Transition::NotStarted,
            1 => Transition::InProgress,
            _ => Transition::Done,
        }
    }
}

#[derive(Debug)]
pub struct AtomicTransition {
    state: AtomicU8,
}

impl AtomicTransition {
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(Transition::NotStarted as u8) }
    }

    pub fn state(&self) -> Transition {
        Transition::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `NotStarted -> InProgress`. Only one caller ever gets `true`.
    pub fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(
                Transition::NotStarted as u8,
                Transition::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Marks a begun transition as done.
    pub fn finish(&self) {
        self.state.store(Transition::Done as u8, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.state() != Transition::NotStarted
    }

    pub fn is_done(&self) -> bool {
        self.state() == Transition::Done
    }
}

impl Default for AtomicTransition {
    fn default() -> Self {
        Self::new()
    }
}
