//! Latest-value-wins coalescing.
//!
//! A single pending slot plus a fixed window. Each [`Coalescer::offer`]
//! replaces the slot and returns the window the caller must (re)arm its
//! timer with; when the timer fires the caller [`Coalescer::take`]s whatever
//! value is current. Superseded values are never delivered.

use std::time::Duration;

/// One pending value and the window that delays its delivery.
#[derive(Debug)]
pub struct Coalescer<T> {
    window: Duration,
    pending: Option<T>,
}

impl<T> Coalescer<T> {
    /// Create an empty coalescer.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Replace the pending value. Returns the window to rearm.
    pub fn offer(&mut self, value: T) -> Duration {
        self.pending = Some(value);
        self.window
    }

    /// Take the pending value, leaving the slot empty.
    pub fn take(&mut self) -> Option<T> {
        self.pending.take()
    }

    /// Drop the pending value. Returns whether one was held.
    pub fn discard(&mut self) -> bool {
        self.pending.take().is_some()
    }
}
