//! Event queue — a single FIFO shared by producers and the pipeline.
//!
//! Producers push from any task. The pipeline polls without blocking and
//! gets the longest run of same-category events from the head, so a burst
//! of platform events is evaluated in one pass and internal events are never
//! mixed into it.

use parking_lot::Mutex;
use parley_core::Event;
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.events.lock().push_back(event);
    }

    /// Remove and return the leading same-category run. Empty if the queue
    /// is empty.
    pub fn poll_batch(&self) -> Vec<Event> {
        let mut events = self.events.lock();
        let Some(category) = events.front().map(Event::category) else {
            return Vec::new();
        };
        let run = events
            .iter()
            .take_while(|e| e.category() == category)
            .count();
        events.drain(..run).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
