//! Dedup filter - drops redelivered messages before they reach a worker

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::message::{Message, MessageId};

struct DedupState {
    seen: HashSet<MessageId>,
    order: VecDeque<(MessageId, Instant)>,
}

/// Remembers message ids for `window`, bounded by `capacity`.
pub struct Dedup {
    state: Mutex<DedupState>,
    window: Duration,
    capacity: usize,
}

impl Dedup {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(DedupState {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            window,
            capacity: capacity.max(1),
        }
    }

    /// Returns true if the message was already admitted inside the window;
    /// otherwise records it and returns false.
    pub fn seen(&self, message: &Message) -> bool {
        self.seen_at(message.id(), Instant::now())
    }

    fn seen_at(&self, id: MessageId, now: Instant) -> bool {
        let mut state = self.state.lock();

        while let Some(&(oldest, at)) = state.order.front() {
            if now.duration_since(at) < self.window && state.order.len() < self.capacity {
                break;
            }
            state.order.pop_front();
            state.seen.remove(&oldest);
        }

        if !state.seen.insert(id) {
            return true;
        }
        state.order.push_back((id, now));
        false
    }

    /// Drops a recorded id so a later redelivery is admitted again.
    pub fn forget(&self, id: MessageId) {
        let mut state = self.state.lock();
        if state.seen.remove(&id) {
            state.order.retain(|(recorded, _)| *recorded != id);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
