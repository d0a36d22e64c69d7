//! Bounded, append-only log of pushed events shared by every consumer.
//!
//! Events are numbered by a monotonically increasing sequence (the count of
//! events ever appended). Consumers keep their own [`EventCursor`] over that
//! sequence, so one consumer reading never changes what another sees as new,
//! and cursors stay valid after the buffer wraps or is cleared.

use sdlc_core::events::Event;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCursor {
    next_seq: u64,
}

impl EventCursor {
    /// Sequence number of the next event this cursor will yield.
    pub fn position(&self) -> u64 {
        self.next_seq
    }
}

/// Events read past a cursor. `skipped` counts events that were evicted or
/// cleared before the consumer got to them; they are gone for good.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<Arc<Event>>,
    pub skipped: u64,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug)]
struct LogState {
    events: VecDeque<Arc<Event>>,
    capacity: usize,
    appended: u64,
}

impl LogState {
    fn first_seq(&self) -> u64 {
        self.appended - self.events.len() as u64
    }
}

#[derive(Debug)]
pub struct EventLog {
    state: Mutex<LogState>,
    appended_tx: watch::Sender<u64>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (appended_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(LogState {
                events: VecDeque::with_capacity(capacity),
                capacity,
                appended: 0,
            }),
            appended_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends an event, evicting the oldest when full. Returns its sequence.
    pub fn push(&self, event: Event) -> u64 {
        let (seq, appended) = {
            let mut state = self.lock();
            if state.events.len() == state.capacity {
                state.events.pop_front();
            }
            state.events.push_back(Arc::new(event));
            let seq = state.appended;
            state.appended += 1;
            (seq, state.appended)
        };
        self.appended_tx.send_replace(appended);
        seq
    }

    /// Drops every buffered event. Sequence numbering continues.
    pub fn clear(&self) {
        self.lock().events.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    pub fn total_appended(&self) -> u64 {
        self.lock().appended
    }

    /// Buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<Arc<Event>> {
        self.lock().events.iter().cloned().collect()
    }

    /// Buffered events that concern `run_id` or no run at all.
    pub fn events_for_run(&self, run_id: &str) -> Vec<Arc<Event>> {
        self.lock()
            .events
            .iter()
            .filter(|event| event.is_for_run(run_id))
            .cloned()
            .collect()
    }

    /// Cursor positioned after everything appended so far.
    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            next_seq: self.lock().appended,
        }
    }

    /// Returns the events appended since `cursor` and moves it to the end.
    pub fn read_since(&self, cursor: &mut EventCursor) -> EventBatch {
        let state = self.lock();
        let first_seq = state.first_seq();
        let start = cursor.next_seq.max(first_seq);
        let skipped = first_seq.saturating_sub(cursor.next_seq);
        let offset = usize::try_from(start - first_seq).unwrap_or(usize::MAX);
        let events = state.events.iter().skip(offset).cloned().collect();
        cursor.next_seq = cursor.next_seq.max(state.appended);
        EventBatch { events, skipped }
    }

    /// Wakes on every append; the value is the total appended count.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.appended_tx.subscribe()
    }
}
