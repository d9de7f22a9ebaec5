use std::collections::VecDeque;
use std::time::{Duration, Instant};

use influence_proto::SyncMessage;

/// Outgoing queue that spaces broadcasts so one pass over many NPCs does not
/// flood the shared channel.
///
/// Queued updates and deletes for the same identity coalesce: only the newest
/// survives, and it takes its place at the back of the queue so it is never
/// released ahead of anything queued before it.
#[derive(Debug)]
pub struct BroadcastPacer {
    spacing: Duration,
    queue: VecDeque<SyncMessage>,
    next_release: Option<Instant>,
}

impl BroadcastPacer {
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            queue: VecDeque::new(),
            next_release: None,
        }
    }

    pub fn enqueue(&mut self, message: SyncMessage) {
        if let Some(key) = message.identity_key() {
            self.queue.retain(|queued| queued.identity_key() != Some(key));
        }
        self.queue.push_back(message);
    }

    /// Messages whose turn has come at `now`.
    pub fn release_due(&mut self, now: Instant) -> Vec<SyncMessage> {
        let mut released = Vec::new();
        while !self.queue.is_empty() {
            if matches!(self.next_release, Some(at) if now < at) {
                break;
            }
            if let Some(message) = self.queue.pop_front() {
                released.push(message);
            }
            if !self.spacing.is_zero() {
                self.next_release = Some(now + self.spacing);
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn next_release(&self) -> Option<Instant> {
        if self.queue.is_empty() {
            None
        } else {
            self.next_release
        }
    }
}
