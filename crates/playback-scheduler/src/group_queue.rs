//! Per-conversation queue state.
//!
//! Owns the priority-ordered pending set plus the arrival and completion-run
//! bookkeeping behind back-to-back and burst detection.

use std::cmp::Reverse;

use playback_types::{GroupId, MessageId, SenderId};

use crate::config::PriorityWeights;
use crate::priority::{self, Classification};

/// A tracked message waiting for (or owning) playback.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub message_id: MessageId,
    pub group_id: GroupId,
    pub sender_id: SenderId,
    /// Scheduler-monotonic arrival timestamp (ms).
    pub arrival_ms: u64,
    /// Global admission sequence; FIFO tie-breaker within a priority.
    pub arrival_seq: u64,
    pub classification: Classification,
    pub priority: u32,
}

impl QueueEntry {
    fn sort_key(&self) -> (Reverse<u32>, u64) {
        (Reverse(self.priority), self.arrival_seq)
    }
}

/// A completed same-sender run, ready to be reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunCompleted {
    pub sender_id: SenderId,
    pub message_count: usize,
}

/// Mutable queue state for one conversation.
#[derive(Debug, Default)]
pub struct GroupQueueState {
    /// Pending entries, highest priority first, FIFO within equal priority.
    pending: Vec<QueueEntry>,
    /// Author of the most recent admitted arrival.
    pub last_arrival_sender: Option<SenderId>,
    /// Timestamp of the most recent admitted arrival.
    pub last_arrival_ms: Option<u64>,
    /// Entries this conversation currently owns in playback.
    pub active_concurrent: usize,
    /// Back-to-back groups completed so far (survives queue clears).
    pub groups_formed: u64,
    run_sender: Option<SenderId>,
    run_len: usize,
    last_completed_ms: Option<u64>,
}

impl GroupQueueState {
    /// Insert an entry at its priority position, after equal-priority peers.
    pub fn insert(&mut self, entry: QueueEntry) {
        let key = entry.sort_key();
        let pos = self
            .pending
            .binary_search_by(|e| e.sort_key().cmp(&key))
            .unwrap_or_else(|pos| pos);
        self.pending.insert(pos, entry);
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.pending.iter().any(|e| &e.message_id == message_id)
    }

    /// Pop the highest-priority pending entry.
    pub fn pop_next(&mut self) -> Option<QueueEntry> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.remove(0))
        }
    }

    /// Sort key of the entry `pop_next` would return.
    pub fn peek_key(&self) -> Option<(u32, u64)> {
        self.pending.first().map(|e| (e.priority, e.arrival_seq))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Count pending arrivals inside the burst window ending at `arrival_ms`.
    pub fn pending_in_window(&self, arrival_ms: u64, window_ms: u64) -> usize {
        self.pending
            .iter()
            .filter(|e| arrival_ms.saturating_sub(e.arrival_ms) <= window_ms)
            .count()
    }

    /// Record the latest admitted arrival for back-to-back classification.
    pub fn note_arrival(&mut self, sender_id: &SenderId, arrival_ms: u64) {
        self.last_arrival_sender = Some(sender_id.clone());
        self.last_arrival_ms = Some(arrival_ms);
    }

    /// Upgrade pending Backlog entries inside a confirmed burst window.
    ///
    /// RealTime and BackToBack entries keep their class; the order is
    /// re-derived after re-scoring.
    pub fn upgrade_burst_window(
        &mut self,
        arrival_ms: u64,
        window_ms: u64,
        weights: &PriorityWeights,
    ) {
        let mut changed = false;
        for entry in &mut self.pending {
            if entry.classification == Classification::Backlog
                && arrival_ms.saturating_sub(entry.arrival_ms) <= window_ms
            {
                entry.classification = Classification::Burst;
                entry.priority = priority::score(Classification::Burst, weights);
                changed = true;
            }
        }
        if changed {
            self.pending.sort_by_key(QueueEntry::sort_key);
        }
    }

    /// Account a completed entry against the current same-sender run.
    ///
    /// Returns the previous run when this completion ended it (sender change
    /// or gap beyond `threshold_ms`) and that run had two or more messages.
    pub fn record_completion(
        &mut self,
        sender_id: &SenderId,
        completed_ms: u64,
        threshold_ms: u64,
    ) -> Option<RunCompleted> {
        let continues = self.run_sender.as_ref() == Some(sender_id)
            && self
                .last_completed_ms
                .is_some_and(|t| completed_ms.saturating_sub(t) <= threshold_ms);
        let flushed = if continues {
            self.run_len += 1;
            None
        } else {
            let flushed = self.flush_run();
            self.run_sender = Some(sender_id.clone());
            self.run_len = 1;
            flushed
        };
        self.last_completed_ms = Some(completed_ms);
        flushed
    }

    /// End the current run, reporting it when it grouped two or more messages.
    pub fn flush_run(&mut self) -> Option<RunCompleted> {
        let sender = self.run_sender.take();
        let len = std::mem::take(&mut self.run_len);
        if len >= 2 {
            let sender_id = sender?;
            self.groups_formed += 1;
            Some(RunCompleted {
                sender_id,
                message_count: len,
            })
        } else {
            None
        }
    }

    /// Drop pending entries and all run/arrival bookkeeping.
    ///
    /// `groups_formed` is a lifetime statistic and survives.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_arrival_sender = None;
        self.last_arrival_ms = None;
        self.run_sender = None;
        self.run_len = 0;
        self.last_completed_ms = None;
    }
}
