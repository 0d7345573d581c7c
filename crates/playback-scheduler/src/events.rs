//! In-process event bus for scheduler lifecycle updates.
//!
//! Provides a lightweight broadcast channel the rendering layer subscribes to.

use tokio::sync::broadcast;

use playback_types::{GroupId, InterruptReason, MessageId, PlaybackFailure, SenderId};

/// Lifecycle events published by the scheduler.
///
/// Emission is fire-and-forget: an event with no subscribers is dropped.
#[derive(Clone, Debug)]
pub enum SchedulerEvent {
    /// Playback started for a message.
    ProcessingStarted {
        message_id: MessageId,
        group_id: GroupId,
    },
    /// Playback finished normally.
    ProcessingCompleted {
        message_id: MessageId,
        group_id: GroupId,
        duration_ms: u64,
    },
    /// Resolution or playback failed; the queue advanced past the entry.
    ProcessingFailed {
        message_id: MessageId,
        group_id: GroupId,
        failure: PlaybackFailure,
    },
    /// Playback was preempted by a higher-priority arrival.
    ProcessingInterrupted {
        message_id: MessageId,
        group_id: GroupId,
        reason: InterruptReason,
    },
    /// A same-sender run of two or more messages finished.
    BackToBackGroupCompleted {
        group_id: GroupId,
        sender_id: SenderId,
        message_count: usize,
    },
    /// A conversation drained: nothing pending, nothing playing.
    QueueCompleted { group_id: GroupId },
    /// A conversation's queue was explicitly discarded.
    QueueCleared { group_id: GroupId },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
