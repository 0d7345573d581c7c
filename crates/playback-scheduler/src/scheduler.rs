//! Message playback scheduling across conversation queues.
//!
//! Owns admission, the per-entry lifecycle (queued, playing, then completed,
//! failed, or interrupted), and the single process-wide playback slot. All
//! state mutation is serialized through one mutex; transport calls and event
//! emission happen after the lock is released.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use playback_types::{
    GroupId, InterruptReason, MessageId, MessageSubmission, MetricsSnapshot, PlaybackFailure,
    QueueStatus,
};

use crate::audio_transport::{AudioTransport, ReadReceipts};
use crate::config::{ConfigError, SchedulerConfig};
use crate::events::{EventBus, SchedulerEvent};
use crate::group_queue::{GroupQueueState, QueueEntry, RunCompleted};
use crate::metrics::MetricsCollector;
use crate::priority::{self, Classification, ClassifyInputs};

/// The entry currently holding the audio output.
struct ActiveEntry {
    entry: QueueEntry,
    started: Instant,
}

#[derive(Default)]
struct SchedulerState {
    groups: HashMap<GroupId, GroupQueueState>,
    /// Process-wide playback slot. The device has one audio output, so at
    /// most one entry is Playing across all conversations.
    active: Option<ActiveEntry>,
    paused: bool,
    next_seq: u64,
}

/// Orchestrates voice message playback across all conversation queues.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    audio: Arc<dyn AudioTransport>,
    receipts: Arc<dyn ReadReceipts>,
    events: EventBus,
    metrics: MetricsCollector,
    epoch: Instant,
}

impl Scheduler {
    /// Build a scheduler with its collaborators, validating the config.
    pub fn new(
        config: SchedulerConfig,
        audio: Arc<dyn AudioTransport>,
        receipts: Arc<dyn ReadReceipts>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let metrics = MetricsCollector::new(config.enable_metrics);
        Ok(Self {
            state: Mutex::new(SchedulerState::default()),
            config,
            audio,
            receipts,
            events: EventBus::new(),
            metrics,
            epoch: Instant::now(),
        })
    }

    /// Lifecycle event bus for subscriber registration.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Convenience subscription to the lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current counter values.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Submit a message for playback in a conversation.
    ///
    /// Returns `false` (no side effects, no events) for the local user's own
    /// messages, messages already marked read, and duplicates of an entry
    /// still tracked by the conversation. Accepted messages are classified,
    /// inserted by priority, and played as soon as the audio output is free;
    /// a sufficiently outranking arrival preempts in-progress playback when
    /// interruption is enabled.
    pub fn add_message(&self, submission: MessageSubmission, group_id: &GroupId) -> bool {
        if submission.from_local_user {
            debug!(message_id = %submission.message_id, "rejecting local user's own message");
            return false;
        }
        if submission.already_read {
            debug!(message_id = %submission.message_id, "rejecting already-read message");
            return false;
        }

        let mut cancel: Option<MessageId> = None;
        let mut post_events: Vec<SchedulerEvent> = Vec::new();
        let mut should_advance = false;
        {
            let mut guard = self.state.lock().unwrap();
            let s = &mut *guard;

            let duplicate_active = s.active.as_ref().is_some_and(|a| {
                a.entry.group_id == *group_id && a.entry.message_id == submission.message_id
            });
            let duplicate_pending = s
                .groups
                .get(group_id)
                .is_some_and(|g| g.contains(&submission.message_id));
            if duplicate_active || duplicate_pending {
                debug!(message_id = %submission.message_id, %group_id, "rejecting duplicate submission");
                return false;
            }

            let arrival_ms = self.now_ms();
            let active_snapshot = s.active.as_ref().map(|a| {
                (
                    a.entry.message_id.clone(),
                    a.entry.group_id.clone(),
                    a.entry.classification,
                    a.entry.priority,
                    arrival_ms.saturating_sub(a.entry.arrival_ms) <= self.config.burst_threshold_ms
                        && a.entry.group_id == *group_id,
                )
            });
            let seq = s.next_seq;
            s.next_seq += 1;

            let group = s.groups.entry(group_id.clone()).or_default();
            let in_window = group.pending_in_window(arrival_ms, self.config.burst_threshold_ms)
                + usize::from(active_snapshot.as_ref().is_some_and(|a| a.4))
                + 1;
            let classification = priority::classify(
                &ClassifyInputs {
                    real_time: submission.real_time,
                    sender_id: &submission.sender_id,
                    arrival_ms,
                    last_arrival_sender: group.last_arrival_sender.as_ref(),
                    last_arrival_ms: group.last_arrival_ms,
                    arrivals_in_burst_window: in_window,
                },
                &self.config,
            );
            let score = priority::score(classification, &self.config.priority_weights);

            group.note_arrival(&submission.sender_id, arrival_ms);
            group.insert(QueueEntry {
                message_id: submission.message_id.clone(),
                group_id: group_id.clone(),
                sender_id: submission.sender_id.clone(),
                arrival_ms,
                arrival_seq: seq,
                classification,
                priority: score,
            });
            if classification == Classification::Burst {
                group.upgrade_burst_window(
                    arrival_ms,
                    self.config.burst_threshold_ms,
                    &self.config.priority_weights,
                );
            }
            info!(
                message_id = %submission.message_id,
                %group_id,
                ?classification,
                "message admitted"
            );

            if s.paused {
                // retained for a later resume
            } else if s.active.is_none() {
                should_advance = true;
            } else if self.config.enable_interruption {
                let (active_id, active_group, active_class, active_priority, _) =
                    active_snapshot.expect("active entry present");
                let reason = preemption_reason(
                    classification,
                    score,
                    active_class,
                    active_priority,
                    self.config.interruption_margin,
                );
                if let Some(reason) = reason {
                    let taken = s.active.take().expect("active entry present");
                    let active_queue = s
                        .groups
                        .get_mut(&taken.entry.group_id)
                        .expect("group exists for active entry");
                    active_queue.active_concurrent =
                        active_queue.active_concurrent.saturating_sub(1);
                    let flushed = if self.config.enable_back_to_back_detection {
                        active_queue.flush_run()
                    } else {
                        None
                    };
                    cancel = Some(active_id.clone());
                    post_events.push(SchedulerEvent::ProcessingInterrupted {
                        message_id: active_id,
                        group_id: active_group.clone(),
                        reason,
                    });
                    if let Some(run) = flushed {
                        post_events.push(run_event(&active_group, run));
                    }
                    should_advance = true;
                }
            }
        }

        self.metrics.on_submitted();
        if let Some(message_id) = cancel {
            info!(%message_id, "interrupting active playback");
            self.metrics.on_interrupted();
            if self.audio.cancel(&message_id).is_err() {
                warn!(%message_id, "audio transport rejected cancel");
            }
        }
        self.emit_all(post_events);
        if should_advance {
            self.advance(Some(group_id));
        }
        true
    }

    /// Signal from the audio layer that the active playback finished.
    ///
    /// Signals for anything but the active entry (late reports after a clear
    /// or an interruption) are ignored.
    pub fn playback_finished(&self, message_id: &MessageId) {
        let (group_id, duration_ms, post_events) = {
            let mut guard = self.state.lock().unwrap();
            let s = &mut *guard;
            let matches_active = s
                .active
                .as_ref()
                .is_some_and(|a| a.entry.message_id == *message_id);
            if !matches_active {
                debug!(%message_id, "ignoring stale completion signal");
                return;
            }
            let taken = s.active.take().expect("active entry present");
            let duration_ms = taken.started.elapsed().as_millis() as u64;
            let now_ms = self.now_ms();
            let group = s
                .groups
                .get_mut(&taken.entry.group_id)
                .expect("group exists for active entry");
            group.active_concurrent = group.active_concurrent.saturating_sub(1);

            let mut post_events = Vec::new();
            if self.config.enable_back_to_back_detection {
                if let Some(run) = group.record_completion(
                    &taken.entry.sender_id,
                    now_ms,
                    self.config.back_to_back_threshold_ms,
                ) {
                    post_events.push(run_event(&taken.entry.group_id, run));
                }
            }
            if group.is_empty() {
                if self.config.enable_back_to_back_detection {
                    if let Some(run) = group.flush_run() {
                        post_events.push(run_event(&taken.entry.group_id, run));
                    }
                }
                post_events.push(SchedulerEvent::QueueCompleted {
                    group_id: taken.entry.group_id.clone(),
                });
            }
            (taken.entry.group_id.clone(), duration_ms, post_events)
        };

        info!(%message_id, %group_id, duration_ms, "playback completed");
        self.receipts.mark_read(message_id);
        self.metrics.on_completed();
        self.events.emit(SchedulerEvent::ProcessingCompleted {
            message_id: message_id.clone(),
            group_id: group_id.clone(),
            duration_ms,
        });
        self.emit_all(post_events);
        self.advance(Some(&group_id));
    }

    /// Signal from the audio layer that the active playback errored.
    ///
    /// The entry is dropped (no automatic retry) and the queue advances.
    pub fn playback_failed(&self, message_id: &MessageId, detail: impl Into<String>) {
        let failure = PlaybackFailure::Transport {
            detail: detail.into(),
        };
        if let Some(group_id) = self.fail_active(message_id, failure) {
            self.advance(Some(&group_id));
        }
    }

    /// Discard a conversation's queue, cancelling its active playback.
    ///
    /// No per-entry events are emitted; a single `QueueCleared` is. Used on
    /// conversation switch.
    pub fn clear_queue(&self, group_id: &GroupId) {
        let cancel = {
            let mut guard = self.state.lock().unwrap();
            let s = &mut *guard;
            let taken = if s
                .active
                .as_ref()
                .is_some_and(|a| a.entry.group_id == *group_id)
            {
                s.active.take()
            } else {
                None
            };
            let Some(group) = s.groups.get_mut(group_id) else {
                return;
            };
            if taken.is_some() {
                group.active_concurrent = group.active_concurrent.saturating_sub(1);
            }
            group.reset();
            taken.map(|a| a.entry.message_id)
        };

        if let Some(message_id) = &cancel {
            if self.audio.cancel(message_id).is_err() {
                warn!(%message_id, "audio transport rejected cancel");
            }
        }
        info!(%group_id, "queue cleared");
        self.events.emit(SchedulerEvent::QueueCleared {
            group_id: group_id.clone(),
        });
        // the slot may have been freed for other conversations
        self.advance(None);
    }

    /// Stop dispatching new entries.
    ///
    /// Pending work is retained and in-flight playback is allowed to finish;
    /// pause only prevents the next dispatch.
    pub fn pause_processing(&self) {
        let mut s = self.state.lock().unwrap();
        s.paused = true;
        info!("processing paused");
    }

    /// Re-enable dispatch and immediately play the best pending entry.
    pub fn resume_processing(&self) {
        {
            let mut s = self.state.lock().unwrap();
            s.paused = false;
        }
        info!("processing resumed");
        self.advance(None);
    }

    /// Point-in-time view of one conversation's queue.
    pub fn queue_status(&self, group_id: &GroupId) -> QueueStatus {
        let s = self.state.lock().unwrap();
        let active = s
            .active
            .as_ref()
            .filter(|a| a.entry.group_id == *group_id);
        let (pending_count, groups_formed) = s
            .groups
            .get(group_id)
            .map(|g| (g.pending_len(), g.groups_formed))
            .unwrap_or((0, 0));
        QueueStatus {
            is_processing: active.is_some(),
            pending_count,
            back_to_back_groups_formed: groups_formed,
            active_message_id: active.map(|a| a.entry.message_id.clone()),
        }
    }

    /// Fill the playback slot from the pending queues.
    ///
    /// The hinted conversation is served first; otherwise the conversation
    /// holding the globally best pending entry wins. Entries that fail to
    /// resolve or start are dropped as Failed and the loop keeps going, so a
    /// bad entry never blocks the queue.
    fn advance(&self, hint: Option<&GroupId>) {
        loop {
            let popped = {
                let mut guard = self.state.lock().unwrap();
                let s = &mut *guard;
                if s.paused || s.active.is_some() {
                    return;
                }
                let Some(group_id) = pick_group(s, hint, self.config.max_concurrent_per_group)
                else {
                    return;
                };
                let group = s.groups.get_mut(&group_id).expect("picked group exists");
                let entry = group.pop_next().expect("picked group has pending work");
                group.active_concurrent += 1;
                s.active = Some(ActiveEntry {
                    entry: entry.clone(),
                    started: Instant::now(),
                });
                entry
            };

            let message_id = popped.message_id;
            let group_id = popped.group_id;
            match self.audio.resolve(&message_id) {
                Some(location) => match self.audio.start(&message_id, &location) {
                    Ok(()) => {
                        info!(%message_id, %group_id, "playback started");
                        self.events.emit(SchedulerEvent::ProcessingStarted {
                            message_id,
                            group_id,
                        });
                        return;
                    }
                    Err(err) => {
                        warn!(%message_id, ?err, "audio transport rejected start");
                        self.fail_active(
                            &message_id,
                            PlaybackFailure::Transport {
                                detail: "audio backend offline".to_string(),
                            },
                        );
                    }
                },
                None => {
                    warn!(%message_id, "no playable location for message");
                    self.fail_active(&message_id, PlaybackFailure::Unresolvable);
                }
            }
        }
    }

    /// Fail the active entry and report it; returns its conversation, or
    /// `None` when the signal was stale.
    fn fail_active(&self, message_id: &MessageId, failure: PlaybackFailure) -> Option<GroupId> {
        let (group_id, post_events) = {
            let mut guard = self.state.lock().unwrap();
            let s = &mut *guard;
            let matches_active = s
                .active
                .as_ref()
                .is_some_and(|a| a.entry.message_id == *message_id);
            if !matches_active {
                debug!(%message_id, "ignoring stale failure signal");
                return None;
            }
            let taken = s.active.take().expect("active entry present");
            let group = s
                .groups
                .get_mut(&taken.entry.group_id)
                .expect("group exists for active entry");
            group.active_concurrent = group.active_concurrent.saturating_sub(1);

            let mut post_events = Vec::new();
            if self.config.enable_back_to_back_detection {
                // the spoken turn was broken; report whatever run had formed
                if let Some(run) = group.flush_run() {
                    post_events.push(run_event(&taken.entry.group_id, run));
                }
            }
            if group.is_empty() {
                post_events.push(SchedulerEvent::QueueCompleted {
                    group_id: taken.entry.group_id.clone(),
                });
            }
            (taken.entry.group_id.clone(), post_events)
        };

        self.metrics.on_failed();
        self.events.emit(SchedulerEvent::ProcessingFailed {
            message_id: message_id.clone(),
            group_id: group_id.clone(),
            failure,
        });
        self.emit_all(post_events);
        Some(group_id)
    }

    fn emit_all(&self, events: Vec<SchedulerEvent>) {
        for event in events {
            if matches!(event, SchedulerEvent::BackToBackGroupCompleted { .. }) {
                self.metrics.on_back_to_back_group();
            }
            self.events.emit(event);
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

fn run_event(group_id: &GroupId, run: RunCompleted) -> SchedulerEvent {
    SchedulerEvent::BackToBackGroupCompleted {
        group_id: group_id.clone(),
        sender_id: run.sender_id,
        message_count: run.message_count,
    }
}

/// Why a new arrival may preempt the active entry.
///
/// A real-time arrival always preempts backlog catch-up; anything else must
/// outrank the active priority by more than the configured margin.
fn preemption_reason(
    new_class: Classification,
    new_priority: u32,
    active_class: Classification,
    active_priority: u32,
    margin: u32,
) -> Option<InterruptReason> {
    if new_class == Classification::RealTime
        && matches!(active_class, Classification::Backlog | Classification::Burst)
    {
        return Some(InterruptReason::RealTimeArrival);
    }
    if new_priority > active_priority.saturating_add(margin) {
        return Some(InterruptReason::HigherPriority);
    }
    None
}

fn pick_group(
    s: &SchedulerState,
    hint: Option<&GroupId>,
    max_concurrent: usize,
) -> Option<GroupId> {
    let eligible =
        |g: &GroupQueueState| !g.is_empty() && g.active_concurrent < max_concurrent;
    if let Some(hint) = hint {
        if s.groups.get(hint).is_some_and(eligible) {
            return Some(hint.clone());
        }
    }
    s.groups
        .iter()
        .filter(|(_, g)| eligible(g))
        .max_by_key(|(_, g)| {
            let (priority, seq) = g.peek_key().expect("non-empty group has a head");
            (priority, Reverse(seq))
        })
        .map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    use playback_types::{PlaybackLocation, SenderId};
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::audio_transport::AudioTransportError;

    #[derive(Default)]
    struct FakeTransport {
        started: Mutex<Vec<MessageId>>,
        cancelled: Mutex<Vec<MessageId>>,
        fail_start: Mutex<HashSet<String>>,
        unresolvable: Mutex<HashSet<String>>,
    }

    impl FakeTransport {
        fn started(&self) -> Vec<MessageId> {
            self.started.lock().unwrap().clone()
        }

        fn cancelled(&self) -> Vec<MessageId> {
            self.cancelled.lock().unwrap().clone()
        }

        fn fail_start_for(&self, id: &str) {
            self.fail_start.lock().unwrap().insert(id.to_string());
        }

        fn unresolvable_for(&self, id: &str) {
            self.unresolvable.lock().unwrap().insert(id.to_string());
        }
    }

    impl AudioTransport for FakeTransport {
        fn resolve(&self, message_id: &MessageId) -> Option<PlaybackLocation> {
            if self.unresolvable.lock().unwrap().contains(message_id.as_str()) {
                None
            } else {
                Some(PlaybackLocation::new(format!("audio://{message_id}")))
            }
        }

        fn start(
            &self,
            message_id: &MessageId,
            _location: &PlaybackLocation,
        ) -> Result<(), AudioTransportError> {
            if self.fail_start.lock().unwrap().contains(message_id.as_str()) {
                return Err(AudioTransportError::Offline);
            }
            self.started.lock().unwrap().push(message_id.clone());
            Ok(())
        }

        fn cancel(&self, message_id: &MessageId) -> Result<(), AudioTransportError> {
            self.cancelled.lock().unwrap().push(message_id.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeReceipts {
        read: Mutex<Vec<MessageId>>,
    }

    impl FakeReceipts {
        fn read(&self) -> Vec<MessageId> {
            self.read.lock().unwrap().clone()
        }
    }

    impl ReadReceipts for FakeReceipts {
        fn mark_read(&self, message_id: &MessageId) {
            self.read.lock().unwrap().push(message_id.clone());
        }
    }

    struct Harness {
        scheduler: Scheduler,
        transport: Arc<FakeTransport>,
        receipts: Arc<FakeReceipts>,
        rx: broadcast::Receiver<SchedulerEvent>,
    }

    impl Harness {
        fn new(config: SchedulerConfig) -> Self {
            let transport = Arc::new(FakeTransport::default());
            let receipts = Arc::new(FakeReceipts::default());
            let scheduler =
                Scheduler::new(config, transport.clone(), receipts.clone()).unwrap();
            let rx = scheduler.subscribe();
            Self {
                scheduler,
                transport,
                receipts,
                rx,
            }
        }

        fn drain_events(&mut self) -> Vec<SchedulerEvent> {
            let mut events = Vec::new();
            loop {
                match self.rx.try_recv() {
                    Ok(event) => events.push(event),
                    Err(TryRecvError::Empty) => return events,
                    Err(err) => panic!("event stream broken: {err:?}"),
                }
            }
        }
    }

    fn submission(id: &str, sender: &str) -> MessageSubmission {
        MessageSubmission {
            message_id: MessageId::from(id),
            sender_id: SenderId::from(sender),
            from_local_user: false,
            already_read: false,
            real_time: false,
        }
    }

    fn real_time(id: &str, sender: &str) -> MessageSubmission {
        MessageSubmission {
            real_time: true,
            ..submission(id, sender)
        }
    }

    fn g(id: &str) -> GroupId {
        GroupId::from(id)
    }

    #[test]
    fn first_message_starts_immediately() {
        let mut h = Harness::new(SchedulerConfig::default());
        assert!(h.scheduler.add_message(real_time("m1", "alice"), &g("g1")));

        let events = h.drain_events();
        assert!(matches!(
            events.as_slice(),
            [SchedulerEvent::ProcessingStarted { message_id, group_id }]
                if message_id.as_str() == "m1" && group_id.as_str() == "g1"
        ));
        assert_eq!(h.transport.started().len(), 1);

        let status = h.scheduler.queue_status(&g("g1"));
        assert!(status.is_processing);
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.active_message_id, Some(MessageId::from("m1")));
    }

    #[test]
    fn admission_rejects_own_and_read_messages() {
        let mut h = Harness::new(SchedulerConfig::default());
        let own = MessageSubmission {
            from_local_user: true,
            ..submission("m1", "me")
        };
        let read = MessageSubmission {
            already_read: true,
            ..submission("m2", "alice")
        };
        assert!(!h.scheduler.add_message(own, &g("g1")));
        assert!(!h.scheduler.add_message(read, &g("g1")));
        assert!(h.drain_events().is_empty());
        assert_eq!(h.scheduler.metrics().submitted, 0);
    }

    #[test]
    fn duplicate_is_rejected_while_tracked_and_accepted_after() {
        let h = Harness::new(SchedulerConfig::default());
        assert!(h.scheduler.add_message(submission("m1", "alice"), &g("g1")));
        // playing
        assert!(!h.scheduler.add_message(submission("m1", "alice"), &g("g1")));
        h.scheduler.add_message(submission("m2", "bob"), &g("g1"));
        // pending
        assert!(!h.scheduler.add_message(submission("m2", "bob"), &g("g1")));
        assert_eq!(h.scheduler.metrics().submitted, 2);

        h.scheduler.playback_finished(&MessageId::from("m1"));
        // terminal entries are untracked; a retry is a fresh submission
        assert!(h.scheduler.add_message(submission("m1", "alice"), &g("g1")));
    }

    #[test]
    fn completion_marks_read_and_reports_duration() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.drain_events();

        h.scheduler.playback_finished(&MessageId::from("m1"));

        assert_eq!(h.receipts.read(), vec![MessageId::from("m1")]);
        let events = h.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingCompleted { message_id, .. }
                if message_id.as_str() == "m1"
        ));
        assert!(matches!(
            &events[1],
            SchedulerEvent::QueueCompleted { group_id } if group_id.as_str() == "g1"
        ));
        assert!(!h.scheduler.queue_status(&g("g1")).is_processing);
    }

    #[test]
    fn queue_completed_fires_once_per_drain() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "bob"), &g("g1"));
        h.scheduler.playback_finished(&MessageId::from("m1"));
        h.scheduler.playback_finished(&MessageId::from("m2"));

        let completed: Vec<_> = h
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SchedulerEvent::QueueCompleted { .. }))
            .collect();
        assert_eq!(completed.len(), 1);
    }

    #[test]
    fn higher_class_dequeues_before_backlog() {
        let mut config = SchedulerConfig::default();
        config.enable_interruption = false;
        // keep the burst window tiny so spaced arrivals stay out of it
        config.burst_threshold_ms = 1;
        let h = Harness::new(config);
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        thread::sleep(Duration::from_millis(10));
        h.scheduler.add_message(submission("m2", "bob"), &g("g1"));
        thread::sleep(Duration::from_millis(10));
        h.scheduler.add_message(real_time("m3", "carol"), &g("g1"));

        h.scheduler.playback_finished(&MessageId::from("m1"));
        h.scheduler.playback_finished(&MessageId::from("m3"));
        h.scheduler.playback_finished(&MessageId::from("m2"));

        let order: Vec<_> = h
            .transport
            .started()
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(order, ["m1", "m3", "m2"]);
    }

    #[test]
    fn equal_class_is_fifo() {
        let h = Harness::new(SchedulerConfig::default());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "bob"), &g("g1"));
        h.scheduler.add_message(submission("m3", "carol"), &g("g1"));

        h.scheduler.playback_finished(&MessageId::from("m1"));
        h.scheduler.playback_finished(&MessageId::from("m2"));
        h.scheduler.playback_finished(&MessageId::from("m3"));

        let order: Vec<_> = h
            .transport
            .started()
            .iter()
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(order, ["m1", "m2", "m3"]);
    }

    #[test]
    fn real_time_arrival_preempts_backlog() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.drain_events();

        h.scheduler.add_message(real_time("m2", "bob"), &g("g1"));

        let events = h.drain_events();
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingInterrupted { message_id, reason, .. }
                if message_id.as_str() == "m1" && *reason == InterruptReason::RealTimeArrival
        ));
        assert!(matches!(
            &events[1],
            SchedulerEvent::ProcessingStarted { message_id, .. }
                if message_id.as_str() == "m2"
        ));
        assert_eq!(h.transport.cancelled(), vec![MessageId::from("m1")]);
        assert_eq!(h.scheduler.metrics().interrupted, 1);

        // a late finish report for the cancelled entry is ignored
        h.scheduler.playback_finished(&MessageId::from("m1"));
        assert!(h.drain_events().is_empty());
        assert!(h.receipts.read().is_empty());
        assert_eq!(h.scheduler.metrics().completed, 0);
    }

    #[test]
    fn margin_preemption_reports_higher_priority() {
        let mut h = Harness::new(SchedulerConfig::default());
        // backlog (weight 25) playing; a same-sender follow-up classifies
        // back-to-back (weight 75), beating 25 + margin 25
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.drain_events();
        h.scheduler.add_message(submission("m2", "alice"), &g("g1"));

        let events = h.drain_events();
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingInterrupted { reason, .. }
                if *reason == InterruptReason::HigherPriority
        ));
        assert!(matches!(
            &events[1],
            SchedulerEvent::ProcessingStarted { message_id, .. }
                if message_id.as_str() == "m2"
        ));
    }

    #[test]
    fn interruption_disabled_queues_behind_active() {
        let mut config = SchedulerConfig::default();
        config.enable_interruption = false;
        let mut h = Harness::new(config);
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.drain_events();

        h.scheduler.add_message(real_time("m2", "bob"), &g("g1"));

        assert!(h.drain_events().is_empty());
        assert!(h.transport.cancelled().is_empty());
        let status = h.scheduler.queue_status(&g("g1"));
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.active_message_id, Some(MessageId::from("m1")));
    }

    #[test]
    fn clear_queue_cancels_without_completion_events() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "bob"), &g("g1"));
        h.drain_events();

        h.scheduler.clear_queue(&g("g1"));

        let events = h.drain_events();
        assert!(matches!(
            events.as_slice(),
            [SchedulerEvent::QueueCleared { group_id }] if group_id.as_str() == "g1"
        ));
        assert_eq!(h.transport.cancelled(), vec![MessageId::from("m1")]);
        let status = h.scheduler.queue_status(&g("g1"));
        assert!(!status.is_processing);
        assert_eq!(status.pending_count, 0);

        // the cancelled backend may still report a finish; nothing happens
        h.scheduler.playback_finished(&MessageId::from("m1"));
        assert!(h.drain_events().is_empty());
        assert_eq!(h.scheduler.metrics().completed, 0);
    }

    #[test]
    fn back_to_back_run_reports_one_group() {
        // interruption off so the follow-ups queue behind the first message
        let mut config = SchedulerConfig::default();
        config.enable_interruption = false;
        let mut h = Harness::new(config);
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m3", "alice"), &g("g1"));

        h.scheduler.playback_finished(&MessageId::from("m1"));
        h.scheduler.playback_finished(&MessageId::from("m2"));
        h.scheduler.playback_finished(&MessageId::from("m3"));

        let events = h.drain_events();
        let runs: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SchedulerEvent::BackToBackGroupCompleted {
                    group_id,
                    sender_id,
                    message_count,
                } => Some((group_id.clone(), sender_id.clone(), *message_count)),
                _ => None,
            })
            .collect();
        assert_eq!(runs, vec![(g("g1"), SenderId::from("alice"), 3)]);
        // the run is reported before the queue-completed signal
        let run_pos = events
            .iter()
            .position(|e| matches!(e, SchedulerEvent::BackToBackGroupCompleted { .. }))
            .unwrap();
        let done_pos = events
            .iter()
            .position(|e| matches!(e, SchedulerEvent::QueueCompleted { .. }))
            .unwrap();
        assert!(run_pos < done_pos);
        assert_eq!(h.scheduler.metrics().back_to_back_groups, 1);
        assert_eq!(h.scheduler.queue_status(&g("g1")).back_to_back_groups_formed, 1);
    }

    /// Weights that keep dispatch strictly FIFO, so a same-sender run can
    /// build up while later entries stay queued behind it.
    fn flat_weight_config() -> SchedulerConfig {
        let mut config = SchedulerConfig::default();
        config.priority_weights.back_to_back = 25;
        config.priority_weights.burst = 25;
        config
    }

    #[test]
    fn interruption_flushes_open_back_to_back_run() {
        let mut h = Harness::new(flat_weight_config());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m3", "bob"), &g("g1"));
        h.scheduler.playback_finished(&MessageId::from("m1"));
        h.scheduler.playback_finished(&MessageId::from("m2"));
        // bob is playing; alice's two completions form an open run
        h.drain_events();

        h.scheduler.add_message(real_time("m4", "carol"), &g("g1"));

        let events = h.drain_events();
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingInterrupted { message_id, reason, .. }
                if message_id.as_str() == "m3" && *reason == InterruptReason::RealTimeArrival
        ));
        assert!(matches!(
            &events[1],
            SchedulerEvent::BackToBackGroupCompleted { sender_id, message_count, .. }
                if sender_id.as_str() == "alice" && *message_count == 2
        ));
        assert!(matches!(
            &events[2],
            SchedulerEvent::ProcessingStarted { message_id, .. }
                if message_id.as_str() == "m4"
        ));
        assert_eq!(h.scheduler.metrics().back_to_back_groups, 1);
        assert_eq!(h.scheduler.metrics().interrupted, 1);
    }

    #[test]
    fn failure_flushes_open_back_to_back_run() {
        let mut h = Harness::new(flat_weight_config());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m3", "bob"), &g("g1"));
        h.scheduler.playback_finished(&MessageId::from("m1"));
        h.scheduler.playback_finished(&MessageId::from("m2"));
        h.drain_events();

        h.scheduler.playback_failed(&MessageId::from("m3"), "stream reset");

        let events = h.drain_events();
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingFailed { message_id, .. }
                if message_id.as_str() == "m3"
        ));
        assert!(matches!(
            &events[1],
            SchedulerEvent::BackToBackGroupCompleted { sender_id, message_count, .. }
                if sender_id.as_str() == "alice" && *message_count == 2
        ));
        assert!(matches!(&events[2], SchedulerEvent::QueueCompleted { .. }));
        assert_eq!(h.scheduler.metrics().back_to_back_groups, 1);
        assert_eq!(h.scheduler.metrics().failed, 1);
    }

    #[test]
    fn failed_start_advances_to_next_entry() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.transport.fail_start_for("m1");
        h.scheduler.pause_processing();
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "bob"), &g("g1"));
        h.scheduler.resume_processing();

        let events = h.drain_events();
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingFailed { message_id, failure, .. }
                if message_id.as_str() == "m1"
                    && matches!(failure, PlaybackFailure::Transport { .. })
        ));
        assert!(matches!(
            &events[1],
            SchedulerEvent::ProcessingStarted { message_id, .. }
                if message_id.as_str() == "m2"
        ));
        assert_eq!(h.scheduler.metrics().failed, 1);
    }

    #[test]
    fn unresolvable_message_is_failed() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.transport.unresolvable_for("m1");
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));

        let events = h.drain_events();
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingFailed { failure, .. }
                if *failure == PlaybackFailure::Unresolvable
        ));
        // the drain still closes out the conversation
        assert!(matches!(
            &events[1],
            SchedulerEvent::QueueCompleted { .. }
        ));
        assert!(h.transport.started().is_empty());
    }

    #[test]
    fn reported_playback_failure_advances() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "bob"), &g("g1"));
        h.drain_events();

        h.scheduler.playback_failed(&MessageId::from("m1"), "decoder died");

        let events = h.drain_events();
        assert!(matches!(
            &events[0],
            SchedulerEvent::ProcessingFailed { failure: PlaybackFailure::Transport { detail }, .. }
                if detail == "decoder died"
        ));
        assert!(matches!(
            &events[1],
            SchedulerEvent::ProcessingStarted { message_id, .. }
                if message_id.as_str() == "m2"
        ));
        assert!(h.receipts.read().is_empty());
    }

    #[test]
    fn pause_retains_pending_and_resume_dispatches() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.scheduler.pause_processing();
        assert!(h.scheduler.add_message(submission("m1", "alice"), &g("g1")));
        assert!(h.drain_events().is_empty());
        assert_eq!(h.scheduler.queue_status(&g("g1")).pending_count, 1);

        h.scheduler.resume_processing();

        let events = h.drain_events();
        assert!(matches!(
            events.as_slice(),
            [SchedulerEvent::ProcessingStarted { message_id, .. }]
                if message_id.as_str() == "m1"
        ));
    }

    #[test]
    fn one_playback_slot_across_conversations() {
        let mut h = Harness::new(SchedulerConfig::default());
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        assert!(h.scheduler.add_message(submission("m2", "bob"), &g("g2")));
        h.drain_events();

        // g2 holds until the shared audio output frees up
        assert!(!h.scheduler.queue_status(&g("g2")).is_processing);
        assert_eq!(h.scheduler.queue_status(&g("g2")).pending_count, 1);

        h.scheduler.playback_finished(&MessageId::from("m1"));

        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            SchedulerEvent::QueueCompleted { group_id } if group_id.as_str() == "g1"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            SchedulerEvent::ProcessingStarted { message_id, group_id }
                if message_id.as_str() == "m2" && group_id.as_str() == "g2"
        )));
        assert!(h.scheduler.queue_status(&g("g2")).is_processing);
    }

    #[test]
    fn metrics_track_the_session() {
        let mut config = SchedulerConfig::default();
        config.enable_interruption = false;
        let mut h = Harness::new(config);
        h.scheduler.add_message(submission("m1", "alice"), &g("g1"));
        h.scheduler.add_message(submission("m2", "alice"), &g("g1"));
        h.scheduler.playback_finished(&MessageId::from("m1"));
        h.scheduler.playback_finished(&MessageId::from("m2"));
        h.scheduler.add_message(submission("m3", "bob"), &g("g1"));
        h.scheduler.playback_failed(&MessageId::from("m3"), "network reset");
        h.drain_events();

        let snapshot = h.scheduler.metrics();
        assert_eq!(snapshot.submitted, 3);
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.interrupted, 0);
        assert_eq!(snapshot.back_to_back_groups, 1);
    }
}
