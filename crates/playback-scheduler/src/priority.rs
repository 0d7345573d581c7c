//! Classification and scoring of incoming messages.
//!
//! Pure decision logic over explicit inputs so it stays testable without a clock.

use playback_types::SenderId;

use crate::config::{PriorityWeights, SchedulerConfig};

/// How an arrival relates to the rest of its conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    /// Delivered live while the user is listening.
    RealTime,
    /// Continues a same-sender run within the grouping threshold.
    BackToBack,
    /// Part of a multi-message arrival cluster (typically backlog catch-up).
    Burst,
    /// A lone unread message with no temporal relationship to others.
    Backlog,
}

/// Facts about one arrival, gathered by the scheduler at admission time.
#[derive(Debug)]
pub struct ClassifyInputs<'a> {
    /// Submission came over the real-time delivery path.
    pub real_time: bool,
    /// Author of the arrival.
    pub sender_id: &'a SenderId,
    /// Arrival timestamp (scheduler-monotonic milliseconds).
    pub arrival_ms: u64,
    /// Author of the conversation's previous arrival, if any.
    pub last_arrival_sender: Option<&'a SenderId>,
    /// Timestamp of the conversation's previous arrival.
    pub last_arrival_ms: Option<u64>,
    /// Not-yet-completed entries (candidate included) whose arrivals fall
    /// within the burst window ending at `arrival_ms`.
    pub arrivals_in_burst_window: usize,
}

/// Classify an arrival. Precedence: back-to-back, then burst, then the
/// delivery path (real-time vs. backlog).
pub fn classify(inputs: &ClassifyInputs<'_>, config: &SchedulerConfig) -> Classification {
    if config.enable_back_to_back_detection && continues_run(inputs, config) {
        return Classification::BackToBack;
    }
    if inputs.arrivals_in_burst_window >= 3 {
        return Classification::Burst;
    }
    if inputs.real_time {
        Classification::RealTime
    } else {
        Classification::Backlog
    }
}

fn continues_run(inputs: &ClassifyInputs<'_>, config: &SchedulerConfig) -> bool {
    let (Some(last_sender), Some(last_ms)) = (inputs.last_arrival_sender, inputs.last_arrival_ms)
    else {
        return false;
    };
    last_sender == inputs.sender_id
        && inputs.arrival_ms.saturating_sub(last_ms) <= config.back_to_back_threshold_ms
}

/// Numeric priority for a classification; ties are broken FIFO by arrival
/// order at insertion time, never here.
pub fn score(classification: Classification, weights: &PriorityWeights) -> u32 {
    match classification {
        Classification::RealTime => weights.real_time,
        Classification::BackToBack => weights.back_to_back,
        Classification::Burst => weights.burst,
        Classification::Backlog => weights.backlog,
    }
}
