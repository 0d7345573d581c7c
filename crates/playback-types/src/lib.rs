//! Shared types for the voice message playback scheduler.
//!
//! Plain data carried between the scheduler and its collaborator layers
//! (rendering, network/storage). No behavior lives here.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(
    /// Opaque message identifier, unique within a conversation for as long
    /// as the entry is tracked.
    MessageId
);

id_newtype!(
    /// Conversation (group chat thread) identifier.
    GroupId
);

id_newtype!(
    /// Message author identifier.
    SenderId
);

/// A voice message handed to the scheduler by the collaborator layer.
///
/// `real_time` distinguishes live delivery from backlog reconciliation;
/// `from_local_user` and `already_read` drive admission checks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageSubmission {
    /// Message identifier.
    pub message_id: MessageId,
    /// Author of the message.
    pub sender_id: SenderId,
    /// `true` when the local user recorded this message.
    #[serde(default)]
    pub from_local_user: bool,
    /// `true` when the message is already marked read.
    #[serde(default)]
    pub already_read: bool,
    /// `true` when delivered over the real-time path (not backlog catch-up).
    #[serde(default)]
    pub real_time: bool,
}

/// Playable audio location resolved by the network/storage layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaybackLocation(String);

impl PlaybackLocation {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlaybackLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a playback attempt ended in failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlaybackFailure {
    /// No playable location could be resolved for the message.
    Unresolvable,
    /// The audio transport rejected or aborted the playback.
    Transport { detail: String },
}

impl fmt::Display for PlaybackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolvable => f.write_str("no playable location"),
            Self::Transport { detail } => write!(f, "transport failure: {detail}"),
        }
    }
}

/// Why an in-progress playback was preempted.
///
/// Interruption is not an error: no failure toast, no retry prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// A real-time arrival preempted backlog/burst playback.
    RealTimeArrival,
    /// A new entry outranked the active one beyond the configured margin.
    HigherPriority,
}

/// Point-in-time view of one conversation's queue.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    /// `true` while this conversation owns the active playback.
    pub is_processing: bool,
    /// Entries waiting to be played.
    pub pending_count: usize,
    /// Back-to-back groups completed for this conversation so far.
    pub back_to_back_groups_formed: u64,
    /// Message currently playing for this conversation, if any.
    pub active_message_id: Option<MessageId>,
}

/// Running scheduler counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Submissions accepted past admission.
    pub submitted: u64,
    /// Entries that finished playback normally.
    pub completed: u64,
    /// Entries that failed to resolve or play.
    pub failed: u64,
    /// Entries preempted by higher-priority arrivals.
    pub interrupted: u64,
    /// Back-to-back groups formed across all conversations.
    pub back_to_back_groups: u64,
}
