//! Playback scheduler for voice group-chat messages.
//!
//! Orders incoming voice messages per conversation (real-time replies and
//! same-sender runs ahead of backlog catch-up), serializes playback onto the
//! single audio output, and reports lifecycle events over a broadcast bus.
//! Audio I/O and read-state persistence stay behind collaborator traits.

pub mod audio_transport;
pub mod config;
pub mod events;
pub mod group_queue;
pub mod metrics;
pub mod priority;
pub mod scheduler;

pub use audio_transport::{AudioCommand, AudioTransport, AudioTransportError, ChannelAudioTransport, ReadReceipts};
pub use config::{PriorityWeights, SchedulerConfig};
pub use events::{EventBus, SchedulerEvent};
pub use metrics::MetricsCollector;
pub use priority::Classification;
pub use scheduler::Scheduler;
