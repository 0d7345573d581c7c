//! Collaborator traits for audio I/O and read-state persistence.
//!
//! Implementations translate scheduler requests into audio-backend commands
//! and network writes; the scheduler never performs I/O itself.

use crossbeam_channel::Sender;
use playback_types::{MessageId, PlaybackLocation};

#[derive(Debug)]
pub enum AudioTransportError {
    /// The audio backend is gone or rejected the command.
    Offline,
}

/// Audio side of the collaborator layer.
///
/// `start` must not block for the duration of playback: the backend signals
/// the outcome later through `Scheduler::playback_finished` /
/// `Scheduler::playback_failed`. `cancel` is best-effort; a backend already
/// finishing may still report completion, which the scheduler ignores.
pub trait AudioTransport: Send + Sync {
    /// Resolve a message to a playable location, if one exists.
    fn resolve(&self, message_id: &MessageId) -> Option<PlaybackLocation>;
    /// Begin playback of a resolved location.
    fn start(
        &self,
        message_id: &MessageId,
        location: &PlaybackLocation,
    ) -> Result<(), AudioTransportError>;
    /// Stop in-flight playback of a message.
    fn cancel(&self, message_id: &MessageId) -> Result<(), AudioTransportError>;
}

/// Read-state side of the collaborator layer.
pub trait ReadReceipts: Send + Sync {
    /// Persist that the message has been listened to.
    fn mark_read(&self, message_id: &MessageId);
}

/// Commands a channel-backed audio backend consumes.
#[derive(Clone, Debug)]
pub enum AudioCommand {
    Play {
        message_id: MessageId,
        location: PlaybackLocation,
    },
    Cancel {
        message_id: MessageId,
    },
}

/// [`AudioTransport`] that forwards commands over a crossbeam channel to an
/// audio backend thread. Resolution is delegated to a caller-supplied lookup.
pub struct ChannelAudioTransport {
    cmd_tx: Sender<AudioCommand>,
    resolver: Box<dyn Fn(&MessageId) -> Option<PlaybackLocation> + Send + Sync>,
}

impl ChannelAudioTransport {
    pub fn new(
        cmd_tx: Sender<AudioCommand>,
        resolver: impl Fn(&MessageId) -> Option<PlaybackLocation> + Send + Sync + 'static,
    ) -> Self {
        Self {
            cmd_tx,
            resolver: Box::new(resolver),
        }
    }
}

impl AudioTransport for ChannelAudioTransport {
    fn resolve(&self, message_id: &MessageId) -> Option<PlaybackLocation> {
        (self.resolver)(message_id)
    }

    fn start(
        &self,
        message_id: &MessageId,
        location: &PlaybackLocation,
    ) -> Result<(), AudioTransportError> {
        self.cmd_tx
            .send(AudioCommand::Play {
                message_id: message_id.clone(),
                location: location.clone(),
            })
            .map_err(|_| AudioTransportError::Offline)
    }

    fn cancel(&self, message_id: &MessageId) -> Result<(), AudioTransportError> {
        self.cmd_tx
            .send(AudioCommand::Cancel {
                message_id: message_id.clone(),
            })
            .map_err(|_| AudioTransportError::Offline)
    }
}
