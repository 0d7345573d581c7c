//! `queue-sim` drives the playback scheduler against a simulated backend.
//!
//! Loads a TOML scenario of timed message arrivals, submits them to the
//! scheduler on schedule, and "plays" each message on a backend thread that
//! sleeps for the scripted duration before reporting completion. Lifecycle
//! events are logged as they happen; the final metrics snapshot is printed
//! as JSON.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use playback_scheduler::{
    AudioCommand, ChannelAudioTransport, ReadReceipts, Scheduler, SchedulerConfig,
};
use playback_types::{GroupId, MessageId, MessageSubmission, PlaybackLocation, SenderId};

#[derive(Parser, Debug)]
#[command(name = "queue-sim", version)]
struct Args {
    /// Scenario file with timed message arrivals.
    #[arg(long)]
    scenario: PathBuf,

    /// Scheduler config TOML; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Scenario {
    #[serde(default)]
    messages: Vec<ScenarioMessage>,
}

#[derive(Debug, Deserialize)]
struct ScenarioMessage {
    /// Message id; a UUID is generated when omitted.
    #[serde(default)]
    id: Option<String>,
    group: String,
    sender: String,
    /// Arrival offset from scenario start.
    #[serde(default)]
    at_ms: u64,
    #[serde(default = "default_duration_ms")]
    duration_ms: u64,
    #[serde(default)]
    real_time: bool,
}

fn default_duration_ms() -> u64 {
    500
}

impl Scenario {
    fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read scenario {:?}", path))?;
        toml::from_str(&raw).with_context(|| format!("parse scenario {:?}", path))
    }
}

/// A scenario message with its id resolved.
struct TimedMessage {
    id: String,
    group: GroupId,
    sender: SenderId,
    at_ms: u64,
    duration_ms: u64,
    real_time: bool,
}

impl From<ScenarioMessage> for TimedMessage {
    fn from(m: ScenarioMessage) -> Self {
        Self {
            id: m.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            group: GroupId::from(m.group),
            sender: SenderId::from(m.sender),
            at_ms: m.at_ms,
            duration_ms: m.duration_ms,
            real_time: m.real_time,
        }
    }
}

struct LoggingReceipts;

impl ReadReceipts for LoggingReceipts {
    fn mark_read(&self, message_id: &MessageId) {
        info!(%message_id, "marked read");
    }
}

/// Pretend audio backend: one playback at a time, `duration_ms` long.
///
/// Exits when the command channel disconnects.
fn run_backend(
    rx: Receiver<AudioCommand>,
    durations: HashMap<String, u64>,
    scheduler: Arc<Scheduler>,
) {
    let mut current: Option<(MessageId, Instant)> = None;
    loop {
        let timeout = match &current {
            Some((_, deadline)) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(50),
        };
        match rx.recv_timeout(timeout) {
            Ok(AudioCommand::Play { message_id, .. }) => {
                let duration_ms = durations
                    .get(message_id.as_str())
                    .copied()
                    .unwrap_or_else(default_duration_ms);
                current = Some((
                    message_id,
                    Instant::now() + Duration::from_millis(duration_ms),
                ));
            }
            Ok(AudioCommand::Cancel { message_id }) => {
                if current.as_ref().is_some_and(|(id, _)| *id == message_id) {
                    current = None;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some((id, deadline)) = current.take() {
                    if Instant::now() >= deadline {
                        scheduler.playback_finished(&id);
                    } else {
                        current = Some((id, deadline));
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let scenario = Scenario::load(&args.scenario)?;
    let config = match &args.config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };

    let mut messages: Vec<TimedMessage> =
        scenario.messages.into_iter().map(TimedMessage::from).collect();
    messages.sort_by_key(|m| m.at_ms);

    let (cmd_tx, cmd_rx) = unbounded();
    let transport = Arc::new(ChannelAudioTransport::new(cmd_tx, |message_id| {
        Some(PlaybackLocation::new(format!("sim://{message_id}")))
    }));
    let scheduler = Arc::new(Scheduler::new(config, transport, Arc::new(LoggingReceipts))?);

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "scheduler event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => return,
            }
        }
    });

    let durations: HashMap<String, u64> = messages
        .iter()
        .map(|m| (m.id.clone(), m.duration_ms))
        .collect();
    let backend_scheduler = scheduler.clone();
    thread::spawn(move || run_backend(cmd_rx, durations, backend_scheduler));

    let groups: BTreeSet<GroupId> = messages.iter().map(|m| m.group.clone()).collect();
    let budget_ms = messages.last().map(|m| m.at_ms).unwrap_or(0)
        + messages.iter().map(|m| m.duration_ms).sum::<u64>()
        + 2_000;

    info!(messages = messages.len(), groups = groups.len(), "scenario loaded");
    let start = Instant::now();
    for message in &messages {
        let target = start + Duration::from_millis(message.at_ms);
        let now = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }
        let accepted = scheduler.add_message(
            MessageSubmission {
                message_id: MessageId::from(message.id.as_str()),
                sender_id: message.sender.clone(),
                from_local_user: false,
                already_read: false,
                real_time: message.real_time,
            },
            &message.group,
        );
        if !accepted {
            warn!(message_id = %message.id, "submission rejected");
        }
    }

    let deadline = start + Duration::from_millis(budget_ms);
    loop {
        let idle = groups.iter().all(|group| {
            let status = scheduler.queue_status(group);
            !status.is_processing && status.pending_count == 0
        });
        if idle {
            break;
        }
        if Instant::now() >= deadline {
            warn!("scenario did not drain before the deadline");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("{}", serde_json::to_string_pretty(&scheduler.metrics())?);
    Ok(())
}
