//! Core event bus for the Rivulet worker.
//!
//! The bus provides a typed event enum, sequential identifiers, and support
//! for replaying recent events when subscribers attach late (e.g. the gateway
//! link re-synchronising task state after a reconnect). Internally it uses
//! `tokio::broadcast` with a bounded buffer; when the channel overflows, the
//! oldest events are dropped, matching the desired backpressure behaviour:
//! progress reporting must never stall the download loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};

/// Identifier assigned to each event emitted by the worker.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Lifecycle states of a download/transcode task.
///
/// Transitions are monotone along
/// `pending → downloading → completed → transcoding → ready`, with two
/// sanctioned exceptions: `paused → downloading` (resume) and any state →
/// `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Completed,
    Transcoding,
    Ready,
    Error,
    Paused,
}

impl TaskStatus {
    /// Wire representation, shared with the persistence layer.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Transcoding => "transcoding",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }

    /// Parse the wire representation back into a status.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "transcoding" => Some(Self::Transcoding),
            "ready" => Some(Self::Ready),
            "error" => Some(Self::Error),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    /// Whether a task in this state counts toward the download admission cap.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading | Self::Transcoding)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Individual file discovered within a torrent's metadata.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct InventoryFile {
    pub name: String,
    pub size_bytes: u64,
    pub path: String,
    pub selected: bool,
}

/// Typed domain events surfaced across the worker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskQueued {
        task_id: String,
        magnet_uri: String,
    },
    MetadataResolved {
        task_id: String,
        name: String,
        total_bytes: u64,
        files: Vec<InventoryFile>,
    },
    Progress {
        task_id: String,
        progress: u8,
        speed_bps: u64,
        bytes_downloaded: u64,
    },
    StatusChanged {
        task_id: String,
        status: TaskStatus,
    },
    TranscodeStarted {
        task_id: String,
        input: String,
    },
    TranscodeFinished {
        task_id: String,
        playlist: String,
        segment_count: usize,
        subtitle_count: usize,
    },
    TaskFailed {
        task_id: String,
        message: String,
    },
}

impl Event {
    /// Machine-friendly discriminator for log lines and wire consumers.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskQueued { .. } => "task_queued",
            Event::MetadataResolved { .. } => "metadata_resolved",
            Event::Progress { .. } => "progress",
            Event::StatusChanged { .. } => "status_changed",
            Event::TranscodeStarted { .. } => "transcode_started",
            Event::TranscodeFinished { .. } => "transcode_finished",
            Event::TaskFailed { .. } => "task_failed",
        }
    }

    /// Task the event concerns.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Event::TaskQueued { task_id, .. }
            | Event::MetadataResolved { task_id, .. }
            | Event::Progress { task_id, .. }
            | Event::StatusChanged { task_id, .. }
            | Event::TranscodeStarted { task_id, .. }
            | Event::TranscodeFinished { task_id, .. }
            | Event::TaskFailed { task_id, .. } => task_id,
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, ensuring dropped events impact both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.buffer.lock().expect("event buffer mutex poisoned");
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.buffer.lock().expect("event buffer mutex poisoned");
            for item in buffer.iter() {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Returns the last assigned identifier, if any events have been published.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.buffer.lock().expect("event buffer mutex poisoned");
        buffer.back().map(|event| event.id)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from
/// the live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::task;
    use tokio::time::timeout;

    const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

    fn sample_progress_event(id: usize) -> Event {
        Event::Progress {
            task_id: format!("task_{id}"),
            progress: (id % 100) as u8,
            speed_bps: 1_024,
            bytes_downloaded: (id * 1_000) as u64,
        }
    }

    #[test]
    fn status_round_trips_through_wire_form() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Downloading,
            TaskStatus::Completed,
            TaskStatus::Transcoding,
            TaskStatus::Ready,
            TaskStatus::Error,
            TaskStatus::Paused,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("seeding"), None);
    }

    #[test]
    fn active_statuses_gate_admission() {
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Downloading.is_active());
        assert!(TaskStatus::Transcoding.is_active());
        assert!(!TaskStatus::Completed.is_active());
        assert!(!TaskStatus::Ready.is_active());
        assert!(!TaskStatus::Paused.is_active());
        assert!(!TaskStatus::Error.is_active());
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_progress_event(i));
        }
        assert_eq!(last_id, 5);

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(event) = stream.next().await {
                received.push(event);
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().unwrap().id, 3);
        assert_eq!(received.last().unwrap().id, 5);
    }

    #[tokio::test]
    async fn load_test_does_not_stall_publishers() {
        let bus = Arc::new(EventBus::with_capacity(512));
        let mut stream = bus.subscribe(None);

        let publisher = {
            let bus = bus.clone();
            task::spawn(async move {
                for i in 0..500 {
                    let publish_bus = bus.clone();
                    timeout(PUBLISH_TIMEOUT, async move {
                        let _ = publish_bus.publish(sample_progress_event(i));
                    })
                    .await
                    .expect("publish timed out");
                }
            })
        };

        let consumer = task::spawn(async move {
            let mut ids = HashSet::new();
            while ids.len() < 500 {
                if let Some(event) = stream.next().await {
                    ids.insert(event.id);
                }
            }
            ids
        });

        publisher.await.expect("publisher task panicked");
        let ids = consumer.await.expect("consumer task panicked");
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn event_serialization_is_snake_cased() {
        let event = Event::StatusChanged {
            task_id: "task_1".into(),
            status: TaskStatus::Downloading,
        };
        let value = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(value["type"], "status_changed");
        assert_eq!(value["status"], "downloading");
    }
}
