//! Event types for the keyflow event system
//!
//! The pipeline publishes lifecycle changes and timeline snapshots on an
//! [`EventBus`]; the playback/render layer subscribes to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One note block of a timeline snapshot
///
/// `duration` is `None` while the note is still open (in progress); the
/// renderer draws it up to the current `notes_total_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteBlock {
    /// MIDI pitch
    pub pitch: u8,

    /// Normalized velocity (0.0-1.0)
    pub velocity: f32,

    /// Virtual start time (seconds)
    pub start_time: f64,

    /// Length in seconds, `None` for open notes
    pub duration: Option<f64>,

    /// CSS color assigned when the note opened
    pub color: String,
}

impl NoteBlock {
    pub fn is_complete(&self) -> bool {
        self.duration.is_some()
    }
}

/// Why a generation run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` / `cancel()` requested by the host
    Cancelled,

    /// Model emitted the pad token mid-stream
    DecodeFault,

    /// Model collaborator returned an error
    ModelError(String),

    /// Event receiver was dropped
    ConsumerGone,
}

/// keyflow event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GenerationEvent {
    /// Tokenizer, vocabulary and model are being loaded
    Loading {
        timestamp: DateTime<Utc>,
    },

    /// Resources loaded, generation can start
    Loaded {
        timestamp: DateTime<Utc>,
    },

    /// A generation run entered Running
    RunStarted {
        run_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A generation run returned to Idle
    RunStopped {
        run_id: Uuid,
        reason: StopReason,
        timestamp: DateTime<Utc>,
    },

    /// Timeline snapshot (completed notes first, then open notes)
    Notes {
        notes: Vec<NoteBlock>,
        notes_total_time: f64,
        prompt_end_time: f64,
        timestamp: DateTime<Utc>,
    },
}

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use keyflow_common::events::{EventBus, GenerationEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(GenerationEvent::Loaded {
///     timestamp: chrono::Utc::now(),
/// });
/// assert!(matches!(rx.try_recv(), Ok(GenerationEvent::Loaded { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GenerationEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before lagging subscribers lose old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: GenerationEvent,
    ) -> Result<usize, broadcast::error::SendError<GenerationEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: GenerationEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
