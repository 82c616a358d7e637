use crate::error::{Result, ScanError};
use crate::sample::Modality;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events emitted while a scan is recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanEvent {
    /// A scan started recording into a project
    RecordingStarted {
        scan_id: String,
        timestamp: SystemTime,
    },
    /// A chunk flush finished, successfully or not
    ChunkWritten {
        modality: Modality,
        file_name: String,
        frames: u64,
        ok: bool,
    },
    /// A writer refused a sample for this tick
    SampleDropped { modality: Modality, tick: u64 },
    /// The current recording buffer was busy, points of this tick were not recorded
    PointsSkipped { tick: u64, candidates: usize },
    /// All live writers were rotated out for flushing
    RotationStarted { tick: u64, writers: usize },
    /// Memory guard tripped, the recording should stop
    MemoryPressure { ratio: f64 },
    /// Recording stopped; chunk writes may still be outstanding
    RecordingStopped {
        ticks: u64,
        timestamp: SystemTime,
    },
}

impl ScanEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            ScanEvent::RecordingStarted { scan_id, .. } => {
                format!("Recording started: {}", scan_id)
            }
            ScanEvent::ChunkWritten {
                modality,
                file_name,
                frames,
                ok,
            } => {
                if *ok {
                    format!("{} chunk written: {} ({} frames)", modality, file_name, frames)
                } else {
                    format!("{} chunk failed: {}", modality, file_name)
                }
            }
            ScanEvent::SampleDropped { modality, tick } => {
                format!("{} sample dropped at tick {}", modality, tick)
            }
            ScanEvent::PointsSkipped { tick, candidates } => {
                format!("Skipped {} point candidates at tick {}", candidates, tick)
            }
            ScanEvent::RotationStarted { tick, writers } => {
                format!("Rotating {} writers at tick {}", writers, tick)
            }
            ScanEvent::MemoryPressure { ratio } => {
                format!("Memory pressure at {:.0}%", ratio * 100.0)
            }
            ScanEvent::RecordingStopped { ticks, .. } => {
                format!("Recording stopped after {} ticks", ticks)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            ScanEvent::RecordingStarted { .. } => "recording_started",
            ScanEvent::ChunkWritten { .. } => "chunk_written",
            ScanEvent::SampleDropped { .. } => "sample_dropped",
            ScanEvent::PointsSkipped { .. } => "points_skipped",
            ScanEvent::RotationStarted { .. } => "rotation_started",
            ScanEvent::MemoryPressure { .. } => "memory_pressure",
            ScanEvent::RecordingStopped { .. } => "recording_stopped",
        }
    }
}

/// Event bus for recorder observers using broadcast channels
///
/// Publishing never blocks and never fails the publisher; it is called from
/// the capture thread and from blocking flush tasks alike.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ScanEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, returning how many received it
    pub fn publish(&self, event: ScanEvent) -> usize {
        match &event {
            ScanEvent::RecordingStarted { scan_id, .. } => {
                info!("Recording started: {}", scan_id);
            }
            ScanEvent::ChunkWritten {
                ok: false,
                file_name,
                ..
            } => {
                error!("Chunk write failed: {}", file_name);
            }
            ScanEvent::MemoryPressure { ratio } => {
                warn!("Memory pressure at {:.0}%, stopping recording", ratio * 100.0);
            }
            ScanEvent::RecordingStopped { ticks, .. } => {
                info!("Recording stopped after {} ticks", ticks);
            }
            _ => {
                debug!("Event: {}", event.description());
            }
        }

        // No subscribers is not an error for the recorder
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Event filter for selective event handling
#[derive(Debug, Clone)]
pub enum EventFilter {
    /// Accept all events
    All,
    /// Accept only specific event types
    EventTypes(Vec<&'static str>),
}

impl EventFilter {
    /// Check if an event passes this filter
    pub fn matches(&self, event: &ScanEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::EventTypes(types) => types.contains(&event.event_type()),
        }
    }
}

/// Event receiver with filtering
pub struct EventReceiver {
    receiver: broadcast::Receiver<ScanEvent>,
    filter: EventFilter,
    name: String,
}

impl EventReceiver {
    pub fn new(receiver: broadcast::Receiver<ScanEvent>, filter: EventFilter, name: String) -> Self {
        Self {
            receiver,
            filter,
            name,
        }
    }

    /// Receive the next filtered event, skipping over lag
    pub async fn recv(&mut self) -> Result<ScanEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed for receiver '{}'", self.name);
                    return Err(ScanError::ChannelClosed);
                }
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<ScanEvent>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!("Receiver '{}' lagged behind by {} events", self.name, n);
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(ScanError::ChannelClosed);
                }
            }
        }
    }
}
