pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
pub mod points;
pub mod project;
pub mod recorder;
pub mod sample;
pub mod sequence;
pub mod sequencer;
pub mod stage;

pub use config::ScanConfig;
pub use error::{Result, ScanError};
pub use events::{EventBus, EventFilter, EventReceiver, ScanEvent};
pub use manifest::{FrameCollection, FrameInfo, FrameLocation, MarkerCode};
pub use points::{PointsOutcome, RecordingBufferManager};
pub use project::{GeoLocation, Project, ScanMetadata};
pub use recorder::ScanRecorder;
pub use sample::{
    CameraPose, Modality, PlaneSample, PointCandidate, Resolution, SampleFormat, SelectionType,
    SensorTick,
};
pub use sequence::{SequenceMetaInfo, SequenceWriter, WriterDelegate};
pub use sequencer::{
    FrameSequencer, MemoryPressure, ProgressSink, TickOutcome, WorldSnapshotProvider,
};
pub use stage::{Stage, StageCell};
