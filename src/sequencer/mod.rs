mod collaborators;
mod core;
mod progress;
mod slot;

pub use collaborators::{MemoryBudget, MemoryPressure, ProgressSink, WorldSnapshotProvider};
pub use self::core::{FrameSequencer, SequencerStats, TickOutcome, TickReport};
pub use progress::{FlushStats, FlushTracker};
pub use slot::WriterSlot;
