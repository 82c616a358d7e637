pub mod buffer;
pub mod las_chunk;
pub mod manager;

pub use buffer::{PointBuffer, PointRing};
pub use las_chunk::write_las_chunk;
pub use manager::{PointStatsSnapshot, PointsOutcome, RecordingBufferManager};
