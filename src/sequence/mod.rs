pub mod container;
pub mod image_writer;
pub mod manifest_writer;
pub mod meta;
pub mod raw_writer;
pub mod writer;

pub use container::{ContainerFrame, ContainerHeader, ContainerReader, ContainerWriter};
pub use image_writer::{EncodeOptions, FrameImageWriter};
pub use manifest_writer::ManifestWriter;
pub use meta::{parse_chunk_name, SequenceMetaInfo};
pub use raw_writer::{RawChunkReader, RawSampleWriter};
pub use writer::{partial_path, spawn_flush, write_atomically, ChunkReport, SequenceWriter, WriterDelegate};
