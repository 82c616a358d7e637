use crate::error::Result;
use crate::manifest::{FrameCollection, FrameInfo, MarkerCode};
use crate::sequence::meta::SequenceMetaInfo;
use crate::sequence::writer::{write_atomically, SequenceWriter};
use crate::stage::{Stage, StageCell};
use std::path::Path;

/// Rough in-memory cost of one manifest entry
const FRAME_INFO_BYTES: u64 = std::mem::size_of::<FrameInfo>() as u64 + 96;

/// Collects the FrameInfo entries of one chunk interval and writes them as JSON
pub struct ManifestWriter {
    meta: SequenceMetaInfo,
    stage: StageCell,
    collection: FrameCollection,
}

impl ManifestWriter {
    pub fn new(meta: SequenceMetaInfo) -> Self {
        Self {
            meta,
            stage: StageCell::new(),
            collection: FrameCollection::default(),
        }
    }

    /// Attach the world snapshot taken at rotation; ignored once writing
    pub fn attach_world_snapshot(&mut self, snapshot: serde_json::Value) -> bool {
        if !self.stage.is(Stage::Ready) {
            return false;
        }
        self.collection.world_map = Some(snapshot);
        true
    }

    /// Replace the marker list carried by this chunk
    pub fn set_markers(&mut self, markers: &[MarkerCode]) {
        if self.stage.is(Stage::Ready) && !markers.is_empty() {
            self.collection.qr_codes = Some(markers.to_vec());
        }
    }

    pub fn collection(&self) -> &FrameCollection {
        &self.collection
    }
}

impl SequenceWriter for ManifestWriter {
    type Sample = FrameInfo;

    fn meta(&self) -> &SequenceMetaInfo {
        &self.meta
    }

    fn stage(&self) -> Stage {
        self.stage.get()
    }

    fn append(&mut self, info: FrameInfo) -> bool {
        if !self.stage.is(Stage::Ready) {
            return false;
        }
        self.collection.frames.push(info);
        true
    }

    fn frames_written(&self) -> u64 {
        self.collection.frames.len() as u64
    }

    fn buffered_bytes(&self) -> u64 {
        self.frames_written() * FRAME_INFO_BYTES
    }

    fn seal(&mut self) {
        self.stage.try_begin_write();
    }

    fn write_chunk(&mut self, path: &Path) -> Result<u64> {
        let collection = &self.collection;
        write_atomically(path, |out| {
            serde_json::to_writer_pretty(out, collection)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{CameraPose, Modality};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tempfile::TempDir;

    fn info() -> FrameInfo {
        FrameInfo::new(SystemTime::now(), &CameraPose::default())
    }

    #[test]
    fn test_written_manifest_loads_back() {
        let temp_dir = TempDir::new().unwrap();
        let meta = SequenceMetaInfo::new(Modality::Manifest, "json", 60, temp_dir.path());
        let mut writer = ManifestWriter::new(meta);

        for _ in 0..4 {
            assert!(writer.append(info()));
        }
        writer.set_markers(&[MarkerCode::new([0.0, 1.0, 2.0], "shelf")]);
        assert!(writer.attach_world_snapshot(serde_json::json!({ "features": 12 })));
        assert_eq!(writer.last_location(), None);

        writer.seal();
        assert!(!writer.append(info()));
        assert!(!writer.attach_world_snapshot(serde_json::json!(null)));

        let path = writer.meta().full_path();
        writer.write_chunk(&path).unwrap();

        let loaded = FrameCollection::load(&path).unwrap();
        assert_eq!(&loaded, writer.collection());
        assert_eq!(loaded.frames.len(), 4);
        assert_eq!(loaded.qr_codes.unwrap()[0].message, "shelf");
    }

    #[test]
    fn test_sub_second_timestamps_survive_disk() {
        let temp_dir = TempDir::new().unwrap();
        let meta = SequenceMetaInfo::new(Modality::Manifest, "json", 60, temp_dir.path());
        let mut writer = ManifestWriter::new(meta);

        let start = UNIX_EPOCH + Duration::new(1_760_000_000, 123_456_789);
        for i in 0..6_000u32 {
            let at = start + Duration::from_nanos(16_666_667) * i;
            assert!(writer.append(FrameInfo::new(at, &CameraPose::default())));
        }

        writer.seal();
        let path = writer.meta().full_path();
        writer.write_chunk(&path).unwrap();

        let loaded = FrameCollection::load(&path).unwrap();
        assert_eq!(loaded.frames.len(), 6_000);
        for (read, appended) in loaded.frames.iter().zip(&writer.collection().frames) {
            assert_eq!(read.timestamp.to_bits(), appended.timestamp.to_bits());
            assert_eq!(read, appended);
        }
    }

    #[test]
    fn test_empty_marker_list_is_not_attached() {
        let meta = SequenceMetaInfo::new(Modality::Manifest, "json", 60, ".");
        let mut writer = ManifestWriter::new(meta);
        writer.set_markers(&[]);
        assert!(writer.collection().qr_codes.is_none());
    }
}
