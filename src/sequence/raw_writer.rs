use crate::error::{Result, ScanError};
use crate::sample::{PlaneSample, SampleFormat};
use crate::sequence::meta::SequenceMetaInfo;
use crate::sequence::writer::{write_atomically, SequenceWriter};
use crate::stage::{Stage, StageCell};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Buffers depth or confidence planes and writes them back to back
///
/// Each frame occupies `bytes_per_row * height` bytes; the chunk has no header.
pub struct RawSampleWriter {
    meta: SequenceMetaInfo,
    stage: StageCell,
    format: SampleFormat,
    bytes_per_row: usize,
    frames: Vec<PlaneSample>,
}

impl RawSampleWriter {
    pub fn for_sample(mut meta: SequenceMetaInfo, first: &PlaneSample) -> Result<Self> {
        if !first.validate_size() {
            return Err(ScanError::component(
                format!("{} writer", meta.prefix()),
                format!(
                    "{} bytes do not cover {} at {} bytes per row",
                    first.data.len(),
                    first.resolution(),
                    first.bytes_per_row
                ),
            ));
        }

        meta.latch_resolution(first.resolution());
        Ok(Self {
            meta,
            stage: StageCell::new(),
            format: first.format,
            bytes_per_row: first.bytes_per_row,
            frames: Vec::new(),
        })
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Bytes per frame in the chunk
    pub fn frame_size(&self) -> usize {
        let height = self.meta.resolution().map(|r| r.height).unwrap_or_default();
        self.bytes_per_row * height as usize
    }
}

impl SequenceWriter for RawSampleWriter {
    type Sample = PlaneSample;

    fn meta(&self) -> &SequenceMetaInfo {
        &self.meta
    }

    fn stage(&self) -> Stage {
        self.stage.get()
    }

    fn append(&mut self, plane: PlaneSample) -> bool {
        if !self.stage.is(Stage::Ready) {
            return false;
        }

        if plane.format != self.format
            || plane.bytes_per_row != self.bytes_per_row
            || !plane.validate_size()
            || !self.meta.latch_resolution(plane.resolution())
        {
            debug!(
                "Rejected {} {:?} plane for {}",
                plane.resolution(),
                plane.format,
                self.meta.file_name()
            );
            return false;
        }

        self.frames.push(plane);
        true
    }

    fn frames_written(&self) -> u64 {
        self.frames.len() as u64
    }

    fn buffered_bytes(&self) -> u64 {
        (self.frames.len() * self.frame_size()) as u64
    }

    fn seal(&mut self) {
        self.stage.try_begin_write();
    }

    fn write_chunk(&mut self, path: &Path) -> Result<u64> {
        let frame_size = self.frame_size();
        let frames = &self.frames;
        write_atomically(path, |out| {
            for plane in frames {
                out.write_all(&plane.data[..frame_size])?;
            }
            Ok(())
        })
    }
}

/// Random access to the frames of a raw chunk
pub struct RawChunkReader {
    file: File,
    frame_size: usize,
    frame_count: u64,
}

impl RawChunkReader {
    pub fn open<P: AsRef<Path>>(path: P, frame_size: usize) -> Result<Self> {
        let path = path.as_ref();
        if frame_size == 0 {
            return Err(ScanError::chunk_format(
                path.display().to_string(),
                "frame size must be positive",
            ));
        }

        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len % frame_size as u64 != 0 {
            return Err(ScanError::chunk_format(
                path.display().to_string(),
                format!("{} bytes is not a multiple of {}", len, frame_size),
            ));
        }

        Ok(Self {
            file,
            frame_size,
            frame_count: len / frame_size as u64,
        })
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Read frame `index`, None when out of range
    pub fn read_frame(&mut self, index: u64) -> Result<Option<Vec<u8>>> {
        if index >= self.frame_count {
            return Ok(None);
        }
        self.file
            .seek(SeekFrom::Start(index * self.frame_size as u64))?;
        let mut frame = vec![0u8; self.frame_size];
        self.file.read_exact(&mut frame)?;
        Ok(Some(frame))
    }
}
