use crate::config::RecordingConfig;
use crate::error::{Result, ScanError};
use crate::sample::{PlaneSample, SampleFormat};
use crate::sequence::container::ContainerWriter;
use crate::sequence::meta::SequenceMetaInfo;
use crate::sequence::writer::{write_atomically, SequenceWriter};
use crate::stage::{Stage, StageCell};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use image::codecs::jpeg::JpegEncoder;
use image::ColorType;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// JPEG settings of the RGB writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Encoder threads per writer
    pub workers: usize,
    /// Frames allowed to wait for an encoder before appends are refused
    pub backlog: usize,
}

impl From<&RecordingConfig> for EncodeOptions {
    fn from(recording: &RecordingConfig) -> Self {
        Self {
            quality: recording.rgb_quality,
            workers: recording.rgb_encode_workers,
            backlog: recording.rgb_encode_backlog,
        }
    }
}

struct EncodeJob {
    index: u64,
    plane: PlaneSample,
}

/// State shared between the writer and its encoder threads
#[derive(Default)]
struct EncodedFrames {
    /// JPEG bytes by frame index
    frames: Mutex<Vec<Option<Vec<u8>>>>,
    failures: Mutex<Vec<String>>,
    /// Raw bytes of frames still waiting for an encoder
    queued_bytes: AtomicU64,
    encoded_bytes: AtomicU64,
}

impl EncodedFrames {
    fn held_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::Acquire) + self.encoded_bytes.load(Ordering::Acquire)
    }

    fn store(&self, index: u64, jpeg: Vec<u8>) {
        let index = index as usize;
        let mut frames = self.frames.lock();
        if frames.len() <= index {
            frames.resize(index + 1, None);
        }
        frames[index] = Some(jpeg);
    }
}

fn encode_loop(jobs: Receiver<EncodeJob>, shared: Arc<EncodedFrames>, quality: u8) {
    for job in jobs.iter() {
        let raw = job.plane.frame_size() as u64;
        let mut jpeg = Vec::new();
        let result = JpegEncoder::new_with_quality(&mut jpeg, quality).encode(
            &job.plane.packed_rows(),
            job.plane.width,
            job.plane.height,
            ColorType::Rgb8,
        );
        drop(job.plane);

        match result {
            Ok(()) => {
                shared
                    .encoded_bytes
                    .fetch_add(jpeg.len() as u64, Ordering::AcqRel);
                shared.store(job.index, jpeg);
            }
            Err(e) => {
                warn!("Failed to encode rgb frame {}: {}", job.index, e);
                shared.failures.lock().push(format!("frame {}: {}", job.index, e));
            }
        }
        shared.queued_bytes.fetch_sub(raw, Ordering::AcqRel);
    }
}

/// Encodes RGB frames to JPEG as they arrive and writes them as one image chunk container
///
/// Accepted planes go through a bounded queue to a few encoder threads, so
/// the writer holds at most `backlog` raw frames plus the encoded JPEGs.
/// A full queue refuses the frame instead of stalling the capture thread.
pub struct FrameImageWriter {
    meta: SequenceMetaInfo,
    stage: StageCell,
    bytes_per_row: usize,
    frames: u64,
    jobs: Option<Sender<EncodeJob>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<EncodedFrames>,
    /// Bytes reported to the memory budget, refreshed on every accepted append
    held: u64,
}

impl FrameImageWriter {
    /// Create a writer shaped after the first sample it will receive
    pub fn for_sample(
        mut meta: SequenceMetaInfo,
        first: &PlaneSample,
        options: EncodeOptions,
    ) -> Result<Self> {
        if first.format != SampleFormat::Rgb8 {
            return Err(ScanError::component(
                "rgb writer",
                format!("expected Rgb8 frames, got {:?}", first.format),
            ));
        }
        if !first.validate_size() {
            return Err(ScanError::component(
                "rgb writer",
                format!("frame buffer too small for {}", first.resolution()),
            ));
        }

        meta.latch_resolution(first.resolution());

        let (sender, receiver) = channel::bounded(options.backlog.max(1));
        let shared = Arc::new(EncodedFrames::default());
        let quality = options.quality.clamp(1, 100);
        let mut workers = Vec::with_capacity(options.workers.max(1));
        for i in 0..options.workers.max(1) {
            let jobs = receiver.clone();
            let shared = shared.clone();
            let worker = thread::Builder::new()
                .name(format!("rgb-encode-{}", i))
                .spawn(move || encode_loop(jobs, shared, quality))?;
            workers.push(worker);
        }

        debug!(
            "Started {} encoders for {}",
            workers.len(),
            meta.file_name()
        );

        Ok(Self {
            meta,
            stage: StageCell::new(),
            bytes_per_row: first.bytes_per_row,
            frames: 0,
            jobs: Some(sender),
            workers,
            shared,
            held: 0,
        })
    }

    /// Wait for the encoders and take the JPEG frames in order
    fn finish_encoding(&mut self) -> Result<Vec<Vec<u8>>> {
        self.jobs = None;
        for worker in self.workers.drain(..) {
            worker
                .join()
                .map_err(|_| ScanError::component("rgb writer", "encoder thread panicked"))?;
        }

        let failures = std::mem::take(&mut *self.shared.failures.lock());
        if let Some(first) = failures.first() {
            return Err(ScanError::component(
                "rgb writer",
                format!("{} frames failed to encode ({})", failures.len(), first),
            ));
        }

        let encoded = std::mem::take(&mut *self.shared.frames.lock());
        if encoded.len() as u64 != self.frames {
            return Err(ScanError::component(
                "rgb writer",
                format!("encoded {} of {} frames", encoded.len(), self.frames),
            ));
        }

        encoded
            .into_iter()
            .enumerate()
            .map(|(index, jpeg)| {
                jpeg.ok_or_else(|| {
                    ScanError::component("rgb writer", format!("frame {} was never encoded", index))
                })
            })
            .collect()
    }
}

impl SequenceWriter for FrameImageWriter {
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

        if plane.format != SampleFormat::Rgb8
            || plane.bytes_per_row != self.bytes_per_row
            || !plane.validate_size()
            || !self.meta.latch_resolution(plane.resolution())
        {
            debug!(
                "Rejected {} frame {} for {}",
                plane.resolution(),
                self.frames,
                self.meta.file_name()
            );
            return false;
        }

        let jobs = match &self.jobs {
            Some(jobs) => jobs,
            None => return false,
        };

        let raw = plane.frame_size() as u64;
        self.shared.queued_bytes.fetch_add(raw, Ordering::AcqRel);
        let job = EncodeJob {
            index: self.frames,
            plane,
        };
        match jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.queued_bytes.fetch_sub(raw, Ordering::AcqRel);
                debug!(
                    "Encoder backlog of {} is full, refusing frame {}",
                    self.meta.file_name(),
                    self.frames
                );
                return false;
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.queued_bytes.fetch_sub(raw, Ordering::AcqRel);
                warn!("Encoders of {} are gone", self.meta.file_name());
                return false;
            }
        }

        self.frames += 1;
        self.held = self.shared.held_bytes();
        true
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn buffered_bytes(&self) -> u64 {
        self.held
    }

    fn seal(&mut self) {
        if self.stage.try_begin_write() {
            // Encoders drain what is queued, then exit
            self.jobs = None;
        }
    }

    fn write_chunk(&mut self, path: &Path) -> Result<u64> {
        let resolution = self
            .meta
            .resolution()
            .ok_or_else(|| ScanError::component("rgb writer", "resolution never latched"))?;
        let frame_duration = self.meta.frame_duration();
        let rate = self.meta.rate();
        let frames = self.finish_encoding()?;

        write_atomically(path, |out| {
            let mut container =
                ContainerWriter::new(out, resolution.width, resolution.height, rate)?;
            for (index, jpeg) in frames.iter().enumerate() {
                container.append(frame_duration * index as u32, jpeg)?;
            }
            container.finish()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Modality;
    use crate::sequence::container::ContainerReader;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn rgb_plane(width: u32, height: u32, shade: u8) -> PlaneSample {
        PlaneSample::new(
            vec![shade; (width * height * 3) as usize],
            width,
            height,
            SampleFormat::Rgb8,
        )
    }

    fn options(backlog: usize) -> EncodeOptions {
        EncodeOptions {
            quality: 80,
            workers: 2,
            backlog,
        }
    }

    fn writer(dir: &Path) -> FrameImageWriter {
        let meta = SequenceMetaInfo::new(Modality::Rgb, "mjpeg", 30, dir);
        FrameImageWriter::for_sample(meta, &rgb_plane(16, 8, 0), options(8)).unwrap()
    }

    /// Wait until the encoders emptied the queue
    fn wait_for_encoders(writer: &FrameImageWriter) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while writer.shared.queued_bytes.load(Ordering::Acquire) > 0 {
            assert!(Instant::now() < deadline, "encoders did not catch up");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_rejects_wrong_format_up_front() {
        let meta = SequenceMetaInfo::new(Modality::Rgb, "mjpeg", 30, ".");
        let depth = PlaneSample::new(vec![0u8; 16 * 8 * 4], 16, 8, SampleFormat::Depth32F);
        assert!(FrameImageWriter::for_sample(meta, &depth, options(8)).is_err());
    }

    #[test]
    fn test_append_and_locations() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = writer(temp_dir.path());
        assert!(writer.last_location().is_none());

        assert!(writer.append(rgb_plane(16, 8, 10)));
        assert!(writer.append(rgb_plane(16, 8, 20)));
        assert!(!writer.append(rgb_plane(32, 8, 30)));

        let location = writer.last_location().unwrap();
        assert_eq!(location.frame, 1);
        assert_eq!(location.file_name, writer.meta().file_name());
        assert!(writer.buffered_bytes() > 0);
    }

    #[test]
    fn test_held_bytes_shrink_to_encoded_size() {
        let temp_dir = TempDir::new().unwrap();
        let meta = SequenceMetaInfo::new(Modality::Rgb, "mjpeg", 30, temp_dir.path());
        let mut writer =
            FrameImageWriter::for_sample(meta, &rgb_plane(64, 48, 0), options(8)).unwrap();
        let raw = 64 * 48 * 3u64;

        assert!(writer.append(rgb_plane(64, 48, 200)));
        wait_for_encoders(&writer);
        assert!(writer.append(rgb_plane(64, 48, 100)));
        wait_for_encoders(&writer);
        assert!(writer.append(rgb_plane(64, 48, 50)));

        // Two frames are JPEGs by now, only the last may still be raw
        assert!(writer.buffered_bytes() < 2 * raw);
        assert_eq!(writer.frames_written(), 3);
    }

    #[test]
    fn test_full_backlog_refuses_frames() {
        let temp_dir = TempDir::new().unwrap();
        let meta = SequenceMetaInfo::new(Modality::Rgb, "mjpeg", 30, temp_dir.path());
        let plane = rgb_plane(640, 480, 7);
        let mut writer = FrameImageWriter::for_sample(
            meta,
            &plane,
            EncodeOptions {
                quality: 80,
                workers: 1,
                backlog: 2,
            },
        )
        .unwrap();

        let accepted = (0..64).filter(|_| writer.append(plane.clone())).count();
        assert!(accepted >= 2);
        assert!(accepted < 64);
        assert_eq!(writer.frames_written(), accepted as u64);
        // At most the queue plus the frame being encoded is raw
        assert!(writer.buffered_bytes() < 4 * plane.frame_size() as u64);

        writer.seal();
        let path = writer.meta().full_path();
        writer.write_chunk(&path).unwrap();
        let reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.header().frame_count as usize, accepted);
    }

    #[test]
    fn test_sealed_writer_refuses_appends() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = writer(temp_dir.path());
        assert!(writer.append(rgb_plane(16, 8, 1)));

        writer.seal();
        assert!(writer.is_writing());
        assert!(!writer.append(rgb_plane(16, 8, 2)));
        assert_eq!(writer.frames_written(), 1);
    }

    #[test]
    fn test_chunk_decodes_back() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = writer(temp_dir.path());
        for shade in [0u8, 128, 255] {
            assert!(writer.append(rgb_plane(16, 8, shade)));
        }
        writer.seal();

        let path = writer.meta().full_path();
        let written = writer.write_chunk(&path).unwrap();
        assert_eq!(written, std::fs::metadata(&path).unwrap().len());

        let mut reader = ContainerReader::open(&path).unwrap();
        assert_eq!(reader.header().frame_count, 3);
        assert_eq!(reader.header().rate, 30);

        let frames = reader.read_all().unwrap();
        let decoded =
            image::load_from_memory_with_format(&frames[2].data, image::ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
        assert!(frames[1].presentation_time > frames[0].presentation_time);

        // Frames keep their append order across encoder threads
        let first = image::load_from_memory(&frames[0].data).unwrap().to_rgb8();
        let last = image::load_from_memory(&frames[2].data).unwrap().to_rgb8();
        assert!(first.get_pixel(0, 0)[0] < 20);
        assert!(last.get_pixel(0, 0)[0] > 235);
    }
}
