use crate::config::{OutputConfig, RecordingConfig, ScanConfig};
use crate::error::Result;
use crate::events::{EventBus, ScanEvent};
use crate::manifest::{FrameInfo, FrameLocation, MarkerSet};
use crate::points::{PointStatsSnapshot, PointsOutcome, RecordingBufferManager};
use crate::sample::{Modality, PlaneSample, SensorTick};
use crate::sequence::{
    spawn_flush, EncodeOptions, FrameImageWriter, ManifestWriter, RawSampleWriter, SequenceMetaInfo,
    SequenceWriter, WriterDelegate,
};
use crate::sequencer::collaborators::{
    MemoryBudget, MemoryPressure, ProgressSink, WorldSnapshotProvider,
};
use crate::sequencer::progress::{FlushStats, FlushTracker};
use crate::sequencer::slot::WriterSlot;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Result of feeding one tick to the sequencer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The sequencer is stopped; nothing was recorded
    Ignored,
    /// Memory guard tripped; nothing was recorded and the caller should stop
    StopRequested,
    Recorded(TickReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    /// 2D modalities that accepted a sample
    pub accepted: Vec<Modality>,
    pub points: Option<PointsOutcome>,
    /// This tick completed a chunk interval
    pub rotated: bool,
}

/// Counters of the sequencer
#[derive(Debug, Clone, Default)]
pub struct SequencerStats {
    pub ticks: u64,
    pub rotations: u64,
    pub samples_dropped: u64,
    pub markers: usize,
    pub flushes: FlushStats,
    pub points: Option<PointStatsSnapshot>,
}

enum PlaneAppend {
    /// Location of the sample plus the writer's held bytes before and after
    Accepted(FrameLocation, u64, u64),
    Refused,
    Unconfigured(String),
}

/// Drives one tick across all modality writers and the point buffers
///
/// Writers are created lazily on the first tick that carries their sample,
/// appended to once per tick and rotated out together every
/// `rate * sequence_seconds` ticks or on stop. All serialization happens on
/// the blocking pool; `tick` itself only appends and hands off.
pub struct FrameSequencer {
    recording: RecordingConfig,
    output: OutputConfig,
    directory: PathBuf,
    handle: Handle,
    events: EventBus,
    rgb: WriterSlot<FrameImageWriter>,
    depth: WriterSlot<RawSampleWriter>,
    confidence: WriterSlot<RawSampleWriter>,
    manifest: WriterSlot<ManifestWriter>,
    points: Option<RecordingBufferManager>,
    tracker: Arc<FlushTracker>,
    budget: Arc<MemoryBudget>,
    memory: Arc<dyn MemoryPressure>,
    snapshots: Option<Arc<dyn WorldSnapshotProvider>>,
    markers: MarkerSet,
    ticks: u64,
    interval_ticks: u64,
    rotations: u64,
    samples_dropped: u64,
    stopped: bool,
}

impl FrameSequencer {
    pub fn new<P: Into<PathBuf>>(
        config: &ScanConfig,
        directory: P,
        events: EventBus,
        handle: &Handle,
    ) -> Result<Self> {
        let directory = directory.into();
        let budget = Arc::new(MemoryBudget::new(
            config.system.memory_limit_bytes,
            config.system.memory_pressure_ratio,
        ));
        let tracker = Arc::new(FlushTracker::new(budget.clone(), events.clone()));

        let points = if config.recording.record_points {
            Some(RecordingBufferManager::new(
                &config.points,
                directory.clone(),
                &config.output.points_extension,
                tracker.clone(),
                handle,
            )?)
        } else {
            None
        };

        info!(
            "Created sequencer for {} ({} ticks per chunk)",
            directory.display(),
            config.recording.ticks_per_sequence()
        );

        Ok(Self {
            recording: config.recording.clone(),
            output: config.output.clone(),
            directory,
            handle: handle.clone(),
            events,
            rgb: WriterSlot::new(),
            depth: WriterSlot::new(),
            confidence: WriterSlot::new(),
            manifest: WriterSlot::new(),
            points,
            tracker,
            memory: budget.clone(),
            budget,
            snapshots: None,
            markers: MarkerSet::new(),
            ticks: 0,
            interval_ticks: 0,
            rotations: 0,
            samples_dropped: 0,
            stopped: false,
        })
    }

    /// Replace the default memory oracle (the sequencer's own byte budget)
    pub fn with_memory_pressure(mut self, memory: Arc<dyn MemoryPressure>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_world_snapshots(mut self, provider: Arc<dyn WorldSnapshotProvider>) -> Self {
        self.snapshots = Some(provider);
        self
    }

    /// Record one tick
    pub fn tick(&mut self, sample: &SensorTick) -> TickOutcome {
        if self.stopped {
            return TickOutcome::Ignored;
        }

        if self.memory.under_pressure() {
            let ratio = self.memory.ratio();
            self.events.publish(ScanEvent::MemoryPressure { ratio });
            return TickOutcome::StopRequested;
        }

        let tick = self.ticks;
        self.collect_markers(tick, sample);

        let mut info = FrameInfo::new(sample.timestamp, &sample.pose);
        let mut accepted = Vec::with_capacity(3);

        let rate = self.recording.rate;

        if self.recording.record_rgb {
            let directory = &self.directory;
            let options = EncodeOptions::from(&self.recording);
            let extension = self.output.rgb_extension.as_str();
            let outcome = append_plane(&mut self.rgb, sample.image.as_ref(), |plane| {
                let meta = SequenceMetaInfo::new(Modality::Rgb, extension, rate, directory);
                FrameImageWriter::for_sample(meta, plane, options)
            });
            self.settle_append(tick, Modality::Rgb, outcome, &mut info, &mut accepted);
        }

        if self.recording.record_depth {
            let directory = &self.directory;
            let extension = self.output.depth_extension.as_str();
            let outcome = append_plane(&mut self.depth, sample.depth.as_ref(), |plane| {
                let meta = SequenceMetaInfo::new(Modality::Depth, extension, rate, directory);
                RawSampleWriter::for_sample(meta, plane)
            });
            self.settle_append(tick, Modality::Depth, outcome, &mut info, &mut accepted);
        }

        if self.recording.record_confidence {
            let directory = &self.directory;
            let extension = self.output.confidence_extension.as_str();
            let outcome = append_plane(&mut self.confidence, sample.confidence.as_ref(), |plane| {
                let meta = SequenceMetaInfo::new(Modality::Confidence, extension, rate, directory);
                RawSampleWriter::for_sample(meta, plane)
            });
            self.settle_append(tick, Modality::Confidence, outcome, &mut info, &mut accepted);
        }

        self.append_manifest(info);

        let points = match self.points.as_mut() {
            Some(manager) if !sample.points.is_empty() => {
                let outcome = manager.process_points(tick, sample.points.clone(), true);
                if outcome == PointsOutcome::Skipped {
                    self.events.publish(ScanEvent::PointsSkipped {
                        tick,
                        candidates: sample.points.len(),
                    });
                }
                Some(outcome)
            }
            _ => None,
        };

        self.ticks += 1;
        self.interval_ticks += 1;
        let rotated = self.interval_ticks >= self.recording.ticks_per_sequence();
        if rotated {
            self.rotate();
        }

        TickOutcome::Recorded(TickReport {
            tick,
            accepted,
            points,
            rotated,
        })
    }

    /// Flush every live writer and start a new chunk interval
    ///
    /// Returns how many writers were handed to the blocking pool.
    pub fn rotate(&mut self) -> usize {
        self.interval_ticks = 0;
        let delegate: Arc<dyn WriterDelegate> = self.tracker.clone();
        let mut flushed = 0;

        if let Some(writer) = self.rgb.retire() {
            self.tracker
                .track(spawn_flush(writer, &self.handle, delegate.clone()));
            flushed += 1;
        }
        if let Some(writer) = self.depth.retire() {
            self.tracker
                .track(spawn_flush(writer, &self.handle, delegate.clone()));
            flushed += 1;
        }
        if let Some(writer) = self.confidence.retire() {
            self.tracker
                .track(spawn_flush(writer, &self.handle, delegate.clone()));
            flushed += 1;
        }
        if let Some(mut manifest) = self.manifest.retire() {
            manifest.set_markers(self.markers.codes());
            self.flush_manifest(manifest, delegate);
            flushed += 1;
        }

        if flushed > 0 {
            self.rotations += 1;
            self.events.publish(ScanEvent::RotationStarted {
                tick: self.ticks,
                writers: flushed,
            });
        }
        flushed
    }

    /// Stop recording: rotate whatever is buffered and flush the point tail
    ///
    /// Later ticks are ignored. Progress of the outstanding writes goes to
    /// `progress` as they complete.
    pub fn stop(&mut self, progress: Option<Arc<dyn ProgressSink>>) -> usize {
        if self.stopped {
            return 0;
        }
        self.stopped = true;

        let flushed = self.rotate();

        if let Some(manager) = &self.points {
            self.tracker.expect_pending();
            let queued = manager.flush_partial();
            let tracker = self.tracker.clone();
            self.tracker.track(self.handle.spawn(async move {
                let _ = queued.await;
                tracker.pending_resolved();
            }));
        }

        self.tracker.stop(progress);
        self.events.publish(ScanEvent::RecordingStopped {
            ticks: self.ticks,
            timestamp: std::time::SystemTime::now(),
        });
        flushed
    }

    /// Wait until point copy passes and every chunk write are done
    pub async fn settle(&self) {
        if let Some(manager) = &self.points {
            manager.settle().await;
        }
        self.tracker.drain().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn points(&self) -> Option<&RecordingBufferManager> {
        self.points.as_ref()
    }

    pub fn stats(&self) -> SequencerStats {
        SequencerStats {
            ticks: self.ticks,
            rotations: self.rotations,
            samples_dropped: self.samples_dropped,
            markers: self.markers.len(),
            flushes: self.tracker.stats(),
            points: self.points.as_ref().map(|p| p.stats()),
        }
    }

    fn collect_markers(&mut self, tick: u64, sample: &SensorTick) {
        if !self.recording.detect_markers
            || sample.markers.is_empty()
            || tick % self.recording.marker_interval_ticks.max(1) as u64 != 0
        {
            return;
        }
        for marker in &sample.markers {
            if self.markers.insert(marker.clone()) {
                info!(
                    "Detected marker {:?} at {:?}",
                    marker.message, marker.location
                );
            }
        }
    }

    fn settle_append(
        &mut self,
        tick: u64,
        modality: Modality,
        outcome: Option<PlaneAppend>,
        info: &mut FrameInfo,
        accepted: &mut Vec<Modality>,
    ) {
        match outcome {
            None => debug!("Tick {} carried no {} sample", tick, modality),
            Some(PlaneAppend::Accepted(location, before, after)) => {
                self.budget.adjust(before, after);
                info.set_location(modality, location);
                accepted.push(modality);
            }
            Some(PlaneAppend::Refused) => {
                warn!("A {} frame is missing in the recording (tick {})", modality, tick);
                self.samples_dropped += 1;
                self.events
                    .publish(ScanEvent::SampleDropped { modality, tick });
            }
            Some(PlaneAppend::Unconfigured(reason)) => {
                warn!("Skipping {} for tick {}: {}", modality, tick, reason);
                self.samples_dropped += 1;
                self.events
                    .publish(ScanEvent::SampleDropped { modality, tick });
            }
        }
    }

    fn append_manifest(&mut self, info: FrameInfo) {
        let (rate, directory) = (self.recording.rate, &self.directory);
        let extension = self.output.manifest_extension.as_str();
        let writer = match self.manifest.get_or_try_insert_with(|| {
            let meta = SequenceMetaInfo::new(Modality::Manifest, extension, rate, directory);
            Ok(ManifestWriter::new(meta))
        }) {
            Ok(writer) => writer,
            Err(e) => {
                error!("Failed to create manifest writer: {}", e);
                return;
            }
        };

        let before = writer.buffered_bytes();
        if writer.append(info) {
            self.budget.adjust(before, writer.buffered_bytes());
        } else {
            warn!("A frame info was refused by the manifest writer");
        }
    }

    fn flush_manifest(&self, mut manifest: ManifestWriter, delegate: Arc<dyn WriterDelegate>) {
        let provider = match (&self.snapshots, self.recording.record_world_map) {
            (Some(provider), true) => provider.clone(),
            _ => {
                self.tracker
                    .track(spawn_flush(manifest, &self.handle, delegate));
                return;
            }
        };

        // The manifest is only flushed once the snapshot arrived
        self.tracker.expect_pending();
        let tracker = self.tracker.clone();
        let handle = self.handle.clone();
        self.tracker.track(self.handle.spawn(async move {
            match provider.capture().await {
                Some(snapshot) => {
                    manifest.attach_world_snapshot(snapshot);
                }
                None => warn!(
                    "Couldn't capture world snapshot for {}",
                    manifest.meta().file_name()
                ),
            }
            let flush = spawn_flush(manifest, &handle, delegate);
            tracker.pending_resolved();
            if let Err(e) = flush.await {
                error!("Manifest flush task failed: {}", e);
            }
        }));
    }
}

/// Append a plane to the slot's writer, creating the writer from the plane if needed
fn append_plane<W, F>(
    slot: &mut WriterSlot<W>,
    plane: Option<&PlaneSample>,
    create: F,
) -> Option<PlaneAppend>
where
    W: SequenceWriter<Sample = PlaneSample>,
    F: FnOnce(&PlaneSample) -> Result<W>,
{
    let plane = plane?;
    let writer = match slot.get_or_try_insert_with(|| create(plane)) {
        Ok(writer) => writer,
        Err(e) => return Some(PlaneAppend::Unconfigured(e.to_string())),
    };

    let before = writer.buffered_bytes();
    if !writer.append(plane.clone()) {
        return Some(PlaneAppend::Refused);
    }

    let after = writer.buffered_bytes();
    Some(match writer.last_location() {
        Some(location) => PlaneAppend::Accepted(location, before, after),
        None => PlaneAppend::Refused,
    })
}
