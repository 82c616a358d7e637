use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::events::{EventBus, ScanEvent};
use crate::project::{GeoLocation, Project, ScanMetadata};
use crate::sample::{PointCandidate, SensorTick};
use crate::sequencer::{
    FrameSequencer, MemoryPressure, ProgressSink, SequencerStats, TickOutcome,
    WorldSnapshotProvider,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// One recording session: a project directory plus the sequencer feeding it
///
/// `begin_recording` validates the configuration and creates the project
/// before the first tick, so fatal setup errors never surface mid-scan.
pub struct ScanRecorder {
    config: ScanConfig,
    events: EventBus,
    project: Project,
    metadata: ScanMetadata,
    sequencer: FrameSequencer,
    recording: bool,
}

impl ScanRecorder {
    pub fn begin_recording(
        config: &ScanConfig,
        project_name: &str,
        location: Option<GeoLocation>,
        events: EventBus,
        handle: &Handle,
    ) -> Result<Self> {
        config.validate()?;

        let project = Project::create(config.output.projects_dir(), project_name)?;
        let metadata = ScanMetadata::new(project_name, &config.recording, location);
        project.write_metadata(&metadata)?;

        let sequencer = FrameSequencer::new(config, project.root(), events.clone(), handle)?;

        info!(
            "Recording scan {} into {}",
            metadata.scan_id,
            project.root().display()
        );
        events.publish(ScanEvent::RecordingStarted {
            scan_id: metadata.scan_id.clone(),
            timestamp: SystemTime::now(),
        });

        Ok(Self {
            config: config.clone(),
            events,
            project,
            metadata,
            sequencer,
            recording: true,
        })
    }

    pub fn with_world_snapshots(mut self, provider: Arc<dyn WorldSnapshotProvider>) -> Self {
        self.sequencer = self.sequencer.with_world_snapshots(provider);
        self
    }

    pub fn with_memory_pressure(mut self, memory: Arc<dyn MemoryPressure>) -> Self {
        self.sequencer = self.sequencer.with_memory_pressure(memory);
        self
    }

    /// Feed one sensor tick
    pub fn tick(&mut self, sample: &SensorTick) -> TickOutcome {
        self.sequencer.tick(sample)
    }

    /// Stop recording and rotate out everything buffered
    ///
    /// The end time is written to the project metadata at once; chunk writes
    /// keep running and report through `progress`.
    pub fn stop_recording(&mut self, progress: Option<Arc<dyn ProgressSink>>) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        self.recording = false;

        let flushed = self.sequencer.stop(progress);
        self.metadata.scan_end = Some(Utc::now());
        self.project.write_metadata(&self.metadata)?;

        info!(
            "Stopped scan {} after {} ticks, {} writers flushing",
            self.metadata.scan_id,
            self.sequencer.ticks(),
            flushed
        );
        Ok(())
    }

    /// Stop if still recording and wait for outstanding chunk writes
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.recording {
            self.stop_recording(None)?;
        }

        let limit = Duration::from_secs(self.config.system.shutdown_timeout_seconds);
        match timeout(limit, self.sequencer.settle()).await {
            Ok(()) => {
                let stats = self.sequencer.stats();
                if stats.flushes.failed > 0 {
                    warn!("{} chunk writes failed", stats.flushes.failed);
                }
                info!(
                    "Scan {} settled: {} chunks written",
                    self.metadata.scan_id, stats.flushes.finished
                );
                Ok(())
            }
            Err(_) => {
                error!("Chunk writes did not finish within {:?}", limit);
                Err(ScanError::system(format!(
                    "{} chunk writes still outstanding after {:?}",
                    self.sequencer.stats().flushes.outstanding(),
                    limit
                )))
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn metadata(&self) -> &ScanMetadata {
        &self.metadata
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Latest thinned point set for renderers
    pub fn visual_points(&self) -> Vec<PointCandidate> {
        self.sequencer
            .points()
            .map(|points| points.visual_points())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SequencerStats {
        self.sequencer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventReceiver};
    use crate::sample::{CameraPose, PlaneSample, SampleFormat};
    use tempfile::TempDir;

    fn create_test_config(dir: &TempDir) -> ScanConfig {
        let mut config = ScanConfig::default();
        config.recording.rate = 5;
        config.recording.sequence_seconds = 1;
        config.recording.record_points = false;
        config.output.projects_path = dir.path().to_string_lossy().into_owned();
        config
    }

    fn tick(index: u64) -> SensorTick {
        SensorTick::new(
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + index),
            CameraPose::default(),
        )
        .with_depth(PlaneSample::new(vec![0u8; 16], 2, 2, SampleFormat::Depth32F))
    }

    #[tokio::test]
    async fn test_recording_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let events = EventBus::new(64);
        let mut receiver = EventReceiver::new(
            events.subscribe(),
            EventFilter::EventTypes(vec!["recording_started", "recording_stopped"]),
            "test".to_string(),
        );

        let mut recorder =
            ScanRecorder::begin_recording(&config, "lobby", None, events, &Handle::current())
                .unwrap();
        assert!(recorder.is_recording());
        assert!(recorder.project().metadata_path().exists());
        assert!(recorder.project().load_metadata().unwrap().scan_end.is_none());

        for i in 0..7 {
            recorder.tick(&tick(i));
        }
        recorder.stop_recording(None).unwrap();
        assert_eq!(recorder.tick(&tick(8)), TickOutcome::Ignored);
        recorder.shutdown().await.unwrap();

        let project = recorder.project();
        let metadata = project.load_metadata().unwrap();
        assert!(metadata.scan_end.is_some());
        assert_eq!(metadata.rate, 5);

        let manifests = project.manifests().unwrap();
        assert_eq!(manifests.len(), 2);
        let total: usize = manifests
            .iter()
            .map(|m| project.load_manifest(m).unwrap().frames.len())
            .sum();
        assert_eq!(total, 7);

        assert_eq!(
            receiver.try_recv().unwrap().map(|e| e.event_type()),
            Some("recording_started")
        );
        assert_eq!(
            receiver.try_recv().unwrap().map(|e| e.event_type()),
            Some("recording_stopped")
        );
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal_before_start() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.recording.rate = 0;

        let result =
            ScanRecorder::begin_recording(&config, "bad", None, EventBus::new(4), &Handle::current());
        assert!(matches!(result, Err(ScanError::Config(_))));
        assert!(!temp_dir.path().join("bad").exists());
    }

    #[tokio::test]
    async fn test_shutdown_without_stop_finalizes_scan() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let location = GeoLocation {
            latitude: 47.07,
            longitude: 15.44,
        };

        let mut recorder = ScanRecorder::begin_recording(
            &config,
            "yard",
            Some(location),
            EventBus::new(64),
            &Handle::current(),
        )
        .unwrap();
        recorder.tick(&tick(0));
        recorder.shutdown().await.unwrap();

        assert!(!recorder.is_recording());
        let metadata = recorder.project().load_metadata().unwrap();
        assert_eq!(metadata.location(), Some(location));
        assert!(metadata.scan_end.is_some());
        assert_eq!(recorder.stats().flushes.outstanding(), 0);
        assert!(recorder.visual_points().is_empty());
    }
}
