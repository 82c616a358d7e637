use crate::config::PointsConfig;
use crate::error::{Result, ScanError};
use crate::points::buffer::PointBuffer;
use crate::points::las_chunk::write_las_chunk;
use crate::sample::{Modality, PointCandidate};
use crate::sequence::{ChunkReport, SequenceMetaInfo, WriterDelegate};
use crate::stage::Stage;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Statistics for the point buffers
#[derive(Debug, Default)]
pub struct PointStats {
    /// Ticks whose candidates were handed to the copy worker
    pub ticks_processed: AtomicU64,
    /// Ticks whose candidates were not recorded because the buffer was busy
    pub ticks_skipped: AtomicU64,
    pub points_visualized: AtomicU64,
    pub points_recorded: AtomicU64,
    /// Accepted points that arrived after their buffer filled up
    pub points_truncated: AtomicU64,
    pub chunks_written: AtomicU64,
    pub chunks_failed: AtomicU64,
}

impl PointStats {
    /// Get current statistics as a snapshot
    pub fn snapshot(&self) -> PointStatsSnapshot {
        PointStatsSnapshot {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            points_visualized: self.points_visualized.load(Ordering::Relaxed),
            points_recorded: self.points_recorded.load(Ordering::Relaxed),
            points_truncated: self.points_truncated.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of point buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointStatsSnapshot {
    pub ticks_processed: u64,
    pub ticks_skipped: u64,
    pub points_visualized: u64,
    pub points_recorded: u64,
    pub points_truncated: u64,
    pub chunks_written: u64,
    pub chunks_failed: u64,
}

/// What happened to one tick's candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsOutcome {
    /// Queued for visualization and recording
    Recorded,
    /// Queued for visualization only
    Visualized,
    /// Queued for visualization; the recording buffer was busy
    Skipped,
}

enum CopyJob {
    Pass {
        tick: u64,
        points: Arc<[PointCandidate]>,
        visual: usize,
        recording: Option<usize>,
    },
    FlushPartial(oneshot::Sender<()>),
    Barrier(oneshot::Sender<()>),
}

struct Shared {
    config: PointsConfig,
    visual: Vec<PointBuffer>,
    recording: Vec<PointBuffer>,
    current_recording: AtomicUsize,
    latest_visual: AtomicUsize,
    meta: Mutex<SequenceMetaInfo>,
    stats: PointStats,
    delegate: Arc<dyn WriterDelegate>,
    handle: Handle,
    flushes: Mutex<Vec<JoinHandle<()>>>,
}

/// Fixed pool of visualization and recording point buffers
///
/// The producer only claims buffers and queues copy passes. A single worker
/// task runs the passes one at a time on the blocking pool, in submission
/// order; LAS serialization runs there as well. A recording buffer that is not `Ready` when a tick arrives
/// is skipped for that tick rather than waited for.
pub struct RecordingBufferManager {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<CopyJob>,
    next_visual: usize,
}

impl RecordingBufferManager {
    pub fn new<P: Into<PathBuf>>(
        config: &PointsConfig,
        directory: P,
        extension: &str,
        delegate: Arc<dyn WriterDelegate>,
        handle: &Handle,
    ) -> Result<Self> {
        if config.buffers_in_flight == 0 || config.recording_capacity == 0 || config.visual_capacity < 2 {
            return Err(ScanError::component(
                "points",
                "buffer pool needs at least one buffer and non-trivial capacities",
            ));
        }

        let pool = |capacity: usize| {
            (0..config.buffers_in_flight)
                .map(|_| PointBuffer::new(capacity))
                .collect::<Vec<_>>()
        };

        let shared = Arc::new(Shared {
            config: config.clone(),
            visual: pool(config.visual_capacity),
            recording: pool(config.recording_capacity),
            current_recording: AtomicUsize::new(0),
            latest_visual: AtomicUsize::new(0),
            meta: Mutex::new(SequenceMetaInfo::new(Modality::Points, extension, 0, directory)),
            stats: PointStats::default(),
            delegate,
            handle: handle.clone(),
            flushes: Mutex::new(Vec::new()),
        });

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let (jobs, receiver) = mpsc::unbounded_channel();
        handle.spawn(copy_worker(shared.clone(), receiver, rng));

        debug!(
            "Created point buffers: {} x {} visual, {} x {} recording",
            config.buffers_in_flight,
            config.visual_capacity,
            config.buffers_in_flight,
            config.recording_capacity
        );

        Ok(Self {
            shared,
            jobs,
            next_visual: 0,
        })
    }

    /// Hand one tick's candidates to the copy worker without waiting on it
    pub fn process_points(
        &mut self,
        tick: u64,
        points: Arc<[PointCandidate]>,
        record: bool,
    ) -> PointsOutcome {
        let k = self.shared.visual.len();
        let visual = self.next_visual;
        self.next_visual = (self.next_visual + 1) % k;

        let mut outcome = PointsOutcome::Visualized;
        let mut recording = None;
        if record {
            let index = self.shared.current_recording.load(Ordering::Acquire);
            if self.shared.recording[index].stage().try_begin_expand() {
                recording = Some(index);
                outcome = PointsOutcome::Recorded;
            } else {
                self.shared.stats.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Recording buffer {} is {}, skipping {} candidates of tick {}",
                    index,
                    self.shared.recording[index].stage().get(),
                    points.len(),
                    tick
                );
                outcome = PointsOutcome::Skipped;
            }
        }

        let job = CopyJob::Pass {
            tick,
            points,
            visual,
            recording,
        };
        if self.jobs.send(job).is_err() {
            error!("Point copy worker is gone, dropping tick {}", tick);
            if let Some(index) = recording {
                self.shared.recording[index].stage().finish_expand(false);
            }
            return PointsOutcome::Skipped;
        }

        self.shared.stats.ticks_processed.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Flush whatever the current recording buffer holds, after all queued passes
    ///
    /// The returned receiver resolves once the worker has queued the chunk
    /// write (or found nothing to flush).
    pub fn flush_partial(&self) -> oneshot::Receiver<()> {
        let (queued, receiver) = oneshot::channel();
        if self.jobs.send(CopyJob::FlushPartial(queued)).is_err() {
            error!("Point copy worker is gone, partial points are lost");
        }
        receiver
    }

    /// Wait until queued copy passes and started chunk writes are done
    pub async fn settle(&self) {
        let (done, wait) = oneshot::channel();
        if self.jobs.send(CopyJob::Barrier(done)).is_ok() {
            let _ = wait.await;
        }

        let flushes = std::mem::take(&mut *self.shared.flushes.lock());
        for flush in flushes {
            if let Err(e) = flush.await {
                error!("Point chunk task failed: {}", e);
            }
        }
    }

    /// Copy of the most recently updated visualization buffer
    pub fn visual_points(&self) -> Vec<PointCandidate> {
        let index = self.shared.latest_visual.load(Ordering::Acquire);
        self.shared.visual[index].lock().points().to_vec()
    }

    pub fn current_recording_index(&self) -> usize {
        self.shared.current_recording.load(Ordering::Acquire)
    }

    pub fn recording_stage(&self, index: usize) -> Option<Stage> {
        self.shared.recording.get(index).map(|b| b.stage().get())
    }

    pub fn recording_filled(&self, index: usize) -> Option<usize> {
        self.shared.recording.get(index).map(|b| b.filled())
    }

    pub fn stats(&self) -> PointStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

async fn copy_worker(
    shared: Arc<Shared>,
    mut jobs: mpsc::UnboundedReceiver<CopyJob>,
    mut rng: StdRng,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            CopyJob::Pass {
                tick,
                points,
                visual,
                recording,
            } => {
                let pass_shared = shared.clone();
                let pass = shared.handle.spawn_blocking(move || {
                    copy_visual(&pass_shared, &mut rng, &points, visual);
                    if let Some(index) = recording {
                        copy_recording(&pass_shared, &mut rng, &points, index, tick);
                    }
                    rng
                });
                match pass.await {
                    Ok(returned) => rng = returned,
                    Err(e) => {
                        error!("Point copy pass for tick {} failed: {}", tick, e);
                        break;
                    }
                }
            }
            CopyJob::FlushPartial(queued) => {
                flush_current(&shared);
                let _ = queued.send(());
            }
            CopyJob::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!("Point copy worker stopped");
}

fn copy_visual(shared: &Shared, rng: &mut StdRng, points: &[PointCandidate], index: usize) {
    let threshold = shared.config.confidence_threshold;
    let probability = shared.config.visual_keep_probability;
    let mut ring = shared.visual[index].lock();
    let mut kept = 0u64;

    for point in points.iter().filter(|p| p.selection.is_confident(threshold)) {
        if rng.gen_bool(probability) {
            kept += 1;
            if !ring.push_wrapping(*point) {
                trace!("Visual buffer {} reached its end, pass stopped", index);
                break;
            }
        }
    }
    drop(ring);

    shared.latest_visual.store(index, Ordering::Release);
    shared.stats.points_visualized.fetch_add(kept, Ordering::Relaxed);
}

fn copy_recording(shared: &Arc<Shared>, rng: &mut StdRng, points: &[PointCandidate], index: usize, tick: u64) {
    let threshold = shared.config.confidence_threshold;
    let probability = shared.config.record_keep_probability;
    let buffer = &shared.recording[index];

    let mut recorded = 0u64;
    let mut truncated = 0u64;
    let full = {
        let mut ring = buffer.lock();
        for point in points.iter().filter(|p| p.selection.is_confident(threshold)) {
            if probability < 1.0 && !rng.gen_bool(probability) {
                continue;
            }
            if ring.push_bounded(*point) {
                recorded += 1;
            } else {
                truncated += 1;
            }
        }
        ring.is_full()
    };

    shared.stats.points_recorded.fetch_add(recorded, Ordering::Relaxed);
    if truncated > 0 {
        shared.stats.points_truncated.fetch_add(truncated, Ordering::Relaxed);
        debug!("Tick {} lost {} points to a full recording buffer", tick, truncated);
    }

    if full {
        shared
            .current_recording
            .store((index + 1) % shared.recording.len(), Ordering::Release);
    }

    if buffer.stage().finish_expand(full) == Stage::Writing {
        spawn_chunk_write(shared, index);
    }
}

fn flush_current(shared: &Arc<Shared>) {
    let index = shared.current_recording.load(Ordering::Acquire);
    let buffer = &shared.recording[index];
    if !buffer.stage().try_begin_write() {
        debug!("Recording buffer {} busy, nothing partial to flush", index);
        return;
    }

    if buffer.filled() == 0 {
        buffer.stage().finish_write();
        return;
    }

    shared
        .current_recording
        .store((index + 1) % shared.recording.len(), Ordering::Release);
    spawn_chunk_write(shared, index);
}

fn spawn_chunk_write(shared: &Arc<Shared>, index: usize) {
    let path = {
        let mut meta = shared.meta.lock();
        meta.refresh_file_name();
        meta.full_path()
    };
    shared.delegate.file_queued(Modality::Points);

    let task_shared = shared.clone();
    let task = shared.handle.spawn_blocking(move || {
        let shared = task_shared;
        let buffer = &shared.recording[index];

        let (frames, result) = {
            let mut ring = buffer.lock();
            let frames = ring.filled() as u64;
            let result = write_las_chunk(&path, ring.points());
            ring.reset();
            (frames, result)
        };
        buffer.stage().finish_write();

        match &result {
            Ok(bytes) => {
                shared.stats.chunks_written.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Wrote points chunk {} ({} points, {} bytes)",
                    path.display(),
                    frames,
                    bytes
                );
            }
            Err(e) => {
                shared.stats.chunks_failed.fetch_add(1, Ordering::Relaxed);
                error!("Failed to write points chunk {}: {}", path.display(), e);
            }
        }

        shared.delegate.file_written(ChunkReport {
            modality: Modality::Points,
            path,
            frames,
            buffered_bytes: 0,
            result: result.map_err(|e| e.to_string()),
        });
    });

    let mut flushes = shared.flushes.lock();
    flushes.retain(|f| !f.is_finished());
    flushes.push(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SelectionType;
    use crossbeam::channel;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collect {
        queued: AtomicU64,
        reports: Mutex<Vec<ChunkReport>>,
    }

    impl WriterDelegate for Collect {
        fn file_queued(&self, _modality: Modality) {
            self.queued.fetch_add(1, Ordering::Relaxed);
        }

        fn file_written(&self, report: ChunkReport) {
            self.reports.lock().push(report);
        }
    }

    fn config(capacity: usize, buffers: usize) -> PointsConfig {
        PointsConfig {
            buffers_in_flight: buffers,
            visual_capacity: 64,
            recording_capacity: capacity,
            confidence_threshold: 1,
            visual_keep_probability: 0.1,
            record_keep_probability: 1.0,
            seed: Some(7),
        }
    }

    fn candidates(n: usize, selection: SelectionType) -> Arc<[PointCandidate]> {
        (0..n)
            .map(|i| PointCandidate {
                position: [i as f32, 0.0, 1.0],
                color: [0.2, 0.4, 0.6],
                confidence: 1.0,
                timestamp: i as u32,
                selection,
                capture_distance: 1.0,
            })
            .collect::<Vec<_>>()
            .into()
    }

    fn manager(dir: &std::path::Path, config: &PointsConfig) -> (RecordingBufferManager, Arc<Collect>) {
        let delegate = Arc::new(Collect::default());
        let manager =
            RecordingBufferManager::new(config, dir, "las", delegate.clone(), &Handle::current())
                .unwrap();
        (manager, delegate)
    }

    #[tokio::test]
    async fn test_two_flushes_and_a_partial_third_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let (mut manager, delegate) = manager(temp_dir.path(), &config(100, 3));

        for tick in 0..250u64 {
            let outcome =
                manager.process_points(tick, candidates(1, SelectionType::SurfaceSelected), true);
            assert_eq!(outcome, PointsOutcome::Recorded);
            manager.settle().await;
        }

        let reports = delegate.reports.lock();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.frames == 100 && r.is_ok()));
        assert!(reports.iter().all(|r| r.path.exists()));
        drop(reports);

        assert_eq!(manager.current_recording_index(), 2);
        assert_eq!(manager.recording_filled(2), Some(50));
        assert_eq!(manager.recording_stage(2), Some(Stage::Ready));
        assert_eq!(manager.recording_filled(0), Some(0));
        assert_eq!(manager.recording_stage(0), Some(Stage::Ready));

        let stats = manager.stats();
        assert_eq!(stats.points_recorded, 250);
        assert_eq!(stats.chunks_written, 2);
        assert_eq!(stats.ticks_skipped, 0);
    }

    /// Holds the chunk write of a full buffer until the test releases it
    struct HeldFlush {
        entered: channel::Sender<()>,
        release: channel::Receiver<()>,
        reports: Mutex<Vec<ChunkReport>>,
    }

    impl WriterDelegate for HeldFlush {
        fn file_queued(&self, _modality: Modality) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }

        fn file_written(&self, report: ChunkReport) {
            self.reports.lock().push(report);
        }
    }

    fn las_point_count(path: &std::path::Path) -> u64 {
        let bytes = std::fs::read(path).unwrap();
        let offset = u32::from_le_bytes([bytes[96], bytes[97], bytes[98], bytes[99]]) as u64;
        (bytes.len() as u64 - offset) / 34
    }

    #[tokio::test]
    async fn test_busy_buffer_is_a_counted_skip() {
        let temp_dir = TempDir::new().unwrap();
        let (entered_tx, entered) = channel::bounded(1);
        let (release, release_rx) = channel::bounded(1);
        let delegate = Arc::new(HeldFlush {
            entered: entered_tx,
            release: release_rx,
            reports: Mutex::new(Vec::new()),
        });
        let mut manager = RecordingBufferManager::new(
            &config(10, 1),
            temp_dir.path(),
            "las",
            delegate.clone(),
            &Handle::current(),
        )
        .unwrap();

        let outcome = manager.process_points(0, candidates(10, SelectionType::EdgeSelected), true);
        assert_eq!(outcome, PointsOutcome::Recorded);

        // The only buffer is full and its chunk write has not finished
        tokio::task::spawn_blocking(move || entered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.recording_stage(0), Some(Stage::Writing));

        let outcome = manager.process_points(1, candidates(5, SelectionType::EdgeSelected), true);
        assert_eq!(outcome, PointsOutcome::Skipped);

        release.send(()).unwrap();
        manager.settle().await;

        let stats = manager.stats();
        assert_eq!(stats.ticks_skipped, 1);
        assert_eq!(stats.points_recorded, 10);
        assert_eq!(manager.recording_filled(0), Some(0));
        assert_eq!(manager.recording_stage(0), Some(Stage::Ready));

        let reports = delegate.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].frames, 10);
        assert!(reports[0].is_ok());
        assert_eq!(las_point_count(&reports[0].path), 10);
    }

    #[tokio::test]
    async fn test_fill_mid_tick_truncates_remaining_points() {
        let temp_dir = TempDir::new().unwrap();
        let (mut manager, delegate) = manager(temp_dir.path(), &config(10, 2));

        manager.process_points(0, candidates(25, SelectionType::EdgeSelected), true);
        manager.settle().await;

        let stats = manager.stats();
        assert_eq!(stats.points_recorded, 10);
        assert_eq!(stats.points_truncated, 15);
        assert_eq!(delegate.reports.lock().len(), 1);
        assert_eq!(delegate.queued.load(Ordering::Relaxed), 1);
        assert_eq!(manager.current_recording_index(), 1);
    }

    #[tokio::test]
    async fn test_unconfident_points_are_never_stored() {
        let temp_dir = TempDir::new().unwrap();
        let (mut manager, _delegate) = manager(temp_dir.path(), &config(100, 3));

        manager.process_points(0, candidates(40, SelectionType::DepthDeleted), true);
        manager.process_points(1, candidates(40, SelectionType::DistanceDeleted), true);
        manager.settle().await;

        assert_eq!(manager.stats().points_recorded, 0);
        assert!(manager.visual_points().is_empty());
    }

    #[tokio::test]
    async fn test_flush_partial_writes_tail() {
        let temp_dir = TempDir::new().unwrap();
        let (mut manager, delegate) = manager(temp_dir.path(), &config(100, 3));

        manager.process_points(0, candidates(30, SelectionType::SurfaceSelected), true);
        manager.flush_partial().await.unwrap();
        manager.settle().await;

        let reports = delegate.reports.lock();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].frames, 30);
        assert_eq!(manager.recording_filled(0), Some(0));
        assert_eq!(manager.current_recording_index(), 1);
    }

    #[tokio::test]
    async fn test_flush_partial_on_empty_buffer_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let (manager, delegate) = manager(temp_dir.path(), &config(100, 3));

        manager.flush_partial().await.unwrap();
        manager.settle().await;

        assert!(delegate.reports.lock().is_empty());
        assert_eq!(manager.current_recording_index(), 0);
        assert_eq!(manager.recording_stage(0), Some(Stage::Ready));
    }

    #[tokio::test]
    async fn test_visual_thinning_is_reproducible_and_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = config(1000, 1);
        cfg.visual_keep_probability = 0.5;

        let (mut first, _) = manager(temp_dir.path(), &cfg);
        let (mut second, _) = manager(temp_dir.path(), &cfg);
        for tick in 0..5 {
            first.process_points(tick, candidates(100, SelectionType::EdgeSelected), false);
            second.process_points(tick, candidates(100, SelectionType::EdgeSelected), false);
        }
        first.settle().await;
        second.settle().await;

        let shown = first.visual_points();
        assert!(!shown.is_empty());
        assert!(shown.len() <= cfg.visual_capacity);
        assert_eq!(shown, second.visual_points());
        assert_eq!(first.stats().points_recorded, 0);
    }
}
