use crate::events::{EventBus, ScanEvent};
use crate::sample::Modality;
use crate::sequence::{ChunkReport, WriterDelegate};
use crate::sequencer::collaborators::{MemoryBudget, ProgressSink};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Counters of chunk writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub queued: u64,
    pub finished: u64,
    pub failed: u64,
    /// Flushes announced but not queued yet (waiting on a snapshot or copy pass)
    pub pending: u64,
}

impl FlushStats {
    pub fn outstanding(&self) -> u64 {
        (self.queued + self.pending).saturating_sub(self.finished)
    }

    /// Share of expected writes that finished, 1.0 when none are expected
    pub fn progress(&self) -> f32 {
        let expected = self.queued + self.pending;
        if expected == 0 {
            1.0
        } else {
            self.finished as f32 / expected as f32
        }
    }
}

#[derive(Default)]
struct TrackerState {
    stats: FlushStats,
    stopped: bool,
    sink: Option<Arc<dyn ProgressSink>>,
}

/// Delegate of every writer and point buffer of a scan
///
/// Counts queued and finished writes, returns flushed bytes to the memory
/// budget, publishes chunk events and, once the recording stopped, reports
/// `finished / queued` to the progress sink on every completion.
pub struct FlushTracker {
    state: Mutex<TrackerState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    budget: Arc<MemoryBudget>,
    events: EventBus,
}

impl FlushTracker {
    pub fn new(budget: Arc<MemoryBudget>, events: EventBus) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            tasks: Mutex::new(Vec::new()),
            budget,
            events,
        }
    }

    /// Keep a flush task so shutdown can wait for it
    pub fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Announce a flush whose queueing happens later
    pub fn expect_pending(&self) {
        self.state.lock().stats.pending += 1;
    }

    /// The announced flush was queued (or turned out to be unnecessary)
    pub fn pending_resolved(&self) {
        let emit = {
            let mut state = self.state.lock();
            state.stats.pending = state.stats.pending.saturating_sub(1);
            Self::emission(&state)
        };
        Self::emit(emit);
    }

    /// Switch to progress reporting; reports 1.0 at once when nothing is outstanding
    pub fn stop(&self, sink: Option<Arc<dyn ProgressSink>>) {
        let emit = {
            let mut state = self.state.lock();
            state.stopped = true;
            state.sink = sink;
            if state.stats.outstanding() == 0 {
                Self::emission(&state)
            } else {
                None
            }
        };
        Self::emit(emit);
    }

    pub fn stats(&self) -> FlushStats {
        self.state.lock().stats
    }

    pub fn progress(&self) -> f32 {
        self.stats().progress()
    }

    /// Wait for every tracked flush task
    pub async fn drain(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            debug!("Waiting for {} flush tasks", tasks.len());
            for task in tasks {
                if let Err(e) = task.await {
                    error!("Flush task failed: {}", e);
                }
            }
        }
    }

    fn emission(state: &TrackerState) -> Option<(Arc<dyn ProgressSink>, f32)> {
        if !state.stopped {
            return None;
        }
        state
            .sink
            .as_ref()
            .map(|sink| (sink.clone(), state.stats.progress()))
    }

    fn emit(emission: Option<(Arc<dyn ProgressSink>, f32)>) {
        if let Some((sink, progress)) = emission {
            sink.report(progress);
        }
    }
}

impl WriterDelegate for FlushTracker {
    fn file_queued(&self, modality: Modality) {
        let mut state = self.state.lock();
        state.stats.queued += 1;
        debug!("{} flush queued ({} total)", modality, state.stats.queued);
    }

    fn file_written(&self, report: ChunkReport) {
        self.budget.release(report.buffered_bytes);

        let emit = {
            let mut state = self.state.lock();
            state.stats.finished += 1;
            if !report.is_ok() {
                state.stats.failed += 1;
            }
            Self::emission(&state)
        };

        self.events.publish(ScanEvent::ChunkWritten {
            modality: report.modality,
            file_name: report.file_name(),
            frames: report.frames,
            ok: report.is_ok(),
        });

        Self::emit(emit);
    }
}
