use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Lifecycle stage shared by sequence writers and point buffers
///
/// `Ready` accepts appends. `Expanding` means a copy pass owns the storage.
/// `Writing` means a background flush owns the storage; writers never leave it,
/// point buffers return to `Ready` once the flush completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Ready,
    Expanding,
    Writing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ready => "ready",
            Stage::Expanding => "expanding",
            Stage::Writing => "writing",
        };
        f.write_str(name)
    }
}

/// Single-owner stage flag
///
/// Transitions are compare-and-swap, so a caller that loses a race simply sees
/// `false` and backs off; nothing ever waits on a stage.
pub struct StageCell {
    stage: AtomicCell<Stage>,
}

impl StageCell {
    pub fn new() -> Self {
        Self {
            stage: AtomicCell::new(Stage::Ready),
        }
    }

    pub fn get(&self) -> Stage {
        self.stage.load()
    }

    pub fn is(&self, stage: Stage) -> bool {
        self.get() == stage
    }

    /// Move from `from` to `to`, returning false if the cell was elsewhere
    pub fn transition(&self, from: Stage, to: Stage) -> bool {
        let moved = self.stage.compare_exchange(from, to).is_ok();
        if moved {
            trace!("Stage {} -> {}", from, to);
        }
        moved
    }

    /// Ready -> Expanding, claimed by the producer before a copy pass
    pub fn try_begin_expand(&self) -> bool {
        self.transition(Stage::Ready, Stage::Expanding)
    }

    /// Close a copy pass, handing the storage to a flush if it filled up
    pub fn finish_expand(&self, full: bool) -> Stage {
        let next = if full { Stage::Writing } else { Stage::Ready };
        if self.transition(Stage::Expanding, next) {
            next
        } else {
            self.get()
        }
    }

    /// Ready -> Writing; used by writers when they are sealed and by buffers
    /// flushed outside a copy pass
    pub fn try_begin_write(&self) -> bool {
        self.transition(Stage::Ready, Stage::Writing)
    }

    /// Writing -> Ready once a reusable buffer has been drained
    pub fn finish_write(&self) -> bool {
        self.transition(Stage::Writing, Stage::Ready)
    }
}

impl Default for StageCell {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StageCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StageCell").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let cell = StageCell::new();
        assert!(cell.is(Stage::Ready));

        assert!(cell.try_begin_expand());
        assert!(!cell.try_begin_expand());
        assert_eq!(cell.finish_expand(true), Stage::Writing);

        assert!(!cell.try_begin_expand());
        assert!(cell.finish_write());
        assert!(cell.is(Stage::Ready));
    }

    #[test]
    fn test_expand_without_fill_returns_to_ready() {
        let cell = StageCell::new();
        assert!(cell.try_begin_expand());
        assert_eq!(cell.finish_expand(false), Stage::Ready);
    }

    #[test]
    fn test_sealed_writer_never_reopens() {
        let cell = StageCell::new();
        assert!(cell.try_begin_write());
        assert!(!cell.try_begin_write());
        assert!(!cell.try_begin_expand());
        assert!(cell.is(Stage::Writing));
    }

    #[test]
    fn test_finish_expand_outside_pass_is_noop() {
        let cell = StageCell::new();
        assert_eq!(cell.finish_expand(true), Stage::Ready);
    }
}
