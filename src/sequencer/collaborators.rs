use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Oracle consulted once per tick before anything is recorded
pub trait MemoryPressure: Send + Sync {
    /// Fraction of the allowed memory in use
    fn ratio(&self) -> f64;

    fn under_pressure(&self) -> bool;
}

/// Receives flush progress in `0.0..=1.0` after a recording stopped
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: f32);
}

impl<F> ProgressSink for F
where
    F: Fn(f32) + Send + Sync,
{
    fn report(&self, progress: f32) {
        self(progress)
    }
}

/// Source of the opaque world snapshot stored with each manifest chunk
#[async_trait]
pub trait WorldSnapshotProvider: Send + Sync {
    async fn capture(&self) -> Option<serde_json::Value>;
}

/// Accounts bytes held by live writers and in-flight flushes
///
/// Doubles as the default memory oracle: pressure once `used / limit`
/// reaches the configured ratio. A limit of zero disables the guard.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: u64,
    pressure_ratio: f64,
    used: AtomicU64,
}

impl MemoryBudget {
    pub fn new(limit: u64, pressure_ratio: f64) -> Self {
        Self {
            limit,
            pressure_ratio,
            used: AtomicU64::new(0),
        }
    }

    pub fn reserve(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn release(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Move a writer's reservation from `before` to `after` bytes
    pub fn adjust(&self, before: u64, after: u64) {
        if after >= before {
            self.reserve(after - before);
        } else {
            self.release(before - after);
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl MemoryPressure for MemoryBudget {
    fn ratio(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used() as f64 / self.limit as f64
    }

    fn under_pressure(&self) -> bool {
        self.limit > 0 && self.ratio() >= self.pressure_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_pressure() {
        let budget = MemoryBudget::new(1000, 0.9);
        budget.reserve(850);
        assert!(!budget.under_pressure());
        budget.reserve(50);
        assert!(budget.under_pressure());
        assert!((budget.ratio() - 0.9).abs() < f64::EPSILON);

        budget.release(5000);
        assert_eq!(budget.used(), 0);
        assert!(!budget.under_pressure());
    }

    #[test]
    fn test_adjust_follows_shrinking_writers() {
        let budget = MemoryBudget::new(1000, 0.9);
        budget.adjust(0, 600);
        budget.adjust(600, 950);
        assert!(budget.under_pressure());

        // Raw frames encoded down to a fraction of their size
        budget.adjust(950, 120);
        assert_eq!(budget.used(), 120);
        assert!(!budget.under_pressure());
    }

    #[test]
    fn test_unlimited_budget_never_pressures() {
        let budget = MemoryBudget::new(0, 0.5);
        budget.reserve(u64::MAX / 2);
        assert!(!budget.under_pressure());
        assert_eq!(budget.ratio(), 0.0);
    }

    #[test]
    fn test_closure_progress_sink() {
        let seen = parking_lot::Mutex::new(Vec::new());
        let sink = |p: f32| seen.lock().push(p);
        sink.report(0.5);
        sink.report(1.0);
        assert_eq!(*seen.lock(), vec![0.5, 1.0]);
    }
}
