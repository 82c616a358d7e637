use crate::sample::PointCandidate;
use crate::stage::{Stage, StageCell};
use parking_lot::{Mutex, MutexGuard};

/// Fixed-capacity point storage with a write cursor
///
/// Storage is allocated once; `filled` never exceeds `capacity`.
#[derive(Debug)]
pub struct PointRing {
    points: Vec<PointCandidate>,
    capacity: usize,
    cursor: usize,
    filled: usize,
}

impl PointRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: vec![PointCandidate::default(); capacity],
            capacity,
            cursor: 0,
            filled: 0,
        }
    }

    /// Append without wrapping; false once the ring is full
    pub fn push_bounded(&mut self, point: PointCandidate) -> bool {
        if self.filled >= self.capacity {
            return false;
        }
        self.points[self.cursor] = point;
        self.cursor += 1;
        self.filled += 1;
        true
    }

    /// Write at the cursor and advance it modulo capacity
    ///
    /// Returns false when the cursor has reached `capacity - 1`; the caller
    /// ends its pass there so the front of the ring is not overrun mid-pass.
    pub fn push_wrapping(&mut self, point: PointCandidate) -> bool {
        if self.capacity == 0 {
            return false;
        }
        self.points[self.cursor] = point;
        self.cursor = (self.cursor + 1) % self.capacity;
        self.filled = (self.filled + 1).min(self.capacity);
        self.cursor + 1 != self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.filled >= self.capacity
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Points written so far (the whole ring once it wrapped)
    pub fn points(&self) -> &[PointCandidate] {
        &self.points[..self.filled]
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.filled = 0;
    }
}

/// A ring plus the stage that says who may touch it
#[derive(Debug)]
pub struct PointBuffer {
    stage: StageCell,
    ring: Mutex<PointRing>,
}

impl PointBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            stage: StageCell::new(),
            ring: Mutex::new(PointRing::new(capacity)),
        }
    }

    pub fn stage(&self) -> &StageCell {
        &self.stage
    }

    pub fn is_ready(&self) -> bool {
        self.stage.is(Stage::Ready)
    }

    pub fn lock(&self) -> MutexGuard<'_, PointRing> {
        self.ring.lock()
    }

    pub fn filled(&self) -> usize {
        self.ring.lock().filled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(x: f32) -> PointCandidate {
        PointCandidate {
            position: [x, 0.0, 0.0],
            ..Default::default()
        }
    }

    #[test]
    fn test_bounded_ring_stops_when_full() {
        let mut ring = PointRing::new(3);
        assert!(ring.push_bounded(point(0.0)));
        assert!(ring.push_bounded(point(1.0)));
        assert!(ring.push_bounded(point(2.0)));
        assert!(ring.is_full());
        assert!(!ring.push_bounded(point(3.0)));
        assert_eq!(ring.filled(), 3);
        assert_eq!(ring.points()[2].position[0], 2.0);

        ring.reset();
        assert_eq!(ring.filled(), 0);
        assert_eq!(ring.cursor(), 0);
    }

    #[test]
    fn test_wrapping_ring_ends_pass_before_last_slot() {
        let mut ring = PointRing::new(4);
        assert!(ring.push_wrapping(point(0.0)));
        assert!(ring.push_wrapping(point(1.0)));
        // cursor now 3 == capacity - 1
        assert!(!ring.push_wrapping(point(2.0)));
        assert_eq!(ring.filled(), 3);

        // next pass writes the last slot and wraps to the front
        assert!(ring.push_wrapping(point(3.0)));
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.filled(), 4);
        assert!(ring.push_wrapping(point(4.0)));
        assert_eq!(ring.points()[0].position[0], 4.0);
        assert!(ring.filled() <= ring.capacity());
    }

    #[test]
    fn test_buffer_stage_starts_ready() {
        let buffer = PointBuffer::new(8);
        assert!(buffer.is_ready());
        assert!(buffer.stage().try_begin_expand());
        assert!(!buffer.is_ready());
        assert_eq!(buffer.filled(), 0);
    }
}
