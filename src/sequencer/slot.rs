use crate::error::{Result, ScanError};

/// Holds the live writer of one modality
///
/// Writers are discarded after their flush; `retire` moves the writer out and
/// bumps the generation so the next tick lazily creates a fresh one.
#[derive(Debug)]
pub struct WriterSlot<W> {
    generation: u64,
    writer: Option<W>,
}

impl<W> WriterSlot<W> {
    pub fn new() -> Self {
        Self {
            generation: 0,
            writer: None,
        }
    }

    /// Get the live writer, creating it first if the slot is empty
    pub fn get_or_try_insert_with<F>(&mut self, create: F) -> Result<&mut W>
    where
        F: FnOnce() -> Result<W>,
    {
        if self.writer.is_none() {
            self.writer = Some(create()?);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| ScanError::system("writer slot empty after insert"))
    }

    /// Take the live writer out for flushing
    pub fn retire(&mut self) -> Option<W> {
        let writer = self.writer.take();
        if writer.is_some() {
            self.generation += 1;
        }
        writer
    }

    pub fn get(&self) -> Option<&W> {
        self.writer.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.writer.is_some()
    }

    /// Number of writers retired from this slot so far
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<W> Default for WriterSlot<W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_create_and_retire() {
        let mut slot: WriterSlot<Vec<u32>> = WriterSlot::new();
        assert!(!slot.is_live());

        slot.get_or_try_insert_with(|| Ok(vec![1])).unwrap().push(2);
        // existing writer is reused, factory not called
        slot.get_or_try_insert_with(|| panic!("already live"))
            .unwrap()
            .push(3);
        assert_eq!(slot.get(), Some(&vec![1, 2, 3]));

        assert_eq!(slot.retire(), Some(vec![1, 2, 3]));
        assert_eq!(slot.generation(), 1);
        assert_eq!(slot.retire(), None);
        assert_eq!(slot.generation(), 1);
    }

    #[test]
    fn test_failed_create_leaves_slot_empty() {
        let mut slot: WriterSlot<u8> = WriterSlot::new();
        assert!(slot
            .get_or_try_insert_with(|| Err(ScanError::system("no resolution yet")))
            .is_err());
        assert!(!slot.is_live());
        assert_eq!(*slot.get_or_try_insert_with(|| Ok(5)).unwrap(), 5);
    }
}
