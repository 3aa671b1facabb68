use crate::{device::Device, params::MAX_FRAMES_IN_FLIGHT};
use arrayvec::ArrayVec;
use parking_lot::Mutex;

/// A device resource that may still be referenced by in-flight GPU work.
pub enum Retired<D: Device> {
    Buffer(D::Buffer),
    Accel(D::AccelerationStructure),
}

/// Resources released off the render thread, waiting to be moved into a
/// graveyard bucket by the next purge.
pub struct RetireQueue<D: Device> {
    items: Mutex<Vec<Retired<D>>>,
}

impl<D: Device> RetireQueue<D> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, item: Retired<D>) {
        self.items.lock().push(item);
    }

    pub fn drain(&self) -> Vec<Retired<D>> {
        std::mem::take(&mut *self.items.lock())
    }
}

impl<D: Device> Default for RetireQueue<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deferred destruction across frames in flight.
///
/// Anything buried while recording frame slot `i` is dropped the next time
/// slot `i` is cleared, by which point the GPU work that could reference it
/// has completed.
pub struct Graveyard<T> {
    buckets: ArrayVec<Vec<T>, MAX_FRAMES_IN_FLIGHT>,
}

impl<T> Graveyard<T> {
    pub fn new(frames_in_flight: usize) -> Self {
        assert!(
            (1..=MAX_FRAMES_IN_FLIGHT).contains(&frames_in_flight),
            "frames in flight must be between 1 and {}",
            MAX_FRAMES_IN_FLIGHT
        );
        Self {
            buckets: (0..frames_in_flight).map(|_| Vec::new()).collect(),
        }
    }

    pub fn bury(&mut self, slot: usize, item: T) {
        self.buckets[slot].push(item);
    }

    pub fn bury_all(&mut self, slot: usize, items: impl IntoIterator<Item = T>) {
        self.buckets[slot].extend(items);
    }

    /// Drops everything buried in this slot, returning how many items went.
    pub fn clear(&mut self, slot: usize) -> usize {
        let bucket = &mut self.buckets[slot];
        let count = bucket.len();
        bucket.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn items_outlive_the_other_slots() {
        let tracker = Rc::new(());
        let mut graveyard = Graveyard::new(2);
        graveyard.bury(0, Rc::clone(&tracker));
        assert_eq!(graveyard.clear(1), 0);
        assert_eq!(Rc::strong_count(&tracker), 2);
        assert_eq!(graveyard.clear(0), 1);
        assert_eq!(Rc::strong_count(&tracker), 1);
        assert!(graveyard.is_empty());
    }

    #[test]
    fn bury_all_counts() {
        let mut graveyard = Graveyard::new(3);
        graveyard.bury_all(2, 0..5);
        graveyard.bury(1, 9);
        assert_eq!(graveyard.len(), 6);
        assert_eq!(graveyard.clear(2), 5);
        assert_eq!(graveyard.len(), 1);
    }

    #[test]
    #[should_panic]
    fn rejects_too_many_frames() {
        let _ = Graveyard::<()>::new(MAX_FRAMES_IN_FLIGHT + 1);
    }
}
