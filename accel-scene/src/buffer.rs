use crate::{device::*, error::DeviceError, graveyard::Retired};

const MIN_CAPACITY: u64 = 256;

/// A device buffer that is reallocated larger when it is too small and
/// never shrinks.
pub(crate) struct GrowableBuffer<D: Device> {
    usage: BufferUsage,
    location: MemoryLocation,
    current: Option<(D::Buffer, u64)>,
}

impl<D: Device> GrowableBuffer<D> {
    pub fn new(usage: BufferUsage, location: MemoryLocation) -> Self {
        Self {
            usage,
            location,
            current: None,
        }
    }

    /// Makes room for at least `required` bytes. A replaced buffer is handed
    /// to `retired` since earlier work may still read it.
    pub fn ensure(&mut self, device: &D, required: u64, retired: &mut Vec<Retired<D>>) -> Result<&D::Buffer, DeviceError> {
        let is_large_enough = matches!(&self.current, Some((_, capacity)) if *capacity >= required);
        if !is_large_enough {
            let capacity = required.max(MIN_CAPACITY).next_power_of_two();
            let buffer = device.create_buffer(capacity, self.usage, self.location)?;
            if let Some((old, old_capacity)) = self.current.replace((buffer, capacity)) {
                tracing::trace!(old_capacity, capacity, "grew buffer");
                retired.push(Retired::Buffer(old));
            }
        }
        match &self.current {
            Some((buffer, _)) => Ok(buffer),
            None => unreachable!(),
        }
    }

    pub fn buffer(&self) -> Option<&D::Buffer> {
        self.current.as_ref().map(|(buffer, _)| buffer)
    }

    pub fn capacity(&self) -> u64 {
        self.current.as_ref().map_or(0, |(_, capacity)| *capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingDevice;

    #[test]
    fn grows_and_never_shrinks() {
        let device = RecordingDevice::new();
        let mut retired = Vec::new();
        let mut buffer = GrowableBuffer::<RecordingDevice>::new(BufferUsage::STORAGE, MemoryLocation::HostVisible);
        assert!(buffer.buffer().is_none());

        buffer.ensure(&device, 10, &mut retired).unwrap();
        assert_eq!(buffer.capacity(), MIN_CAPACITY);
        assert!(retired.is_empty());

        buffer.ensure(&device, 1000, &mut retired).unwrap();
        assert_eq!(buffer.capacity(), 1024);
        assert_eq!(retired.len(), 1);

        buffer.ensure(&device, 100, &mut retired).unwrap();
        assert_eq!(buffer.capacity(), 1024);
        assert_eq!(retired.len(), 1);
        assert_eq!(device.live_buffer_count(), 2);

        retired.clear();
        assert_eq!(device.live_buffer_count(), 1);
    }
}
