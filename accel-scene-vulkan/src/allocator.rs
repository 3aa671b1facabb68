use crate::context::*;
use accel_scene::prelude::DeviceError;
use spark::{vk, Builder};
use std::sync::Arc;

/// A dedicated allocation bound to a single buffer.
pub(crate) struct Alloc {
    context: Arc<Context>,
    pub mem: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl Alloc {
    pub fn for_buffer(
        context: &Arc<Context>,
        buffer: vk::Buffer,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self, DeviceError> {
        let mem_req = unsafe { context.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = context
            .get_memory_type_index(mem_req.memory_type_bits, memory_property_flags)
            .ok_or(DeviceError::MemoryTypeNotFound(mem_req.memory_type_bits))?;

        let mem = {
            let mut memory_allocate_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(mem_req.size)
                .memory_type_index(memory_type_index);

            let mut flags_info = vk::MemoryAllocateFlagsInfo {
                flags: vk::MemoryAllocateFlagsKHR::DEVICE_ADDRESS_KHR,
                ..Default::default()
            };
            if context.is_ray_tracing_supported {
                memory_allocate_info = memory_allocate_info.insert_next(&mut flags_info);
            }

            unsafe { context.device.allocate_memory(&memory_allocate_info, None) }.map_err(device_error)?
        };
        let alloc = Self {
            context: Arc::clone(context),
            mem,
            size: mem_req.size,
        };

        unsafe { context.device.bind_buffer_memory(buffer, alloc.mem, 0) }.map_err(device_error)?;
        Ok(alloc)
    }

    pub fn map(&self) -> Result<*mut u8, DeviceError> {
        let mapping = unsafe {
            self.context
                .device
                .map_memory(self.mem, 0, vk::WHOLE_SIZE, Default::default())
        }
        .map_err(device_error)?;
        Ok(mapping as *mut u8)
    }
}

impl Drop for Alloc {
    fn drop(&mut self) {
        unsafe {
            self.context.device.free_memory(self.mem, None);
        }
    }
}
