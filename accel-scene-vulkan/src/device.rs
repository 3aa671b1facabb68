use crate::{allocator::*, context::*};
use accel_scene::prelude::*;
use parking_lot::Mutex;
use spark::vk;
use std::{mem, ptr, slice, sync::Arc};

pub struct VulkanBuffer {
    context: Arc<Context>,
    buffer: vk::Buffer,
    size: u64,
    address: DeviceAddress,
    mapping: Option<*mut u8>,
    _alloc: Alloc,
}

unsafe impl Send for VulkanBuffer {}
unsafe impl Sync for VulkanBuffer {}

impl VulkanBuffer {
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_buffer(Some(self.buffer), None) };
    }
}

pub struct VulkanAccel {
    context: Arc<Context>,
    accel: vk::AccelerationStructureKHR,
    address: DeviceAddress,
    _buffer: VulkanBuffer,
}

impl VulkanAccel {
    pub fn accel(&self) -> vk::AccelerationStructureKHR {
        self.accel
    }
}

impl Drop for VulkanAccel {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_acceleration_structure_khr(Some(self.accel), None)
        };
    }
}

/// Each command buffer owns its pool, so recording needs no shared locking.
pub struct VulkanCommandBuffer {
    context: Arc<Context>,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl VulkanCommandBuffer {
    pub fn cmd(&self) -> vk::CommandBuffer {
        self.cmd
    }
}

impl Drop for VulkanCommandBuffer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_command_pool(Some(self.pool), None) };
    }
}

pub struct VulkanSemaphore {
    context: Arc<Context>,
    semaphore: vk::Semaphore,
}

impl VulkanSemaphore {
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for VulkanSemaphore {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_semaphore(Some(self.semaphore), None) };
    }
}

pub struct VulkanQueryPool {
    context: Arc<Context>,
    query_pool: vk::QueryPool,
}

impl Drop for VulkanQueryPool {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_query_pool(Some(self.query_pool), None) };
    }
}

fn buffer_usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS_KHR;
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags = flags | vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.intersects(BufferUsage::STORAGE | BufferUsage::ACCELERATION_STRUCTURE_SCRATCH) {
        flags = flags | vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT) {
        flags = flags | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
        flags = flags | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    flags
}

fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut result = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(BuildFlags::ALLOW_UPDATE) {
        result = result | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(BuildFlags::ALLOW_COMPACTION) {
        result = result | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    if flags.contains(BuildFlags::PREFER_FAST_TRACE) {
        result = result | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
        result = result | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    result
}

fn accel_type(ty: AccelType) -> vk::AccelerationStructureTypeKHR {
    match ty {
        AccelType::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelType::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn build_mode(mode: BuildMode) -> vk::BuildAccelerationStructureModeKHR {
    match mode {
        BuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
        BuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
    }
}

fn geometry_info(
    geometry: &AccelGeometry,
) -> (
    Vec<vk::AccelerationStructureGeometryKHR>,
    Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
) {
    match geometry {
        AccelGeometry::Triangles(triangles) => triangles
            .iter()
            .map(|triangle| {
                let geometry_triangles_data = vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_format: vk::Format::R32G32B32_SFLOAT,
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: triangle.vertex_address,
                    },
                    vertex_stride: triangle.vertex_stride,
                    max_vertex: triangle.max_vertex,
                    index_type: vk::IndexType::UINT32,
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: triangle.index_address,
                    },
                    transform_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: triangle.transform_address,
                    },
                    ..Default::default()
                };
                let geometry = vk::AccelerationStructureGeometryKHR {
                    geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                    geometry: vk::AccelerationStructureGeometryDataKHR {
                        triangles: geometry_triangles_data,
                    },
                    flags: vk::GeometryFlagsKHR::OPAQUE,
                    ..Default::default()
                };
                let build_range_info = vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: triangle.triangle_count,
                    primitive_offset: 0,
                    first_vertex: 0,
                    transform_offset: 0,
                };
                (geometry, build_range_info)
            })
            .unzip(),
        AccelGeometry::Instances { address, count } => {
            let geometry_instance_data = vk::AccelerationStructureGeometryInstancesDataKHR {
                data: vk::DeviceOrHostAddressConstKHR {
                    device_address: *address,
                },
                ..Default::default()
            };
            let geometry = vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::INSTANCES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    instances: geometry_instance_data,
                },
                ..Default::default()
            };
            let build_range_info = vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: *count,
                primitive_offset: 0,
                first_vertex: 0,
                transform_offset: 0,
            };
            (vec![geometry], vec![build_range_info])
        }
    }
}

pub struct VulkanDevice {
    context: Arc<Context>,
    queue: Mutex<vk::Queue>,
}

impl VulkanDevice {
    pub fn new(context: &Arc<Context>) -> Self {
        Self {
            context: Arc::clone(context),
            queue: Mutex::new(context.queue),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn is_ray_tracing_supported(&self) -> bool {
        self.context.is_ray_tracing_supported
    }

    pub fn wait_idle(&self) -> Result<(), DeviceError> {
        let _queue = self.queue.lock();
        unsafe { self.context.device.device_wait_idle() }.map_err(device_error)
    }

    fn memory_barrier(
        &self,
        cmd: &VulkanCommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        src_access_mask: vk::AccessFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        dst_access_mask: vk::AccessFlags,
    ) {
        let memory_barrier = vk::MemoryBarrier {
            src_access_mask,
            dst_access_mask,
            ..Default::default()
        };
        unsafe {
            self.context.device.cmd_pipeline_barrier(
                cmd.cmd,
                src_stage_mask,
                dst_stage_mask,
                vk::DependencyFlags::empty(),
                slice::from_ref(&memory_barrier),
                &[],
                &[],
            )
        }
    }
}

impl Device for VulkanDevice {
    type Buffer = VulkanBuffer;
    type AccelerationStructure = VulkanAccel;
    type CommandBuffer = VulkanCommandBuffer;
    type Semaphore = VulkanSemaphore;
    type QueryPool = VulkanQueryPool;

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<VulkanBuffer, DeviceError> {
        let device = &self.context.device;
        let buffer = {
            let buffer_create_info = vk::BufferCreateInfo {
                size,
                usage: buffer_usage_flags(usage),
                ..Default::default()
            };
            unsafe { device.create_buffer(&buffer_create_info, None) }.map_err(device_error)?
        };
        let memory_property_flags = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        };
        let alloc = Alloc::for_buffer(&self.context, buffer, memory_property_flags).and_then(|alloc| {
            let mapping = match location {
                MemoryLocation::DeviceLocal => None,
                MemoryLocation::HostVisible => Some(alloc.map()?),
            };
            Ok((alloc, mapping))
        });
        let (alloc, mapping) = match alloc {
            Ok(pair) => pair,
            Err(err) => {
                unsafe { device.destroy_buffer(Some(buffer), None) };
                return Err(err);
            }
        };
        let address = unsafe { device.get_buffer_device_address_helper(buffer) };
        Ok(VulkanBuffer {
            context: Arc::clone(&self.context),
            buffer,
            size,
            address,
            mapping,
            _alloc: alloc,
        })
    }

    fn buffer_address(&self, buffer: &VulkanBuffer) -> DeviceAddress {
        buffer.address
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let mapping = match buffer.mapping {
            Some(mapping) => mapping,
            None => panic!("buffer is not host visible"),
        };
        assert!(
            offset + data.len() as u64 <= buffer.size,
            "write of {} bytes at offset {} overflows buffer of size {}",
            data.len(),
            offset,
            buffer.size
        );
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), mapping.add(offset as usize), data.len()) };
        Ok(())
    }

    fn accel_build_sizes(&self, flags: BuildFlags, geometry: &AccelGeometry) -> AccelBuildSizes {
        let (geometries, build_range_infos) = geometry_info(geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: accel_type(geometry.ty()),
            flags: build_flags(flags),
            mode: vk::BuildAccelerationStructureModeKHR::BUILD,
            geometry_count: geometries.len() as u32,
            p_geometries: geometries.as_ptr(),
            ..Default::default()
        };
        let max_primitive_counts: Vec<u32> = build_range_infos.iter().map(|info| info.primitive_count).collect();

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.context.device.get_acceleration_structure_build_sizes_khr(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                Some(max_primitive_counts.as_slice()),
                &mut sizes,
            )
        };
        AccelBuildSizes {
            accel_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        }
    }

    fn create_accel(&self, ty: AccelType, size: u64) -> Result<VulkanAccel, DeviceError> {
        let buffer = self.create_buffer(
            size,
            BufferUsage::ACCELERATION_STRUCTURE_STORAGE,
            MemoryLocation::DeviceLocal,
        )?;
        let accel = {
            let create_info = vk::AccelerationStructureCreateInfoKHR {
                buffer: Some(buffer.buffer),
                size,
                ty: accel_type(ty),
                ..Default::default()
            };
            unsafe { self.context.device.create_acceleration_structure_khr(&create_info, None) }
                .map_err(device_error)?
        };
        let address = unsafe { self.context.device.get_accel_device_address_helper(accel) };
        Ok(VulkanAccel {
            context: Arc::clone(&self.context),
            accel,
            address,
            _buffer: buffer,
        })
    }

    fn accel_address(&self, accel: &VulkanAccel) -> DeviceAddress {
        accel.address
    }

    fn allocate_command_buffer(&self) -> Result<VulkanCommandBuffer, DeviceError> {
        let device = &self.context.device;
        let pool = {
            let command_pool_create_info = vk::CommandPoolCreateInfo {
                queue_family_index: self.context.queue_family_index,
                ..Default::default()
            };
            unsafe { device.create_command_pool(&command_pool_create_info, None) }.map_err(device_error)?
        };
        let command_buffer_allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: Some(pool),
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let command_buffers: spark::Result<[vk::CommandBuffer; 1]> =
            unsafe { device.allocate_command_buffers_array(&command_buffer_allocate_info) };
        match command_buffers {
            Ok([cmd]) => Ok(VulkanCommandBuffer {
                context: Arc::clone(&self.context),
                pool,
                cmd,
            }),
            Err(err) => {
                unsafe { device.destroy_command_pool(Some(pool), None) };
                Err(device_error(err))
            }
        }
    }

    fn begin_commands(&self, cmd: &VulkanCommandBuffer) -> Result<(), DeviceError> {
        let device = &self.context.device;
        unsafe { device.reset_command_pool(cmd.pool, vk::CommandPoolResetFlags::empty()) }.map_err(device_error)?;
        let command_buffer_begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe { device.begin_command_buffer(cmd.cmd, &command_buffer_begin_info) }.map_err(device_error)
    }

    fn end_commands(&self, cmd: &VulkanCommandBuffer) -> Result<(), DeviceError> {
        unsafe { self.context.device.end_command_buffer(cmd.cmd) }.map_err(device_error)
    }

    fn cmd_build_accel(&self, cmd: &VulkanCommandBuffer, build: &AccelBuild<Self>) {
        let (geometries, build_range_infos) = geometry_info(&build.geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: accel_type(build.geometry.ty()),
            flags: build_flags(build.flags),
            mode: build_mode(build.mode),
            src_acceleration_structure: build.src.map(|src| src.accel),
            dst_acceleration_structure: Some(build.dst.accel),
            geometry_count: geometries.len() as u32,
            p_geometries: geometries.as_ptr(),
            scratch_data: vk::DeviceOrHostAddressKHR {
                device_address: build.scratch_address,
            },
            ..Default::default()
        };
        unsafe {
            self.context.device.cmd_build_acceleration_structures_khr(
                cmd.cmd,
                slice::from_ref(&build_info),
                &[build_range_infos.as_ptr()],
            )
        };
    }

    fn cmd_build_barrier(&self, cmd: &VulkanCommandBuffer) {
        self.memory_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        );
    }

    fn cmd_top_level_read_barrier(&self, cmd: &VulkanCommandBuffer, _accel: &VulkanAccel) {
        self.memory_barrier(
            cmd,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        );
    }

    fn create_query_pool(&self, query_count: u32) -> Result<VulkanQueryPool, DeviceError> {
        let create_info = vk::QueryPoolCreateInfo {
            query_type: vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
            query_count,
            ..Default::default()
        };
        let query_pool = unsafe { self.context.device.create_query_pool(&create_info, None) }.map_err(device_error)?;
        Ok(VulkanQueryPool {
            context: Arc::clone(&self.context),
            query_pool,
        })
    }

    fn cmd_reset_queries(&self, cmd: &VulkanCommandBuffer, pool: &VulkanQueryPool, first: u32, count: u32) {
        unsafe {
            self.context
                .device
                .cmd_reset_query_pool(cmd.cmd, pool.query_pool, first, count)
        };
    }

    fn cmd_write_compacted_size(
        &self,
        cmd: &VulkanCommandBuffer,
        accel: &VulkanAccel,
        pool: &VulkanQueryPool,
        query: u32,
    ) {
        unsafe {
            self.context.device.cmd_write_acceleration_structures_properties_khr(
                cmd.cmd,
                slice::from_ref(&accel.accel),
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool.query_pool,
                query,
            )
        };
    }

    fn read_compacted_sizes(&self, pool: &VulkanQueryPool, count: u32) -> Result<Vec<u64>, DeviceError> {
        let mut results = vec![0u64; count as usize];
        unsafe {
            self.context.device.get_query_pool_results(
                pool.query_pool,
                0,
                count,
                results.as_mut_slice(),
                mem::size_of::<u64>() as vk::DeviceSize,
                vk::QueryResultFlags::N64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(device_error)?;
        Ok(results)
    }

    fn cmd_copy_compact(&self, cmd: &VulkanCommandBuffer, src: &VulkanAccel, dst: &VulkanAccel) {
        let copy_info = vk::CopyAccelerationStructureInfoKHR {
            src: Some(src.accel),
            dst: Some(dst.accel),
            mode: vk::CopyAccelerationStructureModeKHR::COMPACT,
            ..Default::default()
        };
        unsafe { self.context.device.cmd_copy_acceleration_structure_khr(cmd.cmd, &copy_info) };
    }

    fn create_semaphore(&self) -> Result<VulkanSemaphore, DeviceError> {
        let semaphore = unsafe { self.context.device.create_semaphore(&Default::default(), None) }.map_err(device_error)?;
        Ok(VulkanSemaphore {
            context: Arc::clone(&self.context),
            semaphore,
        })
    }

    fn submit(
        &self,
        command_buffers: &[&VulkanCommandBuffer],
        wait: Option<&VulkanSemaphore>,
        signal: Option<&VulkanSemaphore>,
    ) -> Result<(), DeviceError> {
        let cmds: Vec<vk::CommandBuffer> = command_buffers.iter().map(|cmd| cmd.cmd).collect();
        let wait_stage_mask =
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR | vk::PipelineStageFlags::COMPUTE_SHADER;

        let mut submit_info = vk::SubmitInfo::builder().p_command_buffers(&cmds);
        if let Some(wait) = wait {
            submit_info =
                submit_info.p_wait_semaphores(slice::from_ref(&wait.semaphore), slice::from_ref(&wait_stage_mask));
        }
        if let Some(signal) = signal {
            submit_info = submit_info.p_signal_semaphores(slice::from_ref(&signal.semaphore));
        }

        let queue = self.queue.lock();
        unsafe {
            self.context
                .device
                .queue_submit(*queue, slice::from_ref(&*submit_info), None)
        }
        .map_err(device_error)
    }
}
