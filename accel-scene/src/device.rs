use crate::error::DeviceError;
use bitflags::bitflags;

pub type DeviceAddress = u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_DST = 0x1;
        const STORAGE = 0x2;
        const ACCELERATION_STRUCTURE_BUILD_INPUT = 0x4;
        const ACCELERATION_STRUCTURE_STORAGE = 0x8;
        const ACCELERATION_STRUCTURE_SCRATCH = 0x10;
    }
}

bitflags! {
    /// Bit values match `VkBuildAccelerationStructureFlagBitsKHR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 0x1;
        const ALLOW_COMPACTION = 0x2;
        const PREFER_FAST_TRACE = 0x4;
        const PREFER_FAST_BUILD = 0x8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    DeviceLocal,
    /// Host visible and coherent, written with [`Device::write_buffer`].
    HostVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelType {
    BottomLevel,
    TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Build,
    Update,
}

/// One triangle mesh inside a bottom level build. Vertices are three
/// 32-bit floats at the start of each `vertex_stride` bytes, indices are
/// 32-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: DeviceAddress,
    pub vertex_stride: u64,
    pub max_vertex: u32,
    pub index_address: DeviceAddress,
    pub transform_address: DeviceAddress,
    pub triangle_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum AccelGeometry<'a> {
    Triangles(&'a [TriangleGeometry]),
    Instances { address: DeviceAddress, count: u32 },
}

impl<'a> AccelGeometry<'a> {
    pub fn ty(&self) -> AccelType {
        match self {
            Self::Triangles(..) => AccelType::BottomLevel,
            Self::Instances { .. } => AccelType::TopLevel,
        }
    }

    pub fn primitive_count(&self) -> u64 {
        match self {
            Self::Triangles(triangles) => triangles.iter().map(|t| t.triangle_count as u64).sum(),
            Self::Instances { count, .. } => *count as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelBuildSizes {
    pub accel_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

impl AccelBuildSizes {
    pub fn scratch_size(&self, mode: BuildMode) -> u64 {
        match mode {
            BuildMode::Build => self.build_scratch_size,
            BuildMode::Update => self.update_scratch_size,
        }
    }
}

pub struct AccelBuild<'a, D: Device + ?Sized> {
    pub mode: BuildMode,
    pub flags: BuildFlags,
    pub geometry: AccelGeometry<'a>,
    /// Required for [`BuildMode::Update`], may alias `dst`.
    pub src: Option<&'a D::AccelerationStructure>,
    pub dst: &'a D::AccelerationStructure,
    pub scratch_address: DeviceAddress,
}

/// The narrow slice of a graphics device that acceleration structure
/// management needs.
///
/// Resources are released when their values are dropped, so callers must keep
/// them alive until the GPU work that references them has completed. Command
/// recording methods take the command buffer by shared reference; backends
/// that need mutation keep it internally.
pub trait Device: Send + Sync + 'static {
    type Buffer: Send + Sync + 'static;
    type AccelerationStructure: Send + Sync + 'static;
    type CommandBuffer: Send + Sync + 'static;
    type Semaphore: Send + Sync + 'static;
    type QueryPool: Send + Sync + 'static;

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<Self::Buffer, DeviceError>;
    fn buffer_address(&self, buffer: &Self::Buffer) -> DeviceAddress;

    /// Only valid for [`MemoryLocation::HostVisible`] buffers.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    fn accel_build_sizes(&self, flags: BuildFlags, geometry: &AccelGeometry) -> AccelBuildSizes;
    fn create_accel(&self, ty: AccelType, size: u64) -> Result<Self::AccelerationStructure, DeviceError>;
    fn accel_address(&self, accel: &Self::AccelerationStructure) -> DeviceAddress;

    fn allocate_command_buffer(&self) -> Result<Self::CommandBuffer, DeviceError>;
    fn begin_commands(&self, cmd: &Self::CommandBuffer) -> Result<(), DeviceError>;
    fn end_commands(&self, cmd: &Self::CommandBuffer) -> Result<(), DeviceError>;

    fn cmd_build_accel(&self, cmd: &Self::CommandBuffer, build: &AccelBuild<Self>);

    /// Orders acceleration structure writes (builds and copies) before later
    /// builds that read them or reuse their scratch memory.
    fn cmd_build_barrier(&self, cmd: &Self::CommandBuffer);

    /// Makes a finished top level build visible to ray queries in shaders.
    fn cmd_top_level_read_barrier(&self, cmd: &Self::CommandBuffer, accel: &Self::AccelerationStructure);

    fn create_query_pool(&self, query_count: u32) -> Result<Self::QueryPool, DeviceError>;
    fn cmd_reset_queries(&self, cmd: &Self::CommandBuffer, pool: &Self::QueryPool, first: u32, count: u32);
    fn cmd_write_compacted_size(
        &self,
        cmd: &Self::CommandBuffer,
        accel: &Self::AccelerationStructure,
        pool: &Self::QueryPool,
        query: u32,
    );

    /// Reads results without waiting; only call once the queries are known
    /// to have completed.
    fn read_compacted_sizes(&self, pool: &Self::QueryPool, count: u32) -> Result<Vec<u64>, DeviceError>;
    fn cmd_copy_compact(
        &self,
        cmd: &Self::CommandBuffer,
        src: &Self::AccelerationStructure,
        dst: &Self::AccelerationStructure,
    );

    fn create_semaphore(&self) -> Result<Self::Semaphore, DeviceError>;

    /// Submits in order. A semaphore wait blocks acceleration structure
    /// builds and shader stages.
    fn submit(
        &self,
        command_buffers: &[&Self::CommandBuffer],
        wait: Option<&Self::Semaphore>,
        signal: Option<&Self::Semaphore>,
    ) -> Result<(), DeviceError>;
}
