//! A headless [`Device`] that records what it is asked to do.
//!
//! Buffers live in host memory, structures are sized by a simple
//! deterministic rule, and every submission is appended to a log that tests
//! and dry runs can inspect. Binary semaphore rules are checked on submit.

use crate::{device::*, error::DeviceError, maths::AlignUp};
use bytemuck::Pod;
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

const ADDRESS_ALIGNMENT: u64 = 256;

new_key_type! {
    struct BufferKey;
    struct AccelKey;
}

struct BufferRecord {
    address: DeviceAddress,
    size: u64,
}

struct AccelRecord {
    ty: AccelType,
    address: DeviceAddress,
    size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCommand {
    BuildAccel {
        ty: AccelType,
        mode: BuildMode,
        flags: BuildFlags,
        primitive_count: u64,
        src: Option<DeviceAddress>,
        dst: DeviceAddress,
        scratch_address: DeviceAddress,
    },
    BuildBarrier,
    TopLevelReadBarrier {
        accel: DeviceAddress,
    },
    ResetQueries {
        first: u32,
        count: u32,
    },
    WriteCompactedSize {
        accel: DeviceAddress,
        query: u32,
    },
    CopyCompact {
        src: DeviceAddress,
        dst: DeviceAddress,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmit {
    pub command_buffer_count: usize,
    pub commands: Vec<RecordedCommand>,
    pub wait: Option<u32>,
    pub signal: Option<u32>,
}

impl RecordedSubmit {
    pub fn builds(&self) -> impl Iterator<Item = &RecordedCommand> {
        self.commands
            .iter()
            .filter(|command| matches!(command, RecordedCommand::BuildAccel { .. }))
    }

    pub fn build_count(&self, ty: AccelType) -> usize {
        self.builds()
            .filter(|command| matches!(command, RecordedCommand::BuildAccel { ty: t, .. } if *t == ty))
            .count()
    }
}

#[derive(Default)]
struct RecordingState {
    buffers: SlotMap<BufferKey, BufferRecord>,
    accels: SlotMap<AccelKey, AccelRecord>,
    submits: Vec<RecordedSubmit>,
    next_address: DeviceAddress,
    signalled: HashSet<u32>,
    submits_before_failure: Option<usize>,
}

impl RecordingState {
    fn allocate_address(&mut self, size: u64) -> DeviceAddress {
        let address = self.next_address;
        self.next_address += size.max(1).align_up(ADDRESS_ALIGNMENT) + ADDRESS_ALIGNMENT;
        address
    }

    fn is_live_address(&self, address: DeviceAddress) -> bool {
        self.buffers
            .values()
            .any(|b| (b.address..b.address + b.size.max(1)).contains(&address))
            || self
                .accels
                .values()
                .any(|a| (a.address..a.address + a.size.max(1)).contains(&address))
    }
}

type SharedState = Arc<Mutex<RecordingState>>;

pub struct RecordingDevice {
    state: SharedState,
    next_semaphore_id: AtomicU32,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RecordingState {
                next_address: ADDRESS_ALIGNMENT,
                ..Default::default()
            })),
            next_semaphore_id: AtomicU32::new(1),
        }
    }

    pub fn submits(&self) -> Vec<RecordedSubmit> {
        self.state.lock().submits.clone()
    }

    pub fn take_submits(&self) -> Vec<RecordedSubmit> {
        std::mem::take(&mut self.state.lock().submits)
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_accel_count(&self, ty: AccelType) -> usize {
        self.state.lock().accels.values().filter(|a| a.ty == ty).count()
    }

    pub fn is_signalled(&self, semaphore: &RecordedSemaphore) -> bool {
        self.state.lock().signalled.contains(&semaphore.id)
    }

    /// Lets `count` more submissions through, then fails the next one with
    /// [`DeviceError::DeviceLost`] without applying any of its effects.
    pub fn fail_submit_after(&self, count: usize) {
        self.state.lock().submits_before_failure = Some(count);
    }

    fn compacted_size(size: u64) -> u64 {
        (size / 2).align_up(ADDRESS_ALIGNMENT)
    }
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RecordedBuffer {
    key: BufferKey,
    address: DeviceAddress,
    size: u64,
    location: MemoryLocation,
    usage: BufferUsage,
    data: Mutex<Vec<u8>>,
    state: SharedState,
}

impl RecordedBuffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Decodes the first `count` elements of a host visible buffer.
    pub fn read_pod<T: Pod>(&self, count: usize) -> Vec<T> {
        let data = self.data.lock();
        data.chunks_exact(std::mem::size_of::<T>())
            .take(count)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

impl Drop for RecordedBuffer {
    fn drop(&mut self) {
        self.state.lock().buffers.remove(self.key);
    }
}

pub struct RecordedAccel {
    key: AccelKey,
    ty: AccelType,
    address: DeviceAddress,
    size: u64,
    state: SharedState,
}

impl RecordedAccel {
    pub fn ty(&self) -> AccelType {
        self.ty
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }
}

impl Drop for RecordedAccel {
    fn drop(&mut self) {
        self.state.lock().accels.remove(self.key);
    }
}

enum QueryEffect {
    Reset {
        results: QueryResults,
        first: u32,
        count: u32,
    },
    Write {
        results: QueryResults,
        query: u32,
        value: u64,
    },
}

#[derive(Default)]
struct CommandState {
    is_recording: bool,
    commands: Vec<RecordedCommand>,
    effects: Vec<QueryEffect>,
}

#[derive(Default)]
pub struct RecordedCommandBuffer {
    state: Mutex<CommandState>,
}

impl RecordedCommandBuffer {
    fn record(&self, command: RecordedCommand) {
        let mut state = self.state.lock();
        assert!(state.is_recording, "command buffer is not recording");
        state.commands.push(command);
    }
}

type QueryResults = Arc<Mutex<Vec<Option<u64>>>>;

pub struct RecordedQueryPool {
    results: QueryResults,
}

#[derive(Debug)]
pub struct RecordedSemaphore {
    id: u32,
}

impl RecordedSemaphore {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Device for RecordingDevice {
    type Buffer = RecordedBuffer;
    type AccelerationStructure = RecordedAccel;
    type CommandBuffer = RecordedCommandBuffer;
    type Semaphore = RecordedSemaphore;
    type QueryPool = RecordedQueryPool;

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<Self::Buffer, DeviceError> {
        let mut state = self.state.lock();
        let address = state.allocate_address(size);
        let key = state.buffers.insert(BufferRecord { address, size });
        let data = match location {
            MemoryLocation::HostVisible => vec![0u8; size as usize],
            MemoryLocation::DeviceLocal => Vec::new(),
        };
        Ok(RecordedBuffer {
            key,
            address,
            size,
            location,
            usage,
            data: Mutex::new(data),
            state: Arc::clone(&self.state),
        })
    }

    fn buffer_address(&self, buffer: &Self::Buffer) -> DeviceAddress {
        buffer.address
    }

    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        assert_eq!(buffer.location, MemoryLocation::HostVisible, "buffer is not host visible");
        let start = offset as usize;
        let end = start + data.len();
        assert!(end as u64 <= buffer.size, "write past the end of a buffer");
        buffer.data.lock()[start..end].copy_from_slice(data);
        Ok(())
    }

    fn accel_build_sizes(&self, _flags: BuildFlags, geometry: &AccelGeometry) -> AccelBuildSizes {
        let primitive_count = geometry.primitive_count();
        let build_scratch_size = (128 * primitive_count + 256).align_up(ADDRESS_ALIGNMENT);
        AccelBuildSizes {
            accel_size: (256 + 64 * primitive_count).align_up(ADDRESS_ALIGNMENT),
            build_scratch_size,
            update_scratch_size: (build_scratch_size / 2).align_up(ADDRESS_ALIGNMENT),
        }
    }

    fn create_accel(&self, ty: AccelType, size: u64) -> Result<Self::AccelerationStructure, DeviceError> {
        let mut state = self.state.lock();
        let address = state.allocate_address(size);
        let key = state.accels.insert(AccelRecord { ty, address, size });
        Ok(RecordedAccel {
            key,
            ty,
            address,
            size,
            state: Arc::clone(&self.state),
        })
    }

    fn accel_address(&self, accel: &Self::AccelerationStructure) -> DeviceAddress {
        accel.address
    }

    fn allocate_command_buffer(&self) -> Result<Self::CommandBuffer, DeviceError> {
        Ok(Default::default())
    }

    fn begin_commands(&self, cmd: &Self::CommandBuffer) -> Result<(), DeviceError> {
        let mut state = cmd.state.lock();
        assert!(!state.is_recording, "command buffer is already recording");
        *state = CommandState {
            is_recording: true,
            ..Default::default()
        };
        Ok(())
    }

    fn end_commands(&self, cmd: &Self::CommandBuffer) -> Result<(), DeviceError> {
        let mut state = cmd.state.lock();
        assert!(state.is_recording, "command buffer is not recording");
        state.is_recording = false;
        Ok(())
    }

    fn cmd_build_accel(&self, cmd: &Self::CommandBuffer, build: &AccelBuild<Self>) {
        let ty = build.geometry.ty();
        assert_eq!(ty, build.dst.ty, "geometry does not match structure type");
        if build.mode == BuildMode::Update {
            assert!(build.src.is_some(), "update without a source structure");
            assert!(build.flags.contains(BuildFlags::ALLOW_UPDATE), "update of a structure without ALLOW_UPDATE");
        }
        let required = self.accel_build_sizes(build.flags, &build.geometry);
        assert!(required.accel_size <= build.dst.size, "structure is too small for its geometry");
        {
            let state = self.state.lock();
            assert!(state.is_live_address(build.scratch_address), "scratch memory is not live");
            match build.geometry {
                AccelGeometry::Triangles(triangles) => {
                    for triangle in triangles {
                        assert!(state.is_live_address(triangle.vertex_address), "vertex buffer is not live");
                        assert!(state.is_live_address(triangle.index_address), "index buffer is not live");
                        if triangle.transform_address != 0 {
                            assert!(
                                state.is_live_address(triangle.transform_address),
                                "transform buffer is not live"
                            );
                        }
                    }
                }
                AccelGeometry::Instances { address, .. } => {
                    assert!(state.is_live_address(address), "instance buffer is not live");
                }
            }
        }
        cmd.record(RecordedCommand::BuildAccel {
            ty,
            mode: build.mode,
            flags: build.flags,
            primitive_count: build.geometry.primitive_count(),
            src: build.src.map(|src| src.address),
            dst: build.dst.address,
            scratch_address: build.scratch_address,
        });
    }

    fn cmd_build_barrier(&self, cmd: &Self::CommandBuffer) {
        cmd.record(RecordedCommand::BuildBarrier);
    }

    fn cmd_top_level_read_barrier(&self, cmd: &Self::CommandBuffer, accel: &Self::AccelerationStructure) {
        cmd.record(RecordedCommand::TopLevelReadBarrier { accel: accel.address });
    }

    fn create_query_pool(&self, query_count: u32) -> Result<Self::QueryPool, DeviceError> {
        Ok(RecordedQueryPool {
            results: Arc::new(Mutex::new(vec![None; query_count as usize])),
        })
    }

    fn cmd_reset_queries(&self, cmd: &Self::CommandBuffer, pool: &Self::QueryPool, first: u32, count: u32) {
        cmd.record(RecordedCommand::ResetQueries { first, count });
        cmd.state.lock().effects.push(QueryEffect::Reset {
            results: Arc::clone(&pool.results),
            first,
            count,
        });
    }

    fn cmd_write_compacted_size(
        &self,
        cmd: &Self::CommandBuffer,
        accel: &Self::AccelerationStructure,
        pool: &Self::QueryPool,
        query: u32,
    ) {
        cmd.record(RecordedCommand::WriteCompactedSize {
            accel: accel.address,
            query,
        });
        cmd.state.lock().effects.push(QueryEffect::Write {
            results: Arc::clone(&pool.results),
            query,
            value: Self::compacted_size(accel.size),
        });
    }

    fn read_compacted_sizes(&self, pool: &Self::QueryPool, count: u32) -> Result<Vec<u64>, DeviceError> {
        let results = pool.results.lock();
        Ok(results[..count as usize]
            .iter()
            .map(|result| result.expect("query result is not available"))
            .collect())
    }

    fn cmd_copy_compact(
        &self,
        cmd: &Self::CommandBuffer,
        src: &Self::AccelerationStructure,
        dst: &Self::AccelerationStructure,
    ) {
        assert!(Self::compacted_size(src.size) <= dst.size, "compacted copy does not fit");
        cmd.record(RecordedCommand::CopyCompact {
            src: src.address,
            dst: dst.address,
        });
    }

    fn create_semaphore(&self) -> Result<Self::Semaphore, DeviceError> {
        Ok(RecordedSemaphore {
            id: self.next_semaphore_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn submit(
        &self,
        command_buffers: &[&Self::CommandBuffer],
        wait: Option<&Self::Semaphore>,
        signal: Option<&Self::Semaphore>,
    ) -> Result<(), DeviceError> {
        {
            let mut state = self.state.lock();
            match state.submits_before_failure {
                Some(0) => {
                    state.submits_before_failure = None;
                    return Err(DeviceError::DeviceLost);
                }
                Some(n) => state.submits_before_failure = Some(n - 1),
                None => {}
            }
        }
        let mut commands = Vec::new();
        for cmd in command_buffers {
            let cmd_state = cmd.state.lock();
            assert!(!cmd_state.is_recording, "submitted a command buffer that is still recording");
            commands.extend(cmd_state.commands.iter().cloned());
            for effect in &cmd_state.effects {
                match effect {
                    QueryEffect::Reset { results, first, count } => {
                        let mut results = results.lock();
                        for result in &mut results[*first as usize..(*first + *count) as usize] {
                            *result = None;
                        }
                    }
                    QueryEffect::Write { results, query, value } => {
                        results.lock()[*query as usize] = Some(*value);
                    }
                }
            }
        }

        let mut state = self.state.lock();
        if let Some(wait) = wait {
            assert!(state.signalled.remove(&wait.id), "waited on a semaphore that is not signalled");
        }
        if let Some(signal) = signal {
            assert!(state.signalled.insert(signal.id), "signalled a semaphore that is already signalled");
        }
        state.submits.push(RecordedSubmit {
            command_buffer_count: command_buffers.len(),
            commands,
            wait: wait.map(|s| s.id),
            signal: signal.map(|s| s.id),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_resources_releases_them() {
        let device = RecordingDevice::new();
        let buffer = device
            .create_buffer(100, BufferUsage::STORAGE, MemoryLocation::HostVisible)
            .unwrap();
        let accel = device.create_accel(AccelType::BottomLevel, 512).unwrap();
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(device.live_accel_count(AccelType::BottomLevel), 1);
        drop(buffer);
        drop(accel);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_accel_count(AccelType::BottomLevel), 0);
    }

    #[test]
    fn addresses_are_distinct_and_aligned() {
        let device = RecordingDevice::new();
        let a = device
            .create_buffer(300, BufferUsage::STORAGE, MemoryLocation::DeviceLocal)
            .unwrap();
        let b = device
            .create_buffer(1, BufferUsage::STORAGE, MemoryLocation::DeviceLocal)
            .unwrap();
        let a_address = device.buffer_address(&a);
        let b_address = device.buffer_address(&b);
        assert_eq!(a_address % ADDRESS_ALIGNMENT, 0);
        assert_eq!(b_address % ADDRESS_ALIGNMENT, 0);
        assert!(b_address >= a_address + 300);
    }

    #[test]
    fn host_writes_are_readable() {
        let device = RecordingDevice::new();
        let buffer = device
            .create_buffer(8, BufferUsage::STORAGE, MemoryLocation::HostVisible)
            .unwrap();
        device.write_buffer(&buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.contents(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn compacted_sizes_arrive_on_submit() {
        let device = RecordingDevice::new();
        let accel = device.create_accel(AccelType::BottomLevel, 1024).unwrap();
        let pool = device.create_query_pool(1).unwrap();
        let cmd = device.allocate_command_buffer().unwrap();
        device.begin_commands(&cmd).unwrap();
        device.cmd_reset_queries(&cmd, &pool, 0, 1);
        device.cmd_write_compacted_size(&cmd, &accel, &pool, 0);
        device.end_commands(&cmd).unwrap();
        device.submit(&[&cmd], None, None).unwrap();
        assert_eq!(device.read_compacted_sizes(&pool, 1).unwrap(), vec![512]);
    }

    #[test]
    fn semaphores_pair_signal_with_wait() {
        let device = RecordingDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        device.submit(&[], None, Some(&semaphore)).unwrap();
        assert!(device.is_signalled(&semaphore));
        device.submit(&[], Some(&semaphore), None).unwrap();
        assert!(!device.is_signalled(&semaphore));

        let submits = device.submits();
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0].signal, Some(semaphore.id()));
        assert_eq!(submits[1].wait, Some(semaphore.id()));
    }

    #[test]
    #[should_panic(expected = "not signalled")]
    fn waiting_on_unsignalled_semaphore_panics() {
        let device = RecordingDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        device.submit(&[], Some(&semaphore), None).unwrap();
    }

    #[test]
    fn injected_submit_failure_has_no_effect() {
        let device = RecordingDevice::new();
        let semaphore = device.create_semaphore().unwrap();
        device.fail_submit_after(1);
        device.submit(&[], None, None).unwrap();
        assert_eq!(
            device.submit(&[], None, Some(&semaphore)),
            Err(DeviceError::DeviceLost)
        );
        assert!(!device.is_signalled(&semaphore));
        assert_eq!(device.submits().len(), 1);
        device.submit(&[], None, Some(&semaphore)).unwrap();
        assert!(device.is_signalled(&semaphore));
    }
}
