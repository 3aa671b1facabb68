use crate::{
    device::*,
    error::DeviceError,
    graveyard::{RetireQueue, Retired},
    maths::*,
    scene_description::GeometryRecord,
    slot_pool::SlotIndex,
};
use parking_lot::Mutex;
use std::{
    mem,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

/// A triangle mesh owned by someone else: positions are three 32-bit floats
/// at the start of each vertex, indices are 32-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshDesc {
    pub vertex_buffer_address: DeviceAddress,
    pub vertex_stride: u32,
    pub vertex_count: u32,
    pub index_buffer_address: DeviceAddress,
    pub triangle_count: u32,
}

const TRANSFORM_SIZE: u64 = mem::size_of::<TransposedTransform3>() as u64;

struct GroupState<D: Device> {
    triangles: Vec<TriangleGeometry>,
    transform_buffer: Option<D::Buffer>,
    pending_transforms: Option<Vec<TransposedTransform3>>,
    accel: Option<D::AccelerationStructure>,
    accel_address: DeviceAddress,
}

/// The meshes behind one bottom level acceleration structure.
///
/// The group counts as built when the structure it holds was built from its
/// current contents. Marking it dirty bumps an epoch, so a change that lands
/// while a build is in flight is never lost.
pub struct GeometryGroup<D: Device> {
    slot: SlotIndex,
    is_dynamic: bool,
    records: Vec<GeometryRecord>,
    first_geometry_index: AtomicU32,
    dirty_epoch: AtomicU64,
    built_epoch: AtomicU64,
    state: Mutex<GroupState<D>>,
    device: Arc<D>,
    retired: Arc<RetireQueue<D>>,
}

fn upload_transforms<D: Device>(device: &D, transforms: &[TransposedTransform3]) -> Result<D::Buffer, DeviceError> {
    let buffer = device.create_buffer(
        (transforms.len() as u64 * TRANSFORM_SIZE).max(TRANSFORM_SIZE),
        BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
        MemoryLocation::HostVisible,
    )?;
    device.write_buffer(&buffer, 0, bytemuck::cast_slice(transforms))?;
    Ok(buffer)
}

impl<D: Device> GeometryGroup<D> {
    pub(crate) fn new(
        device: &Arc<D>,
        retired: &Arc<RetireQueue<D>>,
        slot: SlotIndex,
        meshes: &[MeshDesc],
        transforms: &[Mat4],
        material_indices: &[u32],
        is_dynamic: bool,
    ) -> Result<Self, DeviceError> {
        let transforms: Vec<_> = transforms.iter().map(TransposedTransform3::from_mat4).collect();
        let transform_buffer = upload_transforms(device.as_ref(), &transforms)?;
        let transform_base = device.buffer_address(&transform_buffer);

        let triangles = meshes
            .iter()
            .enumerate()
            .map(|(index, mesh)| TriangleGeometry {
                vertex_address: mesh.vertex_buffer_address,
                vertex_stride: mesh.vertex_stride as u64,
                max_vertex: mesh.vertex_count.saturating_sub(1),
                index_address: mesh.index_buffer_address,
                transform_address: transform_base + index as u64 * TRANSFORM_SIZE,
                triangle_count: mesh.triangle_count,
            })
            .collect();
        let records = meshes
            .iter()
            .zip(material_indices)
            .map(|(mesh, &material_index)| GeometryRecord {
                vertex_buffer_address: mesh.vertex_buffer_address,
                index_buffer_address: mesh.index_buffer_address,
                material_index,
                _pad: 0,
            })
            .collect();

        Ok(Self {
            slot,
            is_dynamic,
            records,
            first_geometry_index: AtomicU32::new(0),
            dirty_epoch: AtomicU64::new(1),
            built_epoch: AtomicU64::new(0),
            state: Mutex::new(GroupState {
                triangles,
                transform_buffer: Some(transform_buffer),
                pending_transforms: None,
                accel: None,
                accel_address: 0,
            }),
            device: Arc::clone(device),
            retired: Arc::clone(retired),
        })
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    pub fn mesh_count(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[GeometryRecord] {
        &self.records
    }

    /// Index of this group's first entry in the scene description geometry
    /// array. May move when groups created earlier are dropped.
    pub fn first_geometry_index(&self) -> u32 {
        self.first_geometry_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_first_geometry_index(&self, index: u32) {
        self.first_geometry_index.store(index, Ordering::Release);
    }

    pub fn is_built(&self) -> bool {
        self.built_epoch.load(Ordering::Acquire) == self.dirty_epoch.load(Ordering::Acquire)
    }

    /// Schedules a rebuild on the next frame. A structure already in use by
    /// the GPU is left alone until the rebuild replaces it.
    pub fn set_dirty(&self) {
        self.dirty_epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Queues new per-mesh transforms, applied by the next [`update`](Self::update).
    #[track_caller]
    pub fn set_transforms(&self, transforms: &[Mat4]) {
        assert!(self.is_dynamic, "transforms of a static geometry group are fixed");
        assert_eq!(
            transforms.len(),
            self.records.len(),
            "transform count does not match mesh count"
        );
        self.state.lock().pending_transforms = Some(transforms.iter().map(TransposedTransform3::from_mat4).collect());
    }

    /// Applies queued transforms. Returns true if the group now needs a
    /// rebuild because of it; static groups never do.
    pub fn update(&self) -> Result<bool, DeviceError> {
        if !self.is_dynamic {
            return Ok(false);
        }
        let mut state = self.state.lock();
        let transforms = match state.pending_transforms.take() {
            Some(transforms) => transforms,
            None => return Ok(false),
        };
        let buffer = match upload_transforms(self.device.as_ref(), &transforms) {
            Ok(buffer) => buffer,
            Err(err) => {
                state.pending_transforms = Some(transforms);
                return Err(err);
            }
        };
        let base = self.device.buffer_address(&buffer);
        for (index, triangle) in state.triangles.iter_mut().enumerate() {
            triangle.transform_address = base + index as u64 * TRANSFORM_SIZE;
        }
        if let Some(old) = state.transform_buffer.replace(buffer) {
            self.retired.push(Retired::Buffer(old));
        }
        drop(state);
        self.set_dirty();
        Ok(true)
    }

    pub fn build_flags(&self, compaction: bool) -> BuildFlags {
        if self.is_dynamic {
            BuildFlags::PREFER_FAST_BUILD | BuildFlags::ALLOW_UPDATE
        } else if compaction {
            BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_COMPACTION
        } else {
            BuildFlags::PREFER_FAST_TRACE
        }
    }

    /// The address instances should reference, if the group is built.
    pub fn accel_address(&self) -> Option<DeviceAddress> {
        if !self.is_built() {
            return None;
        }
        let state = self.state.lock();
        state.accel.as_ref().map(|_| state.accel_address)
    }

    pub(crate) fn triangles(&self) -> Vec<TriangleGeometry> {
        self.state.lock().triangles.clone()
    }

    pub(crate) fn dirty_epoch(&self) -> u64 {
        self.dirty_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn built_epoch(&self) -> u64 {
        self.built_epoch.load(Ordering::Acquire)
    }

    /// Installs a structure built from the contents seen at `epoch`,
    /// returning the one it replaces.
    pub(crate) fn install(
        &self,
        accel: D::AccelerationStructure,
        epoch: u64,
    ) -> Option<D::AccelerationStructure> {
        let mut state = self.state.lock();
        state.accel_address = self.device.accel_address(&accel);
        let old = state.accel.replace(accel);
        self.built_epoch.store(epoch, Ordering::Release);
        old
    }

    pub(crate) fn with_accel<R>(&self, f: impl FnOnce(&D::AccelerationStructure) -> R) -> Option<R> {
        self.state.lock().accel.as_ref().map(f)
    }
}

impl<D: Device> Drop for GeometryGroup<D> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(accel) = state.accel.take() {
            self.retired.push(Retired::Accel(accel));
        }
        if let Some(buffer) = state.transform_buffer.take() {
            self.retired.push(Retired::Buffer(buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{recording::RecordingDevice, slot_pool::SlotPool};

    fn mesh(device: &RecordingDevice, keep: &mut Vec<<RecordingDevice as Device>::Buffer>) -> MeshDesc {
        let vertices = device
            .create_buffer(8 * 12, BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT, MemoryLocation::DeviceLocal)
            .unwrap();
        let indices = device
            .create_buffer(36 * 4, BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT, MemoryLocation::DeviceLocal)
            .unwrap();
        let desc = MeshDesc {
            vertex_buffer_address: device.buffer_address(&vertices),
            vertex_stride: 12,
            vertex_count: 8,
            index_buffer_address: device.buffer_address(&indices),
            triangle_count: 12,
        };
        keep.push(vertices);
        keep.push(indices);
        desc
    }

    fn group(
        device: &Arc<RecordingDevice>,
        retired: &Arc<RetireQueue<RecordingDevice>>,
        meshes: &[MeshDesc],
        transforms: &[Mat4],
        is_dynamic: bool,
    ) -> Arc<GeometryGroup<RecordingDevice>> {
        let pool = SlotPool::new(4);
        let materials: Vec<u32> = (0..meshes.len() as u32).collect();
        pool.try_create(|slot| GeometryGroup::new(device, retired, slot, meshes, transforms, &materials, is_dynamic))
            .unwrap()
    }

    #[test]
    fn uploads_transposed_transforms() {
        let device = Arc::new(RecordingDevice::new());
        let retired = Arc::new(RetireQueue::new());
        let mut keep = Vec::new();
        let meshes = [mesh(&device, &mut keep), mesh(&device, &mut keep)];
        let transforms = [Mat4::identity(), Mat4::from_translation(Vec3::new(4.0, 5.0, 6.0))];
        let group = group(&device, &retired, &meshes, &transforms, false);

        let triangles = group.triangles();
        assert_eq!(triangles.len(), 2);
        assert_eq!(triangles[1].transform_address - triangles[0].transform_address, 48);
        assert_eq!(triangles[0].max_vertex, 7);

        let state = group.state.lock();
        let uploaded = state.transform_buffer.as_ref().unwrap().read_pod::<TransposedTransform3>(2);
        assert_eq!(uploaded[0], TransposedTransform3::IDENTITY);
        assert_eq!(uploaded[1].translation(), Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(group.records()[1].material_index, 1);
    }

    #[test]
    fn dirty_epochs() {
        let device = Arc::new(RecordingDevice::new());
        let retired = Arc::new(RetireQueue::new());
        let mut keep = Vec::new();
        let meshes = [mesh(&device, &mut keep)];
        let group = group(&device, &retired, &meshes, &[Mat4::identity()], false);
        assert!(!group.is_built());
        assert!(group.accel_address().is_none());

        let epoch = group.dirty_epoch();
        let accel = device.create_accel(AccelType::BottomLevel, 4096).unwrap();
        let address = accel.address();
        assert!(group.install(accel, epoch).is_none());
        assert!(group.is_built());
        assert_eq!(group.accel_address(), Some(address));

        // dirtied while a build of the old contents was in flight
        let epoch = group.dirty_epoch();
        group.set_dirty();
        let accel = device.create_accel(AccelType::BottomLevel, 4096).unwrap();
        assert!(group.install(accel, epoch).is_some());
        assert!(!group.is_built());
    }

    #[test]
    fn dynamic_update_replaces_transform_buffer() {
        let device = Arc::new(RecordingDevice::new());
        let retired = Arc::new(RetireQueue::new());
        let mut keep = Vec::new();
        let meshes = [mesh(&device, &mut keep)];
        let group = group(&device, &retired, &meshes, &[Mat4::identity()], true);
        let epoch = group.dirty_epoch();
        let accel = device.create_accel(AccelType::BottomLevel, 4096).unwrap();
        group.install(accel, epoch);
        assert!(!group.update().unwrap());

        let before = group.triangles()[0].transform_address;
        group.set_transforms(&[Mat4::from_translation(Vec3::new(0.0, 1.0, 0.0))]);
        assert!(group.update().unwrap());
        assert!(!group.is_built());
        assert_ne!(group.triangles()[0].transform_address, before);
        assert_eq!(retired.drain().len(), 1);
    }

    #[test]
    fn build_flags_follow_kind() {
        let device = Arc::new(RecordingDevice::new());
        let retired = Arc::new(RetireQueue::new());
        let mut keep = Vec::new();
        let meshes = [mesh(&device, &mut keep)];
        let fixed = group(&device, &retired, &meshes, &[Mat4::identity()], false);
        let dynamic = group(&device, &retired, &meshes, &[Mat4::identity()], true);
        assert_eq!(fixed.build_flags(false), BuildFlags::PREFER_FAST_TRACE);
        assert!(fixed.build_flags(true).contains(BuildFlags::ALLOW_COMPACTION));
        assert_eq!(
            dynamic.build_flags(true),
            BuildFlags::PREFER_FAST_BUILD | BuildFlags::ALLOW_UPDATE
        );
    }

    #[test]
    fn dropping_retires_device_resources() {
        let device = Arc::new(RecordingDevice::new());
        let retired = Arc::new(RetireQueue::new());
        let mut keep = Vec::new();
        let meshes = [mesh(&device, &mut keep)];
        let group = group(&device, &retired, &meshes, &[Mat4::identity()], false);
        let accel = device.create_accel(AccelType::BottomLevel, 4096).unwrap();
        group.install(accel, group.dirty_epoch());
        drop(group);

        let items = retired.drain();
        assert_eq!(items.len(), 2);
        assert_eq!(device.live_accel_count(AccelType::BottomLevel), 1);
        drop(items);
        assert_eq!(device.live_accel_count(AccelType::BottomLevel), 0);
    }

    #[test]
    #[should_panic(expected = "static geometry group")]
    fn static_groups_reject_transforms() {
        let device = Arc::new(RecordingDevice::new());
        let retired = Arc::new(RetireQueue::new());
        let mut keep = Vec::new();
        let meshes = [mesh(&device, &mut keep)];
        let group = group(&device, &retired, &meshes, &[Mat4::identity()], false);
        group.set_transforms(&[Mat4::identity()]);
    }
}
