use crate::{
    device::{Device, DeviceAddress},
    geometry::GeometryGroup,
    maths::*,
    slot_pool::SlotIndex,
};
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

bitflags! {
    /// Bit values match `VkGeometryInstanceFlagBitsKHR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 0x1;
        const TRIANGLE_FLIP_FACING = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NO_OPAQUE = 0x8;
    }
}

impl Default for InstanceFlags {
    fn default() -> Self {
        Self::TRIANGLE_FACING_CULL_DISABLE | Self::FORCE_OPAQUE
    }
}

/// The placement record consumed by a top level build, laid out as
/// `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Zeroable, Pod)]
pub struct AccelerationStructureInstance {
    pub transform: TransposedTransform3,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl AccelerationStructureInstance {
    pub const CUSTOM_INDEX_MASK: u32 = 0x00ff_ffff;

    pub fn new(transform: TransposedTransform3, accel_address: DeviceAddress) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: 0xff << 24,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: accel_address,
        }
    }

    pub fn with_instance_custom_index(mut self, instance_custom_index: u32) -> Self {
        self.instance_custom_index_and_mask =
            (self.instance_custom_index_and_mask & !Self::CUSTOM_INDEX_MASK) | (instance_custom_index & Self::CUSTOM_INDEX_MASK);
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask =
            (self.instance_custom_index_and_mask & Self::CUSTOM_INDEX_MASK) | ((mask as u32) << 24);
        self
    }

    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags =
            (self.instance_shader_binding_table_record_offset_and_flags & 0x00ff_ffff) | ((flags.bits() as u32) << 24);
        self
    }

    pub fn instance_custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & Self::CUSTOM_INDEX_MASK
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.instance_shader_binding_table_record_offset_and_flags >> 24) as u8)
    }
}

/// The user-editable part of an instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceDesc {
    pub transform: Mat4,
    pub mask: u8,
    /// Only the low 24 bits reach the placement record.
    pub custom_index: u32,
    pub flags: InstanceFlags,
    pub color: Vec4,
    pub is_enabled: bool,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self {
            transform: Mat4::identity(),
            mask: 0xff,
            custom_index: 0,
            flags: InstanceFlags::default(),
            color: Vec4::one(),
            is_enabled: true,
        }
    }
}

#[derive(Default)]
struct Derived {
    record: Option<AccelerationStructureInstance>,
    is_modified: bool,
}

/// A placement of a geometry group in the scene.
///
/// The group is held weakly: once it is dropped the instance stops being
/// usable but stays valid.
pub struct Instance<D: Device> {
    slot: SlotIndex,
    group: Weak<GeometryGroup<D>>,
    desc: Mutex<InstanceDesc>,
    derived: Mutex<Derived>,
}

impl<D: Device> Instance<D> {
    pub(crate) fn new(slot: SlotIndex, group: &Arc<GeometryGroup<D>>) -> Self {
        Self {
            slot,
            group: Arc::downgrade(group),
            desc: Mutex::new(Default::default()),
            derived: Mutex::new(Default::default()),
        }
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    pub fn group(&self) -> Option<Arc<GeometryGroup<D>>> {
        self.group.upgrade()
    }

    pub fn desc(&self) -> InstanceDesc {
        *self.desc.lock()
    }

    pub fn modify<R>(&self, f: impl FnOnce(&mut InstanceDesc) -> R) -> R {
        f(&mut self.desc.lock())
    }

    pub fn set_transform(&self, transform: Mat4) {
        self.desc.lock().transform = transform;
    }

    pub fn set_enabled(&self, is_enabled: bool) {
        self.desc.lock().is_enabled = is_enabled;
    }

    pub fn is_usable(&self) -> bool {
        self.desc.lock().is_enabled && self.group.upgrade().map_or(false, |group| group.is_built())
    }

    /// Whether the last [`update`](Self::update) changed the placement record.
    pub fn has_been_modified(&self) -> bool {
        self.derived.lock().is_modified
    }

    /// The placement record from the last successful [`update`](Self::update).
    pub fn record(&self) -> Option<AccelerationStructureInstance> {
        self.derived.lock().record
    }

    /// Recomputes the placement record. Returns the record and the owning
    /// group when the instance is usable this frame, otherwise `None`.
    pub fn update(&self) -> Option<(AccelerationStructureInstance, Arc<GeometryGroup<D>>)> {
        let desc = self.desc();
        let mut derived = self.derived.lock();
        derived.is_modified = false;
        if !desc.is_enabled {
            return None;
        }
        let group = self.group.upgrade()?;
        let accel_address = group.accel_address()?;

        let record = AccelerationStructureInstance::new(TransposedTransform3::from_mat4(&desc.transform), accel_address)
            .with_instance_custom_index(desc.custom_index)
            .with_mask(desc.mask)
            .with_flags(desc.flags);
        if derived.record != Some(record) {
            derived.is_modified = true;
            derived.record = Some(record);
        }
        Some((record, group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::*,
        geometry::MeshDesc,
        graveyard::RetireQueue,
        recording::RecordingDevice,
        slot_pool::SlotPool,
    };

    struct Fixture {
        device: Arc<RecordingDevice>,
        groups: SlotPool<GeometryGroup<RecordingDevice>>,
        instances: SlotPool<Instance<RecordingDevice>>,
        retired: Arc<RetireQueue<RecordingDevice>>,
        _buffers: Vec<<RecordingDevice as Device>::Buffer>,
        mesh: MeshDesc,
    }

    impl Fixture {
        fn new() -> Self {
            let device = Arc::new(RecordingDevice::new());
            let buffer = device
                .create_buffer(1024, BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT, MemoryLocation::DeviceLocal)
                .unwrap();
            let address = device.buffer_address(&buffer);
            Self {
                device,
                groups: SlotPool::new(4),
                instances: SlotPool::new(4),
                retired: Arc::new(RetireQueue::new()),
                _buffers: vec![buffer],
                mesh: MeshDesc {
                    vertex_buffer_address: address,
                    vertex_stride: 12,
                    vertex_count: 3,
                    index_buffer_address: address + 512,
                    triangle_count: 1,
                },
            }
        }

        fn built_group(&self) -> Arc<GeometryGroup<RecordingDevice>> {
            let group = self
                .groups
                .try_create(|slot| {
                    GeometryGroup::new(&self.device, &self.retired, slot, &[self.mesh], &[Mat4::identity()], &[0], false)
                })
                .unwrap();
            let accel = self.device.create_accel(AccelType::BottomLevel, 4096).unwrap();
            group.install(accel, group.dirty_epoch());
            group
        }

        fn instance(&self, group: &Arc<GeometryGroup<RecordingDevice>>) -> Arc<Instance<RecordingDevice>> {
            self.instances.create(|slot| Instance::new(slot, group))
        }
    }

    #[test]
    fn record_packing() {
        let record = AccelerationStructureInstance::new(TransposedTransform3::IDENTITY, 0x1000)
            .with_instance_custom_index(0x0123_4567)
            .with_mask(0x0f)
            .with_flags(InstanceFlags::FORCE_OPAQUE);
        assert_eq!(std::mem::size_of::<AccelerationStructureInstance>(), 64);
        assert_eq!(record.instance_custom_index(), 0x0023_4567);
        assert_eq!(record.mask(), 0x0f);
        assert_eq!(record.flags(), InstanceFlags::FORCE_OPAQUE);
        assert_eq!(record.instance_custom_index_and_mask, 0x0f23_4567);
        assert_eq!(record.instance_shader_binding_table_record_offset_and_flags, 0x0400_0000);
        assert_eq!(record.acceleration_structure_reference, 0x1000);
    }

    #[test]
    fn modified_only_when_record_changes() {
        let fixture = Fixture::new();
        let group = fixture.built_group();
        let instance = fixture.instance(&group);

        assert!(instance.update().is_some());
        assert!(instance.has_been_modified());
        assert!(instance.update().is_some());
        assert!(!instance.has_been_modified());

        instance.set_transform(Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)));
        instance.update();
        assert!(instance.has_been_modified());

        instance.modify(|desc| desc.color = Vec4::new(1.0, 0.0, 0.0, 1.0));
        instance.update();
        assert!(!instance.has_been_modified());

        instance.modify(|desc| desc.mask = 0x01);
        instance.update();
        assert!(instance.has_been_modified());
        assert_eq!(instance.record().unwrap().mask(), 0x01);
    }

    #[test]
    fn new_structure_address_marks_modified() {
        let fixture = Fixture::new();
        let group = fixture.built_group();
        let instance = fixture.instance(&group);
        instance.update();

        let accel = fixture.device.create_accel(AccelType::BottomLevel, 4096).unwrap();
        let old = group.install(accel, group.dirty_epoch());
        instance.update();
        assert!(instance.has_been_modified());
        drop(old);
    }

    #[test]
    fn unusable_without_built_group() {
        let fixture = Fixture::new();
        let group = fixture.built_group();
        let instance = fixture.instance(&group);
        assert!(instance.is_usable());

        group.set_dirty();
        assert!(!instance.is_usable());
        assert!(instance.update().is_none());
        assert!(!instance.has_been_modified());

        let group = fixture.built_group();
        let orphan = fixture.instance(&group);
        drop(group);
        assert!(!orphan.is_usable());
        assert!(orphan.update().is_none());
        assert!(orphan.group().is_none());
    }

    #[test]
    fn disabled_instances_are_not_usable() {
        let fixture = Fixture::new();
        let group = fixture.built_group();
        let instance = fixture.instance(&group);
        instance.set_enabled(false);
        assert!(!instance.is_usable());
        assert!(instance.update().is_none());
        instance.set_enabled(true);
        assert!(instance.update().is_some());
    }
}
