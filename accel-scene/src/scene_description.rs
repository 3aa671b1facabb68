//! Flat arrays that let shaders map a ray hit back to vertex and material
//! data, independent of the acceleration structure format.

use crate::{
    buffer::GrowableBuffer,
    device::*,
    error::DeviceError,
    graveyard::Retired,
};
use bytemuck::{Pod, Zeroable};

/// One entry per mesh, in group creation order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Zeroable, Pod)]
pub struct GeometryRecord {
    pub vertex_buffer_address: u64,
    pub index_buffer_address: u64,
    pub material_index: u32,
    pub _pad: u32,
}

/// One entry per top level instance, in placement order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Zeroable, Pod)]
pub struct InstanceRecord {
    pub first_geometry_index: u32,
}

/// CPU copy of the geometry array. `version` changes on every edit so each
/// frame slot knows when its GPU copy is stale.
#[derive(Default)]
pub(crate) struct GeometryTable {
    records: Vec<GeometryRecord>,
    version: u64,
}

impl GeometryTable {
    /// Appends records and returns the index of the first one.
    pub fn append(&mut self, records: &[GeometryRecord]) -> u32 {
        let offset = self.records.len() as u32;
        self.records.extend_from_slice(records);
        self.version += 1;
        offset
    }

    /// Replaces the contents with the given runs of records, packed in
    /// order, and returns the new offset of each run.
    pub fn repack<'a>(&mut self, runs: impl IntoIterator<Item = &'a [GeometryRecord]>) -> Vec<u32> {
        self.records.clear();
        let offsets = runs
            .into_iter()
            .map(|run| {
                let offset = self.records.len() as u32;
                self.records.extend_from_slice(run);
                offset
            })
            .collect();
        self.version += 1;
        offsets
    }

    pub fn records(&self) -> &[GeometryRecord] {
        &self.records
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

pub struct BufferView<'a, D: Device> {
    pub buffer: &'a D::Buffer,
    pub count: usize,
    pub size: u64,
}

/// The per-frame-slot GPU copies of both arrays.
pub(crate) struct SceneDescriptionBuffers<D: Device> {
    geometries: GrowableBuffer<D>,
    geometry_count: usize,
    geometry_version: Option<u64>,
    instances: GrowableBuffer<D>,
    instance_count: usize,
}

impl<D: Device> SceneDescriptionBuffers<D> {
    pub fn new() -> Self {
        let usage = BufferUsage::STORAGE;
        Self {
            geometries: GrowableBuffer::new(usage, MemoryLocation::HostVisible),
            geometry_count: 0,
            geometry_version: None,
            instances: GrowableBuffer::new(usage, MemoryLocation::HostVisible),
            instance_count: 0,
        }
    }

    /// Returns true if this slot's copy was refreshed.
    pub fn upload_geometries(
        &mut self,
        device: &D,
        table: &GeometryTable,
        retired: &mut Vec<Retired<D>>,
    ) -> Result<bool, DeviceError> {
        if self.geometry_version == Some(table.version()) {
            return Ok(false);
        }
        let bytes: &[u8] = bytemuck::cast_slice(table.records());
        if !bytes.is_empty() {
            let buffer = self.geometries.ensure(device, bytes.len() as u64, retired)?;
            device.write_buffer(buffer, 0, bytes)?;
        }
        self.geometry_count = table.records().len();
        self.geometry_version = Some(table.version());
        Ok(true)
    }

    pub fn upload_instances(
        &mut self,
        device: &D,
        records: &[InstanceRecord],
        retired: &mut Vec<Retired<D>>,
    ) -> Result<(), DeviceError> {
        let bytes: &[u8] = bytemuck::cast_slice(records);
        if !bytes.is_empty() {
            let buffer = self.instances.ensure(device, bytes.len() as u64, retired)?;
            device.write_buffer(buffer, 0, bytes)?;
        }
        self.instance_count = records.len();
        Ok(())
    }

    pub fn geometries(&self) -> Option<BufferView<D>> {
        Self::view::<GeometryRecord>(&self.geometries, self.geometry_count)
    }

    pub fn instances(&self) -> Option<BufferView<D>> {
        Self::view::<InstanceRecord>(&self.instances, self.instance_count)
    }

    fn view<T>(buffer: &GrowableBuffer<D>, count: usize) -> Option<BufferView<D>> {
        if count == 0 {
            return None;
        }
        buffer.buffer().map(|buffer| BufferView {
            buffer,
            count,
            size: (count * std::mem::size_of::<T>()) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::RecordingDevice;

    fn record(n: u64) -> GeometryRecord {
        GeometryRecord {
            vertex_buffer_address: n,
            index_buffer_address: n + 1,
            material_index: n as u32,
            _pad: 0,
        }
    }

    #[test]
    fn record_layouts() {
        assert_eq!(std::mem::size_of::<GeometryRecord>(), 24);
        assert_eq!(std::mem::align_of::<GeometryRecord>(), 8);
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 4);

        let bytes = bytemuck::bytes_of(&GeometryRecord {
            vertex_buffer_address: 0x0102,
            index_buffer_address: 0x0304,
            material_index: 5,
            _pad: 0,
        })
        .to_vec();
        assert_eq!(&bytes[0..8], &0x0102u64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &0x0304u64.to_ne_bytes());
        assert_eq!(&bytes[16..20], &5u32.to_ne_bytes());
    }

    #[test]
    fn append_returns_previous_length() {
        let mut table = GeometryTable::default();
        assert_eq!(table.append(&[record(0), record(1)]), 0);
        assert_eq!(table.append(&[record(2)]), 2);
        assert_eq!(table.append(&[]), 3);
        assert_eq!(table.records().len(), 3);
    }

    #[test]
    fn repack_closes_gaps() {
        let mut table = GeometryTable::default();
        let a = [record(0)];
        let c = [record(4), record(5)];
        table.append(&a);
        table.append(&[record(2), record(3)]);
        table.append(&c);
        let version = table.version();

        let offsets = table.repack([&a[..], &c[..]]);
        assert_eq!(offsets, vec![0, 1]);
        assert_eq!(table.records(), &[record(0), record(4), record(5)]);
        assert!(table.version() > version);
    }

    #[test]
    fn uploads_only_when_stale() {
        let device = RecordingDevice::new();
        let mut retired = Vec::new();
        let mut table = GeometryTable::default();
        let mut buffers = SceneDescriptionBuffers::<RecordingDevice>::new();
        assert!(buffers.geometries().is_none());

        table.append(&[record(8), record(16)]);
        assert!(buffers.upload_geometries(&device, &table, &mut retired).unwrap());
        assert!(!buffers.upload_geometries(&device, &table, &mut retired).unwrap());

        let view = buffers.geometries().unwrap();
        assert_eq!(view.count, 2);
        assert_eq!(view.size, 48);
        assert_eq!(view.buffer.read_pod::<GeometryRecord>(2), vec![record(8), record(16)]);
    }

    #[test]
    fn instance_records_follow_placements() {
        let device = RecordingDevice::new();
        let mut retired = Vec::new();
        let mut buffers = SceneDescriptionBuffers::<RecordingDevice>::new();
        let records: Vec<_> = [0, 0, 1, 1, 2]
            .iter()
            .map(|&first_geometry_index| InstanceRecord { first_geometry_index })
            .collect();
        buffers.upload_instances(&device, &records, &mut retired).unwrap();
        let view = buffers.instances().unwrap();
        assert_eq!(view.count, 5);
        assert_eq!(view.buffer.read_pod::<InstanceRecord>(5), records);

        buffers.upload_instances(&device, &[], &mut retired).unwrap();
        assert!(buffers.instances().is_none());
    }
}
