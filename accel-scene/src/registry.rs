use crate::{
    device::Device,
    error::DeviceError,
    geometry::{GeometryGroup, MeshDesc},
    graveyard::{RetireQueue, Retired},
    instance::Instance,
    maths::Mat4,
    scene_description::GeometryTable,
    slot_pool::SlotPool,
};
use parking_lot::Mutex;
use std::sync::Arc;

struct RegistryShared<D: Device> {
    device: Arc<D>,
    is_enabled: bool,
    /// Taken for each individual pool operation, never across a whole frame.
    access: Mutex<GeometryTable>,
    groups: SlotPool<GeometryGroup<D>>,
    instances: SlotPool<Instance<D>>,
    retired: Arc<RetireQueue<D>>,
}

/// The thread-safe half of the builder: geometry groups and instances can be
/// added from any thread through a clone of this.
pub struct SceneRegistry<D: Device> {
    shared: Arc<RegistryShared<D>>,
}

impl<D: Device> Clone for SceneRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub(crate) struct Purge<D: Device> {
    pub groups: Vec<Arc<GeometryGroup<D>>>,
    pub instances: Vec<Arc<Instance<D>>>,
    pub groups_purged: usize,
    pub instances_purged: usize,
}

impl<D: Device> SceneRegistry<D> {
    pub(crate) fn new(device: Arc<D>, is_enabled: bool, pool_granularity: usize) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                device,
                is_enabled,
                access: Mutex::new(GeometryTable::default()),
                groups: SlotPool::new(pool_granularity),
                instances: SlotPool::new(pool_granularity),
                retired: Arc::new(RetireQueue::new()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled
    }

    /// Creates a group of meshes that will get one bottom level structure.
    ///
    /// Returns `Ok(None)` when ray tracing is not supported. Panics unless
    /// there is one transform and one material index per mesh.
    #[track_caller]
    pub fn add_geometry_group(
        &self,
        meshes: &[MeshDesc],
        transforms: &[Mat4],
        material_indices: &[u32],
        is_dynamic: bool,
    ) -> Result<Option<Arc<GeometryGroup<D>>>, DeviceError> {
        assert!(!meshes.is_empty(), "a geometry group needs at least one mesh");
        assert_eq!(meshes.len(), transforms.len(), "transform count does not match mesh count");
        assert_eq!(
            meshes.len(),
            material_indices.len(),
            "material index count does not match mesh count"
        );
        if !self.shared.is_enabled {
            return Ok(None);
        }

        let shared = &*self.shared;
        let mut table = shared.access.lock();
        let group = shared.groups.try_create(|slot| {
            GeometryGroup::new(
                &shared.device,
                &shared.retired,
                slot,
                meshes,
                transforms,
                material_indices,
                is_dynamic,
            )
        })?;
        group.set_first_geometry_index(table.append(group.records()));
        tracing::trace!(
            slot = %group.slot(),
            meshes = meshes.len(),
            first_geometry_index = group.first_geometry_index(),
            "added geometry group"
        );
        Ok(Some(group))
    }

    /// Places a group in the scene. Returns `None` when ray tracing is not
    /// supported.
    pub fn add_instance(&self, group: &Arc<GeometryGroup<D>>) -> Option<Arc<Instance<D>>> {
        if !self.shared.is_enabled {
            return None;
        }
        let _access = self.shared.access.lock();
        Some(self.shared.instances.create(|slot| Instance::new(slot, group)))
    }

    /// Collects the live contents of both pools, recycling the slots of
    /// anything dropped. Dropping a group closes the gap it leaves in the
    /// geometry array.
    pub(crate) fn purge(&self) -> Purge<D> {
        let (groups, groups_purged) = {
            let mut table = self.shared.access.lock();
            let (mut groups, groups_purged) = self.shared.groups.collect_live();
            if groups_purged != 0 {
                groups.sort_by_key(|group| group.first_geometry_index());
                let offsets = table.repack(groups.iter().map(|group| group.records()));
                for (group, offset) in groups.iter().zip(offsets) {
                    group.set_first_geometry_index(offset);
                }
            }
            (groups, groups_purged)
        };
        let (instances, instances_purged) = {
            let _access = self.shared.access.lock();
            self.shared.instances.collect_live()
        };
        Purge {
            groups,
            instances,
            groups_purged,
            instances_purged,
        }
    }

    pub(crate) fn drain_retired(&self) -> Vec<Retired<D>> {
        self.shared.retired.drain()
    }

    pub(crate) fn with_geometry_table<R>(&self, f: impl FnOnce(&GeometryTable) -> R) -> R {
        f(&self.shared.access.lock())
    }

    /// One past the highest live instance slot, for arrays indexed by slot.
    pub fn instance_storage_count(&self) -> usize {
        self.shared.instances.required_storage_count()
    }

    pub fn geometry_group_storage_count(&self) -> usize {
        self.shared.groups.required_storage_count()
    }
}
