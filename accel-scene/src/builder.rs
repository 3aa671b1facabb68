use crate::{
    buffer::GrowableBuffer,
    device::*,
    error::DeviceError,
    geometry::{GeometryGroup, MeshDesc},
    graveyard::{Graveyard, Retired},
    instance::{AccelerationStructureInstance, Instance},
    maths::*,
    params::*,
    policy::*,
    registry::SceneRegistry,
    scene_description::{BufferView, InstanceRecord, SceneDescriptionBuffers},
    slot_pool::SlotIndex,
};
use arrayvec::ArrayVec;
use std::{
    mem,
    sync::{Arc, Weak},
};

const SCRATCH_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    pub frame_index: u64,
    /// Which of the frames in flight is being recorded.
    pub swapchain_index: usize,
}

impl FrameContext {
    pub fn new(frame_index: u64, frames_in_flight: usize) -> Self {
        Self {
            frame_index,
            swapchain_index: (frame_index % frames_in_flight as u64) as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub groups_purged: usize,
    pub instances_purged: usize,
    pub groups_built: usize,
    pub groups_compacted: usize,
    pub active_instances: usize,
    pub top_level: TopLevelAction,
    pub frames_before_rebuild: u32,
}

struct PendingCompaction<D: Device> {
    group: Weak<GeometryGroup<D>>,
    epoch: u64,
    query: u32,
}

struct Compaction<D: Device> {
    group: Arc<GeometryGroup<D>>,
    accel: D::AccelerationStructure,
    epoch: u64,
}

struct PendingBuild<D: Device> {
    group: Arc<GeometryGroup<D>>,
    epoch: u64,
    triangles: Vec<TriangleGeometry>,
    flags: BuildFlags,
    accel: D::AccelerationStructure,
    scratch_offset: u64,
    query: Option<u32>,
}

/// Identifies a placement: the instance slot and the structure it references.
type PlacementKey = (SlotIndex, DeviceAddress);

struct TopLevel<D: Device> {
    accel: D::AccelerationStructure,
    /// The placements it was last built over, in build order.
    keys: Vec<PlacementKey>,
}

/// Everything that is reused once per cycle through the frames in flight.
struct FrameResources<D: Device> {
    build_commands: Vec<D::CommandBuffer>,
    compact_commands: D::CommandBuffer,
    top_level_commands: D::CommandBuffer,
    query_pool: Option<(D::QueryPool, u32)>,
    pending_compactions: Vec<PendingCompaction<D>>,
    geometry_semaphore: D::Semaphore,
    top_level_semaphore: D::Semaphore,
    is_top_level_submitted: bool,
    instance_buffer: GrowableBuffer<D>,
    scene_description: SceneDescriptionBuffers<D>,
}

impl<D: Device> FrameResources<D> {
    fn new(device: &D) -> Result<Self, DeviceError> {
        Ok(Self {
            build_commands: Vec::new(),
            compact_commands: device.allocate_command_buffer()?,
            top_level_commands: device.allocate_command_buffer()?,
            query_pool: None,
            pending_compactions: Vec::new(),
            geometry_semaphore: device.create_semaphore()?,
            top_level_semaphore: device.create_semaphore()?,
            is_top_level_submitted: false,
            instance_buffer: GrowableBuffer::new(
                BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
                MemoryLocation::HostVisible,
            ),
            scene_description: SceneDescriptionBuffers::new(),
        })
    }
}

#[derive(Default)]
struct GeometryPass {
    groups_built: usize,
    groups_compacted: usize,
    is_submitted: bool,
}

/// Keeps a two level acceleration structure in sync with a changing scene.
///
/// Geometry groups and instances are created through the [`SceneRegistry`]
/// (from any thread), and [`on_frame`](Self::on_frame) is called once per
/// frame on the render thread to bring the structures up to date. Device
/// resources that may still be in use are held for a full cycle of frames in
/// flight before being released.
///
/// The caller must wait for the device to go idle before dropping the
/// builder.
pub struct AccelBuilder<D: Device> {
    device: Arc<D>,
    params: BuilderParams,
    registry: SceneRegistry<D>,
    frames: ArrayVec<FrameResources<D>, MAX_FRAMES_IN_FLIGHT>,
    graveyard: Graveyard<Retired<D>>,
    retired: Vec<Retired<D>>,
    policy: RebuildPolicy,
    build_scratch: GrowableBuffer<D>,
    top_level_scratch: GrowableBuffer<D>,
    top_level: Option<TopLevel<D>>,
    previous_active_instances: usize,
    placements: Vec<AccelerationStructureInstance>,
    placement_keys: Vec<PlacementKey>,
    instance_records: Vec<InstanceRecord>,
    needs_read_barrier: bool,
}

impl<D: Device> AccelBuilder<D> {
    pub fn new(device: Arc<D>, params: BuilderParams) -> Result<Self, DeviceError> {
        assert!(
            (1..=MAX_FRAMES_IN_FLIGHT).contains(&params.frames_in_flight),
            "frames in flight must be between 1 and {}",
            MAX_FRAMES_IN_FLIGHT
        );
        let is_enabled = params.ray_tracing_supported;
        let mut frames = ArrayVec::new();
        if is_enabled {
            for _ in 0..params.frames_in_flight {
                frames.push(FrameResources::new(device.as_ref())?);
            }
        }
        tracing::info!(
            is_enabled,
            frames_in_flight = params.frames_in_flight,
            rebuild_budget = params.rebuild_budget,
            compaction = params.compaction,
            "created acceleration structure builder"
        );

        let scratch_usage = BufferUsage::ACCELERATION_STRUCTURE_SCRATCH | BufferUsage::STORAGE;
        Ok(Self {
            registry: SceneRegistry::new(Arc::clone(&device), is_enabled, params.pool_granularity),
            device,
            frames,
            graveyard: Graveyard::new(params.frames_in_flight),
            retired: Vec::new(),
            policy: RebuildPolicy::new(params.rebuild_budget),
            build_scratch: GrowableBuffer::new(scratch_usage, MemoryLocation::DeviceLocal),
            top_level_scratch: GrowableBuffer::new(scratch_usage, MemoryLocation::DeviceLocal),
            top_level: None,
            previous_active_instances: 0,
            placements: Vec::new(),
            placement_keys: Vec::new(),
            instance_records: Vec::new(),
            needs_read_barrier: false,
            params,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.registry.is_enabled()
    }

    pub fn params(&self) -> &BuilderParams {
        &self.params
    }

    pub fn registry(&self) -> SceneRegistry<D> {
        self.registry.clone()
    }

    #[track_caller]
    pub fn add_geometry_group(
        &self,
        meshes: &[MeshDesc],
        transforms: &[Mat4],
        material_indices: &[u32],
        is_dynamic: bool,
    ) -> Result<Option<Arc<GeometryGroup<D>>>, DeviceError> {
        self.registry
            .add_geometry_group(meshes, transforms, material_indices, is_dynamic)
    }

    pub fn add_instance(&self, group: &Arc<GeometryGroup<D>>) -> Option<Arc<Instance<D>>> {
        self.registry.add_instance(group)
    }

    pub fn frames_before_rebuild(&self) -> u32 {
        self.policy.frames_before_rebuild()
    }

    #[track_caller]
    fn check_frame(&self, frame: &FrameContext) -> usize {
        assert!(self.is_enabled(), "ray tracing is not supported on this device");
        assert!(
            frame.swapchain_index < self.frames.len(),
            "swapchain index {} is out of range for {} frames in flight",
            frame.swapchain_index,
            self.frames.len()
        );
        frame.swapchain_index
    }

    /// Runs the per-frame cycle: purge, geometry builds, instance updates and
    /// the top level build or update.
    pub fn on_frame(&mut self, frame: &FrameContext) -> Result<FrameStats, DeviceError> {
        if !self.is_enabled() {
            return Ok(FrameStats::default());
        }
        let slot = self.check_frame(frame);
        let result = self.run_frame(slot);
        let retired = mem::take(&mut self.retired);
        self.graveyard.bury_all(slot, retired);
        match &result {
            Ok(stats) => tracing::debug!(frame = frame.frame_index, ?stats, "acceleration structures ready"),
            Err(err) => tracing::warn!(frame = frame.frame_index, %err, "acceleration structure update failed"),
        }
        result
    }

    fn run_frame(&mut self, slot: usize) -> Result<FrameStats, DeviceError> {
        let freed = self.graveyard.clear(slot);
        if freed != 0 {
            tracing::trace!(slot, freed, "released retired resources");
        }
        self.frames[slot].is_top_level_submitted = false;

        let purge = self.registry.purge();
        for group in &purge.groups {
            group.update()?;
        }
        self.retired.extend(self.registry.drain_retired());

        let dirty: Vec<_> = purge.groups.iter().filter(|group| !group.is_built()).cloned().collect();
        let compactions = self.collect_compactions(slot)?;
        let geometry = self.build_geometry(slot, &dirty, compactions)?;

        self.placements.clear();
        self.placement_keys.clear();
        self.instance_records.clear();
        for instance in &purge.instances {
            if let Some((record, group)) = instance.update() {
                self.placements.push(record);
                self.placement_keys
                    .push((instance.slot(), record.acceleration_structure_reference));
                self.instance_records.push(InstanceRecord {
                    first_geometry_index: group.first_geometry_index(),
                });
            }
        }
        let active_instances = self.placements.len();

        let action = self.policy.decide(&FrameTopology {
            groups_built: geometry.groups_built,
            groups_compacted: geometry.groups_compacted,
            active_instances,
            previous_active_instances: self.previous_active_instances,
            top_level_instances: self.top_level.as_ref().map(|top_level| top_level.keys.len()),
            instances_changed: self
                .top_level
                .as_ref()
                .map_or(false, |top_level| top_level.keys != self.placement_keys),
        });

        let result = match action {
            TopLevelAction::None => {
                if let Some(old) = self.top_level.take() {
                    self.retired.push(Retired::Accel(old.accel));
                }
                Ok(())
            }
            TopLevelAction::Rebuild(reason) => {
                let reason: &'static str = reason.into();
                tracing::debug!(reason, active_instances, "rebuilding top level");
                self.build_top_level(slot, BuildMode::Build, geometry.is_submitted)
            }
            TopLevelAction::Update => self.build_top_level(slot, BuildMode::Update, geometry.is_submitted),
        };
        if let Err(err) = result {
            self.abandon_top_level(slot, geometry.is_submitted);
            return Err(err);
        }
        if geometry.is_submitted && !self.frames[slot].is_top_level_submitted {
            self.device
                .submit(&[], Some(&self.frames[slot].geometry_semaphore), None)?;
        }
        self.previous_active_instances = active_instances;

        let device = self.device.as_ref();
        let frame = &mut self.frames[slot];
        let retired = &mut self.retired;
        self.registry
            .with_geometry_table(|table| frame.scene_description.upload_geometries(device, table, retired))?;
        frame
            .scene_description
            .upload_instances(device, &self.instance_records, retired)?;

        Ok(FrameStats {
            groups_purged: purge.groups_purged,
            instances_purged: purge.instances_purged,
            groups_built: geometry.groups_built,
            groups_compacted: geometry.groups_compacted,
            active_instances,
            top_level: action,
            frames_before_rebuild: self.policy.frames_before_rebuild(),
        })
    }

    /// Reads the compacted sizes written when this slot was last used. That
    /// work has completed by now, so this never waits.
    fn collect_compactions(&mut self, slot: usize) -> Result<Vec<Compaction<D>>, DeviceError> {
        let device = self.device.as_ref();
        let frame = &mut self.frames[slot];
        let pending = mem::take(&mut frame.pending_compactions);
        let pool = match &frame.query_pool {
            Some((pool, _)) if !pending.is_empty() => pool,
            _ => return Ok(Vec::new()),
        };
        let query_count = pending.iter().map(|p| p.query + 1).max().unwrap_or(0);
        let sizes = device.read_compacted_sizes(pool, query_count)?;

        let mut compactions = Vec::new();
        for p in pending {
            let group = match p.group.upgrade() {
                Some(group) => group,
                None => continue,
            };
            if !group.is_built() || group.built_epoch() != p.epoch {
                continue;
            }
            let accel = device.create_accel(AccelType::BottomLevel, sizes[p.query as usize])?;
            compactions.push(Compaction {
                group,
                accel,
                epoch: p.epoch,
            });
        }
        Ok(compactions)
    }

    fn build_geometry(
        &mut self,
        slot: usize,
        dirty: &[Arc<GeometryGroup<D>>],
        compactions: Vec<Compaction<D>>,
    ) -> Result<GeometryPass, DeviceError> {
        if dirty.is_empty() && compactions.is_empty() {
            return Ok(GeometryPass::default());
        }
        let device = self.device.as_ref();
        let compaction = self.params.compaction;

        let mut builds = Vec::with_capacity(dirty.len());
        let mut scratch_size = 0;
        let mut query_count = 0;
        for group in dirty {
            let epoch = group.dirty_epoch();
            let triangles = group.triangles();
            let flags = group.build_flags(compaction);
            let sizes = device.accel_build_sizes(flags, &AccelGeometry::Triangles(&triangles));
            let accel = device.create_accel(AccelType::BottomLevel, sizes.accel_size)?;
            let query = flags.contains(BuildFlags::ALLOW_COMPACTION).then(|| {
                query_count += 1;
                query_count - 1
            });
            builds.push(PendingBuild {
                group: Arc::clone(group),
                epoch,
                triangles,
                flags,
                accel,
                scratch_offset: scratch_size,
                query,
            });
            scratch_size += sizes.build_scratch_size.align_up(SCRATCH_ALIGNMENT);
        }

        let frame = &mut self.frames[slot];
        let scratch_address = if scratch_size != 0 {
            device.buffer_address(self.build_scratch.ensure(device, scratch_size, &mut self.retired)?)
        } else {
            0
        };
        if query_count != 0 && frame.query_pool.as_ref().map_or(true, |(_, capacity)| *capacity < query_count) {
            let capacity = query_count.next_power_of_two();
            frame.query_pool = Some((device.create_query_pool(capacity)?, capacity));
        }
        while frame.build_commands.len() < builds.len() {
            frame.build_commands.push(device.allocate_command_buffer()?);
        }

        for (build, cmd) in builds.iter().zip(&frame.build_commands) {
            device.begin_commands(cmd)?;
            device.cmd_build_barrier(cmd);
            let query = build.query.zip(frame.query_pool.as_ref());
            if let Some((query, (pool, _))) = query {
                device.cmd_reset_queries(cmd, pool, query, 1);
            }
            device.cmd_build_accel(
                cmd,
                &AccelBuild {
                    mode: BuildMode::Build,
                    flags: build.flags,
                    geometry: AccelGeometry::Triangles(&build.triangles),
                    src: None,
                    dst: &build.accel,
                    scratch_address: scratch_address + build.scratch_offset,
                },
            );
            if let Some((query, (pool, _))) = query {
                device.cmd_build_barrier(cmd);
                device.cmd_write_compacted_size(cmd, &build.accel, pool, query);
            }
            device.end_commands(cmd)?;
        }

        if !compactions.is_empty() {
            let cmd = &frame.compact_commands;
            device.begin_commands(cmd)?;
            device.cmd_build_barrier(cmd);
            for compaction in &compactions {
                compaction
                    .group
                    .with_accel(|src| device.cmd_copy_compact(cmd, src, &compaction.accel));
            }
            device.end_commands(cmd)?;
        }

        let mut command_buffers: Vec<_> = frame.build_commands[..builds.len()].iter().collect();
        if !compactions.is_empty() {
            command_buffers.push(&frame.compact_commands);
        }
        device.submit(&command_buffers, None, Some(&frame.geometry_semaphore))?;

        let pass = GeometryPass {
            groups_built: builds.len(),
            groups_compacted: compactions.len(),
            is_submitted: true,
        };
        for build in builds {
            if let Some(query) = build.query {
                frame.pending_compactions.push(PendingCompaction {
                    group: Arc::downgrade(&build.group),
                    epoch: build.epoch,
                    query,
                });
            }
            if let Some(old) = build.group.install(build.accel, build.epoch) {
                self.retired.push(Retired::Accel(old));
            }
        }
        for compaction in compactions {
            if let Some(old) = compaction.group.install(compaction.accel, compaction.epoch) {
                self.retired.push(Retired::Accel(old));
            }
        }
        tracing::debug!(
            built = pass.groups_built,
            compacted = pass.groups_compacted,
            scratch_size,
            "submitted geometry builds"
        );
        Ok(pass)
    }

    fn build_top_level(&mut self, slot: usize, mode: BuildMode, wait_for_geometry: bool) -> Result<(), DeviceError> {
        let device = self.device.as_ref();
        let frame = &mut self.frames[slot];
        let instance_count = self.placements.len();

        let instance_data: &[u8] = bytemuck::cast_slice(&self.placements);
        let instance_address = {
            let buffer = frame
                .instance_buffer
                .ensure(device, instance_data.len() as u64, &mut self.retired)?;
            device.write_buffer(buffer, 0, instance_data)?;
            device.buffer_address(buffer)
        };
        let geometry = AccelGeometry::Instances {
            address: instance_address,
            count: instance_count as u32,
        };
        let flags = BuildFlags::PREFER_FAST_BUILD | BuildFlags::ALLOW_UPDATE;
        let sizes = device.accel_build_sizes(flags, &geometry);

        let top_level = match self.top_level.take() {
            Some(top_level) if mode == BuildMode::Update => top_level,
            old => {
                if let Some(old) = old {
                    self.retired.push(Retired::Accel(old.accel));
                }
                TopLevel {
                    accel: device.create_accel(AccelType::TopLevel, sizes.accel_size)?,
                    keys: self.placement_keys.clone(),
                }
            }
        };
        let top_level = self.top_level.insert(top_level);
        let scratch = self
            .top_level_scratch
            .ensure(device, sizes.scratch_size(mode), &mut self.retired)?;
        let scratch_address = device.buffer_address(scratch);

        let cmd = &frame.top_level_commands;
        device.begin_commands(cmd)?;
        device.cmd_build_barrier(cmd);
        device.cmd_build_accel(
            cmd,
            &AccelBuild {
                mode,
                flags,
                geometry,
                src: (mode == BuildMode::Update).then(|| &top_level.accel),
                dst: &top_level.accel,
                scratch_address,
            },
        );
        device.end_commands(cmd)?;
        device.submit(
            &[cmd],
            wait_for_geometry.then(|| &frame.geometry_semaphore),
            Some(&frame.top_level_semaphore),
        )?;
        frame.is_top_level_submitted = true;
        self.needs_read_barrier = true;
        tracing::debug!(?mode, instance_count, "submitted top level build");
        Ok(())
    }

    /// Recovers from a failed top level step. The current structure may be
    /// unbuilt or half updated, so it is retired and the next frame rebuilds
    /// from scratch. A signalled geometry semaphore that nothing waited on is
    /// drained so the next use of this slot can signal it again.
    fn abandon_top_level(&mut self, slot: usize, is_geometry_submitted: bool) {
        if let Some(old) = self.top_level.take() {
            self.retired.push(Retired::Accel(old.accel));
        }
        let frame = &self.frames[slot];
        if is_geometry_submitted && !frame.is_top_level_submitted {
            if let Err(err) = self.device.submit(&[], Some(&frame.geometry_semaphore), None) {
                tracing::warn!(%err, "failed to drain geometry semaphore");
            }
        }
    }

    /// The structure to trace against this frame, if any instance is usable.
    ///
    /// Panics if ray tracing is not supported.
    #[track_caller]
    pub fn top_level(&self, frame: &FrameContext) -> Option<&D::AccelerationStructure> {
        self.check_frame(frame);
        self.top_level.as_ref().map(|top_level| &top_level.accel)
    }

    /// Signalled once this frame's top level build completes. Ray queries
    /// this frame must wait on it; `None` if nothing was submitted.
    #[track_caller]
    pub fn top_level_semaphore(&self, frame: &FrameContext) -> Option<&D::Semaphore> {
        let frame = &self.frames[self.check_frame(frame)];
        frame.is_top_level_submitted.then(|| &frame.top_level_semaphore)
    }

    #[track_caller]
    pub fn geometries_buffer(&self, frame: &FrameContext) -> Option<BufferView<D>> {
        self.frames[self.check_frame(frame)].scene_description.geometries()
    }

    #[track_caller]
    pub fn instances_buffer(&self, frame: &FrameContext) -> Option<BufferView<D>> {
        self.frames[self.check_frame(frame)].scene_description.instances()
    }

    /// The placement records of the last top level build or update, in build
    /// order.
    pub fn placements(&self) -> &[AccelerationStructureInstance] {
        &self.placements
    }

    pub fn instance_records(&self) -> &[InstanceRecord] {
        &self.instance_records
    }

    pub fn start_frame(&mut self) {
        self.needs_read_barrier = false;
    }

    /// Records the barrier that makes this frame's top level build visible
    /// to ray queries in `cmd`.
    pub fn wait_for_completion(&self, cmd: &D::CommandBuffer) {
        if !self.needs_read_barrier {
            return;
        }
        if let Some(top_level) = &self.top_level {
            self.device.cmd_top_level_read_barrier(cmd, &top_level.accel);
        }
    }
}
