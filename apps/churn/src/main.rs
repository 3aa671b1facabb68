use accel_scene::prelude::*;
use accel_scene::recording::RecordingDevice;
use accel_scene_vulkan::prelude::*;
use rand::{prelude::*, rngs::SmallRng};
use rayon::prelude::*;
use std::sync::Arc;
use structopt::StructOpt;
use strum::{EnumString, EnumVariantNames, VariantNames};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, EnumString, EnumVariantNames)]
#[strum(serialize_all = "kebab_case")]
enum Backend {
    Recording,
    Vulkan,
}

#[derive(Debug, StructOpt)]
#[structopt(no_version)]
struct AppParams {
    /// Device to build acceleration structures with
    #[structopt(long, possible_values=&Backend::VARIANTS, default_value="recording")]
    backend: Backend,

    /// Number of frames to run
    #[structopt(long, default_value = "120")]
    frames: u64,

    /// Number of static geometry groups
    #[structopt(long, default_value = "8")]
    groups: usize,

    /// Number of instances created before the first frame
    #[structopt(long, default_value = "256")]
    instances: usize,

    /// Instances removed and added each frame
    #[structopt(long, default_value = "4")]
    churn: usize,

    #[structopt(long, default_value = "0")]
    seed: u64,

    /// Builder and device options after `--`, such as `--compact`,
    /// `--frames-in-flight=3`, `--rebuild-budget=N`, `--no-ray-tracing`,
    /// `-d` or `--vk13`
    #[structopt(last = true)]
    passthrough: Vec<String>,
}

const CUBE_POSITIONS: [[f32; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [-1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0],
];

#[rustfmt::skip]
const CUBE_INDICES: [u32; 36] = [
    0, 2, 1, 1, 2, 3,
    4, 5, 6, 5, 7, 6,
    0, 1, 4, 1, 5, 4,
    2, 6, 3, 3, 6, 7,
    0, 4, 2, 2, 4, 6,
    1, 3, 5, 3, 7, 5,
];

/// Vertex and index data shared by every mesh in the scene.
struct CubeMesh<D: Device> {
    _vertices: D::Buffer,
    _indices: D::Buffer,
    desc: MeshDesc,
}

impl<D: Device> CubeMesh<D> {
    fn new(device: &D) -> Result<Self, DeviceError> {
        let vertex_data: &[u8] = bytemuck::cast_slice(&CUBE_POSITIONS);
        let index_data: &[u8] = bytemuck::cast_slice(&CUBE_INDICES);

        let vertices = device.create_buffer(
            vertex_data.len() as u64,
            BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
            MemoryLocation::HostVisible,
        )?;
        device.write_buffer(&vertices, 0, vertex_data)?;
        let indices = device.create_buffer(
            index_data.len() as u64,
            BufferUsage::ACCELERATION_STRUCTURE_BUILD_INPUT,
            MemoryLocation::HostVisible,
        )?;
        device.write_buffer(&indices, 0, index_data)?;

        let desc = MeshDesc {
            vertex_buffer_address: device.buffer_address(&vertices),
            vertex_stride: 12,
            vertex_count: CUBE_POSITIONS.len() as u32,
            index_buffer_address: device.buffer_address(&indices),
            triangle_count: (CUBE_INDICES.len() / 3) as u32,
        };
        Ok(Self {
            _vertices: vertices,
            _indices: indices,
            desc,
        })
    }
}

fn random_transform(rng: &mut impl Rng) -> Mat4 {
    let offset = Vec3::new(
        rng.gen_range(-50.0..50.0),
        rng.gen_range(-50.0..50.0),
        rng.gen_range(-50.0..50.0),
    );
    Mat4::from_translation(offset) * Mat4::from_rotation_y(rng.gen_range(0.0..std::f32::consts::TAU))
}

struct Scene<D: Device> {
    registry: SceneRegistry<D>,
    mesh: CubeMesh<D>,
    groups: Vec<Arc<GeometryGroup<D>>>,
    dynamic_group: Option<Arc<GeometryGroup<D>>>,
    instances: Vec<Arc<Instance<D>>>,
    next_material: u32,
}

impl<D: Device> Scene<D> {
    fn add_static_group(&mut self, rng: &mut impl Rng) -> Result<(), DeviceError> {
        let mesh_count = rng.gen_range(1..=4);
        let meshes = vec![self.mesh.desc; mesh_count];
        let transforms: Vec<Mat4> = (0..mesh_count).map(|_| random_transform(rng)).collect();
        let material_indices: Vec<u32> = (0..mesh_count as u32).map(|i| self.next_material + i).collect();
        self.next_material += mesh_count as u32;
        if let Some(group) = self
            .registry
            .add_geometry_group(&meshes, &transforms, &material_indices, false)?
        {
            self.groups.push(group);
        }
        Ok(())
    }

    fn add_instance(&mut self, rng: &mut impl Rng) {
        let group = match self.groups.choose(rng) {
            Some(group) => group,
            None => return,
        };
        if let Some(instance) = self.registry.add_instance(group) {
            instance.set_transform(random_transform(rng));
            self.instances.push(instance);
        }
    }

    fn churn(&mut self, frame_index: u64, churn: usize, rng: &mut impl Rng) -> Result<(), DeviceError> {
        for _ in 0..churn.min(self.instances.len()) {
            let index = rng.gen_range(0..self.instances.len());
            self.instances.swap_remove(index);
        }
        for _ in 0..churn {
            self.add_instance(rng);
        }

        if frame_index % 16 == 15 && !self.groups.is_empty() {
            let index = rng.gen_range(0..self.groups.len());
            let group = self.groups.swap_remove(index);
            tracing::debug!(slot = %group.slot(), "replacing geometry group");
            self.add_static_group(rng)?;
        }

        if let Some(instance) = self.instances.choose(rng) {
            instance.set_enabled(!instance.desc().is_enabled);
        }

        if let Some(group) = &self.dynamic_group {
            let angle = frame_index as f32 * 0.05;
            let transforms: Vec<Mat4> = (0..group.mesh_count())
                .map(|i| Mat4::from_translation(Vec3::new(3.0 * i as f32, 0.0, 0.0)) * Mat4::from_rotation_y(angle))
                .collect();
            group.set_transforms(&transforms);
        }
        Ok(())
    }
}

fn run<D: Device>(
    device: Arc<D>,
    builder_params: BuilderParams,
    app_params: &AppParams,
    after_frame: impl Fn(&D) -> Result<(), DeviceError>,
) -> Result<(), DeviceError> {
    let mut builder = AccelBuilder::new(Arc::clone(&device), builder_params)?;
    let mut rng = SmallRng::seed_from_u64(app_params.seed);

    let mut scene = Scene {
        registry: builder.registry(),
        mesh: CubeMesh::new(device.as_ref())?,
        groups: Vec::new(),
        dynamic_group: None,
        instances: Vec::new(),
        next_material: 0,
    };
    for _ in 0..app_params.groups {
        scene.add_static_group(&mut rng)?;
    }
    scene.dynamic_group = scene.registry.add_geometry_group(
        &[scene.mesh.desc; 2],
        &[Mat4::identity(); 2],
        &[scene.next_material, scene.next_material + 1],
        true,
    )?;
    if let Some(group) = &scene.dynamic_group {
        if let Some(instance) = scene.registry.add_instance(group) {
            scene.instances.push(instance);
        }
    }

    if !scene.groups.is_empty() {
        let registry = &scene.registry;
        let groups = &scene.groups;
        let seed = app_params.seed;
        let instances: Vec<_> = (0..app_params.instances)
            .into_par_iter()
            .filter_map(|i| {
                let mut rng = SmallRng::seed_from_u64(seed ^ (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
                let instance = registry.add_instance(&groups[i % groups.len()])?;
                instance.set_transform(random_transform(&mut rng));
                Some(instance)
            })
            .collect();
        scene.instances.extend(instances);
    }
    tracing::info!(
        groups = scene.groups.len(),
        instances = scene.instances.len(),
        "created scene"
    );

    let render_commands = (0..builder.params().frames_in_flight)
        .map(|_| device.allocate_command_buffer())
        .collect::<Result<Vec<_>, _>>()?;

    for frame_index in 0..app_params.frames {
        if frame_index != 0 {
            scene.churn(frame_index, app_params.churn, &mut rng)?;
        }

        let context = FrameContext::new(frame_index, builder.params().frames_in_flight);
        builder.start_frame();
        let stats = builder.on_frame(&context)?;

        let cmd = &render_commands[context.swapchain_index];
        device.begin_commands(cmd)?;
        builder.wait_for_completion(cmd);
        device.end_commands(cmd)?;
        let wait = if builder.is_enabled() {
            builder.top_level_semaphore(&context)
        } else {
            None
        };
        device.submit(&[cmd], wait, None)?;
        after_frame(device.as_ref())?;

        if frame_index % 16 == 0 || stats.top_level != TopLevelAction::Update {
            tracing::info!(frame = frame_index, ?stats, "frame");
        }
    }

    tracing::info!(
        instance_storage = scene.registry.instance_storage_count(),
        geometry_group_storage = scene.registry.geometry_group_storage_count(),
        "finished"
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let app_params = AppParams::from_args();
    let mut builder_params = BuilderParams::default();
    let mut context_params = ContextParams::default();
    for arg in &app_params.passthrough {
        let is_builder_arg = builder_params.parse_arg(arg);
        let is_context_arg = context_params.parse_arg(arg);
        if !is_builder_arg && !is_context_arg {
            panic!("unknown argument {:?}", arg);
        }
    }

    let result = match app_params.backend {
        Backend::Recording => {
            let device = Arc::new(RecordingDevice::new());
            run(Arc::clone(&device), builder_params, &app_params, |device| {
                let submits = device.take_submits();
                tracing::trace!(submits = submits.len(), "recorded");
                Ok(())
            })
        }
        Backend::Vulkan => {
            Context::new(&context_params).and_then(|context| {
                let device = Arc::new(VulkanDevice::new(&Arc::new(context)));
                builder_params.ray_tracing_supported &= device.is_ray_tracing_supported();
                let result = run(Arc::clone(&device), builder_params, &app_params, VulkanDevice::wait_idle);
                device.wait_idle()?;
                result
            })
        }
    };
    if let Err(err) = result {
        tracing::error!(%err, "churn failed");
        std::process::exit(1);
    }
}
