//! Ray tracing pipeline: binding layout, push constants, shader groups.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::device::{DeviceProvider, PipelineDevice, RayTracingPipelineDesc, ShaderGroup};
use crate::error::{Result, RtError};
use crate::raytracing::sbt::ShaderBindingTable;

/// Primary ray plus one shadow ray from the closest-hit program.
pub const MAX_RECURSION_DEPTH: u32 = 2;

pub const RAYGEN_SHADER: &str = "raygen.rgen.spv";
pub const MISS_SHADER: &str = "miss.rmiss.spv";
pub const SHADOW_MISS_SHADER: &str = "shadow.rmiss.spv";
pub const CLOSEST_HIT_SHADER: &str = "closesthit.rchit.spv";

// Binding indices shared with the shader programs
pub const BINDING_TLAS: u32 = 0;
pub const BINDING_ACCUMULATION: u32 = 1;
pub const BINDING_CAMERA: u32 = 2;
pub const BINDING_VERTICES: u32 = 3;
pub const BINDING_INDICES: u32 = 4;
pub const BINDING_MATERIALS: u32 = 5;
pub const BINDING_INSTANCES: u32 = 6;

/// Descriptor set layout of the single per-frame set.
pub fn binding_layout() -> [vk::DescriptorSetLayoutBinding<'static>; 7] {
    let binding = |index, ty, stages| {
        vk::DescriptorSetLayoutBinding::default()
            .binding(index)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stages)
    };
    let storage = |index| binding(index, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::CLOSEST_HIT_KHR);

    [
        binding(
            BINDING_TLAS,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR | vk::ShaderStageFlags::MISS_KHR,
        ),
        binding(BINDING_ACCUMULATION, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::RAYGEN_KHR),
        binding(BINDING_CAMERA, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::RAYGEN_KHR),
        storage(BINDING_VERTICES),
        storage(BINDING_INDICES),
        storage(BINDING_MATERIALS),
        storage(BINDING_INSTANCES),
    ]
}

/// Push constant block shared by generation and hit programs.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PushConstants {
    pub max_bounces: u32,
    pub samples_per_frame: u32,
}

impl Default for PushConstants {
    fn default() -> Self {
        Self {
            max_bounces: 4,
            samples_per_frame: 1,
        }
    }
}

impl PushConstants {
    pub const STAGES: vk::ShaderStageFlags =
        vk::ShaderStageFlags::from_raw(vk::ShaderStageFlags::RAYGEN_KHR.as_raw() | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw());

    pub fn range() -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: Self::STAGES,
            offset: 0,
            size: std::mem::size_of::<Self>() as u32,
        }
    }
}

/// Stage array and group table. Group order is the record order of the
/// shader binding table.
pub fn shader_groups() -> [ShaderGroup; 4] {
    [
        ShaderGroup::General { shader: 0 },
        ShaderGroup::General { shader: 1 },
        ShaderGroup::General { shader: 2 },
        ShaderGroup::TrianglesHit { closest_hit: 3 },
    ]
}

/// SPIR-V words of the four ray tracing programs.
#[derive(Debug, Clone, Default)]
pub struct ShaderBinaries {
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub shadow_miss: Vec<u32>,
    pub closest_hit: Vec<u32>,
}

impl ShaderBinaries {
    /// Load the precompiled programs from `dir` by their fixed file names.
    pub fn load(dir: &Path) -> Result<Self> {
        let binaries = Self {
            raygen: load_spirv(&dir.join(RAYGEN_SHADER))?,
            miss: load_spirv(&dir.join(MISS_SHADER))?,
            shadow_miss: load_spirv(&dir.join(SHADOW_MISS_SHADER))?,
            closest_hit: load_spirv(&dir.join(CLOSEST_HIT_SHADER))?,
        };
        tracing::debug!(dir = %dir.display(), "Loaded ray tracing shaders");
        Ok(binaries)
    }

    fn stages(&self) -> [(vk::ShaderStageFlags, &[u32]); 4] {
        [
            (vk::ShaderStageFlags::RAYGEN_KHR, self.raygen.as_slice()),
            (vk::ShaderStageFlags::MISS_KHR, self.miss.as_slice()),
            (vk::ShaderStageFlags::MISS_KHR, self.shadow_miss.as_slice()),
            (vk::ShaderStageFlags::CLOSEST_HIT_KHR, self.closest_hit.as_slice()),
        ]
    }
}

fn load_spirv(path: &Path) -> Result<Vec<u32>> {
    let shader_error = |source| RtError::ShaderLoad {
        path: PathBuf::from(path),
        source,
    };
    let mut file = File::open(path).map_err(shader_error)?;
    ash::util::read_spv(&mut file).map_err(shader_error)
}

/// Ray tracing pipeline and the layouts it was created with.
#[derive(Debug, Default)]
pub struct RayTracingPipeline {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

impl RayTracingPipeline {
    pub unsafe fn build<D>(device: &D, binaries: &ShaderBinaries) -> Result<Self>
    where
        D: DeviceProvider + PipelineDevice + ?Sized,
    {
        let limits = device.limits();
        if limits.max_ray_recursion_depth < MAX_RECURSION_DEPTH {
            return Err(RtError::UnsupportedDevice(format!(
                "max ray recursion depth {} is below the required {}",
                limits.max_ray_recursion_depth, MAX_RECURSION_DEPTH
            )));
        }

        let mut rt = Self::default();
        match rt.create_objects(device, binaries) {
            Ok(()) => {
                tracing::info!(groups = shader_groups().len(), "Ray tracing pipeline created");
                Ok(rt)
            }
            Err(e) => {
                rt.destroy(device);
                Err(e)
            }
        }
    }

    unsafe fn create_objects<D>(&mut self, device: &D, binaries: &ShaderBinaries) -> Result<()>
    where
        D: PipelineDevice + ?Sized,
    {
        self.descriptor_set_layout = device.create_descriptor_set_layout(&binding_layout())?;
        self.layout = device.create_pipeline_layout(self.descriptor_set_layout, PushConstants::range())?;

        let mut stages = Vec::with_capacity(4);
        let mut created = Ok(());
        for (stage, code) in binaries.stages() {
            match device.create_shader_module(code) {
                Ok(module) => stages.push((stage, module)),
                Err(e) => {
                    created = Err(e);
                    break;
                }
            }
        }

        let created = created.and_then(|()| {
            device.create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                layout: self.layout,
                stages: &stages,
                groups: &shader_groups(),
                max_recursion_depth: MAX_RECURSION_DEPTH,
            })
        });

        // Modules are only needed during pipeline creation
        for (_, module) in stages {
            device.destroy_shader_module(module);
        }

        self.pipeline = created?;
        Ok(())
    }

    /// Destroy in reverse creation order. Null handles are skipped.
    pub unsafe fn destroy<D: PipelineDevice + ?Sized>(&mut self, device: &D) {
        if self.pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(self.pipeline);
        }
        if self.layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.layout);
        }
        if self.descriptor_set_layout != vk::DescriptorSetLayout::null() {
            device.destroy_descriptor_set_layout(self.descriptor_set_layout);
        }
        *self = Self::default();
    }
}

/// Build the pipeline and its shader binding table together.
pub unsafe fn build_pipeline<D>(device: &D, binaries: &ShaderBinaries) -> Result<(RayTracingPipeline, ShaderBindingTable)>
where
    D: DeviceProvider + PipelineDevice + ?Sized,
{
    let mut pipeline = RayTracingPipeline::build(device, binaries)?;
    match ShaderBindingTable::build(device, pipeline.pipeline) {
        Ok(sbt) => Ok((pipeline, sbt)),
        Err(e) => {
            pipeline.destroy(device);
            Err(e)
        }
    }
}
