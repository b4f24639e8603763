//! Collaborator contracts between the ray tracing core and the GPU.
//!
//! The core never talks to `ash` directly. Everything it needs from the
//! device (memory, one-shot command execution, acceleration structure and
//! pipeline objects, frame synchronization, presentation) goes through the
//! traits in this module. The Vulkan backend in [`crate::vulkan`] implements
//! them for a real device.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::error::{Result, RtError};

/// Device alignment and size limits the core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// `minAccelerationStructureScratchOffsetAlignment`
    pub scratch_alignment: u64,
    /// `shaderGroupHandleSize`
    pub handle_size: u32,
    /// `shaderGroupHandleAlignment`
    pub handle_alignment: u32,
    /// `shaderGroupBaseAlignment`
    pub base_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

/// A GPU buffer owned by exactly one holder.
///
/// Freeing goes through [`DeviceProvider::free_buffer`], which resets the
/// handle to null so a second free is a no-op.
#[derive(Debug, Default)]
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    pub device_address: Option<vk::DeviceAddress>,
}

impl GpuBuffer {
    pub fn is_null(&self) -> bool {
        self.handle == vk::Buffer::null()
    }

    /// Device address, or an error naming the buffer if it was created
    /// without `SHADER_DEVICE_ADDRESS` usage.
    pub fn address(&self, name: &'static str) -> Result<vk::DeviceAddress> {
        self.device_address.ok_or(RtError::MissingDeviceAddress(name))
    }
}

/// A GPU image plus its full-resource view.
#[derive(Debug, Default)]
pub struct GpuImage {
    pub handle: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl GpuImage {
    pub fn is_null(&self) -> bool {
        self.handle == vk::Image::null()
    }
}

/// Global memory dependency between two pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

impl MemoryBarrier {
    /// Transfer writes must land before an acceleration structure build reads them.
    pub fn transfer_to_build() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        }
    }
}

/// Layout transition of a single-mip, single-layer color image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

impl ImageTransition {
    /// Build a transition with access masks and stages derived from the layouts.
    pub fn new(image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        let (src_access, dst_access, src_stage, dst_stage) = match (old_layout, new_layout) {
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            ),
            (vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL) => (
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::GENERAL) => (
                vk::AccessFlags::TRANSFER_READ,
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            ),
            // Swapchain images: the acquire semaphore is waited on at the ray
            // tracing stage, so the transition must chain after that stage
            (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::TRANSFER,
            ),
            (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::PRESENT_SRC_KHR) => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::empty(),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            ),
            _ => (
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
            ),
        };

        Self {
            image,
            old_layout,
            new_layout,
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        }
    }
}

/// Triangle geometry for a bottom-level build, addressed on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    /// Highest vertex index referenced by the index data
    pub max_vertex: u32,
    pub index_address: vk::DeviceAddress,
}

/// Geometry input of an acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationGeometry {
    /// Opaque `R32G32B32_SFLOAT` positions with `u32` indices
    Triangles(TriangleGeometry),
    /// Tightly packed array of 64-byte instance records
    Instances { data_address: vk::DeviceAddress },
}

impl AccelerationGeometry {
    pub fn level(&self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::Triangles(_) => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::Instances { .. } => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// Sizes reported by the build-size query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub structure_size: vk::DeviceSize,
    pub scratch_size: vk::DeviceSize,
}

/// One acceleration structure build command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationBuild {
    pub geometry: AccelerationGeometry,
    pub primitive_count: u32,
    pub destination: vk::AccelerationStructureKHR,
    pub scratch_address: vk::DeviceAddress,
}

/// Strided device address regions read by the trace-rays command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Command vocabulary recorded by the core.
pub trait CommandRecorder {
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize);
    fn memory_barrier(&mut self, barrier: MemoryBarrier);
    fn image_barrier(&mut self, transition: ImageTransition);
    fn build_acceleration_structure(&mut self, build: &AccelerationBuild);
    fn bind_ray_tracing_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
    );
    fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, data: &[u8]);
    fn trace_rays(&mut self, regions: &SbtRegions, extent: vk::Extent2D);
    /// Nearest-filter blit of the full extent, source in `TRANSFER_SRC_OPTIMAL`,
    /// destination in `TRANSFER_DST_OPTIMAL`.
    fn blit_image(&mut self, src: vk::Image, dst: vk::Image, extent: vk::Extent2D);
}

/// Memory and one-shot command execution.
pub trait DeviceProvider {
    fn limits(&self) -> DeviceLimits;

    /// Allocate and bind a buffer. The device address is filled in when
    /// `usage` contains `SHADER_DEVICE_ADDRESS`.
    unsafe fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer>;

    /// Copy bytes into a host-visible buffer.
    unsafe fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()>;

    /// Free a buffer and reset it to null. No-op on a null buffer.
    unsafe fn free_buffer(&self, buffer: &mut GpuBuffer);

    unsafe fn allocate_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<GpuImage>;

    /// Free an image and its view, resetting both to null.
    unsafe fn free_image(&self, image: &mut GpuImage);

    /// Record, submit and wait for queue idle.
    unsafe fn run_once(&self, record: &mut dyn FnMut(&mut dyn CommandRecorder)) -> Result<()>;

    unsafe fn wait_idle(&self) -> Result<()>;
}

/// Acceleration structure object management.
pub trait AccelerationStructureDevice {
    unsafe fn build_sizes(&self, geometry: &AccelerationGeometry, primitive_count: u32) -> Result<BuildSizes>;

    unsafe fn create_acceleration_structure(
        &self,
        level: vk::AccelerationStructureTypeKHR,
        storage: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR>;

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress;

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);
}

/// Shader group as indices into the pipeline's stage array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroup {
    General { shader: u32 },
    TrianglesHit { closest_hit: u32 },
}

/// Everything needed to create a ray tracing pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RayTracingPipelineDesc<'a> {
    pub layout: vk::PipelineLayout,
    pub stages: &'a [(vk::ShaderStageFlags, vk::ShaderModule)],
    pub groups: &'a [ShaderGroup],
    pub max_recursion_depth: u32,
}

/// Pipeline object management.
pub trait PipelineDevice {
    unsafe fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule>;
    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule);

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout>;
    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    unsafe fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constants: vk::PushConstantRange,
    ) -> Result<vk::PipelineLayout>;
    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    unsafe fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_>) -> Result<vk::Pipeline>;

    /// Opaque group handles, `group_count * handle_size` bytes.
    unsafe fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32, data_size: usize) -> Result<Vec<u8>>;

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}

/// Submission of one frame's command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Resources bound into one frame slot's descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBindings {
    pub top_level: vk::AccelerationStructureKHR,
    pub accumulation_view: vk::ImageView,
    pub uniform: vk::Buffer,
    pub uniform_size: vk::DeviceSize,
    pub vertices: vk::Buffer,
    pub indices: vk::Buffer,
    pub materials: vk::Buffer,
    pub instances: vk::Buffer,
}

/// Per-frame synchronization, command buffers and descriptors.
pub trait FrameDevice {
    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    /// Block without timeout until the fence is signaled.
    unsafe fn wait_for_fence(&self, fence: vk::Fence) -> Result<()>;
    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    unsafe fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    unsafe fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);

    /// Reset, begin, record and end a primary command buffer.
    unsafe fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        record: &mut dyn FnMut(&mut dyn CommandRecorder),
    ) -> Result<()>;

    unsafe fn submit(&self, submission: &FrameSubmission) -> Result<()>;

    unsafe fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool>;
    /// Destroying the pool frees every set allocated from it.
    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>>;
    unsafe fn write_frame_bindings(&self, set: vk::DescriptorSet, bindings: &FrameBindings);
}

/// Result of asking the presentation engine for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(u32),
    /// Surface out of date or suboptimal
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Stale,
}

/// The presentation engine's swapchain.
pub trait PresentationEngine {
    fn image_count(&self) -> usize;
    fn extent(&self) -> vk::Extent2D;
    fn image(&self, index: u32) -> vk::Image;

    /// Acquire the next presentable image, signaling `signal` when it is ready.
    unsafe fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome>;

    unsafe fn present(&mut self, index: u32, wait: vk::Semaphore) -> Result<PresentOutcome>;
}

/// Everything the renderer needs from a device.
pub trait RayTracingDevice: DeviceProvider + AccelerationStructureDevice + PipelineDevice + FrameDevice {}

impl<T> RayTracingDevice for T where T: DeviceProvider + AccelerationStructureDevice + PipelineDevice + FrameDevice {}

/// Round `value` up to a power-of-two `alignment`. Zero alignment leaves it unchanged.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        (value + alignment - 1) & !(alignment - 1)
    }
}
