//! The device traits implemented on a real Vulkan device.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::commands::{build_geometry_info, vk_geometry};
use super::{descriptors, CommandManager, MemoryManager, Swapchain, VulkanContext};
use crate::config::RenderConfig;
use crate::device::{
    AccelerationGeometry, AccelerationStructureDevice, BuildSizes, CommandRecorder, DeviceLimits, DeviceProvider,
    FrameBindings, FrameDevice, FrameSubmission, GpuBuffer, GpuImage, PipelineDevice, RayTracingPipelineDesc,
    ShaderGroup,
};
use crate::error::{Result, RtError, VkResultExt};

const SHADER_ENTRY: &std::ffi::CStr = c"main";

/// Context, allocator and command pools of one logical device.
///
/// Fields drop in declaration order, so the pools and the allocator are
/// released before the context destroys the device.
pub struct VulkanDevice {
    commands: CommandManager,
    memory: MemoryManager,
    pub context: VulkanContext,
}

impl VulkanDevice {
    /// Bring up the device presenting to `window`.
    pub unsafe fn new(window: &winit::window::Window, config: &RenderConfig) -> Result<Self> {
        let context = VulkanContext::from_winit(window, config)?;
        let memory = MemoryManager::new(&context)?;
        let commands = CommandManager::new(&context)?;

        Ok(Self {
            commands,
            memory,
            context,
        })
    }

    /// Create a swapchain on the context's surface.
    pub unsafe fn create_swapchain(&self, width: u32, height: u32) -> Result<Swapchain> {
        Swapchain::new(&self.context, width, height)
    }

    pub fn device_name(&self) -> &str {
        &self.context.device_name
    }

    fn device(&self) -> &ash::Device {
        &self.context.device
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.context.device.device_wait_idle() {
                tracing::warn!("vkDeviceWaitIdle before device drop failed: {:?}", e);
            }
            self.commands.destroy();
        }
    }
}

impl DeviceProvider for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        self.context.limits
    }

    unsafe fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.memory.create_buffer(size, usage, location, name)
    }

    unsafe fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        self.memory.write_buffer(buffer, offset, data)
    }

    unsafe fn free_buffer(&self, buffer: &mut GpuBuffer) {
        self.memory.destroy_buffer(buffer);
    }

    unsafe fn allocate_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<GpuImage> {
        self.memory.create_image(extent, format, usage, name)
    }

    unsafe fn free_image(&self, image: &mut GpuImage) {
        self.memory.destroy_image(image);
    }

    unsafe fn run_once(&self, record: &mut dyn FnMut(&mut dyn CommandRecorder)) -> Result<()> {
        self.commands.run_once(record)
    }

    unsafe fn wait_idle(&self) -> Result<()> {
        self.device().device_wait_idle().context("vkDeviceWaitIdle")
    }
}

impl AccelerationStructureDevice for VulkanDevice {
    unsafe fn build_sizes(&self, geometry: &AccelerationGeometry, primitive_count: u32) -> Result<BuildSizes> {
        let geometries = [vk_geometry(geometry)];
        let build_info = build_geometry_info(geometry.level(), &geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.context.accel_struct_loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
            &mut size_info,
        );

        Ok(BuildSizes {
            structure_size: size_info.acceleration_structure_size,
            scratch_size: size_info.build_scratch_size,
        })
    }

    unsafe fn create_acceleration_structure(
        &self,
        level: vk::AccelerationStructureTypeKHR,
        storage: vk::Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage)
            .size(size)
            .ty(level);

        self.context
            .accel_struct_loader
            .create_acceleration_structure(&create_info, None)
            .context("vkCreateAccelerationStructureKHR")
    }

    unsafe fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        self.context
            .accel_struct_loader
            .get_acceleration_structure_device_address(&addr_info)
    }

    unsafe fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        self.context
            .accel_struct_loader
            .destroy_acceleration_structure(handle, None);
    }
}

impl PipelineDevice for VulkanDevice {
    unsafe fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        self.device()
            .create_shader_module(&create_info, None)
            .context("vkCreateShaderModule")
    }

    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.device().destroy_shader_module(module, None);
    }

    unsafe fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        descriptors::create_layout(self.device(), bindings)
    }

    unsafe fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.device().destroy_descriptor_set_layout(layout, None);
    }

    unsafe fn create_pipeline_layout(
        &self,
        set_layout: vk::DescriptorSetLayout,
        push_constants: vk::PushConstantRange,
    ) -> Result<vk::PipelineLayout> {
        let set_layouts = [set_layout];
        let ranges = [push_constants];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);

        self.device()
            .create_pipeline_layout(&layout_info, None)
            .context("vkCreatePipelineLayout")
    }

    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.device().destroy_pipeline_layout(layout, None);
    }

    unsafe fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<'_>) -> Result<vk::Pipeline> {
        let stages: Vec<_> = desc
            .stages
            .iter()
            .map(|&(stage, module)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(SHADER_ENTRY)
            })
            .collect();

        let groups: Vec<_> = desc.groups.iter().map(shader_group_info).collect();

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(desc.layout);

        match self.context.rt_pipeline_loader.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[create_info],
            None,
        ) {
            Ok(pipelines) => pipelines.first().copied().ok_or(RtError::Vulkan {
                context: "vkCreateRayTracingPipelinesKHR",
                result: vk::Result::ERROR_UNKNOWN,
            }),
            Err((pipelines, result)) => {
                for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    self.device().destroy_pipeline(pipeline, None);
                }
                Err(RtError::Vulkan {
                    context: "vkCreateRayTracingPipelinesKHR",
                    result,
                })
            }
        }
    }

    unsafe fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32, data_size: usize) -> Result<Vec<u8>> {
        self.context
            .rt_pipeline_loader
            .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, data_size)
            .context("vkGetRayTracingShaderGroupHandlesKHR")
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.device().destroy_pipeline(pipeline, None);
    }
}

impl FrameDevice for VulkanDevice {
    unsafe fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        self.device().create_fence(&fence_info, None).context("vkCreateFence")
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.device().destroy_fence(fence, None);
    }

    unsafe fn wait_for_fence(&self, fence: vk::Fence) -> Result<()> {
        self.device()
            .wait_for_fences(&[fence], true, u64::MAX)
            .context("vkWaitForFences")
    }

    unsafe fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.device().reset_fences(&[fence]).context("vkResetFences")
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        self.device()
            .create_semaphore(&semaphore_info, None)
            .context("vkCreateSemaphore")
    }

    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.device().destroy_semaphore(semaphore, None);
    }

    unsafe fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        self.commands.allocate_frame_buffers(count)
    }

    unsafe fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        self.commands.free_frame_buffers(buffers);
    }

    unsafe fn record(
        &self,
        command_buffer: vk::CommandBuffer,
        record: &mut dyn FnMut(&mut dyn CommandRecorder),
    ) -> Result<()> {
        self.commands.record(command_buffer, record)
    }

    unsafe fn submit(&self, submission: &FrameSubmission) -> Result<()> {
        self.commands.submit(submission)
    }

    unsafe fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool> {
        descriptors::create_pool(self.device(), sizes, max_sets)
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.device().destroy_descriptor_pool(pool, None);
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        descriptors::allocate_sets(self.device(), pool, layout, count)
    }

    unsafe fn write_frame_bindings(&self, set: vk::DescriptorSet, bindings: &FrameBindings) {
        descriptors::write_frame_bindings(self.device(), set, bindings);
    }
}

fn shader_group_info(group: &ShaderGroup) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    let info = vk::RayTracingShaderGroupCreateInfoKHR::default()
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR);

    match *group {
        ShaderGroup::General { shader } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(shader),
        ShaderGroup::TrianglesHit { closest_hit } => info
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .closest_hit_shader(closest_hit),
    }
}
