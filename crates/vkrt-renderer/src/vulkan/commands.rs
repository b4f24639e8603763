//! Command buffer management and recording.

use ash::khr::{acceleration_structure, ray_tracing_pipeline};
use ash::vk;

use super::VulkanContext;
use crate::device::{
    AccelerationBuild, AccelerationGeometry, CommandRecorder, FrameSubmission, ImageTransition, MemoryBarrier, SbtRegions,
};
use crate::error::{Result, RtError, VkResultExt};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYERS: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// Command pools for per-frame and one-shot work on the context's queue.
pub struct CommandManager {
    frame_pool: vk::CommandPool,
    transient_pool: vk::CommandPool,
    queue: vk::Queue,
    device: ash::Device,
    accel_struct_loader: acceleration_structure::Device,
    rt_pipeline_loader: ray_tracing_pipeline::Device,
}

impl CommandManager {
    /// Create a new command manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let frame_pool = ctx
            .device
            .create_command_pool(&pool_info, None)
            .context("vkCreateCommandPool")?;

        // Create transient pool for one-shot commands
        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = match ctx.device.create_command_pool(&transient_info, None) {
            Ok(pool) => pool,
            Err(e) => {
                ctx.device.destroy_command_pool(frame_pool, None);
                return Err(RtError::Vulkan {
                    context: "vkCreateCommandPool",
                    result: e,
                });
            }
        };

        Ok(Self {
            frame_pool,
            transient_pool,
            queue: ctx.queue,
            device: ctx.device.clone(),
            accel_struct_loader: ctx.accel_struct_loader.clone(),
            rt_pipeline_loader: ctx.rt_pipeline_loader.clone(),
        })
    }

    fn recorder(&self, cmd: vk::CommandBuffer) -> VkRecorder<'_> {
        VkRecorder {
            device: &self.device,
            accel_struct_loader: &self.accel_struct_loader,
            rt_pipeline_loader: &self.rt_pipeline_loader,
            cmd,
        }
    }

    /// Record into a transient command buffer, submit it and wait for the
    /// queue to drain.
    pub unsafe fn run_once(&self, record: &mut dyn FnMut(&mut dyn CommandRecorder)) -> Result<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = self
            .device
            .allocate_command_buffers(&alloc_info)
            .context("vkAllocateCommandBuffers")?;
        let result = self.submit_once(buffers[0], record);
        self.device.free_command_buffers(self.transient_pool, &buffers);
        result
    }

    unsafe fn submit_once(
        &self,
        cmd: vk::CommandBuffer,
        record: &mut dyn FnMut(&mut dyn CommandRecorder),
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(cmd, &begin_info)
            .context("vkBeginCommandBuffer")?;

        record(&mut self.recorder(cmd));

        self.device.end_command_buffer(cmd).context("vkEndCommandBuffer")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        self.device
            .queue_submit(self.queue, &[submit_info], vk::Fence::null())
            .context("vkQueueSubmit")?;
        self.device.queue_wait_idle(self.queue).context("vkQueueWaitIdle")
    }

    /// Allocate resettable primary buffers from the frame pool.
    pub unsafe fn allocate_frame_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.frame_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        self.device
            .allocate_command_buffers(&alloc_info)
            .context("vkAllocateCommandBuffers")
    }

    pub unsafe fn free_frame_buffers(&self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            self.device.free_command_buffers(self.frame_pool, buffers);
        }
    }

    /// Reset, begin, record and end a frame command buffer.
    pub unsafe fn record(
        &self,
        cmd: vk::CommandBuffer,
        record: &mut dyn FnMut(&mut dyn CommandRecorder),
    ) -> Result<()> {
        self.device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .context("vkResetCommandBuffer")?;

        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(cmd, &begin_info)
            .context("vkBeginCommandBuffer")?;

        record(&mut self.recorder(cmd));

        self.device.end_command_buffer(cmd).context("vkEndCommandBuffer")
    }

    /// Submit a frame's commands, signaling its fence on completion.
    pub unsafe fn submit(&self, submission: &FrameSubmission) -> Result<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let signal_semaphores = [submission.signal_semaphore];
        let command_buffers = [submission.command_buffer];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        self.device
            .queue_submit(self.queue, &[submit_info], submission.fence)
            .context("vkQueueSubmit")
    }

    /// Destroy both pools, freeing every buffer allocated from them.
    pub unsafe fn destroy(&mut self) {
        if self.frame_pool != vk::CommandPool::null() {
            self.device.destroy_command_pool(self.frame_pool, None);
            self.frame_pool = vk::CommandPool::null();
        }
        if self.transient_pool != vk::CommandPool::null() {
            self.device.destroy_command_pool(self.transient_pool, None);
            self.transient_pool = vk::CommandPool::null();
        }
    }
}

/// Vulkan geometry description for a build or a size query.
pub(super) fn vk_geometry(geometry: &AccelerationGeometry) -> vk::AccelerationStructureGeometryKHR<'static> {
    match *geometry {
        AccelerationGeometry::Triangles(tri) => {
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: tri.vertex_address,
                })
                .vertex_stride(tri.vertex_stride)
                .max_vertex(tri.max_vertex)
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: tri.index_address,
                });

            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
        AccelerationGeometry::Instances { data_address } => {
            let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: data_address,
                });

            vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
                .flags(vk::GeometryFlagsKHR::OPAQUE)
        }
    }
}

/// Build info for a single-geometry build. Destination and scratch are
/// filled in by the caller when recording.
pub(super) fn build_geometry_info<'a>(
    level: vk::AccelerationStructureTypeKHR,
    geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(level)
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
}

/// Records the core's command vocabulary into one Vulkan command buffer.
pub struct VkRecorder<'a> {
    device: &'a ash::Device,
    accel_struct_loader: &'a acceleration_structure::Device,
    rt_pipeline_loader: &'a ray_tracing_pipeline::Device,
    cmd: vk::CommandBuffer,
}

impl CommandRecorder for VkRecorder<'_> {
    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { self.device.cmd_copy_buffer(self.cmd, src, dst, &[region]) };
    }

    fn memory_barrier(&mut self, barrier: MemoryBarrier) {
        let memory_barrier = vk::MemoryBarrier::default()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access);

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        }
    }

    fn image_barrier(&mut self, transition: ImageTransition) {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(transition.old_layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(transition.image)
            .subresource_range(COLOR_RANGE)
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access);

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.cmd,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn build_acceleration_structure(&mut self, build: &AccelerationBuild) {
        let geometries = [vk_geometry(&build.geometry)];
        let build_info = build_geometry_info(build.geometry.level(), &geometries)
            .dst_acceleration_structure(build.destination)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: build.scratch_address,
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(build.primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);
        let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

        unsafe {
            self.accel_struct_loader
                .cmd_build_acceleration_structures(self.cmd, &[build_info], &[build_ranges]);
        }
    }

    fn bind_ray_tracing_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        descriptor_set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline);
            self.device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout,
                0,
                &[descriptor_set],
                &[],
            );
        }
    }

    fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, data: &[u8]) {
        unsafe { self.device.cmd_push_constants(self.cmd, layout, stages, 0, data) };
    }

    fn trace_rays(&mut self, regions: &SbtRegions, extent: vk::Extent2D) {
        unsafe {
            self.rt_pipeline_loader.cmd_trace_rays(
                self.cmd,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                extent.width,
                extent.height,
                1,
            );
        }
    }

    fn blit_image(&mut self, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        let corner = vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: COLOR_LAYERS,
            src_offsets: [vk::Offset3D::default(), corner],
            dst_subresource: COLOR_LAYERS,
            dst_offsets: [vk::Offset3D::default(), corner],
        };

        unsafe {
            self.device.cmd_blit_image(
                self.cmd,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::NEAREST,
            );
        }
    }
}
