//! Descriptor pool, layout and set management for the per-frame set.

use ash::vk;

use crate::device::FrameBindings;
use crate::error::{Result, VkResultExt};
use crate::raytracing::pipeline::{
    BINDING_ACCUMULATION, BINDING_CAMERA, BINDING_INDICES, BINDING_INSTANCES, BINDING_MATERIALS, BINDING_TLAS,
    BINDING_VERTICES,
};

pub unsafe fn create_layout(
    device: &ash::Device,
    bindings: &[vk::DescriptorSetLayoutBinding<'_>],
) -> Result<vk::DescriptorSetLayout> {
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
    device
        .create_descriptor_set_layout(&layout_info, None)
        .context("vkCreateDescriptorSetLayout")
}

/// Pool without `FREE_DESCRIPTOR_SET`; sets live until the pool is destroyed.
pub unsafe fn create_pool(
    device: &ash::Device,
    sizes: &[vk::DescriptorPoolSize],
    max_sets: u32,
) -> Result<vk::DescriptorPool> {
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .pool_sizes(sizes)
        .max_sets(max_sets);

    device
        .create_descriptor_pool(&pool_info, None)
        .context("vkCreateDescriptorPool")
}

pub unsafe fn allocate_sets(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    count: u32,
) -> Result<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; count as usize];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    device
        .allocate_descriptor_sets(&alloc_info)
        .context("vkAllocateDescriptorSets")
}

/// Point every binding of `set` at the frame's resources.
pub unsafe fn write_frame_bindings(device: &ash::Device, set: vk::DescriptorSet, bindings: &FrameBindings) {
    let structures = [bindings.top_level];
    let mut structure_info = vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);

    let image_info = [vk::DescriptorImageInfo::default()
        .image_view(bindings.accumulation_view)
        .image_layout(vk::ImageLayout::GENERAL)];

    let buffer_info = |buffer, range| [vk::DescriptorBufferInfo::default().buffer(buffer).offset(0).range(range)];
    let camera_info = buffer_info(bindings.uniform, bindings.uniform_size);
    let vertex_info = buffer_info(bindings.vertices, vk::WHOLE_SIZE);
    let index_info = buffer_info(bindings.indices, vk::WHOLE_SIZE);
    let material_info = buffer_info(bindings.materials, vk::WHOLE_SIZE);
    let instance_info = buffer_info(bindings.instances, vk::WHOLE_SIZE);

    let mut tlas_write = vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(BINDING_TLAS)
        .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
        .push_next(&mut structure_info);
    // The count is not implied by any info array for acceleration structures
    tlas_write.descriptor_count = 1;

    let writes = [
        tlas_write,
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BINDING_ACCUMULATION)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&image_info),
        vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(BINDING_CAMERA)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&camera_info),
        storage_write(set, BINDING_VERTICES, &vertex_info),
        storage_write(set, BINDING_INDICES, &index_info),
        storage_write(set, BINDING_MATERIALS, &material_info),
        storage_write(set, BINDING_INSTANCES, &instance_info),
    ];

    device.update_descriptor_sets(&writes, &[]);
}

fn storage_write(set: vk::DescriptorSet, binding: u32, info: &[vk::DescriptorBufferInfo]) -> vk::WriteDescriptorSet<'_> {
    vk::WriteDescriptorSet::default()
        .dst_set(set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
        .buffer_info(info)
}
