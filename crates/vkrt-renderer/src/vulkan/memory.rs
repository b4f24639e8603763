//! GPU memory management using gpu-allocator.
//!
//! Allocations stay inside the manager, keyed by the Vulkan handle they back,
//! so the core only ever holds plain [`GpuBuffer`] and [`GpuImage`] values.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::VulkanContext;
use crate::device::{GpuBuffer, GpuImage};
use crate::error::{Result, RtError, VkResultExt};

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
    buffers: Mutex<HashMap<vk::Buffer, Allocation>>,
    images: Mutex<HashMap<vk::Image, Allocation>>,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
        })
    }

    /// Create a buffer with the specified usage and memory location.
    pub unsafe fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self.device.create_buffer(&buffer_info, None).context("vkCreateBuffer")?;
        let requirements = self.device.get_buffer_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .device
            .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_buffer(handle, None);
            self.release(allocation);
            return Err(RtError::Vulkan {
                context: "vkBindBufferMemory",
                result: e,
            });
        }

        // Get device address if usage includes it
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        tracing::trace!(name, size, ?location, "Buffer allocated");
        self.buffers.lock().insert(handle, allocation);

        Ok(GpuBuffer {
            handle,
            size,
            device_address,
        })
    }

    /// Copy bytes into a host-visible buffer at `offset`.
    pub fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let error = |reason| RtError::HostWrite {
            offset,
            len: data.len(),
            reason,
        };

        let mut buffers = self.buffers.lock();
        let allocation = buffers.get_mut(&buffer.handle).ok_or(error("unknown buffer"))?;
        let mapped = allocation.mapped_slice_mut().ok_or(error("buffer is not host visible"))?;

        let start = offset as usize;
        let end = start + data.len();
        if end as u64 > buffer.size || end > mapped.len() {
            return Err(error("out of range"));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Destroy a buffer and reset it to null.
    pub unsafe fn destroy_buffer(&self, buffer: &mut GpuBuffer) {
        if buffer.is_null() {
            return;
        }
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = self.buffers.lock().remove(&buffer.handle) {
            self.release(allocation);
        }
        *buffer = GpuBuffer::default();
    }

    /// Create a single-mip 2D image with a full-resource color view.
    pub unsafe fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<GpuImage> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = self.device.create_image(&image_info, None).context("vkCreateImage")?;
        let requirements = self.device.get_image_memory_requirements(handle);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_image(handle, None);
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .device
            .bind_image_memory(handle, allocation.memory(), allocation.offset())
        {
            self.device.destroy_image(handle, None);
            self.release(allocation);
            return Err(RtError::Vulkan {
                context: "vkBindImageMemory",
                result: e,
            });
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(handle)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match self.device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                self.device.destroy_image(handle, None);
                self.release(allocation);
                return Err(RtError::Vulkan {
                    context: "vkCreateImageView",
                    result: e,
                });
            }
        };

        tracing::trace!(name, ?extent, ?format, "Image allocated");
        self.images.lock().insert(handle, allocation);

        Ok(GpuImage {
            handle,
            view,
            format,
            extent,
        })
    }

    /// Destroy an image and its view, resetting both to null.
    pub unsafe fn destroy_image(&self, image: &mut GpuImage) {
        if image.is_null() {
            return;
        }
        if image.view != vk::ImageView::null() {
            self.device.destroy_image_view(image.view, None);
        }
        self.device.destroy_image(image.handle, None);
        if let Some(allocation) = self.images.lock().remove(&image.handle) {
            self.release(allocation);
        }
        *image = GpuImage::default();
    }

    fn release(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            tracing::warn!("Failed to free GPU allocation: {}", e);
        }
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let buffers: Vec<_> = self.buffers.lock().drain().collect();
        let images: Vec<_> = self.images.lock().drain().collect();
        if !buffers.is_empty() || !images.is_empty() {
            tracing::warn!(
                buffers = buffers.len(),
                images = images.len(),
                "GPU resources still alive at shutdown"
            );
        }

        unsafe {
            for (handle, allocation) in buffers {
                self.device.destroy_buffer(handle, None);
                self.release(allocation);
            }
            for (handle, allocation) in images {
                self.device.destroy_image(handle, None);
                self.release(allocation);
            }
        }
    }
}
