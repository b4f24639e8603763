//! Vulkan swapchain used as a blit destination.

use ash::khr::swapchain;
use ash::vk;

use super::{VulkanContext, VulkanSurface};
use crate::device::{AcquireOutcome, PresentOutcome, PresentationEngine};
use crate::error::{Result, RtError, VkResultExt};

/// Swapchain whose images are written by transfer, never rendered to.
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    loader: swapchain::Device,
    queue: vk::Queue,
}

impl Swapchain {
    /// Create a new swapchain sized to the surface, or to `width` x `height`
    /// where the surface leaves that to the application.
    pub unsafe fn new(ctx: &VulkanContext, width: u32, height: u32) -> Result<Self> {
        let surface = &ctx.surface;
        let extent = surface.get_extent(width, height);

        if !surface
            .capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            return Err(RtError::UnsupportedDevice(
                "swapchain images cannot be used as a transfer destination".into(),
            ));
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(image_count(surface))
            .image_format(surface.format.format)
            .image_color_space(surface.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(surface.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(surface.present_mode)
            .clipped(true);

        let handle = ctx
            .swapchain_loader
            .create_swapchain(&create_info, None)
            .context("vkCreateSwapchainKHR")?;

        let images = match ctx.swapchain_loader.get_swapchain_images(handle) {
            Ok(images) => images,
            Err(e) => {
                ctx.swapchain_loader.destroy_swapchain(handle, None);
                return Err(RtError::Vulkan {
                    context: "vkGetSwapchainImagesKHR",
                    result: e,
                });
            }
        };

        tracing::info!(
            images = images.len(),
            width = extent.width,
            height = extent.height,
            present_mode = ?surface.present_mode,
            "Swapchain created"
        );

        Ok(Self {
            handle,
            images,
            format: surface.format.format,
            extent,
            loader: ctx.swapchain_loader.clone(),
            queue: ctx.queue,
        })
    }

    /// Destroy the swapchain. The device must be idle.
    pub unsafe fn destroy(&mut self) {
        if self.handle != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.handle, None);
            self.handle = vk::SwapchainKHR::null();
            self.images.clear();
        }
    }
}

/// One more than the minimum, capped by the maximum when there is one.
fn image_count(surface: &VulkanSurface) -> u32 {
    let min_images = surface.capabilities.min_image_count;
    let max_images = if surface.capabilities.max_image_count == 0 {
        u32::MAX
    } else {
        surface.capabilities.max_image_count
    };
    (min_images + 1).min(max_images)
}

impl PresentationEngine for Swapchain {
    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    unsafe fn acquire_next_image(&mut self, signal: vk::Semaphore) -> Result<AcquireOutcome> {
        match self
            .loader
            .acquire_next_image(self.handle, u64::MAX, signal, vk::Fence::null())
        {
            Ok((index, false)) => Ok(AcquireOutcome::Acquired(index)),
            Ok((index, true)) => {
                // The semaphore is signaled either way, so the image must be used
                tracing::warn!(index, "Swapchain is suboptimal");
                Ok(AcquireOutcome::Acquired(index))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(e) => Err(RtError::Vulkan {
                context: "vkAcquireNextImageKHR",
                result: e,
            }),
        }
    }

    unsafe fn present(&mut self, index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [index];
        let wait_semaphores = [wait];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match self.loader.queue_present(self.queue, &present_info) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(RtError::Vulkan {
                context: "vkQueuePresentKHR",
                result: e,
            }),
        }
    }
}
