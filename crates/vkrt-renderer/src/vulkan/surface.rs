//! Vulkan surface creation from window handles.

use ash::khr::surface;
use ash::{vk, Entry, Instance};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{Result, VkResultExt};

/// Wrapper around a Vulkan surface.
#[derive(Debug, Default)]
pub struct VulkanSurface {
    pub handle: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
}

impl VulkanSurface {
    /// Create a new Vulkan surface from window handles. Format, present mode
    /// and capabilities are filled in by [`VulkanSurface::configure`] once a
    /// physical device has been picked.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the surface.
    pub unsafe fn new(
        entry: &Entry,
        instance: &Instance,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Self> {
        let handle = ash_window::create_surface(entry, instance, display_handle, window_handle, None)
            .context("vkCreateSurfaceKHR")?;

        Ok(Self {
            handle,
            ..Default::default()
        })
    }

    /// Query capabilities and pick a format and present mode on `physical_device`.
    pub unsafe fn configure(
        &mut self,
        loader: &surface::Instance,
        physical_device: vk::PhysicalDevice,
        vsync: bool,
    ) -> Result<()> {
        self.capabilities = loader
            .get_physical_device_surface_capabilities(physical_device, self.handle)
            .context("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

        let formats = loader
            .get_physical_device_surface_formats(physical_device, self.handle)
            .context("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        self.format = choose_surface_format(&formats);

        let present_modes = loader
            .get_physical_device_surface_present_modes(physical_device, self.handle)
            .context("vkGetPhysicalDeviceSurfacePresentModesKHR")?;
        self.present_mode = choose_present_mode(&present_modes, vsync);

        tracing::debug!(
            format = ?self.format.format,
            present_mode = ?self.present_mode,
            "Surface configured"
        );
        Ok(())
    }

    /// Get the current extent, clamped to surface capabilities.
    pub fn get_extent(&self, desired_width: u32, desired_height: u32) -> vk::Extent2D {
        clamp_extent(&self.capabilities, desired_width, desired_height)
    }

    /// Destroy the surface.
    pub unsafe fn destroy(&mut self, loader: &surface::Instance) {
        if self.handle != vk::SurfaceKHR::null() {
            loader.destroy_surface(self.handle, None);
            self.handle = vk::SurfaceKHR::null();
        }
    }
}

/// Choose the best surface format.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    // Prefer SRGB B8G8R8A8
    for format in formats {
        if format.format == vk::Format::B8G8R8A8_SRGB && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR {
            return *format;
        }
    }

    // Fallback to UNORM B8G8R8A8
    for format in formats {
        if format.format == vk::Format::B8G8R8A8_UNORM {
            return *format;
        }
    }

    formats.first().copied().unwrap_or(vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    })
}

/// Choose the best present mode.
fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // FIFO is guaranteed to be available
        return vk::PresentModeKHR::FIFO;
    }

    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }

    // Immediate (no vsync, may tear)
    if modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
        return vk::PresentModeKHR::IMMEDIATE;
    }

    vk::PresentModeKHR::FIFO
}

fn clamp_extent(capabilities: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        // The surface size is defined
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: height.clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        }
    }
}
