//! Vulkan backend for the ray tracing core.
//!
//! [`VulkanDevice`] implements the device traits in [`crate::device`] on top
//! of `ash`, and [`Swapchain`] implements the presentation engine.

pub mod backend;
pub mod commands;
pub mod context;
pub mod descriptors;
pub mod memory;
pub mod surface;
pub mod swapchain;

pub use backend::VulkanDevice;
pub use commands::CommandManager;
pub use context::VulkanContext;
pub use memory::MemoryManager;
pub use surface::VulkanSurface;
pub use swapchain::Swapchain;

use ash::vk;
use std::ffi::CStr;

/// Buffer device address and scalar block layout are core in 1.2.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"vkrt";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"vkrt";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
