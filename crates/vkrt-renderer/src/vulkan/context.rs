//! Vulkan context: instance, physical device, logical device, and queue.

use ash::ext::debug_utils;
use ash::khr::{acceleration_structure, deferred_host_operations, ray_tracing_pipeline, surface, swapchain};
use ash::{vk, Device, Entry, Instance};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;
use std::os::raw::c_char;

use super::{VulkanSurface, APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION, VALIDATION_LAYER};
use crate::config::RenderConfig;
use crate::device::DeviceLimits;
use crate::error::{Result, RtError, VkResultExt};

/// Device extensions every candidate GPU must expose.
const DEVICE_EXTENSIONS: [&CStr; 4] = [
    swapchain::NAME,
    acceleration_structure::NAME,
    ray_tracing_pipeline::NAME,
    deferred_host_operations::NAME,
];

/// Main Vulkan context holding all core Vulkan objects.
///
/// One queue family serves graphics, compute and present. The surface is
/// owned here because device selection depends on present support.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_family: u32,
    pub queue: vk::Queue,

    // Extension loaders
    pub surface_loader: surface::Instance,
    pub swapchain_loader: swapchain::Device,
    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_pipeline_loader: ray_tracing_pipeline::Device,

    pub surface: VulkanSurface,
    pub limits: DeviceLimits,
    pub device_name: String,

    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

/// Instance-level objects created before a device is picked. Destroyed in
/// reverse if device creation fails.
struct InstanceObjects {
    instance: Instance,
    debug: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: surface::Instance,
    surface: VulkanSurface,
}

impl InstanceObjects {
    unsafe fn destroy(mut self) {
        self.surface.destroy(&self.surface_loader);
        if let Some((loader, messenger)) = &self.debug {
            loader.destroy_debug_utils_messenger(*messenger, None);
        }
        self.instance.destroy_instance(None);
    }
}

impl VulkanContext {
    /// Create a context presenting to a winit window.
    pub unsafe fn from_winit(window: &winit::window::Window, config: &RenderConfig) -> Result<Self> {
        let display_handle = window
            .display_handle()
            .map_err(|e| RtError::Surface(format!("display handle: {}", e)))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| RtError::Surface(format!("window handle: {}", e)))?
            .as_raw();

        Self::new(display_handle, window_handle, config)
    }

    /// Create a new Vulkan context.
    ///
    /// # Safety
    /// The window handles must be valid and outlive the context.
    pub unsafe fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        config: &RenderConfig,
    ) -> Result<Self> {
        let entry = Entry::linked();

        let api_version = entry
            .try_enumerate_instance_version()
            .context("vkEnumerateInstanceVersion")?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(RtError::UnsupportedDevice(format!(
                "Vulkan 1.2 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let validation = config.validation && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, display_handle, validation)?;

        let debug = if validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug) => Some(debug),
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_loader = surface::Instance::new(&entry, &instance);
        let surface = match VulkanSurface::new(&entry, &instance, display_handle, window_handle) {
            Ok(surface) => surface,
            Err(e) => {
                if let Some((loader, messenger)) = &debug {
                    loader.destroy_debug_utils_messenger(*messenger, None);
                }
                instance.destroy_instance(None);
                return Err(e);
            }
        };

        let mut objects = InstanceObjects {
            instance,
            debug,
            surface_loader,
            surface,
        };

        match Self::create_device_objects(&mut objects, config.vsync) {
            Ok((physical_device, queue_family, device, limits, device_name)) => {
                let queue = device.get_device_queue(queue_family, 0);
                let swapchain_loader = swapchain::Device::new(&objects.instance, &device);
                let accel_struct_loader = acceleration_structure::Device::new(&objects.instance, &device);
                let rt_pipeline_loader = ray_tracing_pipeline::Device::new(&objects.instance, &device);

                Ok(Self {
                    entry,
                    instance: objects.instance,
                    physical_device,
                    device,
                    queue_family,
                    queue,
                    surface_loader: objects.surface_loader,
                    swapchain_loader,
                    accel_struct_loader,
                    rt_pipeline_loader,
                    surface: objects.surface,
                    limits,
                    device_name,
                    debug: objects.debug,
                })
            }
            Err(e) => {
                objects.destroy();
                Err(e)
            }
        }
    }

    unsafe fn create_device_objects(
        objects: &mut InstanceObjects,
        vsync: bool,
    ) -> Result<(vk::PhysicalDevice, u32, Device, DeviceLimits, String)> {
        let (physical_device, queue_family) =
            Self::pick_physical_device(&objects.instance, &objects.surface_loader, objects.surface.handle)?;

        let props = objects.instance.get_physical_device_properties(physical_device);
        let device_name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy().into_owned();
        let limits = Self::query_limits(&objects.instance, physical_device);

        tracing::info!(
            gpu = %device_name,
            handle_size = limits.handle_size,
            base_alignment = limits.base_alignment,
            max_recursion = limits.max_ray_recursion_depth,
            "Selected GPU"
        );

        objects.surface.configure(&objects.surface_loader, physical_device, vsync)?;
        let device = Self::create_logical_device(&objects.instance, physical_device, queue_family)?;

        Ok((physical_device, queue_family, device, limits, device_name))
    }

    unsafe fn validation_available(entry: &Entry) -> bool {
        let available = entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers
                    .iter()
                    .any(|l| CStr::from_ptr(l.layer_name.as_ptr()) == VALIDATION_LAYER)
            })
            .unwrap_or(false);

        if !available {
            tracing::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        available
    }

    /// Create Vulkan instance with required extensions.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: RawDisplayHandle,
        validation: bool,
    ) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("vkEnumerateInstanceExtensionProperties")?
            .to_vec();

        if validation {
            extensions.push(debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        entry.create_instance(&create_info, None).context("vkCreateInstance")
    }

    /// Setup debug messenger for validation layers.
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> Result<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let loader = debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = loader
            .create_debug_utils_messenger(&create_info, None)
            .context("vkCreateDebugUtilsMessengerEXT")?;

        Ok((loader, messenger))
    }

    /// Select the best physical device and its queue family.
    unsafe fn pick_physical_device(
        instance: &Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = instance
            .enumerate_physical_devices()
            .context("vkEnumeratePhysicalDevices")?;

        if devices.is_empty() {
            return Err(RtError::UnsupportedDevice("no Vulkan-capable GPU found".into()));
        }

        let mut scored_devices: Vec<_> = devices
            .iter()
            .filter_map(|&device| {
                let family = Self::find_queue_family(instance, device, surface_loader, surface)?;
                let score = Self::rate_device(instance, device);
                (score > 0).then_some((device, family, score))
            })
            .collect();

        scored_devices.sort_by(|a, b| b.2.cmp(&a.2));

        scored_devices
            .first()
            .map(|&(device, family, _)| (device, family))
            .ok_or_else(|| {
                RtError::UnsupportedDevice(
                    "no GPU supports ray tracing pipelines, acceleration structures and presentation".into(),
                )
            })
    }

    /// Rate a physical device (higher is better, zero is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u32 {
        if !Self::check_rt_support(instance, device) {
            return 0;
        }

        let props = instance.get_physical_device_properties(device);
        let mut score = 1u32;

        // Prefer discrete GPU
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score = score.saturating_add((heap.size / (1024 * 1024)) as u32); // MB of VRAM
            }
        }

        score
    }

    /// First queue family with graphics and compute that can present to `surface`.
    unsafe fn find_queue_family(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let families = instance.get_physical_device_queue_family_properties(device);

        families.iter().enumerate().find_map(|(i, family)| {
            let i = i as u32;
            let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
            let presents = surface_loader
                .get_physical_device_surface_support(device, i, surface)
                .unwrap_or(false);
            (family.queue_flags.contains(flags) && presents).then_some(i)
        })
    }

    /// Required extensions present and ray tracing features supported.
    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> bool {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return false,
        };

        let has_all = DEVICE_EXTENSIONS.iter().all(|&required| {
            extensions
                .iter()
                .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == required)
        });
        if !has_all {
            return false;
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        instance.get_physical_device_features2(device, &mut features2);

        vulkan_12_features.buffer_device_address == vk::TRUE
            && vulkan_12_features.scalar_block_layout == vk::TRUE
            && accel_features.acceleration_structure == vk::TRUE
            && rt_features.ray_tracing_pipeline == vk::TRUE
    }

    /// Alignment and size limits from the ray tracing property structs.
    unsafe fn query_limits(instance: &Instance, device: vk::PhysicalDevice) -> DeviceLimits {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut rt_props)
            .push_next(&mut as_props);

        instance.get_physical_device_properties2(device, &mut props2);

        DeviceLimits {
            scratch_alignment: u64::from(as_props.min_acceleration_structure_scratch_offset_alignment),
            handle_size: rt_props.shader_group_handle_size,
            handle_alignment: rt_props.shader_group_handle_alignment,
            base_alignment: rt_props.shader_group_base_alignment,
            max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
        }
    }

    /// Create logical device with required features and extensions.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> Result<Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let extensions: Vec<*const c_char> = DEVICE_EXTENSIONS.iter().map(|e| e.as_ptr()).collect();

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .scalar_block_layout(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        instance
            .create_device(physical_device, &create_info, None)
            .context("vkCreateDevice")
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                tracing::warn!("vkDeviceWaitIdle before context drop failed: {:?}", e);
            }

            self.device.destroy_device(None);
            self.surface.destroy(&self.surface_loader);

            if let Some((loader, messenger)) = &self.debug {
                loader.destroy_debug_utils_messenger(*messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", ?ty, "{}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", ?ty, "{}", message);
    } else {
        tracing::debug!(target: "vulkan", ?ty, "{}", message);
    }

    vk::FALSE
}
