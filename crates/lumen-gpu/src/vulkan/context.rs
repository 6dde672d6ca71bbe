//! Vulkan context: instance, physical device, logical device, and queue.
//!
//! The backend renders offscreen only, so no surface or swapchain is
//! created here.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use ash::{vk, Device, Entry, Instance};
use parking_lot::Mutex;

use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};
use crate::device::{DeviceError, DeviceResult};

pub struct VulkanContext {
    /// Loader; must outlive the instance.
    _entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_family: u32,
    /// Queue access must be externally synchronized.
    pub queue: Mutex<vk::Queue>,
    pub properties: vk::PhysicalDeviceProperties,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanContext {
    /// # Safety
    /// Loads the system Vulkan driver. The returned context must be dropped
    /// after every object created from its device.
    pub unsafe fn new(enable_validation: bool) -> DeviceResult<Self> {
        let entry = Entry::linked();

        let api_version = entry
            .try_enumerate_instance_version()
            .map_err(|e| DeviceError::Lost(format!("failed to enumerate instance version: {:?}", e)))?
            .unwrap_or(vk::API_VERSION_1_0);

        if api_version < REQUIRED_VK_VERSION {
            return Err(DeviceError::Lost(format!(
                "Vulkan 1.3 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, enable_validation)?;

        let debug = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(debug) => Some(debug),
                Err(e) => {
                    log::warn!("Vulkan: validation messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (physical_device, queue_family) = match Self::pick_physical_device(&instance) {
            Ok(picked) => picked,
            Err(e) => {
                if let Some((loader, messenger)) = &debug {
                    loader.destroy_debug_utils_messenger(*messenger, None);
                }
                instance.destroy_instance(None);
                return Err(e);
            }
        };

        let properties = instance.get_physical_device_properties(physical_device);

        let device = match Self::create_logical_device(&instance, physical_device, queue_family) {
            Ok(device) => device,
            Err(e) => {
                if let Some((loader, messenger)) = &debug {
                    loader.destroy_debug_utils_messenger(*messenger, None);
                }
                instance.destroy_instance(None);
                return Err(e);
            }
        };
        let queue = device.get_device_queue(queue_family, 0);

        log::info!(
            "Vulkan: selected {} (API {}.{}.{})",
            device_name(&properties),
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue: Mutex::new(queue),
            properties,
            debug,
        })
    }

    unsafe fn create_instance(entry: &Entry, enable_validation: bool) -> DeviceResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions: Vec<*const c_char> = Vec::new();
        let mut layer_names: Vec<CString> = Vec::new();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
            layer_names.push(c"VK_LAYER_KHRONOS_validation".to_owned());
        }
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|n| n.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry
            .create_instance(&create_info, None)
            .map_err(|e| DeviceError::Lost(format!("failed to create Vulkan instance: {:?}", e)))
    }

    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> DeviceResult<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

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

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| DeviceError::Allocation(format!("failed to create debug messenger: {:?}", e)))?;

        Ok((debug_utils, messenger))
    }

    /// Pick the highest rated device that can run Vulkan 1.3 graphics and
    /// compute on one queue.
    unsafe fn pick_physical_device(instance: &Instance) -> DeviceResult<(vk::PhysicalDevice, u32)> {
        let devices = instance
            .enumerate_physical_devices()
            .map_err(|e| DeviceError::Lost(format!("failed to enumerate physical devices: {:?}", e)))?;

        if devices.is_empty() {
            return Err(DeviceError::Lost("no Vulkan-capable GPU found".to_string()));
        }

        devices
            .iter()
            .filter_map(|&device| {
                let family = Self::find_queue_family(instance, device)?;
                let score = Self::rate_device(instance, device);
                (score > 0).then_some((device, family, score))
            })
            .max_by_key(|&(_, _, score)| score)
            .map(|(device, family, _)| (device, family))
            .ok_or_else(|| DeviceError::Lost("no suitable GPU found".to_string()))
    }

    /// Rate a physical device (higher is better, zero is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u64 {
        let props = instance.get_physical_device_properties(device);
        if props.api_version < REQUIRED_VK_VERSION {
            return 0;
        }

        let mut score = 1u64;
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += heap.size / (1024 * 1024);
            }
        }

        score
    }

    unsafe fn find_queue_family(instance: &Instance, device: vk::PhysicalDevice) -> Option<u32> {
        let wanted = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        instance
            .get_physical_device_queue_family_properties(device)
            .iter()
            .position(|family| family.queue_flags.contains(wanted))
            .map(|i| i as u32)
    }

    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> DeviceResult<Device> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let supported = instance.get_physical_device_features(physical_device);

        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true)
            .maintenance4(true);

        let device_features = vk::PhysicalDeviceFeatures::default()
            .robust_buffer_access(supported.robust_buffer_access == vk::TRUE)
            .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(device_features)
            .push_next(&mut vulkan_13_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .push_next(&mut features2);

        instance
            .create_device(physical_device, &create_info, None)
            .map_err(|e| DeviceError::Lost(format!("failed to create logical device: {:?}", e)))
    }

    pub fn device_name(&self) -> String {
        device_name(&self.properties)
    }

    /// Integrated GPUs share system memory with the host.
    pub fn unified_memory(&self) -> bool {
        self.properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU
    }

    pub fn wait_idle(&self) -> DeviceResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(super::device_error)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.wait_idle() {
                log::error!("Vulkan: wait idle on shutdown: {}", e);
            }

            self.device.destroy_device(None);

            if let Some((loader, messenger)) = self.debug.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    properties
        .device_name_as_c_str()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown device".to_string())
}

/// Validation messages go through `log`.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK] {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK] {}", message);
    } else {
        log::debug!("[VK] {}", message);
    }

    vk::FALSE
}
