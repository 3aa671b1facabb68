use accel_scene::prelude::DeviceError;
use spark::{vk, Builder, Device, DeviceExtensions, Instance, InstanceExtensions, Loader};
use std::ffi::CStr;
use std::os::raw::c_void;
use std::slice;

unsafe extern "system" fn debug_messenger(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    if let Some(data) = p_callback_data.as_ref() {
        let message = CStr::from_ptr(data.p_message);
        tracing::warn!("{}, {}: {:?}", message_severity, message_types, message);
    }
    vk::FALSE
}

pub(crate) fn device_error(err: vk::Result) -> DeviceError {
    match err {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfMemory,
        vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
        err => DeviceError::Vulkan(err.to_string()),
    }
}

pub trait DeviceExt {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress;
    unsafe fn get_accel_device_address_helper(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress;
}

impl DeviceExt for Device {
    unsafe fn get_buffer_device_address_helper(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo {
            buffer: Some(buffer),
            ..Default::default()
        };
        self.get_buffer_device_address(&info)
    }

    unsafe fn get_accel_device_address_helper(&self, accel: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR {
            acceleration_structure: Some(accel),
            ..Default::default()
        };
        self.get_acceleration_structure_device_address_khr(&info)
    }
}

trait PhysicalDeviceMemoryPropertiesExt {
    fn types(&self) -> &[vk::MemoryType];
    fn heaps(&self) -> &[vk::MemoryHeap];
}

impl PhysicalDeviceMemoryPropertiesExt for vk::PhysicalDeviceMemoryProperties {
    fn types(&self) -> &[vk::MemoryType] {
        &self.memory_types[..self.memory_type_count as usize]
    }
    fn heaps(&self) -> &[vk::MemoryHeap] {
        &self.memory_heaps[..self.memory_heap_count as usize]
    }
}

pub struct ContextParams {
    pub version: vk::Version,
    pub is_debug: bool,
    pub allow_ray_tracing: bool,
}

impl ContextParams {
    pub fn parse_arg(&mut self, s: &str) -> bool {
        match s {
            "-d" => {
                self.is_debug = true;
                true
            }
            "--vk12" => {
                self.version = vk::Version::from_raw_parts(1, 2, 0);
                true
            }
            "--vk13" => {
                self.version = vk::Version::from_raw_parts(1, 3, 0);
                true
            }
            "--no-ray-tracing" => {
                self.allow_ray_tracing = false;
                true
            }
            _ => false,
        }
    }
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            version: vk::Version::from_raw_parts(1, 2, 0),
            is_debug: false,
            allow_ray_tracing: true,
        }
    }
}

/// A headless device with a single compute-capable queue.
pub struct Context {
    pub instance: Instance,
    pub debug_utils_messenger: Option<vk::DebugUtilsMessengerEXT>,
    pub physical_device: vk::PhysicalDevice,
    pub physical_device_properties: vk::PhysicalDeviceProperties,
    pub physical_device_memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub is_ray_tracing_supported: bool,
    pub queue_family_index: u32,
    pub queue: vk::Queue,
    pub device: Device,
}

impl Context {
    pub fn new(params: &ContextParams) -> Result<Self, DeviceError> {
        let instance = {
            let loader = Loader::new().map_err(|err| DeviceError::Vulkan(format!("{:?}", err)))?;
            let instance_version = unsafe { loader.enumerate_instance_version() }.map_err(device_error)?;
            tracing::info!(
                "loading instance version {} ({} supported)",
                params.version,
                instance_version
            );
            if instance_version < params.version {
                return Err(DeviceError::Vulkan(format!(
                    "requested instance version {} is greater than the available version {}",
                    params.version, instance_version
                )));
            }

            let mut extensions = InstanceExtensions::new(params.version);
            if params.is_debug {
                extensions.enable_ext_debug_utils();
            }
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                tracing::debug!("loading instance extension {:?}", name);
            }

            let app_info = vk::ApplicationInfo::builder()
                .p_application_name(Some(CStr::from_bytes_with_nul(b"accel-scene\0").map_err(|err| {
                    DeviceError::Vulkan(err.to_string())
                })?))
                .api_version(params.version);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let instance_create_info = vk::InstanceCreateInfo::builder()
                .p_application_info(Some(&app_info))
                .pp_enabled_extension_names(&extension_name_ptrs);
            unsafe { loader.create_instance(&instance_create_info, None) }.map_err(device_error)?
        };

        let debug_utils_messenger = if params.is_debug {
            let create_info = vk::DebugUtilsMessengerCreateInfoEXT {
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_messenger),
                ..Default::default()
            };
            Some(unsafe { instance.create_debug_utils_messenger_ext(&create_info, None) }.map_err(device_error)?)
        } else {
            None
        };

        let physical_device = {
            let physical_devices = unsafe { instance.enumerate_physical_devices_to_vec() }.map_err(device_error)?;
            for physical_device in &physical_devices {
                let props = unsafe { instance.get_physical_device_properties(*physical_device) };
                tracing::info!("physical device ({}): {:?}", props.device_type, unsafe {
                    CStr::from_ptr(props.device_name.as_ptr())
                });
            }
            *physical_devices
                .first()
                .ok_or_else(|| DeviceError::Vulkan("no physical devices found".to_owned()))?
        };
        let physical_device_properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_version = physical_device_properties.api_version;

        let physical_device_memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        for (i, mt) in physical_device_memory_properties.types().iter().enumerate() {
            tracing::debug!("memory type {}: {}, heap {}", i, mt.property_flags, mt.heap_index);
        }
        for (i, mh) in physical_device_memory_properties.heaps().iter().enumerate() {
            tracing::debug!("heap {}: {} bytes {}", i, mh.size, mh.flags);
        }

        let queue_family_index = unsafe { instance.get_physical_device_queue_family_properties_to_vec(physical_device) }
            .iter()
            .position(|info| info.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .ok_or_else(|| DeviceError::Vulkan("no compute queue family found".to_owned()))?
            as u32;

        let mut is_ray_tracing_supported = false;
        let device = {
            tracing::info!(
                "loading device version {} ({} supported)",
                params.version,
                device_version
            );
            if device_version < params.version {
                return Err(DeviceError::Vulkan(format!(
                    "requested device version {} is greater than the available version {}",
                    params.version, device_version
                )));
            }

            let queue_priorities = [1.0];
            let device_queue_create_info = vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(queue_family_index)
                .p_queue_priorities(&queue_priorities);

            let available_extensions = {
                let extension_properties =
                    unsafe { instance.enumerate_device_extension_properties_to_vec(physical_device, None) }
                        .map_err(device_error)?;
                DeviceExtensions::from_properties(params.version, &extension_properties)
            };

            let mut extensions = DeviceExtensions::new(params.version);
            if params.allow_ray_tracing && available_extensions.supports_khr_acceleration_structure() {
                extensions.enable_khr_acceleration_structure();
                is_ray_tracing_supported = true;
            }
            let extension_names = extensions.to_name_vec();
            for &name in extension_names.iter() {
                tracing::debug!("loading device extension {:?}", name);
            }

            let mut buffer_device_address_features = vk::PhysicalDeviceBufferDeviceAddressFeaturesKHR::builder()
                .buffer_device_address(is_ray_tracing_supported);
            let mut acceleration_structure_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder()
                .acceleration_structure(is_ray_tracing_supported);

            let extension_name_ptrs: Vec<_> = extension_names.iter().map(|s| s.as_ptr()).collect();
            let device_create_info = vk::DeviceCreateInfo::builder()
                .p_queue_create_infos(slice::from_ref(&device_queue_create_info))
                .pp_enabled_extension_names(&extension_name_ptrs)
                .insert_next(&mut buffer_device_address_features)
                .insert_next(&mut acceleration_structure_features);

            unsafe { instance.create_device(physical_device, &device_create_info, None, params.version) }
                .map_err(device_error)?
        };
        if !is_ray_tracing_supported {
            tracing::warn!("acceleration structures are not supported on this device");
        }

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        Ok(Self {
            instance,
            debug_utils_messenger,
            physical_device,
            physical_device_properties,
            physical_device_memory_properties,
            is_ray_tracing_supported,
            queue_family_index,
            queue,
            device,
        })
    }

    pub fn get_memory_type_index(&self, type_filter: u32, property_flags: vk::MemoryPropertyFlags) -> Option<u32> {
        for (i, mt) in self.physical_device_memory_properties.types().iter().enumerate() {
            let i = i as u32;
            if (type_filter & (1 << i)) != 0 && mt.property_flags.contains(property_flags) {
                return Some(i);
            }
        }
        None
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            if self.debug_utils_messenger.is_some() {
                self.instance
                    .destroy_debug_utils_messenger_ext(self.debug_utils_messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_context_args() {
        let mut params = ContextParams::default();
        assert!(params.version == vk::Version::from_raw_parts(1, 2, 0));
        assert!(params.parse_arg("-d"));
        assert!(params.parse_arg("--vk13"));
        assert!(params.parse_arg("--no-ray-tracing"));
        assert!(!params.parse_arg("--compact"));
        assert!(params.is_debug);
        assert!(!params.allow_ray_tracing);
        assert!(params.version == vk::Version::from_raw_parts(1, 3, 0));
    }
}
