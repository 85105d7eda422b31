//! Headless instance and device creation

use crate::backend::traits::{BackendError, BackendResult};
use crate::RendererConfig;
use ash::vk;
use std::ffi::CStr;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Everything created once at startup and destroyed last
pub(super) struct DeviceContext {
    /// Keeps the loader alive
    #[allow(dead_code)]
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub limits: vk::PhysicalDeviceLimits,
    /// Combined depth/stencil format the device can render to
    pub depth_stencil_format: vk::Format,
    pub precise_occlusion: bool,
}

pub(super) fn create(config: &RendererConfig) -> BackendResult<DeviceContext> {
    unsafe {
        let entry = ash::Entry::load().map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let version = entry
            .try_enumerate_instance_version()
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
            .unwrap_or(vk::API_VERSION_1_0);
        if version < vk::API_VERSION_1_3 {
            return Err(BackendError::InitializationFailed(format!(
                "Vulkan 1.3 required, loader reports {}.{}",
                vk::api_version_major(version),
                vk::api_version_minor(version)
            )));
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"vr-render-core")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vr-render-core")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut layers = Vec::new();
        if config.validation {
            let available = entry
                .enumerate_instance_layer_properties()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let found = available
                .iter()
                .any(|layer| layer.layer_name_as_c_str().map(|n| n == VALIDATION_LAYER).unwrap_or(false));
            if found {
                layers.push(VALIDATION_LAYER.as_ptr());
            } else {
                log::warn!("Vulkan validation requested but {:?} is not installed", VALIDATION_LAYER);
            }
        }

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);
        let instance = entry
            .create_instance(&instance_info, None)
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        match create_device(&instance) {
            Ok((physical_device, device, queue_family, precise_occlusion)) => {
                let properties = instance.get_physical_device_properties(physical_device);
                if let Ok(name) = properties.device_name_as_c_str() {
                    log::info!("Vulkan device: {:?} ({:?})", name, properties.device_type);
                }
                let queue = device.get_device_queue(queue_family, 0);
                let depth_stencil_format = pick_depth_stencil_format(&instance, physical_device);
                Ok(DeviceContext {
                    entry,
                    instance,
                    physical_device,
                    device,
                    queue,
                    queue_family,
                    limits: properties.limits,
                    depth_stencil_format,
                    precise_occlusion,
                })
            }
            Err(e) => {
                instance.destroy_instance(None);
                Err(e)
            }
        }
    }
}

fn graphics_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

/// Pick a 1.3 capable device with a graphics queue, discrete GPUs first
unsafe fn create_device(instance: &ash::Instance) -> BackendResult<(vk::PhysicalDevice, ash::Device, u32, bool)> {
    let mut candidates: Vec<(vk::PhysicalDevice, u32, vk::PhysicalDeviceProperties)> = instance
        .enumerate_physical_devices()
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
        .into_iter()
        .filter_map(|pd| {
            let properties = instance.get_physical_device_properties(pd);
            if properties.api_version < vk::API_VERSION_1_3 {
                return None;
            }
            graphics_queue_family(instance, pd).map(|family| (pd, family, properties))
        })
        .collect();
    candidates.sort_by_key(|(_, _, properties)| match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        _ => 2,
    });
    let (physical_device, queue_family, _) = candidates
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::InitializationFailed("No Vulkan 1.3 device with a graphics queue".into()))?;

    let supported = instance.get_physical_device_features(physical_device);
    let precise_occlusion = supported.occlusion_query_precise == vk::TRUE;

    let priorities = [1.0f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities);
    let features = vk::PhysicalDeviceFeatures::default().occlusion_query_precise(precise_occlusion);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);
    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_features(&features)
        .push_next(&mut features13);

    let device = instance
        .create_device(physical_device, &device_info, None)
        .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;
    Ok((physical_device, device, queue_family, precise_occlusion))
}

/// D24S8 is missing on some desktop parts, fall back to D32S8
fn pick_depth_stencil_format(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> vk::Format {
    for format in [vk::Format::D24_UNORM_S8_UINT, vk::Format::D32_SFLOAT_S8_UINT] {
        let properties = unsafe { instance.get_physical_device_format_properties(physical_device, format) };
        if properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            return format;
        }
    }
    vk::Format::D32_SFLOAT_S8_UINT
}
