//! Vulkan capability probe.
//!
//! Loads the system Vulkan loader through `ash`, picks the first physical
//! device exposing a compute queue, and reads the limits that bound chunk
//! sizes. Nothing is dispatched here.

use anyhow::{anyhow, Context, Result};
use ash::vk;
use tracing::{debug, info};

use super::device::DeviceLimits;

/// Probe the first compute-capable Vulkan device.
pub fn probe() -> Result<DeviceLimits> {
    // SAFETY: loading the loader library has no preconditions beyond it being
    // a conforming Vulkan loader.
    let entry = unsafe { ash::Entry::load() }.context("Vulkan loader not available")?;

    let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_2);
    let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

    // SAFETY: create_info and app_info outlive the call; the instance is
    // destroyed below before returning.
    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| anyhow!("vkCreateInstance failed: {:?}", e))?;

    let result = unsafe { select_device(&instance) };

    // SAFETY: no child objects were created from this instance.
    unsafe { instance.destroy_instance(None) };

    result
}

unsafe fn select_device(instance: &ash::Instance) -> Result<DeviceLimits> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(|e| anyhow!("vkEnumeratePhysicalDevices failed: {:?}", e))?;
    debug!(count = devices.len(), "Vulkan physical devices enumerated");

    for device in devices {
        let has_compute = instance
            .get_physical_device_queue_family_properties(device)
            .iter()
            .any(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE));
        if !has_compute {
            continue;
        }

        let props = instance.get_physical_device_properties(device);
        let adapter = props
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| format!("{:?}", props.device_type));

        let mut features = vec![format!("{:?}", props.device_type)];
        features.push(format!(
            "api {}.{}",
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version)
        ));

        info!(
            adapter = %adapter,
            max_storage_buffer_range = props.limits.max_storage_buffer_range,
            "Vulkan compute device found"
        );

        return Ok(DeviceLimits {
            adapter: Some(adapter),
            max_buffer_bytes: Some(u64::from(props.limits.max_storage_buffer_range)),
            max_workgroup_size: Some(props.limits.max_compute_work_group_size[0]),
            features,
        });
    }

    Err(anyhow!("no Vulkan device with a compute queue"))
}
