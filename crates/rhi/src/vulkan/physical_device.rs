//! Physical device selection and capability discovery.

use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::types::{DeviceCapabilities, QueueType};

/// Queue family chosen for each [`QueueType`], plus the presenting family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
    pub compute_family: Option<u32>,
    pub transfer_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Graphics and present are mandatory; compute and transfer fall back to graphics.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    pub fn family(&self, queue: QueueType) -> Option<u32> {
        match queue {
            QueueType::Graphics => self.graphics_family,
            QueueType::Compute => self.compute_family,
            QueueType::Copy => self.transfer_family,
        }
    }

    /// Distinct family indices, graphics first.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(4);
        for family in [
            self.graphics_family,
            self.present_family,
            self.compute_family,
            self.transfer_family,
        ]
        .into_iter()
        .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Everything needed to create a logical device on one GPU.
#[derive(Clone)]
pub struct PhysicalDeviceInfo {
    pub device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
    pub timeline_semaphores: bool,
    /// Whether the graphics family reports valid timestamps.
    pub timestamps: bool,
}

impl PhysicalDeviceInfo {
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    pub fn api_version(&self) -> (u32, u32, u32) {
        let version = self.properties.api_version;
        (
            vk::api_version_major(version),
            vk::api_version_minor(version),
            vk::api_version_patch(version),
        )
    }

    pub fn device_local_memory(&self) -> u64 {
        self.memory_properties
            .memory_heaps
            .iter()
            .take(self.memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum()
    }

    /// The subset of properties the RHI core adapts to.
    pub fn capabilities(&self) -> DeviceCapabilities {
        let limits = &self.properties.limits;
        DeviceCapabilities {
            device_name: self.device_name().to_string(),
            timestamp_period: if self.timestamps {
                limits.timestamp_period
            } else {
                0.0
            },
            whole_query_readback: true,
            timeline_semaphores: self.timeline_semaphores,
            acceleration_structures: false,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            framebuffer_sample_counts: limits.framebuffer_color_sample_counts
                & limits.framebuffer_depth_sample_counts,
        }
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (major, minor, patch) = self.api_version();
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("api_version", &format!("{}.{}.{}", major, minor, patch))
            .field("queue_families", &self.queue_families)
            .field("timeline_semaphores", &self.timeline_semaphores)
            .finish()
    }
}

/// Picks the highest-scoring GPU that can present to `surface`.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }
    info!("Found {} GPU(s)", devices.len());

    let mut suitable: Vec<(PhysicalDeviceInfo, u32)> = devices
        .into_iter()
        .filter_map(|device| check_device_suitability(instance, device, surface, surface_loader))
        .map(|info| {
            let score = rate_device(&info);
            debug!(
                "GPU '{}' ({}) - Score: {}",
                info.device_name(),
                info.device_type_name(),
                score
            );
            (info, score)
        })
        .collect();

    suitable.sort_by(|a, b| b.1.cmp(&a.1));
    let Some((selected, score)) = suitable.into_iter().next() else {
        warn!("No suitable GPU found with required capabilities");
        return Err(RhiError::NoSuitableGpu);
    };

    let (major, minor, patch) = selected.api_version();
    info!(
        "Selected GPU: '{}' ({}) - Vulkan {}.{}.{}, Score: {}",
        selected.device_name(),
        selected.device_type_name(),
        major,
        minor,
        patch,
        score
    );
    Ok(selected)
}

fn check_device_suitability(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::khr::surface::Instance,
) -> Option<PhysicalDeviceInfo> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let features = unsafe { instance.get_physical_device_features(device) };
    let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
    let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let device_name = properties
        .device_name_as_c_str()
        .ok()
        .and_then(|name: &CStr| name.to_str().ok())
        .unwrap_or("Unknown")
        .to_string();

    if vk::api_version_major(properties.api_version) == 1
        && vk::api_version_minor(properties.api_version) < 2
    {
        debug!("GPU '{}' skipped: Vulkan 1.2 not supported", device_name);
        return None;
    }

    let flags: Vec<vk::QueueFlags> = families
        .iter()
        .map(|family| {
            if family.queue_count == 0 {
                vk::QueueFlags::empty()
            } else {
                family.queue_flags
            }
        })
        .collect();
    let queue_families = find_queue_families(&flags, |index| unsafe {
        surface_loader
            .get_physical_device_surface_support(device, index, surface)
            .unwrap_or(false)
    });

    if !queue_families.is_complete() {
        debug!(
            "GPU '{}' skipped: missing required queue families (graphics={}, present={})",
            device_name,
            queue_families.graphics_family.is_some(),
            queue_families.present_family.is_some()
        );
        return None;
    }

    let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan12);
    unsafe { instance.get_physical_device_features2(device, &mut features2) };
    let timeline_semaphores = vulkan12.timeline_semaphore == vk::TRUE;

    let timestamps = queue_families
        .graphics_family
        .and_then(|index| families.get(index as usize))
        .is_some_and(|family| family.timestamp_valid_bits > 0);

    Some(PhysicalDeviceInfo {
        device,
        properties,
        features,
        memory_properties,
        queue_families,
        timeline_semaphores,
        timestamps,
    })
}

/// Assigns queue families from their flags.
///
/// Dedicated compute and transfer families are preferred; both fall back to
/// the graphics family.
pub fn find_queue_families(
    families: &[vk::QueueFlags],
    mut supports_present: impl FnMut(u32) -> bool,
) -> QueueFamilyIndices {
    let mut indices = QueueFamilyIndices::default();
    let mut dedicated_compute: Option<u32> = None;
    let mut dedicated_transfer: Option<u32> = None;

    for (i, flags) in families.iter().enumerate() {
        let i = i as u32;
        if flags.is_empty() {
            continue;
        }

        let has_graphics = flags.contains(vk::QueueFlags::GRAPHICS);
        let has_compute = flags.contains(vk::QueueFlags::COMPUTE);
        let has_transfer = flags.contains(vk::QueueFlags::TRANSFER);

        if has_graphics && indices.graphics_family.is_none() {
            indices.graphics_family = Some(i);
        }
        if has_compute && !has_graphics && dedicated_compute.is_none() {
            dedicated_compute = Some(i);
        }
        if has_transfer && !has_graphics && !has_compute && dedicated_transfer.is_none() {
            dedicated_transfer = Some(i);
        }
        if indices.present_family.is_none() && supports_present(i) {
            indices.present_family = Some(i);
        }
    }

    indices.compute_family = dedicated_compute.or(indices.graphics_family);
    indices.transfer_family = dedicated_transfer.or(indices.graphics_family);
    indices
}

fn rate_device(info: &PhysicalDeviceInfo) -> u32 {
    let mut score = match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10_000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1_000,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 100,
        _ => 10,
    };
    if info.timeline_semaphores {
        score += 500;
    }
    if info.features.sampler_anisotropy == vk::TRUE {
        score += 100;
    }
    score += (info.device_local_memory() / (1024 * 1024 * 1024)) as u32 * 10;
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAPHICS: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const COMPUTE: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn test_dedicated_families_preferred() {
        let families = [GRAPHICS, COMPUTE, vk::QueueFlags::TRANSFER];
        let indices = find_queue_families(&families, |i| i == 0);
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.present_family, Some(0));
        assert_eq!(indices.compute_family, Some(1));
        assert_eq!(indices.transfer_family, Some(2));
        assert_eq!(indices.unique_families(), vec![0, 1, 2]);
    }

    #[test]
    fn test_single_family_serves_everything() {
        let indices = find_queue_families(&[GRAPHICS], |_| true);
        assert!(indices.is_complete());
        for queue in QueueType::ALL {
            assert_eq!(indices.family(queue), Some(0));
        }
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn test_no_present_is_incomplete() {
        let indices = find_queue_families(&[GRAPHICS], |_| false);
        assert!(!indices.is_complete());
    }

    #[test]
    fn test_empty_family_skipped() {
        let families = [vk::QueueFlags::empty(), GRAPHICS];
        let indices = find_queue_families(&families, |_| true);
        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.present_family, Some(1));
    }
}
