//! Logical device and its extension loaders.

use crate::capabilities::{GpuCapabilities, RayTracingCapabilities};
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use carbon_diagnostics::GpuCrashTracker;
use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::ops::Deref;
use std::sync::Arc;

/// Optional device functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub ray_tracing: bool,
    /// NV diagnostics config and checkpoints, used by the crash tracker.
    pub diagnostics: bool,
    /// Load the `VK_EXT_debug_utils` device functions.
    pub debug_utils: bool,
}

/// Device extensions required for `features`.
pub fn required_device_extensions(features: DeviceFeatures) -> Vec<&'static CStr> {
    let mut extensions = vec![ash::khr::swapchain::NAME];
    if features.ray_tracing {
        extensions.extend([
            ash::khr::acceleration_structure::NAME,
            ash::khr::ray_tracing_pipeline::NAME,
            ash::khr::deferred_host_operations::NAME,
        ]);
    }
    if features.diagnostics {
        extensions.extend([
            ash::nv::device_diagnostic_checkpoints::NAME,
            ash::nv::device_diagnostics_config::NAME,
        ]);
    }
    extensions
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilyIndices {
    /// Pick graphics, compute and transfer families.
    ///
    /// Dedicated compute and transfer families are preferred; compute falls
    /// back to graphics and transfer falls back to compute.
    pub fn select(families: &[vk::QueueFamilyProperties]) -> Result<Self> {
        let mut graphics = None;
        let mut compute = None;
        let mut transfer = None;

        for (index, family) in (0u32..).zip(families) {
            let flags = family.queue_flags;
            if flags.contains(vk::QueueFlags::COMPUTE)
                && !flags.contains(vk::QueueFlags::GRAPHICS)
                && compute.is_none()
            {
                compute = Some(index);
            }
            if flags.contains(vk::QueueFlags::TRANSFER)
                && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && transfer.is_none()
            {
                transfer = Some(index);
            }
            if flags.contains(vk::QueueFlags::GRAPHICS) && graphics.is_none() {
                graphics = Some(index);
            }
        }

        let graphics = graphics.ok_or(GpuError::NoSuitableDevice)?;
        let compute = compute.unwrap_or(graphics);
        let transfer = transfer.unwrap_or(compute);
        Ok(Self {
            graphics,
            compute,
            transfer,
        })
    }

    fn unique(&self) -> Vec<u32> {
        let mut seen = HashSet::new();
        [self.graphics, self.compute, self.transfer]
            .into_iter()
            .filter(|family| seen.insert(*family))
            .collect()
    }
}

/// The logical device plus everything needed to call extension functions.
///
/// Dereferences to [`ash::Device`] for core calls. The handle is destroyed by
/// the owning [`GpuContext`](crate::GpuContext).
pub struct Device {
    handle: ash::Device,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    capabilities: GpuCapabilities,
    queue_families: QueueFamilyIndices,
    swapchain: ash::khr::swapchain::Device,
    acceleration_structure: Option<ash::khr::acceleration_structure::Device>,
    ray_tracing_pipeline: Option<ash::khr::ray_tracing_pipeline::Device>,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    checkpoints: Option<ash::nv::device_diagnostic_checkpoints::Device>,
    crash_tracker: Option<Arc<GpuCrashTracker>>,
}

impl Device {
    /// Create the logical device with the required feature set enabled.
    ///
    /// # Safety
    /// The instance and physical device must be valid, and `capabilities` must
    /// describe `physical_device`.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        capabilities: GpuCapabilities,
        queue_families: QueueFamilyIndices,
        features: DeviceFeatures,
        crash_tracker: Option<Arc<GpuCrashTracker>>,
    ) -> Result<Self> {
        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let extensions = required_device_extensions(features);
        for ext in &extensions {
            if !capabilities.has_extension(ext) {
                return Err(GpuError::ExtensionNotSupported(
                    ext.to_string_lossy().into_owned(),
                ));
            }
        }
        let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .runtime_descriptor_array(true)
            .scalar_block_layout(true)
            .timeline_semaphore(true)
            .buffer_device_address(true);
        let mut rt_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut diagnostics_features =
            vk::PhysicalDeviceDiagnosticsConfigFeaturesNV::default().diagnostics_config(true);
        let mut diagnostics_config = vk::DeviceDiagnosticsConfigCreateInfoNV::default().flags(
            vk::DeviceDiagnosticsConfigFlagsNV::ENABLE_SHADER_DEBUG_INFO
                | vk::DeviceDiagnosticsConfigFlagsNV::ENABLE_AUTOMATIC_CHECKPOINTS,
        );

        let base_features = vk::PhysicalDeviceFeatures::default().shader_int64(true);
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(base_features)
            .push_next(&mut vulkan_1_2_features)
            .push_next(&mut vulkan_1_3_features);
        if features.ray_tracing {
            features2 = features2
                .push_next(&mut rt_pipeline_features)
                .push_next(&mut as_features);
        }
        if features.diagnostics {
            features2 = features2.push_next(&mut diagnostics_features);
        }

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut features2);
        if features.diagnostics {
            create_info = create_info.push_next(&mut diagnostics_config);
        }

        let handle = instance
            .create_device(physical_device, &create_info, None)
            .context("Failed to create device")?;

        let swapchain = ash::khr::swapchain::Device::new(instance, &handle);
        let acceleration_structure = features
            .ray_tracing
            .then(|| ash::khr::acceleration_structure::Device::new(instance, &handle));
        let ray_tracing_pipeline = features
            .ray_tracing
            .then(|| ash::khr::ray_tracing_pipeline::Device::new(instance, &handle));
        let debug_utils = features
            .debug_utils
            .then(|| ash::ext::debug_utils::Device::new(instance, &handle));
        let checkpoints = features
            .diagnostics
            .then(|| ash::nv::device_diagnostic_checkpoints::Device::new(instance, &handle));

        Ok(Self {
            handle,
            instance: instance.clone(),
            physical_device,
            capabilities,
            queue_families,
            swapchain,
            acceleration_structure,
            ray_tracing_pipeline,
            debug_utils,
            checkpoints,
            crash_tracker,
        })
    }

    pub fn handle(&self) -> &ash::Device {
        &self.handle
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    pub fn queue_families(&self) -> QueueFamilyIndices {
        self.queue_families
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain
    }

    /// Ray tracing limits. Fails when the device was created without ray
    /// tracing.
    pub fn ray_tracing_capabilities(&self) -> Result<&RayTracingCapabilities> {
        self.capabilities
            .ray_tracing
            .as_ref()
            .filter(|_| self.acceleration_structure.is_some())
            .ok_or_else(|| GpuError::InvalidState("Ray tracing is not enabled".to_string()))
    }

    pub fn acceleration_structure_loader(&self) -> Result<&ash::khr::acceleration_structure::Device> {
        self.acceleration_structure
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Ray tracing is not enabled".to_string()))
    }

    pub fn ray_tracing_pipeline_loader(&self) -> Result<&ash::khr::ray_tracing_pipeline::Device> {
        self.ray_tracing_pipeline
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Ray tracing is not enabled".to_string()))
    }

    /// Checkpoint functions; `None` without crash diagnostics.
    pub fn checkpoint_loader(&self) -> Option<&ash::nv::device_diagnostic_checkpoints::Device> {
        self.checkpoints.as_ref()
    }

    pub fn crash_tracker(&self) -> Option<&Arc<GpuCrashTracker>> {
        self.crash_tracker.as_ref()
    }

    /// Attach a debug name to any Vulkan handle.
    ///
    /// Does nothing when debug utils are not loaded or `name` is empty.
    pub fn set_debug_name<H: vk::Handle>(&self, handle: H, name: &str) -> Result<()> {
        let Some(debug_utils) = &self.debug_utils else {
            return Ok(());
        };
        if name.is_empty() {
            return Ok(());
        }
        let name = CString::new(name)
            .map_err(|e| GpuError::InvalidState(format!("Invalid debug name: {e}")))?;
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        unsafe { debug_utils.set_debug_utils_object_name(&info) }
            .context("Failed to set debug utils object name")
    }

    /// Create a descriptor pool.
    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        unsafe { self.handle.create_descriptor_pool(&create_info, None) }
            .context("Failed to create descriptor pool")
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.handle.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let indices = QueueFamilyIndices::select(&families).unwrap();
        assert_eq!(
            indices,
            QueueFamilyIndices {
                graphics: 0,
                compute: 1,
                transfer: 2,
            }
        );
        assert_eq!(indices.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn single_family_serves_everything() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let indices = QueueFamilyIndices::select(&families).unwrap();
        assert_eq!(indices.compute, 0);
        assert_eq!(indices.transfer, 0);
        assert_eq!(indices.unique(), vec![0]);
    }

    #[test]
    fn graphics_family_is_required() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        assert!(matches!(
            QueueFamilyIndices::select(&families),
            Err(GpuError::NoSuitableDevice)
        ));
    }

    #[test]
    fn extensions_follow_features() {
        let plain = required_device_extensions(DeviceFeatures {
            ray_tracing: false,
            diagnostics: false,
            debug_utils: false,
        });
        assert_eq!(plain, vec![ash::khr::swapchain::NAME]);

        let full = required_device_extensions(DeviceFeatures {
            ray_tracing: true,
            diagnostics: true,
            debug_utils: true,
        });
        assert!(full.contains(&ash::khr::acceleration_structure::NAME));
        assert!(full.contains(&ash::khr::ray_tracing_pipeline::NAME));
        assert!(full.contains(&ash::nv::device_diagnostic_checkpoints::NAME));
        assert_eq!(full.len(), 6);
    }
}
