//! GPU capability detection.

use crate::instance::device_local_memory_mb;
use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Ray tracing limits of the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct RayTracingCapabilities {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    /// Alignment of the scratch buffer offset used by structure builds.
    pub min_acceleration_structure_scratch_offset_alignment: u32,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
}

/// Vertex input limits checked by the graphics pipeline builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexInputLimits {
    pub max_vertex_input_attributes: u32,
    pub max_vertex_input_bindings: u32,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    pub driver_version: u32,

    pub supports_dynamic_rendering: bool,
    pub supports_synchronization2: bool,
    pub supports_buffer_device_address: bool,
    pub supports_descriptor_indexing: bool,
    pub supports_scalar_block_layout: bool,
    pub supports_timeline_semaphore: bool,
    pub supports_shader_int64: bool,

    /// `Some` when both ray tracing pipeline and acceleration structure
    /// features are present.
    pub ray_tracing: Option<RayTracingCapabilities>,
    /// `VK_NV_device_diagnostic_checkpoints` and the diagnostics config
    /// feature are available.
    pub supports_diagnostic_checkpoints: bool,

    pub device_local_memory_mb: u64,
    pub max_memory_allocation_count: u32,
    pub vertex_input: VertexInputLimits,
    pub max_push_constants_size: u32,
    pub max_sampler_anisotropy: f32,

    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let available_extensions: HashSet<String> = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();
        let has = |name: &CStr| {
            name.to_str()
                .is_ok_and(|name| available_extensions.contains(name))
        };

        let mut features_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features_13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut rt_pipeline_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut diagnostics_features = vk::PhysicalDeviceDiagnosticsConfigFeaturesNV::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut features_12)
            .push_next(&mut features_13);
        let has_rt_extensions = has(ash::khr::ray_tracing_pipeline::NAME)
            && has(ash::khr::acceleration_structure::NAME)
            && has(ash::khr::deferred_host_operations::NAME);
        if has_rt_extensions {
            features2 = features2
                .push_next(&mut rt_pipeline_features)
                .push_next(&mut as_features);
        }
        let has_diagnostics_extensions = has(ash::nv::device_diagnostic_checkpoints::NAME)
            && has(ash::nv::device_diagnostics_config::NAME);
        if has_diagnostics_extensions {
            features2 = features2.push_next(&mut diagnostics_features);
        }
        instance.get_physical_device_features2(physical_device, &mut features2);
        let base_features = features2.features;

        let supports_ray_tracing = has_rt_extensions
            && rt_pipeline_features.ray_tracing_pipeline == vk::TRUE
            && as_features.acceleration_structure == vk::TRUE;

        let ray_tracing = supports_ray_tracing.then(|| {
            let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut props2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut rt_props)
                .push_next(&mut as_props);
            instance.get_physical_device_properties2(physical_device, &mut props2);

            RayTracingCapabilities {
                shader_group_handle_size: rt_props.shader_group_handle_size,
                shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
                shader_group_base_alignment: rt_props.shader_group_base_alignment,
                max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
                min_acceleration_structure_scratch_offset_alignment: as_props
                    .min_acceleration_structure_scratch_offset_alignment,
                max_geometry_count: as_props.max_geometry_count,
                max_instance_count: as_props.max_instance_count,
                max_primitive_count: as_props.max_primitive_count,
            }
        });

        let device_name = properties
            .device_name_as_c_str()
            .map_or_else(|_| String::from("<unknown>"), |name| name.to_string_lossy().into_owned());

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: features_13.dynamic_rendering == vk::TRUE,
            supports_synchronization2: features_13.synchronization2 == vk::TRUE,
            supports_buffer_device_address: features_12.buffer_device_address == vk::TRUE,
            supports_descriptor_indexing: features_12.descriptor_indexing == vk::TRUE,
            supports_scalar_block_layout: features_12.scalar_block_layout == vk::TRUE,
            supports_timeline_semaphore: features_12.timeline_semaphore == vk::TRUE,
            supports_shader_int64: base_features.shader_int64 == vk::TRUE,

            ray_tracing,
            supports_diagnostic_checkpoints: has_diagnostics_extensions
                && diagnostics_features.diagnostics_config == vk::TRUE,

            device_local_memory_mb: device_local_memory_mb(&memory_properties),
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,
            vertex_input: VertexInputLimits {
                max_vertex_input_attributes: properties.limits.max_vertex_input_attributes,
                max_vertex_input_bindings: properties.limits.max_vertex_input_bindings,
            },
            max_push_constants_size: properties.limits.max_push_constants_size,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,

            available_extensions,
        }
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .is_ok_and(|name| self.available_extensions.contains(name))
    }

    /// Names of required features the device lacks. Empty when the device
    /// can run the library.
    pub fn missing_features(&self) -> Vec<&'static str> {
        let checks = [
            (self.supports_shader_int64, "shaderInt64"),
            (self.supports_descriptor_indexing, "descriptorIndexing"),
            (self.supports_scalar_block_layout, "scalarBlockLayout"),
            (self.supports_timeline_semaphore, "timelineSemaphore"),
            (self.supports_buffer_device_address, "bufferDeviceAddress"),
            (self.supports_dynamic_rendering, "dynamicRendering"),
            (self.supports_synchronization2, "synchronization2"),
        ];
        checks
            .into_iter()
            .filter_map(|(supported, name)| (!supported).then_some(name))
            .collect()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - ray tracing {}",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            if self.ray_tracing.is_some() { "yes" } else { "no" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "Test GPU".to_string(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_buffer_device_address: true,
            supports_descriptor_indexing: true,
            supports_scalar_block_layout: true,
            supports_timeline_semaphore: true,
            supports_shader_int64: true,
            ray_tracing: None,
            supports_diagnostic_checkpoints: false,
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            vertex_input: VertexInputLimits {
                max_vertex_input_attributes: 16,
                max_vertex_input_bindings: 16,
            },
            max_push_constants_size: 128,
            max_sampler_anisotropy: 16.0,
            available_extensions: HashSet::from(["VK_KHR_swapchain".to_string()]),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x106B), GpuVendor::Apple);
        assert_eq!(GpuVendor::from_vendor_id(0x5143), GpuVendor::Other(0x5143));
    }

    #[test]
    fn missing_features_lists_gaps() {
        let mut caps = capabilities();
        assert!(caps.missing_features().is_empty());

        caps.supports_shader_int64 = false;
        caps.supports_dynamic_rendering = false;
        assert_eq!(
            caps.missing_features(),
            vec!["shaderInt64", "dynamicRendering"]
        );
    }

    #[test]
    fn extension_lookup() {
        let caps = capabilities();
        assert!(caps.has_extension(ash::khr::swapchain::NAME));
        assert!(!caps.has_extension(ash::khr::ray_tracing_pipeline::NAME));
    }

    #[test]
    fn summary_mentions_ray_tracing() {
        let mut caps = capabilities();
        assert!(caps.summary().ends_with("ray tracing no"));
        caps.ray_tracing = Some(RayTracingCapabilities::default());
        assert!(caps.summary().ends_with("ray tracing yes"));
    }
}
