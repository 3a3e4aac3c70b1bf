//! SPIR-V shader modules.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Entry point every shader module is expected to export.
pub const SHADER_ENTRY_POINT: &CStr = c"main";

/// Pipeline stage a shader module runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Fragment,
    Vertex,
    Compute,
    RayGeneration,
    ClosestHit,
    RayMiss,
    AnyHit,
    Intersection,
    Callable,
}

impl ShaderStage {
    pub const fn flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::RayMiss => vk::ShaderStageFlags::MISS_KHR,
            Self::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            Self::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            Self::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        }
    }

    /// Whether the stage belongs to a ray tracing pipeline.
    pub const fn is_ray_tracing(self) -> bool {
        matches!(
            self,
            Self::RayGeneration
                | Self::ClosestHit
                | Self::RayMiss
                | Self::AnyHit
                | Self::Intersection
                | Self::Callable
        )
    }
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        stage.flags()
    }
}

/// A compiled shader module. Destroyed on drop.
pub struct ShaderModule {
    device: Arc<Device>,
    name: String,
    stage: ShaderStage,
    handle: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a module from SPIR-V words.
    ///
    /// With crash diagnostics enabled the binary is registered so crash
    /// dumps can reference it.
    pub fn new(device: Arc<Device>, name: impl Into<String>, stage: ShaderStage, spirv: &[u32]) -> Result<Self> {
        let name = name.into();
        if spirv.is_empty() {
            return Err(GpuError::ShaderModule(format!("{name}: empty SPIR-V binary")));
        }

        let create_info = vk::ShaderModuleCreateInfo::default().code(spirv);
        let handle = unsafe { device.create_shader_module(&create_info, None) }
            .map_err(|e| GpuError::ShaderModule(format!("Failed to create shader module: {name}: {e:?}")))?;

        let module = Self {
            device,
            name,
            stage,
            handle,
        };
        module.device.set_debug_name(handle, &module.name)?;

        if let Some(tracker) = module.device.crash_tracker() {
            if let Some(hash) = tracker.register_shader(spirv) {
                debug!("Registered shader {} as {hash:?}", module.name);
            }
        }
        Ok(module)
    }

    /// Create a module from a SPIR-V byte stream, e.g. an `.spv` file.
    pub fn from_bytes(device: Arc<Device>, name: impl Into<String>, stage: ShaderStage, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let words = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| GpuError::ShaderModule(format!("{name}: {e}")))?;
        Self::new(device, name, stage, &words)
    }

    /// Create a module from a stripped binary and register its unstripped
    /// counterpart for crash-dump source lookups.
    pub fn with_debug_info(
        device: Arc<Device>,
        name: impl Into<String>,
        stage: ShaderStage,
        stripped: &[u32],
        full: &[u32],
    ) -> Result<Self> {
        let module = Self::new(device, name, stage, stripped)?;
        if let Some(tracker) = module.device.crash_tracker() {
            tracker.register_shader_with_debug_info(stripped, full);
        }
        Ok(module)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.flags())
            .module(self.handle)
            .name(SHADER_ENTRY_POINT)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.handle, None) };
    }
}
