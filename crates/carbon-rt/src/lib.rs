//! Hardware ray tracing for carbon.
//!
//! This crate provides:
//! - Bottom- and top-level acceleration structures (`VK_KHR_acceleration_structure`)
//! - Ray tracing pipelines built from validated shader groups (`VK_KHR_ray_tracing_pipeline`)
//! - Shader binding tables
//!
//! Every entry point needs a device created with ray tracing enabled and
//! fails with [`carbon_gpu::GpuError::InvalidState`] otherwise.

pub mod acceleration;
pub mod rt_pipeline;
pub mod sbt;

pub use acceleration::{
    align_build_sizes, instance_descriptor, AccelerationStructure, AccelerationStructureType,
    BottomLevelAccelerationStructure, MeshLayout, PrimitiveData, TopLevelAccelerationStructure,
    IDENTITY_TRANSFORM,
};
pub use rt_pipeline::{shader_group_info, RayTracingPipeline, RayTracingPipelineBuilder, RtShaderGroup};
pub use sbt::{GroupCounts, SbtLayout, SbtRegion, ShaderBindingTable};
