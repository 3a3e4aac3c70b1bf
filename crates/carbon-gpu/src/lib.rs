//! Thin RAII wrappers over Vulkan.
//!
//! This crate provides:
//! - Instance, device and queue bootstrap with extension negotiation
//! - Memory-backed buffers and images via gpu-allocator
//! - Command recording, descriptor sets and pipelines
//! - Render passes and framebuffers for presentation
//! - Swapchain and surface handling
//!
//! Ray tracing structures live in `carbon-rt`, crash diagnostics in
//! `carbon-diagnostics`.

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{aligned_size, Buffer, BufferResource, MappedBuffer, StagingBuffer};
pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities, VertexInputLimits};
pub use command::{execute_single_time_commands, CommandBuffer, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{DescriptorSet, DescriptorSetBuilder};
pub use device::{Device, DeviceFeatures, QueueFamilyIndices};
pub use error::{GpuError, Result, VkResultExt};
pub use image::{Image, ImageResource, StorageImage, Texture};
pub use instance::{surface_instance_extensions, ApplicationInfo};
pub use memory::GpuAllocator;
pub use pipeline::{
    single_pipeline, ComputePipeline, GraphicsPipeline, GraphicsPipelineBuilder, Pipeline,
    PipelineLayoutState, PipelineObject,
};
pub use queue::Queue;
pub use render_pass::{Framebuffer, RenderPass};
pub use shader::{ShaderModule, ShaderStage};
pub use surface::{Surface, SurfaceSupport};
pub use swapchain::Swapchain;
pub use sync::{Fence, Semaphore, DEFAULT_FENCE_TIMEOUT};

pub use ash;
pub use gpu_allocator::MemoryLocation;
