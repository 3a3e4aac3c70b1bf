//! Pipeline creation and management.

use crate::capabilities::VertexInputLimits;
use crate::descriptors::DescriptorSet;
use crate::device::Device;
use crate::error::{GpuError, Result, VkResultExt};
use crate::shader::{ShaderModule, ShaderStage};
use ash::vk;
use std::sync::Arc;

/// Anything that can be bound to a command buffer as a pipeline.
pub trait Pipeline {
    fn handle(&self) -> vk::Pipeline;
    fn layout(&self) -> vk::PipelineLayout;
    fn bind_point(&self) -> vk::PipelineBindPoint;
    /// Sets bound by [`crate::command::CommandBuffer::bind_descriptor_sets`],
    /// in set order.
    fn descriptor_sets(&self) -> Vec<vk::DescriptorSet>;
}

/// The one pipeline from a single-create-info creation call.
///
/// Driver failures and an empty result both become `PipelineCreation`.
pub fn single_pipeline(
    created: std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
    name: &str,
) -> Result<vk::Pipeline> {
    match created {
        Ok(pipelines) => pipelines
            .first()
            .copied()
            .filter(|handle| *handle != vk::Pipeline::null())
            .ok_or_else(|| GpuError::PipelineCreation(format!("{name}: driver returned no pipeline"))),
        Err((_, result)) => Err(GpuError::PipelineCreation(format!("{name}: {result:?}"))),
    }
}

/// Descriptor sets and push constant ranges shared by every pipeline kind.
#[derive(Default, Clone)]
pub struct PipelineLayoutState {
    descriptor_sets: Vec<Arc<DescriptorSet>>,
    push_constants: Vec<vk::PushConstantRange>,
}

impl PipelineLayoutState {
    pub fn add_descriptor_set(&mut self, set: Arc<DescriptorSet>) {
        self.descriptor_sets.push(set);
    }

    pub fn add_push_constant(&mut self, size: u32, stages: vk::ShaderStageFlags, offset: u32) {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
    }

    pub fn push_constants(&self) -> &[vk::PushConstantRange] {
        &self.push_constants
    }

    /// Create a `VkPipelineLayout` over the collected sets and ranges.
    pub fn create_layout(&self, device: &Device) -> Result<vk::PipelineLayout> {
        let set_layouts: Vec<vk::DescriptorSetLayout> =
            self.descriptor_sets.iter().map(|set| set.layout()).collect();
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&self.push_constants);
        unsafe { device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")
    }
}

/// A created pipeline and its layout. Both are destroyed on drop.
pub struct PipelineObject {
    device: Arc<Device>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    descriptor_sets: Vec<Arc<DescriptorSet>>,
}

impl PipelineObject {
    /// Take ownership of `handle` and `layout`, naming the pipeline `name`.
    pub fn new(
        device: Arc<Device>,
        handle: vk::Pipeline,
        layout: vk::PipelineLayout,
        bind_point: vk::PipelineBindPoint,
        state: PipelineLayoutState,
        name: &str,
    ) -> Result<Self> {
        let pipeline = Self {
            device,
            handle,
            layout,
            bind_point,
            descriptor_sets: state.descriptor_sets,
        };
        pipeline.device.set_debug_name(handle, name)?;
        Ok(pipeline)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Pipeline for PipelineObject {
    fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    fn descriptor_sets(&self) -> Vec<vk::DescriptorSet> {
        self.descriptor_sets.iter().map(|set| set.handle()).collect()
    }
}

impl Drop for PipelineObject {
    fn drop(&mut self) {
        unsafe {
            if self.handle != vk::Pipeline::null() {
                self.device.destroy_pipeline(self.handle, None);
            }
            if self.layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(self.layout, None);
            }
        }
    }
}

/// Blend state that overwrites the previous attachment value.
pub fn overwrite_blend_state() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState {
        blend_enable: vk::TRUE,
        src_color_blend_factor: vk::BlendFactor::ONE,
        dst_color_blend_factor: vk::BlendFactor::ZERO,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: vk::BlendFactor::ONE,
        dst_alpha_blend_factor: vk::BlendFactor::ZERO,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

/// Builder for a rasterized pipeline using dynamic rendering.
pub struct GraphicsPipelineBuilder {
    layout: PipelineLayoutState,
    color_attachments: Vec<vk::Format>,
    blend_states: Vec<vk::PipelineColorBlendAttachmentState>,
    stages: Vec<vk::PipelineShaderStageCreateInfo<'static>>,
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    msaa_samples: vk::SampleCountFlags,
    limits: VertexInputLimits,
}

impl GraphicsPipelineBuilder {
    /// Start a pipeline bounded by `limits`.
    pub fn new(limits: VertexInputLimits) -> Self {
        Self {
            layout: PipelineLayoutState::default(),
            color_attachments: Vec::new(),
            blend_states: Vec::new(),
            stages: Vec::new(),
            bindings: Vec::new(),
            attributes: Vec::new(),
            msaa_samples: vk::SampleCountFlags::TYPE_1,
            limits,
        }
    }

    pub fn for_device(device: &Device) -> Self {
        Self::new(device.capabilities().vertex_input)
    }

    pub fn add_descriptor_set(&mut self, set: Arc<DescriptorSet>) -> &mut Self {
        self.layout.add_descriptor_set(set);
        self
    }

    pub fn add_push_constant(&mut self, size: u32, stages: vk::ShaderStageFlags, offset: u32) -> &mut Self {
        self.layout.add_push_constant(size, stages, offset);
        self
    }

    /// Add a color attachment that overwrites previous values. Returns its
    /// index.
    pub fn add_color_attachment(&mut self, format: vk::Format) -> u32 {
        self.color_attachments.push(format);
        self.blend_states.push(overwrite_blend_state());
        u32::try_from(self.color_attachments.len() - 1).unwrap_or(u32::MAX)
    }

    pub fn set_blending_for_color_attachment(
        &mut self,
        attachment: u32,
        state: vk::PipelineColorBlendAttachmentState,
    ) -> Result<()> {
        let slot = self
            .blend_states
            .get_mut(attachment as usize)
            .ok_or_else(|| GpuError::InvalidState(format!("No color attachment {attachment}")))?;
        *slot = state;
        Ok(())
    }

    /// Use `module` as one of the pipeline stages. The module must outlive
    /// [`GraphicsPipelineBuilder::build`].
    pub fn add_shader_module(&mut self, module: &ShaderModule) -> &mut Self {
        self.stages.push(module.stage_create_info());
        self
    }

    pub fn add_vertex_attribute(&mut self, attribute: vk::VertexInputAttributeDescription) -> Result<()> {
        if self.attributes.len() >= self.limits.max_vertex_input_attributes as usize {
            return Err(GpuError::ResourceExhausted(format!(
                "Ran out of vertex attributes. Maximum is {}.",
                self.limits.max_vertex_input_attributes
            )));
        }
        self.attributes.push(attribute);
        Ok(())
    }

    /// Add a vertex binding. Returns its binding number.
    pub fn add_vertex_binding(&mut self, binding: vk::VertexInputBindingDescription) -> Result<u32> {
        if self.bindings.len() >= self.limits.max_vertex_input_bindings as usize {
            return Err(GpuError::ResourceExhausted(format!(
                "Ran out of vertex bindings. Maximum is {}.",
                self.limits.max_vertex_input_bindings
            )));
        }
        self.bindings.push(binding);
        Ok(binding.binding)
    }

    pub fn set_msaa_samples(&mut self, samples: vk::SampleCountFlags) -> &mut Self {
        self.msaa_samples = samples;
        self
    }

    pub fn build(&self, device: Arc<Device>, name: &str) -> Result<GraphicsPipeline> {
        let has_vertex = self
            .stages
            .iter()
            .any(|stage| stage.stage == ShaderStage::Vertex.flags());
        if !has_vertex {
            return Err(GpuError::PipelineCreation(format!("{name}: no vertex shader")));
        }

        let layout = self.layout.create_layout(&device)?;

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.bindings)
            .vertex_attribute_descriptions(&self.attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(self.msaa_samples);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&self.blend_states);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&self.color_attachments);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&self.stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let created =
            unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None) };
        let handle = match single_pipeline(created, name) {
            Ok(handle) => handle,
            Err(err) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        let inner = PipelineObject::new(
            device,
            handle,
            layout,
            vk::PipelineBindPoint::GRAPHICS,
            self.layout.clone(),
            name,
        )?;
        Ok(GraphicsPipeline { inner })
    }
}

/// A rasterized pipeline created by [`GraphicsPipelineBuilder`].
pub struct GraphicsPipeline {
    inner: PipelineObject,
}

impl Pipeline for GraphicsPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.inner.handle()
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.inner.layout()
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::GRAPHICS
    }

    fn descriptor_sets(&self) -> Vec<vk::DescriptorSet> {
        self.inner.descriptor_sets()
    }
}

/// A compute pipeline over a single shader module.
pub struct ComputePipeline {
    inner: PipelineObject,
}

impl ComputePipeline {
    pub fn new(device: Arc<Device>, module: &ShaderModule, state: PipelineLayoutState, name: &str) -> Result<Self> {
        if module.stage() != ShaderStage::Compute {
            return Err(GpuError::PipelineCreation(format!(
                "{name}: expected a compute shader, got {:?}",
                module.stage()
            )));
        }

        let layout = state.create_layout(&device)?;
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(module.stage_create_info())
            .layout(layout);

        let created =
            unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None) };
        let handle = match single_pipeline(created, name) {
            Ok(handle) => handle,
            Err(err) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        let inner = PipelineObject::new(device, handle, layout, vk::PipelineBindPoint::COMPUTE, state, name)?;
        Ok(Self { inner })
    }
}

impl Pipeline for ComputePipeline {
    fn handle(&self) -> vk::Pipeline {
        self.inner.handle()
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.inner.layout()
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::COMPUTE
    }

    fn descriptor_sets(&self) -> Vec<vk::DescriptorSet> {
        self.inner.descriptor_sets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn limits(attributes: u32, bindings: u32) -> VertexInputLimits {
        VertexInputLimits {
            max_vertex_input_attributes: attributes,
            max_vertex_input_bindings: bindings,
        }
    }

    #[test]
    fn vertex_attribute_limit() {
        let mut builder = GraphicsPipelineBuilder::new(limits(2, 16));
        let attribute = vk::VertexInputAttributeDescription::default().format(vk::Format::R32G32B32_SFLOAT);
        builder.add_vertex_attribute(attribute).unwrap();
        builder.add_vertex_attribute(attribute.location(1)).unwrap();

        let err = builder.add_vertex_attribute(attribute.location(2)).unwrap_err();
        assert_eq!(err.to_string(), "Ran out of vertex attributes. Maximum is 2.");
        assert_eq!(builder.attributes.len(), 2);
    }

    #[test]
    fn vertex_binding_limit() {
        let mut builder = GraphicsPipelineBuilder::new(limits(16, 1));
        let binding = vk::VertexInputBindingDescription::default().binding(3).stride(12);
        assert_eq!(builder.add_vertex_binding(binding).unwrap(), 3);

        let err = builder.add_vertex_binding(binding.binding(4)).unwrap_err();
        assert!(matches!(err, GpuError::ResourceExhausted(_)));
        assert_eq!(err.to_string(), "Ran out of vertex bindings. Maximum is 1.");
    }

    #[test]
    fn attributes_do_not_count_against_bindings() {
        let mut builder = GraphicsPipelineBuilder::new(limits(4, 1));
        builder
            .add_vertex_binding(vk::VertexInputBindingDescription::default())
            .unwrap();
        for location in 0..4 {
            builder
                .add_vertex_attribute(vk::VertexInputAttributeDescription::default().location(location))
                .unwrap();
        }
    }

    #[test]
    fn color_attachments_default_to_overwrite() {
        let mut builder = GraphicsPipelineBuilder::new(limits(16, 16));
        assert_eq!(builder.add_color_attachment(vk::Format::B8G8R8A8_UNORM), 0);
        assert_eq!(builder.add_color_attachment(vk::Format::R16G16B16A16_SFLOAT), 1);

        let state = builder.blend_states[1];
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ZERO);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
    }

    #[test]
    fn blending_override_checks_index() {
        let mut builder = GraphicsPipelineBuilder::new(limits(16, 16));
        let index = builder.add_color_attachment(vk::Format::B8G8R8A8_UNORM);
        let additive = vk::PipelineColorBlendAttachmentState {
            dst_color_blend_factor: vk::BlendFactor::ONE,
            ..overwrite_blend_state()
        };
        builder.set_blending_for_color_attachment(index, additive).unwrap();
        assert_eq!(builder.blend_states[0].dst_color_blend_factor, vk::BlendFactor::ONE);
        assert!(builder.set_blending_for_color_attachment(5, additive).is_err());
    }

    #[test]
    fn push_constant_ranges_accumulate() {
        let mut state = PipelineLayoutState::default();
        state.add_push_constant(64, vk::ShaderStageFlags::VERTEX, 0);
        state.add_push_constant(16, vk::ShaderStageFlags::FRAGMENT, 64);
        assert_eq!(state.push_constants().len(), 2);
        assert_eq!(state.push_constants()[1].offset, 64);
    }

    #[test]
    fn empty_creation_result_is_an_error() {
        let err = single_pipeline(Ok(Vec::new()), "empty").unwrap_err();
        assert!(matches!(err, GpuError::PipelineCreation(_)));
        assert!(err.to_string().contains("empty: driver returned no pipeline"));
    }

    #[test]
    fn null_pipeline_is_an_error() {
        assert!(single_pipeline(Ok(vec![vk::Pipeline::null()]), "null").is_err());
    }

    #[test]
    fn driver_failure_names_result() {
        let err = single_pipeline(Err((Vec::new(), vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)), "rt").unwrap_err();
        assert_eq!(err.to_string(), "Pipeline creation failed: rt: ERROR_OUT_OF_DEVICE_MEMORY");
    }

    #[test]
    fn created_pipeline_is_returned() {
        let handle = vk::Pipeline::from_raw(0x42);
        assert_eq!(single_pipeline(Ok(vec![handle]), "ok").unwrap(), handle);
    }
}
