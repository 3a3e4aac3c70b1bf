//! Ray tracing pipelines and shader group assembly.

use ash::vk;
use carbon_gpu::{
    single_pipeline, DescriptorSet, Device, GpuError, Pipeline, PipelineLayoutState, PipelineObject, Result,
    ShaderModule, ShaderStage,
};
use std::sync::Arc;
use tracing::debug;

/// The three kinds of shader group a ray tracing pipeline is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtShaderGroup {
    /// One ray generation, miss or callable shader.
    General,
    /// Closest-hit and/or any-hit shaders for built-in triangles.
    TriangleHit,
    /// An intersection shader with optional closest-hit and any-hit shaders.
    Procedural,
}

impl RtShaderGroup {
    pub const fn raw(self) -> vk::RayTracingShaderGroupTypeKHR {
        match self {
            Self::General => vk::RayTracingShaderGroupTypeKHR::GENERAL,
            Self::TriangleHit => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            Self::Procedural => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
        }
    }

    const fn max_stages(self) -> usize {
        match self {
            Self::General => 1,
            Self::TriangleHit => 2,
            Self::Procedural => 3,
        }
    }
}

fn invalid<T>(message: String) -> Result<T> {
    Err(GpuError::InvalidShaderGroup(message))
}

/// Describe a group whose shaders occupy consecutive pipeline stage slots
/// starting at `first_stage`.
///
/// Unused slots are [`vk::SHADER_UNUSED_KHR`].
pub fn shader_group_info(
    group: RtShaderGroup,
    first_stage: u32,
    stages: &[ShaderStage],
) -> Result<vk::RayTracingShaderGroupCreateInfoKHR<'static>> {
    if stages.len() > group.max_stages() {
        return invalid(format!(
            "{group:?} group takes at most {} shaders, got {}",
            group.max_stages(),
            stages.len()
        ));
    }

    let mut info = vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(group.raw())
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR);

    if group == RtShaderGroup::General {
        return match stages {
            [ShaderStage::RayGeneration | ShaderStage::RayMiss | ShaderStage::Callable] => {
                Ok(info.general_shader(first_stage))
            }
            [other] => invalid(format!("{other:?} shader cannot form a general group")),
            _ => invalid("General group needs exactly one shader".to_string()),
        };
    }

    for (index, stage) in (first_stage..).zip(stages) {
        let slot = match stage {
            ShaderStage::ClosestHit => &mut info.closest_hit_shader,
            ShaderStage::AnyHit => &mut info.any_hit_shader,
            ShaderStage::Intersection if group == RtShaderGroup::Procedural => &mut info.intersection_shader,
            other => return invalid(format!("{other:?} shader cannot be part of a {group:?} group")),
        };
        if *slot != vk::SHADER_UNUSED_KHR {
            return invalid(format!("{group:?} group has more than one {stage:?} shader"));
        }
        *slot = index;
    }

    if group == RtShaderGroup::Procedural && info.intersection_shader == vk::SHADER_UNUSED_KHR {
        return invalid("Procedural group needs an intersection shader".to_string());
    }
    Ok(info)
}

/// Collects shader groups and layout state for a [`RayTracingPipeline`].
///
/// Groups keep the order they were added in; the shader binding table
/// expects ray generation groups first, then miss, hit and callable groups.
#[derive(Default)]
pub struct RayTracingPipelineBuilder {
    layout: PipelineLayoutState,
    stages: Vec<vk::PipelineShaderStageCreateInfo<'static>>,
    groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR<'static>>,
    max_recursion_depth: Option<u32>,
}

impl RayTracingPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_descriptor_set(&mut self, set: Arc<DescriptorSet>) -> &mut Self {
        self.layout.add_descriptor_set(set);
        self
    }

    pub fn add_push_constant(&mut self, size: u32, stages: vk::ShaderStageFlags, offset: u32) -> &mut Self {
        self.layout.add_push_constant(size, stages, offset);
        self
    }

    /// Add a group built from `modules`, returning its group index.
    ///
    /// Every module becomes a new pipeline stage, even if it was added to an
    /// earlier group already.
    pub fn add_shader_group(&mut self, group: RtShaderGroup, modules: &[&ShaderModule]) -> Result<u32> {
        let stages: Vec<ShaderStage> = modules.iter().map(|module| module.stage()).collect();
        let first_stage = u32::try_from(self.stages.len())
            .map_err(|_| GpuError::ResourceExhausted("Too many ray tracing stages".to_string()))?;
        let info = shader_group_info(group, first_stage, &stages)?;

        self.stages
            .extend(modules.iter().map(|module| module.stage_create_info()));
        self.groups.push(info);
        Ok(self.group_count() - 1)
    }

    /// Limit the recursion depth. Defaults to the device maximum and is
    /// clamped to it.
    pub fn set_max_recursion_depth(&mut self, depth: u32) -> &mut Self {
        self.max_recursion_depth = Some(depth);
        self
    }

    pub fn group_count(&self) -> u32 {
        u32::try_from(self.groups.len()).unwrap_or(u32::MAX)
    }

    pub fn groups(&self) -> &[vk::RayTracingShaderGroupCreateInfoKHR<'static>] {
        &self.groups
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn build(&self, device: Arc<Device>, name: &str) -> Result<RayTracingPipeline> {
        if self.groups.is_empty() {
            return Err(GpuError::PipelineCreation(format!("{name}: no shader groups")));
        }

        let loader = device.ray_tracing_pipeline_loader()?;
        let device_max = device.ray_tracing_capabilities()?.max_ray_recursion_depth;
        let recursion_depth = self.max_recursion_depth.map_or(device_max, |depth| depth.min(device_max));

        let layout = self.layout.create_layout(&device)?;
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&self.stages)
            .groups(&self.groups)
            .max_pipeline_ray_recursion_depth(recursion_depth)
            .layout(layout);

        let created = unsafe {
            loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        };
        let handle = match single_pipeline(created, name) {
            Ok(handle) => handle,
            Err(err) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        debug!(
            "Created ray tracing pipeline {name}: {} stages, {} groups, recursion depth {recursion_depth}",
            self.stages.len(),
            self.groups.len()
        );

        let inner = PipelineObject::new(
            device,
            handle,
            layout,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            self.layout.clone(),
            name,
        )?;
        Ok(RayTracingPipeline {
            inner,
            group_count: self.group_count(),
        })
    }
}

pub struct RayTracingPipeline {
    inner: PipelineObject,
    group_count: u32,
}

impl RayTracingPipeline {
    pub fn group_count(&self) -> u32 {
        self.group_count
    }

    /// Opaque handles of the first `count` groups, each
    /// `shader_group_handle_size` bytes, packed back to back.
    pub fn shader_group_handles(&self, count: u32) -> Result<Vec<u8>> {
        if count > self.group_count {
            return Err(GpuError::InvalidState(format!(
                "Requested {count} group handles from a pipeline with {} groups",
                self.group_count
            )));
        }
        let device = self.inner.device();
        let handle_size = device.ray_tracing_capabilities()?.shader_group_handle_size as usize;
        let loader = device.ray_tracing_pipeline_loader()?;
        let handles = unsafe {
            loader.get_ray_tracing_shader_group_handles(self.handle(), 0, count, handle_size * count as usize)
        }?;
        Ok(handles)
    }

    pub fn device(&self) -> &Arc<Device> {
        self.inner.device()
    }
}

impl Pipeline for RayTracingPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.inner.handle()
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.inner.layout()
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::RAY_TRACING_KHR
    }

    fn descriptor_sets(&self) -> Vec<vk::DescriptorSet> {
        self.inner.descriptor_sets()
    }
}
