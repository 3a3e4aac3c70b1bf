//! Descriptor set layouts, pools and updates.

use crate::device::Device;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use std::sync::Arc;

/// Pool sizes every descriptor set allocates from.
pub const DESCRIPTOR_POOL_SIZES: [vk::DescriptorPoolSize; 4] = [
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        descriptor_count: 1,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_IMAGE,
        descriptor_count: 10,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 10,
    },
    vk::DescriptorPoolSize {
        ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        descriptor_count: 10,
    },
];

/// Collects bindings for a [`DescriptorSet`].
#[derive(Default)]
pub struct DescriptorSetBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
}

impl DescriptorSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        count: u32,
        flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stages),
        );
        self.binding_flags.push(flags);
        self
    }

    pub fn add_acceleration_structure(
        self,
        binding: u32,
        stages: vk::ShaderStageFlags,
        flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self.push(binding, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, stages, 1, flags)
    }

    pub fn add_buffer(
        self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        count: u32,
        flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self.push(binding, descriptor_type, stages, count, flags)
    }

    pub fn add_image(
        self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
        count: u32,
        flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self.push(binding, descriptor_type, stages, count, flags)
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// Reject layouts Vulkan would refuse: repeated binding numbers and
    /// zero-sized bindings.
    pub fn validate(&self) -> Result<()> {
        for (index, binding) in self.bindings.iter().enumerate() {
            if binding.descriptor_count == 0 {
                return Err(GpuError::InvalidState(format!(
                    "Descriptor binding {} has no descriptors",
                    binding.binding
                )));
            }
            if self.bindings[..index]
                .iter()
                .any(|other| other.binding == binding.binding)
            {
                return Err(GpuError::InvalidState(format!(
                    "Descriptor binding {} is declared twice",
                    binding.binding
                )));
            }
        }
        Ok(())
    }

    /// Create the layout and a dedicated pool, and allocate the set.
    pub fn build(self, device: Arc<Device>, name: &str) -> Result<DescriptorSet> {
        self.validate()?;

        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&self.binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&self.bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        let pool = match device.create_descriptor_pool(1, &DESCRIPTOR_POOL_SIZES) {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                return Err(err);
            }
        };

        let mut set = DescriptorSet {
            device,
            handle: vk::DescriptorSet::null(),
            pool,
            layout,
            bindings: self.bindings,
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let handles = unsafe { set.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor sets")?;
        set.handle = handles
            .first()
            .copied()
            .ok_or_else(|| GpuError::InvalidState("Driver returned no descriptor set".to_string()))?;
        set.device.set_debug_name(set.handle, name)?;
        Ok(set)
    }
}

/// A single descriptor set with its own layout and pool. Destroyed on drop.
pub struct DescriptorSet {
    device: Arc<Device>,
    handle: vk::DescriptorSet,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSet {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Descriptor type declared for `binding`.
    pub fn binding_type(&self, binding: u32) -> Option<vk::DescriptorType> {
        self.bindings
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.descriptor_type)
    }

    pub fn update_acceleration_structure(&self, binding: u32, structures: &[vk::AccelerationStructureKHR]) {
        let count = u32::try_from(structures.len()).unwrap_or(u32::MAX);
        let mut as_info =
            vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(structures);
        // Acceleration structure writes carry their count outside the info arrays.
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(count)
            .push_next(&mut as_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn update_buffer(&self, binding: u32, descriptor_type: vk::DescriptorType, infos: &[vk::DescriptorBufferInfo]) {
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .buffer_info(infos);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn update_image(&self, binding: u32, descriptor_type: vk::DescriptorType, infos: &[vk::DescriptorImageInfo]) {
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .descriptor_type(descriptor_type)
            .image_info(infos);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }
}

impl Drop for DescriptorSet {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_flags_per_binding() {
        let builder = DescriptorSetBuilder::new()
            .add_acceleration_structure(
                0,
                vk::ShaderStageFlags::RAYGEN_KHR,
                vk::DescriptorBindingFlags::empty(),
            )
            .add_image(
                1,
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ShaderStageFlags::RAYGEN_KHR,
                1,
                vk::DescriptorBindingFlags::empty(),
            )
            .add_buffer(
                2,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                4,
                vk::DescriptorBindingFlags::PARTIALLY_BOUND,
            );

        assert_eq!(builder.bindings().len(), 3);
        assert_eq!(builder.binding_flags.len(), 3);
        assert_eq!(
            builder.bindings()[0].descriptor_type,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
        assert_eq!(builder.bindings()[2].descriptor_count, 4);
        assert_eq!(
            builder.binding_flags[2],
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
        );
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn duplicate_binding_is_rejected() {
        let builder = DescriptorSetBuilder::new()
            .add_buffer(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
                1,
                vk::DescriptorBindingFlags::empty(),
            )
            .add_image(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
                vk::DescriptorBindingFlags::empty(),
            );
        let err = builder.validate().unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn empty_binding_is_rejected() {
        let builder = DescriptorSetBuilder::new().add_buffer(
            3,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::COMPUTE,
            0,
            vk::DescriptorBindingFlags::empty(),
        );
        assert!(builder.validate().is_err());
    }

    #[test]
    fn pool_covers_one_structure() {
        let as_size = DESCRIPTOR_POOL_SIZES
            .iter()
            .find(|size| size.ty == vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .map(|size| size.descriptor_count);
        assert_eq!(as_size, Some(1));
    }
}
