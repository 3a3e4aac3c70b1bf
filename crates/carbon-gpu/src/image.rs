//! 2D images, storage images and sampled textures.

use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{GpuError, Result, VkResultExt};
use crate::memory::GpuAllocator;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::warn;

/// Access mask a barrier waits on for work in `stage`.
pub fn src_access_mask(stage: vk::PipelineStageFlags) -> vk::AccessFlags {
    match stage {
        vk::PipelineStageFlags::TRANSFER => {
            vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::TRANSFER_READ
        }
        vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR => vk::AccessFlags::SHADER_WRITE,
        _ => vk::AccessFlags::empty(),
    }
}

/// Access mask work in `stage` performs after a barrier.
pub fn dst_access_mask(stage: vk::PipelineStageFlags) -> vk::AccessFlags {
    match stage {
        vk::PipelineStageFlags::TRANSFER => {
            vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::TRANSFER_READ
        }
        vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
        | vk::PipelineStageFlags::FRAGMENT_SHADER => vk::AccessFlags::SHADER_WRITE,
        _ => vk::AccessFlags::empty(),
    }
}

/// Number of levels in a full mip chain for `extent`.
pub fn mip_level_count(extent: vk::Extent2D) -> u32 {
    32 - extent.width.max(extent.height).max(1).leading_zeros()
}

/// Extent of mip `level`, never smaller than one texel.
pub fn mip_extent(extent: vk::Extent2D, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
    }
}

fn color_range(base_mip_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level,
        level_count,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn extent_3d(extent: vk::Extent2D) -> vk::Extent3D {
    vk::Extent3D {
        width: extent.width,
        height: extent.height,
        depth: 1,
    }
}

fn mip_offset(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: i32::try_from(extent.width).unwrap_or(i32::MAX),
        y: i32::try_from(extent.height).unwrap_or(i32::MAX),
        z: 1,
    }
}

/// Shared view of anything that owns an image and its view.
pub trait ImageResource {
    fn image(&self) -> vk::Image;
    fn view(&self) -> vk::ImageView;
    fn format(&self) -> vk::Format;
    fn extent(&self) -> vk::Extent2D;
    fn descriptor_image_info(&self) -> vk::DescriptorImageInfo;
}

/// A 2D color image with a view and per-mip layout tracking.
///
/// Images wrapping swapchain images own only their view.
pub struct Image {
    device: Arc<Device>,
    allocator: Option<GpuAllocator>,
    name: String,
    handle: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    layouts: Vec<vk::ImageLayout>,
}

impl Image {
    /// Create a device-local image with one mip level.
    pub fn new(
        device: Arc<Device>,
        allocator: GpuAllocator,
        name: impl Into<String>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        Self::with_mips(
            device,
            allocator,
            name,
            extent,
            format,
            usage,
            1,
            vk::ComponentMapping::default(),
        )
    }

    /// Create a device-local image with `mip_levels` levels and a view using
    /// `components`.
    #[allow(clippy::too_many_arguments)]
    pub fn with_mips(
        device: Arc<Device>,
        allocator: GpuAllocator,
        name: impl Into<String>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
        components: vk::ComponentMapping,
    ) -> Result<Self> {
        let mut image = Self {
            device,
            allocator: Some(allocator),
            name: name.into(),
            handle: vk::Image::null(),
            view: vk::ImageView::null(),
            allocation: None,
            format,
            extent,
            layouts: Vec::new(),
        };
        image.create(usage, mip_levels, components)?;
        Ok(image)
    }

    /// Wrap a swapchain image. Only the view is destroyed with the wrapper.
    pub fn from_swapchain(
        device: Arc<Device>,
        handle: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let view = create_view(&device, handle, format, 1, vk::ComponentMapping::default())?;
        device.set_debug_name(view, &name)?;
        Ok(Self {
            device,
            allocator: None,
            name,
            handle,
            view,
            allocation: None,
            format,
            extent,
            layouts: vec![vk::ImageLayout::UNDEFINED],
        })
    }

    fn create(
        &mut self,
        usage: vk::ImageUsageFlags,
        mip_levels: u32,
        components: vk::ComponentMapping,
    ) -> Result<()> {
        let allocator = self
            .allocator
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState(format!("Image \"{}\" is not owned", self.name)))?;

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.format)
            .extent(extent_3d(self.extent))
            .mip_levels(mip_levels)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let handle = unsafe { self.device.create_image(&create_info, None) }
            .context(format!("Failed to create image \"{}\"", self.name))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };
        let allocation = match allocator.allocate(&self.name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(handle, None) };
                return Err(err);
            }
        };
        self.handle = handle;
        self.allocation = Some(allocation);
        self.layouts = vec![vk::ImageLayout::UNDEFINED; mip_levels as usize];

        if let Some(allocation) = &self.allocation {
            unsafe {
                self.device
                    .bind_image_memory(handle, allocation.memory(), allocation.offset())
            }
            .context(format!("Failed to bind memory of image \"{}\"", self.name))?;
        }

        self.view = create_view(&self.device, handle, self.format, mip_levels, components)?;
        self.device.set_debug_name(handle, &self.name)
    }

    /// Release the view, then the image and its memory. Safe to call
    /// repeatedly.
    pub fn destroy(&mut self) {
        if self.view != vk::ImageView::null() {
            unsafe { self.device.destroy_image_view(self.view, None) };
            self.view = vk::ImageView::null();
        }
        if let Some(allocation) = self.allocation.take() {
            if let Some(allocator) = &self.allocator {
                if let Err(err) = allocator.free(allocation) {
                    warn!("Failed to free image \"{}\": {err}", self.name);
                }
            }
            unsafe { self.device.destroy_image(self.handle, None) };
        }
        self.handle = vk::Image::null();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mip_levels(&self) -> u32 {
        u32::try_from(self.layouts.len()).unwrap_or(u32::MAX)
    }

    /// Tracked layout of mip `level`.
    pub fn layout(&self, level: u32) -> vk::ImageLayout {
        self.layouts
            .get(level as usize)
            .copied()
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        extent_3d(self.extent)
    }

    /// Transition the mips in `range` to `new_layout`.
    ///
    /// The old layout is the tracked layout of `range.base_mip_level`.
    pub fn change_layout(
        &mut self,
        cmd: &CommandBuffer,
        new_layout: vk::ImageLayout,
        range: vk::ImageSubresourceRange,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        let old_layout = self.layout(range.base_mip_level);
        Self::transition(
            cmd,
            self.handle,
            old_layout,
            new_layout,
            src_stage,
            dst_stage,
            range,
        );
        let end = if range.level_count == vk::REMAINING_MIP_LEVELS {
            self.layouts.len()
        } else {
            (range.base_mip_level + range.level_count) as usize
        };
        for layout in self
            .layouts
            .iter_mut()
            .take(end)
            .skip(range.base_mip_level as usize)
        {
            *layout = new_layout;
        }
    }

    /// Record a layout transition for any image.
    pub fn transition(
        cmd: &CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        range: vk::ImageSubresourceRange,
    ) {
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access_mask(src_stage))
            .dst_access_mask(dst_access_mask(dst_stage))
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range);
        cmd.pipeline_barrier(src_stage, dst_stage, &[], &[], &[barrier]);
    }

    /// Copy mip 0 into `destination`, which must match in size.
    pub fn copy_image(&self, cmd: &CommandBuffer, destination: vk::Image, destination_layout: vk::ImageLayout) {
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageCopy {
            src_subresource: subresource,
            src_offset: vk::Offset3D::default(),
            dst_subresource: subresource,
            dst_offset: vk::Offset3D::default(),
            extent: self.extent_3d(),
        };
        unsafe {
            cmd.device().cmd_copy_image(
                cmd.handle(),
                self.handle,
                self.layout(0),
                destination,
                destination_layout,
                &[region],
            );
        }
    }

    /// Copy mip 0 into a buffer, tightly packed.
    pub fn copy_to_buffer(&self, cmd: &CommandBuffer, destination: &Buffer) {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: self.extent_3d(),
        };
        unsafe {
            cmd.device().cmd_copy_image_to_buffer(
                cmd.handle(),
                self.handle,
                self.layout(0),
                crate::buffer::BufferResource::handle(destination),
                &[region],
            );
        }
    }
}

fn create_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
    components: vk::ComponentMapping,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(components)
        .subresource_range(color_range(0, mip_levels));
    unsafe { device.create_image_view(&view_info, None) }.context("Failed to create image view")
}

impl ImageResource for Image {
    fn image(&self) -> vk::Image {
        self.handle
    }

    fn view(&self) -> vk::ImageView {
        self.view
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn descriptor_image_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.view,
            image_layout: self.layout(0),
        }
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Storage image written by ray tracing or compute shaders.
pub struct StorageImage {
    image: Image,
}

impl StorageImage {
    pub const FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;
    pub const USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::TRANSFER_SRC.as_raw() | vk::ImageUsageFlags::STORAGE.as_raw(),
    );

    pub fn new(device: Arc<Device>, allocator: GpuAllocator, extent: vk::Extent2D) -> Result<Self> {
        let image = Image::new(device, allocator, "storageImage", extent, Self::FORMAT, Self::USAGE)?;
        Ok(Self { image })
    }

    /// Replace the image with one of `extent`, e.g. after a window resize.
    pub fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.image.destroy();
        self.image.extent = extent;
        self.image.create(Self::USAGE, 1, vk::ComponentMapping::default())
    }

    /// Transition the whole image.
    pub fn change_layout(
        &mut self,
        cmd: &CommandBuffer,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        self.image
            .change_layout(cmd, new_layout, color_range(0, 1), src_stage, dst_stage);
    }
}

impl Deref for StorageImage {
    type Target = Image;

    fn deref(&self) -> &Self::Target {
        &self.image
    }
}

impl DerefMut for StorageImage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.image
    }
}

/// A sampled texture with its own sampler and an optional mip chain.
pub struct Texture {
    image: Image,
    sampler: vk::Sampler,
}

impl Texture {
    pub const DEFAULT_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;
    pub const USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::SAMPLED.as_raw()
            | vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
            | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
    );

    pub fn new(
        device: Arc<Device>,
        allocator: GpuAllocator,
        name: impl Into<String>,
        extent: vk::Extent2D,
        format: vk::Format,
        mip_levels: u32,
        components: vk::ComponentMapping,
    ) -> Result<Self> {
        let image = Image::with_mips(
            Arc::clone(&device),
            allocator,
            name,
            extent,
            format,
            Self::USAGE,
            mip_levels.max(1),
            components,
        )?;

        #[allow(clippy::cast_precision_loss)]
        let max_lod = image.mip_levels() as f32;
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .min_lod(0.0)
            .max_lod(max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }
            .context("Failed to create sampler")?;

        Ok(Self { image, sampler })
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Whether `format` supports blits in both directions with optimal
    /// tiling, as mipmap generation requires.
    pub fn format_supports_blit(device: &Device, format: vk::Format) -> bool {
        let properties = unsafe {
            device
                .instance()
                .get_physical_device_format_properties(device.physical_device(), format)
        };
        properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::BLIT_SRC | vk::FormatFeatureFlags::BLIT_DST)
    }

    /// Record an upload of `staging` into mip 0, leaving every mip in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn upload(&mut self, cmd: &CommandBuffer, staging: &Buffer) {
        let levels = self.image.mip_levels();
        self.image.change_layout(
            cmd,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            color_range(0, levels),
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        );
        let copy = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: self.image.extent_3d(),
        };
        staging.copy_to_image(
            cmd,
            self.image.handle,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &copy,
        );
    }

    /// Fill mips 1.. by blitting down from mip 0.
    ///
    /// Every mip must be in `TRANSFER_DST_OPTIMAL`; all of them end up in
    /// `SHADER_READ_ONLY_OPTIMAL`.
    pub fn generate_mipmaps(&mut self, cmd: &CommandBuffer) -> Result<()> {
        if !Self::format_supports_blit(&self.image.device, self.image.format) {
            return Err(GpuError::InvalidState(format!(
                "Format {:?} does not support linear blits",
                self.image.format
            )));
        }

        let levels = self.image.mip_levels();
        for level in 1..levels {
            self.image.change_layout(
                cmd,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                color_range(level - 1, 1),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
            );

            let src = mip_extent(self.image.extent, level - 1);
            let dst = mip_extent(self.image.extent, level);
            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offsets: [vk::Offset3D::default(), mip_offset(src)],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offsets: [vk::Offset3D::default(), mip_offset(dst)],
            };
            unsafe {
                cmd.device().cmd_blit_image(
                    cmd.handle(),
                    self.image.handle,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            self.image.change_layout(
                cmd,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                color_range(level - 1, 1),
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            );
        }

        self.image.change_layout(
            cmd,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            color_range(levels - 1, 1),
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        );
        Ok(())
    }
}

impl ImageResource for Texture {
    fn image(&self) -> vk::Image {
        self.image.handle
    }

    fn view(&self) -> vk::ImageView {
        self.image.view
    }

    fn format(&self) -> vk::Format {
        self.image.format
    }

    fn extent(&self) -> vk::Extent2D {
        self.image.extent
    }

    fn descriptor_image_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view,
            image_layout: self.image.layout(0),
        }
    }
}

impl Deref for Texture {
    type Target = Image;

    fn deref(&self) -> &Self::Target {
        &self.image
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.image.device.destroy_sampler(self.sampler, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_stages_read_and_write() {
        let both = vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::TRANSFER_READ;
        assert_eq!(src_access_mask(vk::PipelineStageFlags::TRANSFER), both);
        assert_eq!(dst_access_mask(vk::PipelineStageFlags::TRANSFER), both);
    }

    #[test]
    fn shader_stages_write() {
        assert_eq!(
            src_access_mask(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR),
            vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            dst_access_mask(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR),
            vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            dst_access_mask(vk::PipelineStageFlags::FRAGMENT_SHADER),
            vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            src_access_mask(vk::PipelineStageFlags::FRAGMENT_SHADER),
            vk::AccessFlags::empty()
        );
    }

    #[test]
    fn other_stages_have_no_access() {
        for stage in [
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::FRAGMENT_SHADER,
        ] {
            assert!(src_access_mask(stage).is_empty());
            assert!(dst_access_mask(stage).is_empty());
        }
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_level_count(vk::Extent2D { width: 1, height: 1 }), 1);
        assert_eq!(mip_level_count(vk::Extent2D { width: 256, height: 256 }), 9);
        assert_eq!(mip_level_count(vk::Extent2D { width: 300, height: 20 }), 9);
        assert_eq!(mip_level_count(vk::Extent2D { width: 0, height: 0 }), 1);
    }

    #[test]
    fn mip_extent_clamps_to_one() {
        let extent = vk::Extent2D {
            width: 64,
            height: 4,
        };
        assert_eq!(mip_extent(extent, 1), vk::Extent2D { width: 32, height: 2 });
        assert_eq!(mip_extent(extent, 3), vk::Extent2D { width: 8, height: 1 });
    }
}
