//! Single-subpass render passes over one color attachment.
//!
//! Pipelines in this crate use dynamic rendering; render passes remain for
//! callers that present through framebuffers.

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{Result, VkResultExt};
use crate::swapchain::Swapchain;
use ash::vk;
use std::sync::Arc;
use tracing::debug;

/// The color attachment for `format`.
///
/// Clearing discards the previous contents, so the attachment starts
/// `UNDEFINED`; any other load op expects a presented image.
pub fn color_attachment(format: vk::Format, load_op: vk::AttachmentLoadOp) -> vk::AttachmentDescription {
    let initial_layout = if load_op == vk::AttachmentLoadOp::CLEAR {
        vk::ImageLayout::UNDEFINED
    } else {
        vk::ImageLayout::PRESENT_SRC_KHR
    };
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(initial_layout)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
}

/// External dependency ordering color output against earlier frames.
pub fn color_output_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
}

/// A render pass with one color attachment, destroyed on drop.
pub struct RenderPass {
    device: Arc<Device>,
    handle: vk::RenderPass,
    format: vk::Format,
    load_op: vk::AttachmentLoadOp,
    name: String,
}

impl RenderPass {
    pub fn new(
        device: Arc<Device>,
        format: vk::Format,
        load_op: vk::AttachmentLoadOp,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let attachments = [color_attachment(format, load_op)];
        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];
        let dependencies = [color_output_dependency()];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        let handle = unsafe { device.create_render_pass(&create_info, None) }
            .context("Failed to create render pass")?;
        device.set_debug_name(handle, &name)?;
        debug!("Created render pass {name} ({format:?}, {load_op:?})");

        Ok(Self {
            device,
            handle,
            format,
            load_op,
            name,
        })
    }

    /// Render pass targeting the swapchain's surface format.
    pub fn for_swapchain(
        device: Arc<Device>,
        swapchain: &Swapchain,
        load_op: vk::AttachmentLoadOp,
        name: impl Into<String>,
    ) -> Result<Self> {
        Self::new(device, swapchain.format(), load_op, name)
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn load_op(&self) -> vk::AttachmentLoadOp {
        self.load_op
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin the pass over the whole of `extent` with inline contents.
    pub fn begin(
        &self,
        cmd: &CommandBuffer,
        framebuffer: &Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.handle)
            .framebuffer(framebuffer.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        cmd.begin_render_pass(&begin_info);
    }

    pub fn end(&self, cmd: &CommandBuffer) {
        cmd.end_render_pass();
    }

    /// Destroy the pass. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.handle != vk::RenderPass::null() {
            unsafe { self.device.destroy_render_pass(self.handle, None) };
            self.handle = vk::RenderPass::null();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle == vk::RenderPass::null()
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A framebuffer binding one view to a [`RenderPass`].
pub struct Framebuffer {
    device: Arc<Device>,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    pub fn new(
        device: Arc<Device>,
        render_pass: &RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
        name: &str,
    ) -> Result<Self> {
        let attachments = [view];
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let handle = unsafe { device.create_framebuffer(&create_info, None) }
            .context("Failed to create framebuffer")?;
        device.set_debug_name(handle, name)?;
        Ok(Self { device, handle, extent })
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe { self.device.destroy_framebuffer(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearing_starts_undefined() {
        let attachment = color_attachment(vk::Format::B8G8R8A8_SRGB, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(attachment.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(attachment.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn loading_keeps_presented_contents() {
        for load_op in [vk::AttachmentLoadOp::LOAD, vk::AttachmentLoadOp::DONT_CARE] {
            let attachment = color_attachment(vk::Format::B8G8R8A8_UNORM, load_op);
            assert_eq!(attachment.initial_layout, vk::ImageLayout::PRESENT_SRC_KHR);
            assert_eq!(attachment.load_op, load_op);
        }
    }

    #[test]
    fn attachment_is_single_sampled_and_stored() {
        let attachment = color_attachment(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachment.samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.stencil_load_op, vk::AttachmentLoadOp::DONT_CARE);
    }

    #[test]
    fn dependency_waits_on_color_output() {
        let dependency = color_output_dependency();
        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependency.dst_subpass, 0);
        assert_eq!(dependency.src_stage_mask, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert!(dependency
            .dst_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }
}
