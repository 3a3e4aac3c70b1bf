//! Render pass tests against a real driver.

use crate::HeadlessContext;
use ash::vk;
use carbon_gpu::{Framebuffer, Image, ImageResource, RenderPass};
use std::sync::Arc;

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 32,
    height: 32,
};

fn color_target(harness: &HeadlessContext) -> Image {
    Image::new(
        Arc::clone(harness.device()),
        harness.allocator().clone(),
        "render_pass_target",
        EXTENT,
        vk::Format::B8G8R8A8_UNORM,
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
    )
    .unwrap()
}

#[test]
#[ignore = "Requires GPU hardware"]
fn clear_pass_records_and_destroys() {
    let harness = HeadlessContext::without_ray_tracing().unwrap();
    let target = color_target(&harness);

    let mut render_pass = RenderPass::new(
        Arc::clone(harness.device()),
        target.format(),
        vk::AttachmentLoadOp::CLEAR,
        "clear_pass",
    )
    .unwrap();
    assert_eq!(render_pass.format(), vk::Format::B8G8R8A8_UNORM);
    assert_eq!(render_pass.load_op(), vk::AttachmentLoadOp::CLEAR);
    assert!(!render_pass.is_destroyed());

    let framebuffer = Framebuffer::new(
        Arc::clone(harness.device()),
        &render_pass,
        target.view(),
        EXTENT,
        "clear_framebuffer",
    )
    .unwrap();

    let clear = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: [0.0, 0.5, 1.0, 1.0],
        },
    }];
    harness
        .submit(|cmd| {
            render_pass.begin(cmd, &framebuffer, framebuffer.extent(), &clear);
            render_pass.end(cmd);
            Ok(())
        })
        .unwrap();

    drop(framebuffer);
    render_pass.destroy();
    assert!(render_pass.is_destroyed());
    render_pass.destroy();
}

#[test]
#[ignore = "Requires GPU hardware"]
fn load_pass_is_created_and_dropped() {
    let harness = HeadlessContext::without_ray_tracing().unwrap();
    let render_pass = RenderPass::new(
        Arc::clone(harness.device()),
        vk::Format::B8G8R8A8_UNORM,
        vk::AttachmentLoadOp::LOAD,
        "load_pass",
    )
    .unwrap();
    assert_ne!(render_pass.handle(), vk::RenderPass::null());
    assert_eq!(render_pass.name(), "load_pass");
}
