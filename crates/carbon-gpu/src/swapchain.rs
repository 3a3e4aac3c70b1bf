//! Swapchain management.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::image::Image;
use crate::queue::Queue;
use crate::surface::{Surface, SurfaceSupport};
use crate::sync::Semaphore;
use ash::vk;
use std::sync::Arc;
use tracing::debug;

/// Usage of every swapchain image. Transfer destination allows blitting a
/// storage image into it.
pub const SWAPCHAIN_IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
);

/// The first format the surface reports.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .first()
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("Surface reports no formats".to_string()))
}

/// Mailbox when available, FIFO otherwise.
pub fn select_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's current extent, or the window extent clamped to the
/// surface limits when the surface leaves it to the swapchain.
pub fn select_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more image than the minimum, capped by the maximum when there is one.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// A swapchain and views of its images.
pub struct Swapchain {
    device: Arc<Device>,
    handle: vk::SwapchainKHR,
    images: Vec<Image>,
    surface_format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(device: Arc<Device>, surface: &Surface, window_extent: vk::Extent2D) -> Result<Self> {
        let mut swapchain = Self {
            device,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            surface_format: vk::SurfaceFormatKHR::default(),
            extent: window_extent,
        };
        swapchain.create(surface, window_extent)?;
        Ok(swapchain)
    }

    /// Replace the swapchain, e.g. after a resize. The old swapchain is
    /// handed to the driver and destroyed afterwards.
    pub fn recreate(&mut self, surface: &Surface, window_extent: vk::Extent2D) -> Result<()> {
        self.create(surface, window_extent)
    }

    fn create(&mut self, surface: &Surface, window_extent: vk::Extent2D) -> Result<()> {
        let SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        } = surface.support()?;

        let surface_format = select_surface_format(&formats)?;
        let present_mode = select_present_mode(&present_modes);
        let extent = select_extent(&capabilities, window_extent);
        let image_count = select_image_count(&capabilities);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(SWAPCHAIN_IMAGE_USAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(self.handle);

        let loader = self.device.swapchain_loader();
        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(format!("{e:?}")))?;

        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.handle, None) };
        }
        self.handle = handle;
        self.surface_format = surface_format;
        self.extent = extent;

        let raw_images = unsafe { loader.get_swapchain_images(handle) }
            .map_err(|e| GpuError::SwapchainCreation(format!("{e:?}")))?;
        self.images = raw_images
            .into_iter()
            .enumerate()
            .map(|(index, image)| {
                Image::from_swapchain(
                    Arc::clone(&self.device),
                    image,
                    surface_format.format,
                    extent,
                    format!("swapchain_image_{index}"),
                )
            })
            .collect::<Result<_>>()?;

        debug!(
            "Swapchain created: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode
        );
        Ok(())
    }

    /// Acquire the next image, signalling `semaphore` once it is ready.
    /// Returns the image index and whether the swapchain is suboptimal.
    ///
    /// `ERROR_OUT_OF_DATE_KHR` is returned as an error; the caller recreates
    /// the swapchain.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_image(&self, semaphore: &Semaphore) -> Result<(u32, bool)> {
        unsafe {
            self.device.swapchain_loader().acquire_next_image(
                self.handle,
                u64::MAX,
                semaphore.handle(),
                vk::Fence::null(),
            )
        }
        .map_err(GpuError::from)
    }

    /// Present `image_index` on `queue` once `wait` is signalled.
    pub fn present(&self, queue: &Queue, image_index: u32, wait: Option<&Semaphore>) -> Result<bool> {
        queue.present(self.handle, image_index, wait)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn image_mut(&mut self, index: u32) -> Option<&mut Image> {
        self.images.get_mut(index as usize)
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            unsafe { self.device.swapchain_loader().destroy_swapchain(self.handle, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        }
    }

    #[test]
    fn first_format_wins() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(select_surface_format(&formats).unwrap().format, vk::Format::R8G8B8A8_UNORM);
        assert!(select_surface_format(&[]).is_err());
    }

    #[test]
    fn mailbox_preferred_over_fifo() {
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_clamped_when_surface_is_flexible() {
        let caps = capabilities(2, 3);
        let extent = select_extent(&caps, vk::Extent2D { width: 4000, height: 8 });
        assert_eq!(extent, vk::Extent2D { width: 1920, height: 16 });
    }

    #[test]
    fn current_extent_is_authoritative() {
        let mut caps = capabilities(2, 3);
        caps.current_extent = vk::Extent2D { width: 800, height: 600 };
        let extent = select_extent(&caps, vk::Extent2D { width: 1024, height: 768 });
        assert_eq!(extent, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(select_image_count(&capabilities(2, 0)), 3);
        assert_eq!(select_image_count(&capabilities(2, 2)), 2);
        assert_eq!(select_image_count(&capabilities(1, 8)), 2);
    }
}
