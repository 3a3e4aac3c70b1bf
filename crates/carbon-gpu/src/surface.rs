//! Window surfaces.

use crate::context::GpuContext;
use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Surface properties reported for one physical device.
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// A presentable surface for a window. Destroyed on drop, which must happen
/// before the context is dropped.
pub struct Surface {
    loader: ash::khr::surface::Instance,
    handle: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
}

impl Surface {
    /// Create a surface for `window`.
    ///
    /// The context must have been built with the platform surface
    /// extensions, see [`crate::instance::surface_instance_extensions`].
    pub fn new<W>(context: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let handle = unsafe {
            ash_window::create_surface(
                context.entry(),
                context.instance(),
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(format!("{e:?}")))?;

        Ok(Self {
            loader: ash::khr::surface::Instance::new(context.entry(), context.instance()),
            handle,
            physical_device: context.device().physical_device(),
        })
    }

    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// Whether `queue_family` can present to this surface.
    pub fn supports_queue_family(&self, queue_family: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(self.physical_device, queue_family, self.handle)
        }
        .context("Failed to query surface support")
    }

    pub fn support(&self) -> Result<SurfaceSupport> {
        let capabilities = unsafe {
            self.loader
                .get_physical_device_surface_capabilities(self.physical_device, self.handle)
        }
        .context("Failed to query surface capabilities")?;
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(self.physical_device, self.handle)
        }
        .context("Failed to query surface formats")?;
        let present_modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(self.physical_device, self.handle)
        }
        .context("Failed to query surface present modes")?;

        Ok(SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}
