//! Synchronization primitives.

use crate::device::Device;
use crate::error::{Result, VkResultExt};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Default timeout for [`Fence::wait`], 100 seconds.
pub const DEFAULT_FENCE_TIMEOUT: u64 = 100_000_000_000;

/// A fence, destroyed on drop.
pub struct Fence {
    device: Arc<Device>,
    handle: vk::Fence,
    name: String,
    reset_lock: Mutex<()>,
}

impl Fence {
    pub fn new(device: Arc<Device>, name: impl Into<String>, flags: vk::FenceCreateFlags) -> Result<Self> {
        let name = name.into();
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let handle = unsafe { device.create_fence(&create_info, None) }
            .context("Failed to create fence")?;
        device.set_debug_name(handle, &name)?;

        Ok(Self {
            device,
            handle,
            name,
            reset_lock: Mutex::new(()),
        })
    }

    /// Create a fence that starts signaled.
    pub fn signaled(device: Arc<Device>, name: impl Into<String>) -> Result<Self> {
        Self::new(device, name, vk::FenceCreateFlags::SIGNALED)
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait with [`DEFAULT_FENCE_TIMEOUT`].
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait(&self) -> Result<()> {
        self.wait_timeout(DEFAULT_FENCE_TIMEOUT)
    }

    /// Wait up to `timeout_ns`. Expiry is reported as `TIMEOUT`.
    pub fn wait_timeout(&self, timeout_ns: u64) -> Result<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.handle], true, timeout_ns)
        }
        .context("Failed waiting on fences")
    }

    pub fn reset(&self) -> Result<()> {
        let _guard = self.reset_lock.lock();
        unsafe { self.device.reset_fences(&[self.handle]) }.context("Failed to reset fences")
    }

    pub fn is_signaled(&self) -> Result<bool> {
        unsafe { self.device.get_fence_status(self.handle) }.context("Failed to query fence status")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.handle, None) };
    }
}

/// A binary semaphore, destroyed on drop.
pub struct Semaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: Arc<Device>, name: &str) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.create_semaphore(&create_info, None) }
            .context("Failed to create semaphore")?;
        device.set_debug_name(handle, name)?;
        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.handle, None) };
    }
}
