//! Device queues.

use crate::device::Device;
use crate::error::{GpuError, Result, VkResultExt};
use crate::sync::{Fence, Semaphore};
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::ffi::CStr;
use std::sync::Arc;
use tracing::{error, warn};

/// Number of checkpoint markers attached to a failing result.
pub const CHECKPOINT_QUERY_COUNT: usize = 10;

/// A device queue. Submission and presentation go through a per-queue lock.
pub struct Queue {
    device: Arc<Device>,
    handle: vk::Queue,
    family_index: u32,
    name: String,
    lock: Mutex<()>,
}

impl Queue {
    /// Fetch queue 0 of `family_index`.
    pub fn new(device: Arc<Device>, family_index: u32, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let handle = unsafe { device.get_device_queue(family_index, 0) };
        device.set_debug_name(handle, &name)?;
        Ok(Self {
            device,
            handle,
            family_index,
            name,
            lock: Mutex::new(()),
        })
    }

    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hold the queue lock, e.g. around a sequence of submissions.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(&self, submits: &[vk::SubmitInfo<'_>], fence: Option<&Fence>) -> Result<()> {
        let fence = fence.map_or(vk::Fence::null(), Fence::handle);
        let result = {
            let _guard = self.lock.lock();
            unsafe { self.device.queue_submit(self.handle, submits, fence) }
        };
        self.check(result, "Failed to submit to queue")
    }

    /// Present `image_index` of `swapchain`. Returns `true` when the
    /// swapchain is suboptimal.
    pub fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: Option<&Semaphore>,
    ) -> Result<bool> {
        let swapchains = [swapchain];
        let indices = [image_index];
        let wait = wait_semaphore.map(Semaphore::handle);
        let mut present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&indices);
        if let Some(wait) = wait.as_ref() {
            present_info = present_info.wait_semaphores(std::slice::from_ref(wait));
        }

        let _guard = self.lock.lock();
        unsafe {
            self.device
                .swapchain_loader()
                .queue_present(self.handle, &present_info)
        }
        .context("Failed to present swapchain image")
    }

    pub fn wait_idle(&self) -> Result<()> {
        let result = {
            let _guard = self.lock.lock();
            unsafe { self.device.queue_wait_idle(self.handle) }
        };
        self.check(result, "Failed to wait for queue idle")
    }

    /// The most recent checkpoint markers recorded on this queue, at most
    /// `max`. Empty without diagnostic checkpoints.
    pub fn checkpoint_markers(&self, max: usize) -> Vec<String> {
        let Some(loader) = self.device.checkpoint_loader() else {
            return Vec::new();
        };

        let count = unsafe { loader.get_queue_checkpoint_data_len(self.handle) };
        let mut data = vec![vk::CheckpointDataNV::default(); count];
        unsafe { loader.get_queue_checkpoint_data(self.handle, &mut data) };

        let skip = data.len().saturating_sub(max);
        data.iter()
            .skip(skip)
            .map(|checkpoint| {
                if checkpoint.p_checkpoint_marker.is_null() {
                    return String::from("<null>");
                }
                unsafe { CStr::from_ptr(checkpoint.p_checkpoint_marker.cast()) }
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    /// Turn a failing result into an error carrying this queue's checkpoint
    /// markers.
    pub fn check<T>(&self, result: std::result::Result<T, vk::Result>, message: &str) -> Result<T> {
        result.map_err(|result| {
            let checkpoints = self.checkpoint_markers(CHECKPOINT_QUERY_COUNT);
            if checkpoints.is_empty() {
                warn!("No checkpoints have been created.");
            }
            for marker in &checkpoints {
                error!("Checkpoint: {marker}");
            }
            GpuError::Driver {
                message: message.to_string(),
                result,
                checkpoints,
            }
        })
    }
}
