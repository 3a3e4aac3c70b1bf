//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::device::{required_device_extensions, Device, DeviceFeatures, QueueFamilyIndices};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device, ApplicationInfo, DebugMessenger};
use crate::memory::GpuAllocator;
use crate::queue::Queue;
use carbon_diagnostics::GpuCrashTracker;
use std::ffi::CStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to talk to one GPU: instance, device, allocator and
/// queues.
///
/// Resources created from the context hold clones of its device and
/// allocator and must be dropped before it.
pub struct GpuContext {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    device: Arc<Device>,
    allocator: GpuAllocator,
    graphics_queue: Arc<Queue>,
    compute_queue: Arc<Queue>,
    transfer_queue: Arc<Queue>,
    crash_tracker: Option<Arc<GpuCrashTracker>>,
}

impl GpuContext {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn capabilities(&self) -> &GpuCapabilities {
        self.device.capabilities()
    }

    pub fn allocator(&self) -> &GpuAllocator {
        &self.allocator
    }

    pub fn graphics_queue(&self) -> &Arc<Queue> {
        &self.graphics_queue
    }

    pub fn compute_queue(&self) -> &Arc<Queue> {
        &self.compute_queue
    }

    pub fn transfer_queue(&self) -> &Arc<Queue> {
        &self.transfer_queue
    }

    pub fn crash_tracker(&self) -> Option<&Arc<GpuCrashTracker>> {
        self.crash_tracker.as_ref()
    }

    pub fn has_ray_tracing(&self) -> bool {
        self.device.acceleration_structure_loader().is_ok()
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            warn!("Failed to wait for device idle during teardown: {err}");
        }

        // Frees every VkDeviceMemory while the device is still alive.
        self.allocator.shutdown();

        unsafe {
            self.device.handle().destroy_device(None);
            if let Some(messenger) = self.debug_messenger.take() {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }

        if let Some(tracker) = &self.crash_tracker {
            tracker.disable();
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_info: ApplicationInfo,
    enable_validation: bool,
    ray_tracing: bool,
    crash_tracker: Option<Arc<GpuCrashTracker>>,
    instance_extensions: Vec<&'static CStr>,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_info: ApplicationInfo::default(),
            enable_validation: cfg!(debug_assertions),
            ray_tracing: true,
            crash_tracker: None,
            instance_extensions: Vec::new(),
        }
    }
}

impl GpuContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_info(mut self, info: ApplicationInfo) -> Self {
        self.app_info = info;
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_info.application_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Require ray tracing support. Enabled by default.
    pub fn ray_tracing(mut self, enable: bool) -> Self {
        self.ray_tracing = enable;
        self
    }

    /// Capture GPU crash dumps through `tracker`.
    pub fn crash_tracker(mut self, tracker: Arc<GpuCrashTracker>) -> Self {
        self.crash_tracker = Some(tracker);
        self
    }

    /// Request additional instance extensions, e.g. the surface extensions
    /// needed for presentation.
    pub fn instance_extensions(mut self, extensions: &[&'static CStr]) -> Self {
        self.instance_extensions.extend_from_slice(extensions);
        self
    }

    pub fn build(self) -> Result<GpuContext> {
        // Crash dumps are only captured for devices created after enabling.
        if let Some(tracker) = &self.crash_tracker {
            if !tracker.enable() {
                warn!("GPU crash tracking could not be enabled");
            }
        }

        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Loading(e.to_string()))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_info,
                &self.instance_extensions,
                self.enable_validation,
            )
        }?;

        match unsafe { self.finish(entry.clone(), instance.clone()) } {
            Ok(context) => Ok(context),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    /// # Safety
    /// `instance` must have been created from `entry` and is owned by the
    /// returned context.
    unsafe fn finish(self, entry: ash::Entry, instance: ash::Instance) -> Result<GpuContext> {
        let debug_messenger = if self.enable_validation {
            match DebugMessenger::new(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    warn!("Debug messenger unavailable: {err}");
                    None
                }
            }
        } else {
            None
        };

        let base_features = DeviceFeatures {
            ray_tracing: self.ray_tracing,
            diagnostics: false,
            debug_utils: debug_messenger.is_some(),
        };
        let result = self.create_device(&instance, base_features);
        let (device, allocator, queues) = match result {
            Ok(parts) => parts,
            Err(err) => {
                if let Some(messenger) = &debug_messenger {
                    messenger.destroy();
                }
                return Err(err);
            }
        };
        let [graphics_queue, compute_queue, transfer_queue] = queues;

        Ok(GpuContext {
            entry,
            instance,
            debug_messenger,
            device,
            allocator,
            graphics_queue,
            compute_queue,
            transfer_queue,
            crash_tracker: self.crash_tracker,
        })
    }

    unsafe fn create_device(
        &self,
        instance: &ash::Instance,
        base_features: DeviceFeatures,
    ) -> Result<(Arc<Device>, GpuAllocator, [Arc<Queue>; 3])> {
        let physical_device = select_physical_device(instance, &required_device_extensions(base_features))?;
        let capabilities = GpuCapabilities::query(instance, physical_device);

        let missing = capabilities.missing_features();
        if !missing.is_empty() {
            warn!("Device lacks required features: {}", missing.join(", "));
            return Err(GpuError::NoSuitableDevice);
        }

        let diagnostics = self.crash_tracker.is_some() && capabilities.supports_diagnostic_checkpoints;
        if self.crash_tracker.is_some() && !diagnostics {
            warn!("Device diagnostics are not supported; crash dumps will lack checkpoints");
        }
        let features = DeviceFeatures {
            diagnostics,
            ..base_features
        };

        info!("Selected GPU: {}", capabilities.summary());

        let families = instance.get_physical_device_queue_family_properties(physical_device);
        let queue_families = QueueFamilyIndices::select(&families)?;

        let device = Arc::new(Device::new(
            instance,
            physical_device,
            capabilities,
            queue_families,
            features,
            self.crash_tracker.clone(),
        )?);

        let setup = || -> Result<(GpuAllocator, [Arc<Queue>; 3])> {
            let allocator = GpuAllocator::new(instance, device.handle(), physical_device)?;
            let queues = [
                Arc::new(Queue::new(Arc::clone(&device), queue_families.graphics, "graphics_queue")?),
                Arc::new(Queue::new(Arc::clone(&device), queue_families.compute, "compute_queue")?),
                Arc::new(Queue::new(Arc::clone(&device), queue_families.transfer, "transfer_queue")?),
            ];
            Ok((allocator, queues))
        };

        match setup() {
            Ok((allocator, queues)) => Ok((device, allocator, queues)),
            Err(err) => {
                device.handle().destroy_device(None);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = GpuContextBuilder::new();
        assert!(builder.ray_tracing);
        assert!(builder.crash_tracker.is_none());
        assert_eq!(builder.enable_validation, cfg!(debug_assertions));
    }

    #[test]
    fn builder_collects_extensions() {
        let builder = GpuContextBuilder::new()
            .app_name("probe")
            .ray_tracing(false)
            .instance_extensions(&[ash::khr::surface::NAME]);
        assert_eq!(builder.app_info.application_name, "probe");
        assert!(!builder.ray_tracing);
        assert_eq!(builder.instance_extensions, vec![ash::khr::surface::NAME]);
    }
}
