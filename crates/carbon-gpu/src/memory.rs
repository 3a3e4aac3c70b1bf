//! GPU memory management.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

/// Shared handle to the device memory allocator.
///
/// Cloning is cheap; every resource keeps a clone to free its allocation on
/// drop. After [`GpuAllocator::shutdown`] further allocations fail and frees
/// become no-ops.
#[derive(Clone)]
pub struct GpuAllocator {
    inner: Arc<Mutex<Option<Allocator>>>,
}

impl GpuAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Some(allocator))),
        })
    }

    /// Allocate memory for `requirements`.
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.inner
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator has been shut down".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(format!("{name}: {e}")))
    }

    pub fn free(&self, allocation: Allocation) -> Result<()> {
        let mut guard = self.inner.lock();
        let Some(allocator) = guard.as_mut() else {
            return Ok(());
        };
        allocator
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Free all device memory. Must run before the device is destroyed.
    ///
    /// Allocations still alive are reported as leaks.
    pub fn shutdown(&self) {
        drop(self.inner.lock().take());
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().is_none()
    }
}
