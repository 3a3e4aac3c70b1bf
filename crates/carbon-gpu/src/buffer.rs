//! Device buffers backed by the GPU allocator.

use crate::command::CommandBuffer;
use crate::device::Device;
use crate::error::{GpuError, Result, VkResultExt};
use crate::memory::GpuAllocator;
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tracing::warn;

/// Round `value` up to a multiple of `alignment`, which must be a power of
/// two.
pub const fn aligned_size(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Shared view of anything that owns a `VkBuffer`.
pub trait BufferResource {
    fn handle(&self) -> vk::Buffer;
    fn device_address(&self) -> vk::DeviceAddress;
    fn size(&self) -> vk::DeviceSize;

    fn descriptor_info(&self, range: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle(),
            offset,
            range,
        }
    }

    fn device_address_const(&self) -> vk::DeviceOrHostAddressConstKHR {
        vk::DeviceOrHostAddressConstKHR {
            device_address: self.device_address(),
        }
    }
}

fn check_range(buffer_size: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > buffer_size {
        return Err(GpuError::InvalidState(format!(
            "Range {offset}..{end} exceeds buffer size {buffer_size}"
        )));
    }
    Ok(())
}

/// A buffer with its allocation, destroyed on drop.
///
/// A zero-sized buffer owns no Vulkan objects; copies from it are skipped.
pub struct Buffer {
    device: Arc<Device>,
    allocator: GpuAllocator,
    name: String,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    address: vk::DeviceAddress,
    memory_lock: Mutex<()>,
}

impl Buffer {
    pub fn new(
        device: Arc<Device>,
        allocator: GpuAllocator,
        name: impl Into<String>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let mut buffer = Self {
            device,
            allocator,
            name: name.into(),
            usage,
            location,
            handle: vk::Buffer::null(),
            allocation: None,
            size: 0,
            address: 0,
            memory_lock: Mutex::new(()),
        };
        buffer.create(size)?;
        Ok(buffer)
    }

    fn create(&mut self, size: vk::DeviceSize) -> Result<()> {
        self.size = size;
        if size == 0 {
            return Ok(());
        }

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.device.create_buffer(&create_info, None) }
            .context(format!("Failed to create buffer \"{}\"", self.name))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        let allocation = match self
            .allocator
            .allocate(&self.name, requirements, self.location, true)
        {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(handle, None) };
            self.allocator.free(allocation)?;
            return Err(GpuError::Driver {
                message: format!("Failed to bind memory of buffer \"{}\"", self.name),
                result: err,
                checkpoints: Vec::new(),
            });
        }

        self.handle = handle;
        self.allocation = Some(allocation);

        if self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            self.address = unsafe { self.device.get_buffer_device_address(&info) };
        }

        self.device.set_debug_name(handle, &self.name)
    }

    /// Release the buffer and its memory. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(err) = self.allocator.free(allocation) {
                warn!("Failed to free buffer \"{}\": {err}", self.name);
            }
        }
        if self.handle != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(self.handle, None) };
        }
        self.handle = vk::Buffer::null();
        self.address = 0;
    }

    /// Grow the buffer to `new_size`. Contents are not preserved; shrinking
    /// is a no-op.
    pub fn resize(&mut self, new_size: vk::DeviceSize) -> Result<()> {
        if new_size > self.size {
            self.destroy();
            self.create(new_size)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn is_empty(&self) -> bool {
        self.handle == vk::Buffer::null()
    }

    fn mapped_ptr(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|ptr| ptr.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState(format!("Buffer \"{}\" is not host visible", self.name)))
    }

    /// Copy `bytes` into the mapped memory at `offset`.
    pub fn memory_copy(&self, bytes: &[u8], offset: vk::DeviceSize) -> Result<()> {
        check_range(self.size, offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        let _guard = self.memory_lock.lock();
        let ptr = self.mapped_ptr()?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len());
        }
        Ok(())
    }

    /// Copy plain-old-data values into the mapped memory at `offset`.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T], offset: vk::DeviceSize) -> Result<()> {
        self.memory_copy(bytemuck::cast_slice(data), offset)
    }

    /// Read `len` bytes from the mapped memory at `offset`.
    pub fn read_bytes(&self, offset: vk::DeviceSize, len: usize) -> Result<Vec<u8>> {
        check_range(self.size, offset, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.memory_lock.lock();
        let ptr = self.mapped_ptr()?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Barrier over the whole buffer.
    pub fn memory_barrier(&self, src: vk::AccessFlags, dst: vk::AccessFlags) -> vk::BufferMemoryBarrier<'static> {
        vk::BufferMemoryBarrier::default()
            .src_access_mask(src)
            .dst_access_mask(dst)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.handle)
            .offset(0)
            .size(self.size)
    }

    /// Record a copy of the whole buffer into `destination`.
    pub fn copy_to_buffer(&self, cmd: &CommandBuffer, destination: &impl BufferResource) {
        if self.is_empty() {
            return;
        }
        cmd.copy_buffer(self.handle, destination.handle(), self.size);
    }

    pub fn copy_to_image(
        &self,
        cmd: &CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        copy: &vk::BufferImageCopy,
    ) {
        cmd.copy_buffer_to_image(self.handle, image, layout, std::slice::from_ref(copy));
    }
}

impl BufferResource for Buffer {
    fn handle(&self) -> vk::Buffer {
        self.handle
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// A host-visible upload buffer paired with a device-local destination.
///
/// The upload buffer is named `staging_<name>`, the destination `<name>`.
pub struct StagingBuffer {
    staging: Buffer,
    destination: Option<Buffer>,
    name: String,
}

impl StagingBuffer {
    pub fn new(
        device: Arc<Device>,
        allocator: GpuAllocator,
        name: impl Into<String>,
        size: vk::DeviceSize,
        additional_usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let name = name.into();
        let staging = Buffer::new(
            device,
            allocator,
            format!("staging_{name}"),
            size,
            vk::BufferUsageFlags::TRANSFER_SRC | additional_usage,
            MemoryLocation::CpuToGpu,
        )?;
        Ok(Self {
            staging,
            destination: None,
            name,
        })
    }

    /// Create the device-local destination. Skipped for empty buffers.
    pub fn create_destination_buffer(&mut self, usage: vk::BufferUsageFlags) -> Result<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let destination = Buffer::new(
            Arc::clone(&self.staging.device),
            self.staging.allocator.clone(),
            self.name.clone(),
            self.staging.size,
            vk::BufferUsageFlags::TRANSFER_DST | usage,
            MemoryLocation::GpuOnly,
        )?;
        self.destination = Some(destination);
        Ok(())
    }

    pub fn staging(&self) -> &Buffer {
        &self.staging
    }

    pub fn destination(&self) -> Option<&Buffer> {
        self.destination.as_ref()
    }

    /// Record the upload into the destination buffer.
    pub fn copy_into_vram(&self, cmd: &CommandBuffer) {
        if let Some(destination) = &self.destination {
            self.staging.copy_to_buffer(cmd, destination);
        }
    }

    pub fn memory_copy(&self, bytes: &[u8], offset: vk::DeviceSize) -> Result<()> {
        self.staging.memory_copy(bytes, offset)
    }

    /// Grow both buffers. Contents are not preserved.
    pub fn resize(&mut self, new_size: vk::DeviceSize) -> Result<()> {
        self.staging.resize(new_size)?;
        if let Some(destination) = &mut self.destination {
            destination.resize(new_size)?;
        }
        Ok(())
    }

    /// Release the destination, then the upload buffer. Safe to call
    /// repeatedly.
    pub fn destroy(&mut self) {
        if let Some(mut destination) = self.destination.take() {
            destination.destroy();
        }
        self.staging.destroy();
    }
}

impl BufferResource for StagingBuffer {
    fn handle(&self) -> vk::Buffer {
        self.destination
            .as_ref()
            .map_or(vk::Buffer::null(), BufferResource::handle)
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.destination
            .as_ref()
            .map_or(0, BufferResource::device_address)
    }

    fn size(&self) -> vk::DeviceSize {
        self.staging.size
    }
}

/// A persistently mapped host-visible buffer.
pub struct MappedBuffer(Buffer);

impl MappedBuffer {
    pub fn new(
        device: Arc<Device>,
        allocator: GpuAllocator,
        name: impl Into<String>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Buffer::new(device, allocator, name, size, usage, MemoryLocation::CpuToGpu).map(Self)
    }

    pub fn into_inner(self) -> Buffer {
        self.0
    }
}

impl Deref for MappedBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl BufferResource for MappedBuffer {
    fn handle(&self) -> vk::Buffer {
        self.0.handle
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.0.address
    }

    fn size(&self) -> vk::DeviceSize {
        self.0.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_size_rounds_up() {
        assert_eq!(aligned_size(0, 256), 0);
        assert_eq!(aligned_size(1, 256), 256);
        assert_eq!(aligned_size(256, 256), 256);
        assert_eq!(aligned_size(257, 256), 512);
        assert_eq!(aligned_size(100, 128), 128);
        assert_eq!(aligned_size(7, 1), 7);
    }

    #[test]
    fn range_checks() {
        assert!(check_range(64, 0, 64).is_ok());
        assert!(check_range(64, 60, 4).is_ok());
        assert!(check_range(64, 60, 8).is_err());
        assert!(check_range(64, u64::MAX, 1).is_err());
        assert!(check_range(0, 0, 0).is_ok());
    }
}
