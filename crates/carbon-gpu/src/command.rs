//! Command pools and command buffer recording.

use crate::device::Device;
use crate::error::{GpuError, Result, VkResultExt};
use crate::pipeline::Pipeline;
use crate::queue::Queue;
use crate::sync::Fence;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;
use tracing::warn;

/// Command pool for allocating command buffers. Destroyed on drop.
pub struct CommandPool {
    device: Arc<Device>,
    pool: vk::CommandPool,
    queue_family: u32,
    name: String,
}

impl CommandPool {
    pub fn new(
        device: Arc<Device>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None) }
            .context("Failed to create command pool")?;
        device.set_debug_name(pool, &name)?;

        Ok(Self {
            device,
            pool,
            queue_family,
            name,
        })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate a single command buffer that begins with `usage`.
    pub fn allocate_buffer(
        &self,
        level: vk::CommandBufferLevel,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<CommandBuffer> {
        self.allocate_buffers(level, usage, 1)?
            .pop()
            .ok_or_else(|| GpuError::InvalidState("Driver returned no command buffer".to_string()))
    }

    pub fn allocate_buffers(
        &self,
        level: vk::CommandBufferLevel,
        usage: vk::CommandBufferUsageFlags,
        count: u32,
    ) -> Result<Vec<CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(count);

        let handles = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(handles
            .into_iter()
            .map(|handle| CommandBuffer {
                device: Arc::clone(&self.device),
                handle,
                usage,
            })
            .collect())
    }

    /// Return command buffers to the pool.
    ///
    /// The buffers must not be pending execution.
    pub fn free_buffers(&self, buffers: &[CommandBuffer]) {
        let handles: Vec<vk::CommandBuffer> = buffers.iter().map(CommandBuffer::handle).collect();
        if handles.is_empty() {
            return;
        }
        unsafe { self.device.free_command_buffers(self.pool, &handles) };
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
        }
        .context("Failed to reset command pool")
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

/// A recording proxy over a `VkCommandBuffer`.
///
/// The buffer is owned by its pool; dropping the proxy does not free it.
pub struct CommandBuffer {
    device: Arc<Device>,
    handle: vk::CommandBuffer,
    usage: vk::CommandBufferUsageFlags,
}

impl CommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn begin(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(self.usage);
        unsafe { self.device.begin_command_buffer(self.handle, &begin_info) }
            .context("Failed to begin command buffer")
    }

    /// Finish recording. With a queue, failures carry its checkpoint markers.
    pub fn end(&self, queue: Option<&Queue>) -> Result<()> {
        let result = unsafe { self.device.end_command_buffer(self.handle) };
        match queue {
            Some(queue) => queue.check(result, "Failed to end command buffer"),
            None => result.context("Failed to end command buffer"),
        }
    }

    pub fn begin_rendering(&self, rendering_info: &vk::RenderingInfo<'_>) {
        unsafe { self.device.cmd_begin_rendering(self.handle, rendering_info) };
    }

    pub fn end_rendering(&self) {
        unsafe { self.device.cmd_end_rendering(self.handle) };
    }

    pub fn begin_render_pass(&self, begin_info: &vk::RenderPassBeginInfo<'_>) {
        unsafe {
            self.device
                .cmd_begin_render_pass(self.handle, begin_info, vk::SubpassContents::INLINE);
        }
    }

    pub fn end_render_pass(&self) {
        unsafe { self.device.cmd_end_render_pass(self.handle) };
    }

    pub fn bind_pipeline(&self, pipeline: &dyn Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.handle, pipeline.bind_point(), pipeline.handle());
        }
    }

    /// Bind every descriptor set of `pipeline`, starting at set 0.
    pub fn bind_descriptor_sets(&self, pipeline: &dyn Pipeline) {
        let sets = pipeline.descriptor_sets();
        if sets.is_empty() {
            return;
        }
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.handle,
                pipeline.bind_point(),
                pipeline.layout(),
                0,
                &sets,
                &[],
            );
        }
    }

    pub fn bind_vertex_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.handle, 0, &[buffer], &[offset]);
        }
    }

    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.handle, buffer, offset, index_type);
        }
    }

    /// Record acceleration structure builds. `ranges[i]` belongs to `infos[i]`.
    pub fn build_acceleration_structures(
        &self,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> Result<()> {
        if infos.len() != ranges.len() {
            return Err(GpuError::InvalidState(format!(
                "{} build infos but {} range lists",
                infos.len(),
                ranges.len()
            )));
        }
        let loader = self.device.acceleration_structure_loader()?;
        unsafe { loader.cmd_build_acceleration_structures(self.handle, infos, ranges) };
        Ok(())
    }

    pub fn draw_indexed(&self, index_count: u32, vertex_offset: i32, instance_count: u32, first_index: u32) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                0,
            );
        }
    }

    pub fn pipeline_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.handle,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory_barriers,
                buffer_barriers,
                image_barriers,
            );
        }
    }

    pub fn push_constants(
        &self,
        pipeline: &dyn Pipeline,
        stages: vk::ShaderStageFlags,
        offset: u32,
        values: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(self.handle, pipeline.layout(), stages, offset, values);
        }
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.handle, 0, &[scissor]) };
    }

    /// Set a viewport covering `width` x `height` with depth range [0, 1].
    pub fn set_viewport(&self, width: f32, height: f32) {
        self.set_viewport_region(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        });
    }

    pub fn set_viewport_region(&self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.handle, 0, &[viewport]) };
    }

    pub fn trace_rays(
        &self,
        raygen: &vk::StridedDeviceAddressRegionKHR,
        miss: &vk::StridedDeviceAddressRegionKHR,
        hit: &vk::StridedDeviceAddressRegionKHR,
        callable: &vk::StridedDeviceAddressRegionKHR,
        extent: vk::Extent3D,
    ) -> Result<()> {
        let loader = self.device.ray_tracing_pipeline_loader()?;
        unsafe {
            loader.cmd_trace_rays(
                self.handle,
                raygen,
                miss,
                hit,
                callable,
                extent.width,
                extent.height,
                extent.depth,
            );
        }
        Ok(())
    }

    /// Record a checkpoint marker. No-op without diagnostic checkpoints.
    pub fn set_checkpoint(&self, marker: &'static CStr) {
        if let Some(loader) = self.device.checkpoint_loader() {
            unsafe { loader.cmd_set_checkpoint(self.handle, marker.as_ptr().cast()) };
        }
    }

    /// Copy `size` bytes. No-op for an empty copy.
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        if size == 0 {
            return;
        }
        let region = vk::BufferCopy::default().size(size);
        unsafe { self.device.cmd_copy_buffer(self.handle, src, dst, &[region]) };
    }

    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(self.handle, src, dst, layout, regions);
        }
    }
}

/// Whether a waited-on submission no longer uses its command buffer.
///
/// A lost device retires all work; any other failure may leave it pending.
fn submission_retired(wait: &Result<()>) -> bool {
    match wait {
        Ok(()) => true,
        Err(err) => err.is_device_lost(),
    }
}

/// Record, submit and wait for a one-off command buffer.
///
/// The buffer is freed once the queue has finished with it. If the wait
/// fails while the work may still be pending, the buffer and its fence are
/// leaked instead.
pub fn execute_single_time_commands<F>(pool: &CommandPool, queue: &Queue, f: F) -> Result<()>
where
    F: FnOnce(&CommandBuffer) -> Result<()>,
{
    let cmd = pool.allocate_buffer(
        vk::CommandBufferLevel::PRIMARY,
        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
    )?;

    let submitted = (|| {
        cmd.begin()?;
        f(&cmd)?;
        cmd.end(Some(queue))?;

        let fence = Fence::new(Arc::clone(&cmd.device), "single_time_fence", vk::FenceCreateFlags::empty())?;
        let cmd_buffers = [cmd.handle()];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_buffers);
        queue.submit(&[submit_info], Some(&fence))?;
        Ok(fence)
    })();

    let fence = match submitted {
        Ok(fence) => fence,
        Err(err) => {
            pool.free_buffers(std::slice::from_ref(&cmd));
            return Err(err);
        }
    };

    let waited = fence.wait();
    if submission_retired(&waited) {
        pool.free_buffers(std::slice::from_ref(&cmd));
    } else {
        warn!(
            "Single-time commands on {} still pending; leaking command buffer and fence",
            pool.name()
        );
        std::mem::forget(fence);
    }
    waited
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_wait_retires_submission() {
        assert!(submission_retired(&Ok(())));
    }

    #[test]
    fn timed_out_wait_keeps_buffer_alive() {
        let timeout: Result<()> = Err(GpuError::Vulkan(vk::Result::TIMEOUT));
        assert!(!submission_retired(&timeout));

        let driver: Result<()> = vk::Result::TIMEOUT.result().context("Failed waiting on fences");
        assert!(!submission_retired(&driver));
    }

    #[test]
    fn lost_device_retires_submission() {
        let lost: Result<()> = vk::Result::ERROR_DEVICE_LOST
            .result()
            .context("Failed waiting on fences");
        assert!(submission_retired(&lost));
    }
}
