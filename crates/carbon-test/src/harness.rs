//! Headless GPU context for integration tests.
//!
//! Work is recorded into one-off command buffers on the graphics queue and
//! waited on, so every helper returns with the GPU idle.

use ash::vk;
use carbon_diagnostics::{
    CrashDumpBackend, CrashDumpDecoder, DiagnosticsResult, GpuCrashTracker, ShaderDebugInfoIdentifier,
    ShaderDebugName, ShaderHash,
};
use carbon_gpu::{
    execute_single_time_commands, Buffer, BufferResource, CommandBuffer, CommandPool, Device, GpuAllocator,
    GpuContext, GpuContextBuilder, ImageResource, MemoryLocation, StorageImage,
};
use image::RgbaImage;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::{Result, TestError};

/// A GPU context without a surface, plus a pool for one-off commands.
pub struct HeadlessContext {
    // Dropped before the context that owns the device.
    pool: CommandPool,
    context: GpuContext,
}

impl HeadlessContext {
    /// Context with ray tracing and validation enabled.
    pub fn new() -> Result<Self> {
        Self::with_builder(GpuContextBuilder::new().validation(true))
    }

    /// Context for devices without ray tracing support.
    pub fn without_ray_tracing() -> Result<Self> {
        Self::with_builder(GpuContextBuilder::new().validation(true).ray_tracing(false))
    }

    pub fn with_builder(builder: GpuContextBuilder) -> Result<Self> {
        let context = builder.app_name("carbon-test").build()?;
        let pool = CommandPool::new(
            Arc::clone(context.device()),
            context.graphics_queue().family_index(),
            vk::CommandPoolCreateFlags::TRANSIENT,
            "test_pool",
        )?;
        Ok(Self { pool, context })
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    pub fn device(&self) -> &Arc<Device> {
        self.context.device()
    }

    pub fn allocator(&self) -> &GpuAllocator {
        self.context.allocator()
    }

    /// Record `f`, submit it and wait for completion.
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&CommandBuffer) -> carbon_gpu::Result<()>,
    {
        execute_single_time_commands(&self.pool, self.context.graphics_queue(), f)?;
        Ok(())
    }

    /// Copy the whole of `source` into host memory.
    pub fn read_buffer(&self, source: &impl BufferResource) -> Result<Vec<u8>> {
        let size = source.size();
        let readback = Buffer::new(
            Arc::clone(self.device()),
            self.allocator().clone(),
            "readback",
            size,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;
        self.submit(|cmd| {
            cmd.copy_buffer(source.handle(), readback.handle(), size);
            Ok(())
        })?;

        let len = usize::try_from(size).map_err(|_| TestError::Readback {
            expected: usize::MAX,
            actual: 0,
        })?;
        let bytes = readback.read_bytes(0, len)?;
        if bytes.len() != len {
            return Err(TestError::Readback {
                expected: len,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Read a storage image back as RGBA. The image is left in
    /// `TRANSFER_SRC_OPTIMAL`.
    pub fn read_storage_image(&self, image: &mut StorageImage) -> Result<RgbaImage> {
        let extent = image.extent();
        let len = extent.width as usize * extent.height as usize * 4;
        let readback = Buffer::new(
            Arc::clone(self.device()),
            self.allocator().clone(),
            "image_readback",
            len as u64,
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        )?;
        self.submit(|cmd| {
            image.change_layout(
                cmd,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
            );
            image.copy_to_buffer(cmd, &readback);
            Ok(())
        })?;

        let mut pixels = readback.read_bytes(0, len)?;
        if image.format() == StorageImage::FORMAT {
            bgra_to_rgba(&mut pixels);
        }
        debug!("Read back {}x{} storage image", extent.width, extent.height);

        let actual = pixels.len();
        RgbaImage::from_raw(extent.width, extent.height, pixels)
            .ok_or(TestError::Readback { expected: len, actual })
    }
}

/// Swap the red and blue channels of tightly packed 4-byte pixels.
pub fn bgra_to_rgba(pixels: &mut [u8]) {
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}

/// Mean absolute RGB difference of two images, normalized to 0.0-1.0.
pub fn image_difference(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total: u64 = a
        .pixels()
        .zip(b.pixels())
        .flat_map(|(pa, pb)| (0..3).map(move |c| u64::from(pa[c].abs_diff(pb[c]))))
        .sum();
    let max = u64::from(a.width()) * u64::from(a.height()) * 3 * 255;
    if max == 0 {
        return Ok(0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    Ok(total as f64 / max as f64)
}

/// Crash-dump backend that accepts every call and never produces a dump.
///
/// Shader hashes are FNV-1a over the SPIR-V words, so registered shaders can
/// still be looked up.
#[derive(Debug, Default)]
pub struct NullCrashBackend;

fn fnv1a(bytes: impl IntoIterator<Item = u8>) -> u64 {
    bytes.into_iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

impl CrashDumpBackend for NullCrashBackend {
    fn enable(&self, _tracker: Weak<GpuCrashTracker>) -> DiagnosticsResult {
        DiagnosticsResult::Success
    }

    fn disable(&self) -> DiagnosticsResult {
        DiagnosticsResult::Success
    }

    fn shader_hash(&self, spirv: &[u32]) -> std::result::Result<ShaderHash, DiagnosticsResult> {
        Ok(ShaderHash(fnv1a(spirv.iter().flat_map(|word| word.to_le_bytes()))))
    }

    fn shader_debug_info_identifier(
        &self,
        debug_info: &[u8],
    ) -> std::result::Result<ShaderDebugInfoIdentifier, DiagnosticsResult> {
        Ok(ShaderDebugInfoIdentifier {
            id: [fnv1a(debug_info.iter().copied()), debug_info.len() as u64],
        })
    }

    fn shader_debug_name(
        &self,
        full: &[u32],
        _stripped: &[u32],
    ) -> std::result::Result<ShaderDebugName, DiagnosticsResult> {
        let hash = fnv1a(full.iter().flat_map(|word| word.to_le_bytes()));
        Ok(ShaderDebugName(format!("{hash:016x}.spv")))
    }

    fn decode<'a>(&'a self, _dump: &[u8]) -> std::result::Result<Box<dyn CrashDumpDecoder + 'a>, DiagnosticsResult> {
        Err(DiagnosticsResult::NotAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carbon_diagnostics::CrashTrackerConfig;
    use image::Rgba;

    #[test]
    fn channels_are_swapped_per_pixel() {
        let mut pixels = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
        bgra_to_rgba(&mut pixels);
        assert_eq!(pixels, vec![3, 2, 1, 4, 7, 6, 5, 8, 9]);
    }

    #[test]
    fn identical_images_have_no_difference() {
        let a = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        assert!(image_difference(&a, &a.clone()).unwrap().abs() < f64::EPSILON);
    }

    #[test]
    fn difference_ignores_alpha() {
        let a = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0]));
        let b = RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 0]));
        let c = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
        assert!((image_difference(&a, &b).unwrap() - 1.0).abs() < f64::EPSILON);
        assert!(image_difference(&a, &c).unwrap().abs() < f64::EPSILON);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let a = RgbaImage::new(2, 2);
        let b = RgbaImage::new(2, 3);
        assert!(matches!(image_difference(&a, &b), Err(TestError::ImageComparison(_))));
    }

    #[test]
    fn null_backend_hashes_are_stable() {
        let backend = NullCrashBackend;
        let a = backend.shader_hash(&[0x0723_0203, 1, 2]).unwrap();
        let b = backend.shader_hash(&[0x0723_0203, 1, 2]).unwrap();
        let c = backend.shader_hash(&[0x0723_0203, 1, 3]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn tracker_with_null_backend_registers_shaders() {
        let tracker = GpuCrashTracker::new(NullCrashBackend, CrashTrackerConfig::default());
        assert!(tracker.enable());
        let hash = tracker.register_shader(&[0x0723_0203, 7]).unwrap();
        assert!(tracker.on_shader_lookup(hash).is_some());
        tracker.disable();
        assert!(!tracker.is_enabled());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_context_creation() {
        let harness = HeadlessContext::without_ray_tracing().unwrap();
        assert!(!harness.device().capabilities().device_name.is_empty());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn context_keeps_tracker_enabled_while_alive() {
        let tracker = GpuCrashTracker::new(NullCrashBackend, CrashTrackerConfig::default());
        let harness = HeadlessContext::with_builder(
            GpuContextBuilder::new()
                .ray_tracing(false)
                .crash_tracker(Arc::clone(&tracker)),
        )
        .unwrap();
        assert!(tracker.is_enabled());
        drop(harness);
        assert!(!tracker.is_enabled());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn buffer_contents_survive_readback() {
        let harness = HeadlessContext::without_ray_tracing().unwrap();
        let source = Buffer::new(
            Arc::clone(harness.device()),
            harness.allocator().clone(),
            "readback_source",
            256,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )
        .unwrap();
        let data: Vec<u8> = (0..=255).collect();
        source.memory_copy(&data, 0).unwrap();

        assert_eq!(harness.read_buffer(&source).unwrap(), data);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn storage_image_reads_back_at_full_size() {
        let harness = HeadlessContext::without_ray_tracing().unwrap();
        let mut image = StorageImage::new(
            Arc::clone(harness.device()),
            harness.allocator().clone(),
            vk::Extent2D {
                width: 64,
                height: 32,
            },
        )
        .unwrap();

        let pixels = harness.read_storage_image(&mut image).unwrap();
        assert_eq!(pixels.dimensions(), (64, 32));
        assert_eq!(image.layout(0), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }
}
