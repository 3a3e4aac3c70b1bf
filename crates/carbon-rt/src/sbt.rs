//! Shader binding table management for hardware ray tracing.
//!
//! The table holds one record per shader group, split into four regions:
//! - Ray generation
//! - Miss
//! - Hit groups
//! - Callable

use crate::rt_pipeline::RayTracingPipeline;
use ash::vk;
use carbon_gpu::{aligned_size, BufferResource, CommandBuffer, Device, GpuAllocator, GpuError, MappedBuffer, Result};
use std::sync::Arc;
use tracing::debug;

const SBT_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR.as_raw() | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// Number of groups of each kind, in pipeline group order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
}

impl GroupCounts {
    pub const fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit + self.callable
    }
}

/// Placement of one region inside the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SbtRegion {
    /// Byte offset from the start of the table.
    pub offset: u64,
    /// Size reported to the trace call.
    pub size: u64,
    pub stride: u64,
    /// Index of the region's first group in the pipeline.
    pub first_group: u32,
    pub count: u32,
}

impl SbtRegion {
    fn strided(&self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        if self.count == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Byte layout of a shader binding table, independent of any device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u64,
    pub raygen: SbtRegion,
    pub miss: SbtRegion,
    pub hit: SbtRegion,
    pub callable: SbtRegion,
    /// Bytes the regions occupy, a multiple of the base alignment.
    pub total_size: u64,
    pub base_alignment: u64,
}

impl SbtLayout {
    /// Lay out the regions for `counts` groups.
    ///
    /// Records are `handle_size` rounded up to `handle_alignment`; every
    /// region starts on `base_alignment`. The ray generation region reports
    /// exactly one record since only one ray generation shader is traced.
    pub fn new(handle_size: u32, handle_alignment: u32, base_alignment: u32, counts: GroupCounts) -> Result<Self> {
        if counts.raygen == 0 {
            return Err(GpuError::InvalidState(
                "Shader binding table needs a ray generation group".to_string(),
            ));
        }
        if !handle_alignment.is_power_of_two() || !base_alignment.is_power_of_two() {
            return Err(GpuError::InvalidState(format!(
                "Shader group alignments must be powers of two, got {handle_alignment} and {base_alignment}"
            )));
        }

        let base_alignment = u64::from(base_alignment);
        let stride = aligned_size(u64::from(handle_size), u64::from(handle_alignment));

        let mut offset = 0;
        let mut first_group = 0;
        let mut region = |count: u32| {
            let footprint = aligned_size(stride * u64::from(count), base_alignment);
            let region = SbtRegion {
                offset,
                size: footprint,
                stride,
                first_group,
                count,
            };
            offset += footprint;
            first_group += count;
            region
        };

        let mut raygen = region(counts.raygen);
        raygen.size = stride;
        let miss = region(counts.miss);
        let hit = region(counts.hit);
        let callable = region(counts.callable);

        Ok(Self {
            handle_size: u64::from(handle_size),
            raygen,
            miss,
            hit,
            callable,
            total_size: offset,
            base_alignment,
        })
    }

    fn regions(&self) -> [&SbtRegion; 4] {
        [&self.raygen, &self.miss, &self.hit, &self.callable]
    }

    /// Scatter the packed handles returned by the driver into table order.
    pub fn arrange_handles(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let group_count: u32 = self.regions().iter().map(|region| region.count).sum();
        if handles.len() < handle_size * group_count as usize {
            return Err(GpuError::InvalidState(format!(
                "{} handle bytes for {group_count} groups of {handle_size} bytes",
                handles.len()
            )));
        }

        let mut table = vec![0u8; self.total_size as usize];
        for region in self.regions() {
            for index in 0..region.count {
                let src = (region.first_group + index) as usize * handle_size;
                let dst = (region.offset + u64::from(index) * region.stride) as usize;
                table[dst..dst + handle_size].copy_from_slice(&handles[src..src + handle_size]);
            }
        }
        Ok(table)
    }
}

/// A shader binding table in host-visible memory.
pub struct ShaderBindingTable {
    buffer: MappedBuffer,
    layout: SbtLayout,
    raygen_region: vk::StridedDeviceAddressRegionKHR,
    miss_region: vk::StridedDeviceAddressRegionKHR,
    hit_region: vk::StridedDeviceAddressRegionKHR,
    callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Fetch the group handles of `pipeline` and write them into a new
    /// table. `counts` must cover the pipeline's groups in order.
    pub fn new(
        device: Arc<Device>,
        allocator: GpuAllocator,
        pipeline: &RayTracingPipeline,
        counts: GroupCounts,
    ) -> Result<Self> {
        if counts.total() != pipeline.group_count() {
            return Err(GpuError::InvalidState(format!(
                "Group counts cover {} groups, pipeline has {}",
                counts.total(),
                pipeline.group_count()
            )));
        }

        let properties = device.ray_tracing_capabilities()?;
        let layout = SbtLayout::new(
            properties.shader_group_handle_size,
            properties.shader_group_handle_alignment,
            properties.shader_group_base_alignment,
            counts,
        )?;
        let table = layout.arrange_handles(&pipeline.shader_group_handles(counts.total())?)?;

        // The buffer may be placed with less than the base alignment, so
        // reserve room to shift the table onto it.
        let buffer = MappedBuffer::new(
            device,
            allocator,
            "shader_binding_table",
            layout.total_size + layout.base_alignment,
            SBT_USAGE,
        )?;
        let address = buffer.device_address();
        let start = aligned_size(address, layout.base_alignment) - address;
        buffer.memory_copy(&table, start)?;

        debug!(
            "Shader binding table: {} bytes, {} groups, stride {}",
            layout.total_size,
            counts.total(),
            layout.raygen.stride
        );

        let base = address + start;
        Ok(Self {
            raygen_region: layout.raygen.strided(base),
            miss_region: layout.miss.strided(base),
            hit_region: layout.hit.strided(base),
            callable_region: layout.callable.strided(base),
            buffer,
            layout,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &MappedBuffer {
        &self.buffer
    }

    pub fn raygen_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.raygen_region
    }

    pub fn miss_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.miss_region
    }

    pub fn hit_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.hit_region
    }

    pub fn callable_region(&self) -> &vk::StridedDeviceAddressRegionKHR {
        &self.callable_region
    }

    /// Record a ray dispatch over `extent` using every region of the table.
    /// The pipeline and its descriptor sets must already be bound.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn trace_rays(&self, cmd: &CommandBuffer, extent: vk::Extent2D) -> Result<()> {
        cmd.trace_rays(
            &self.raygen_region,
            &self.miss_region,
            &self.hit_region,
            &self.callable_region,
            vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(raygen: u32, miss: u32, hit: u32, callable: u32) -> GroupCounts {
        GroupCounts {
            raygen,
            miss,
            hit,
            callable,
        }
    }

    #[test]
    fn typical_nvidia_layout() {
        let layout = SbtLayout::new(32, 32, 64, counts(1, 1, 1, 0)).unwrap();
        assert_eq!(layout.raygen.stride, 32);
        assert_eq!(layout.raygen.size, 32);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.miss.size, 64);
        assert_eq!(layout.hit.offset, 128);
        assert_eq!(layout.callable.count, 0);
        assert_eq!(layout.callable.size, 0);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn handle_size_rounded_to_handle_alignment() {
        let layout = SbtLayout::new(20, 16, 64, counts(1, 3, 2, 1)).unwrap();
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.miss.size, 128);
        assert_eq!(layout.hit.offset, 64 + 128);
        assert_eq!(layout.hit.size, 64);
        assert_eq!(layout.callable.offset, 64 + 128 + 64);
        assert_eq!(layout.callable.first_group, 6);
    }

    #[test]
    fn regions_start_on_base_alignment() {
        let layout = SbtLayout::new(32, 32, 64, counts(2, 5, 7, 3)).unwrap();
        for region in layout.regions() {
            assert_eq!(region.offset % 64, 0);
        }
        assert_eq!(layout.total_size % 64, 0);
        assert_eq!(layout.raygen.size, layout.raygen.stride);
    }

    #[test]
    fn missing_raygen_is_rejected() {
        assert!(SbtLayout::new(32, 32, 64, counts(0, 1, 1, 0)).is_err());
    }

    #[test]
    fn non_power_of_two_alignment_is_rejected() {
        assert!(SbtLayout::new(32, 24, 64, counts(1, 0, 0, 0)).is_err());
        assert!(SbtLayout::new(32, 32, 0, counts(1, 0, 0, 0)).is_err());
    }

    #[test]
    fn handles_land_at_record_offsets() {
        let layout = SbtLayout::new(4, 8, 16, counts(1, 2, 1, 0)).unwrap();
        let handles: Vec<u8> = (0..16).collect();
        let table = layout.arrange_handles(&handles).unwrap();

        assert_eq!(table.len(), 48);
        assert_eq!(&table[0..4], &[0, 1, 2, 3]);
        assert_eq!(&table[16..20], &[4, 5, 6, 7]);
        assert_eq!(&table[24..28], &[8, 9, 10, 11]);
        assert_eq!(&table[32..36], &[12, 13, 14, 15]);
        assert_eq!(&table[4..16], &[0; 12]);
    }

    #[test]
    fn short_handle_data_is_rejected() {
        let layout = SbtLayout::new(32, 32, 64, counts(1, 1, 1, 0)).unwrap();
        assert!(layout.arrange_handles(&[0; 64]).is_err());
    }

    #[test]
    fn empty_region_has_null_address() {
        let layout = SbtLayout::new(32, 32, 64, counts(1, 0, 1, 0)).unwrap();
        let miss = layout.miss.strided(0x1000);
        assert_eq!(miss.device_address, 0);
        assert_eq!(miss.size, 0);
        let hit = layout.hit.strided(0x1000);
        assert_eq!(hit.device_address, 0x1000 + 64);
    }
}
