//! Acceleration structure management for hardware ray tracing.
//!
//! Structures follow the driver's build protocol in explicit steps: query
//! [`AccelerationStructure::build_sizes`], create the scratch and result
//! buffers, create the structure, then record a build on a command buffer.

use ash::vk;
use carbon_gpu::{
    Buffer, BufferResource, CommandBuffer, DescriptorSet, Device, GpuAllocator, GpuError, MemoryLocation,
    Result, StagingBuffer, VkResultExt,
};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

/// Alignment of every acceleration structure size.
pub const RESULT_SIZE_ALIGNMENT: u64 = 256;

/// Size of the per-structure transform, a row-major 3x4 matrix.
pub const TRANSFORM_SIZE: u64 = std::mem::size_of::<vk::TransformMatrixKHR>() as u64;

const RESULT_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

const SCRATCH_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw() | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw(),
);

/// Usage of the device-local vertex, index and transform buffers. They stay
/// copyable so their contents can be read back.
pub const BUILD_INPUT_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw(),
);

/// Identity transform for structures that need no placement.
pub const IDENTITY_TRANSFORM: vk::TransformMatrixKHR = vk::TransformMatrixKHR {
    matrix: [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationStructureType {
    BottomLevel,
    TopLevel,
    Generic,
}

impl AccelerationStructureType {
    pub const fn raw(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            Self::Generic => vk::AccelerationStructureTypeKHR::GENERIC,
        }
    }
}

/// Round driver-reported sizes up: the structure size to
/// [`RESULT_SIZE_ALIGNMENT`], the scratch size to the device's scratch offset
/// alignment.
pub fn align_build_sizes(
    sizes: vk::AccelerationStructureBuildSizesInfoKHR<'static>,
    min_scratch_alignment: u32,
) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
    let scratch_alignment = u64::from(min_scratch_alignment.max(1));
    vk::AccelerationStructureBuildSizesInfoKHR {
        acceleration_structure_size: carbon_gpu::aligned_size(
            sizes.acceleration_structure_size,
            RESULT_SIZE_ALIGNMENT,
        ),
        build_scratch_size: carbon_gpu::aligned_size(sizes.build_scratch_size, scratch_alignment),
        ..sizes
    }
}

/// Handle, address and buffers of one structure, replaced as a unit.
#[derive(Debug)]
struct StructureState<B> {
    handle: vk::AccelerationStructureKHR,
    address: vk::DeviceAddress,
    result_buffer: Option<B>,
    scratch_buffer: Option<B>,
}

impl<B> Default for StructureState<B> {
    fn default() -> Self {
        Self {
            handle: vk::AccelerationStructureKHR::null(),
            address: 0,
            result_buffer: None,
            scratch_buffer: None,
        }
    }
}

impl<B> StructureState<B> {
    fn is_built(&self) -> bool {
        self.handle != vk::AccelerationStructureKHR::null()
    }

    /// Release everything in order: the handle through `destroy_handle`, then
    /// the result buffer, then the scratch buffer. Leaves the null sentinel.
    fn teardown(&mut self, destroy_handle: impl FnOnce(vk::AccelerationStructureKHR)) {
        let handle = std::mem::replace(&mut self.handle, vk::AccelerationStructureKHR::null());
        self.address = 0;
        if handle != vk::AccelerationStructureKHR::null() {
            destroy_handle(handle);
        }
        drop(self.result_buffer.take());
        drop(self.scratch_buffer.take());
    }
}

/// The common part of every acceleration structure.
///
/// Creation, destruction and validity checks go through a per-structure
/// lock, so a handle is never observed without its address.
pub struct AccelerationStructure {
    device: Arc<Device>,
    allocator: GpuAllocator,
    kind: AccelerationStructureType,
    name: String,
    state: Mutex<StructureState<Buffer>>,
}

impl AccelerationStructure {
    pub fn new(
        device: Arc<Device>,
        allocator: GpuAllocator,
        kind: AccelerationStructureType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            device,
            allocator,
            kind,
            name: name.into(),
            state: Mutex::new(StructureState::default()),
        }
    }

    pub fn kind(&self) -> AccelerationStructureType {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Query the driver for the sizes a build of `build_info` needs, aligned
    /// with [`align_build_sizes`]. `primitive_counts` holds one count per
    /// geometry.
    pub fn build_sizes(
        &self,
        primitive_counts: &[u32],
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureBuildSizesInfoKHR<'static>> {
        if primitive_counts.len() != build_info.geometry_count as usize {
            return Err(GpuError::InvalidState(format!(
                "{}: {} primitive counts for {} geometries",
                self.name,
                primitive_counts.len(),
                build_info.geometry_count
            )));
        }

        let loader = self.device.acceleration_structure_loader()?;
        let properties = self.device.ray_tracing_capabilities()?;
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                build_info,
                primitive_counts,
                &mut sizes,
            );
        }
        Ok(align_build_sizes(
            sizes,
            properties.min_acceleration_structure_scratch_offset_alignment,
        ))
    }

    /// Allocate the transient scratch buffer used while building.
    pub fn create_scratch_buffer(&self, sizes: &vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Result<()> {
        let buffer = Buffer::new(
            Arc::clone(&self.device),
            self.allocator.clone(),
            format!("{}_scratch", self.name),
            sizes.build_scratch_size,
            SCRATCH_USAGE,
            MemoryLocation::GpuOnly,
        )?;
        self.state.lock().scratch_buffer = Some(buffer);
        Ok(())
    }

    /// Allocate the buffer holding the built structure.
    pub fn create_result_buffer(&self, sizes: &vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Result<()> {
        let buffer = Buffer::new(
            Arc::clone(&self.device),
            self.allocator.clone(),
            self.name.clone(),
            sizes.acceleration_structure_size,
            RESULT_USAGE,
            MemoryLocation::GpuOnly,
        )?;
        self.state.lock().result_buffer = Some(buffer);
        Ok(())
    }

    /// Create the structure in the result buffer and publish its handle and
    /// device address together.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn create_structure(&self, sizes: &vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Result<()> {
        let loader = self.device.acceleration_structure_loader()?;
        let mut state = self.state.lock();

        if state.is_built() {
            return Err(GpuError::InvalidState(format!(
                "{}: structure was already created",
                self.name
            )));
        }
        let buffer = state.result_buffer.as_ref().ok_or_else(|| {
            GpuError::InvalidState(format!("{}: result buffer must be created first", self.name))
        })?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .offset(0)
            .size(sizes.acceleration_structure_size)
            .ty(self.kind.raw());
        let handle = unsafe { loader.create_acceleration_structure(&create_info, None) }
            .context(format!("Failed to create acceleration structure \"{}\"", self.name))?;

        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let address = unsafe { loader.get_acceleration_structure_device_address(&address_info) };

        state.handle = handle;
        state.address = address;
        drop(state);

        debug!("Created acceleration structure {} at {address:#x}", self.name);
        self.device.set_debug_name(handle, &self.name)
    }

    /// Release the structure handle, then the result buffer, then the
    /// scratch buffer. Safe to call repeatedly and on a structure that was
    /// never created.
    pub fn destroy(&self) {
        let loader = self.device.acceleration_structure_loader().ok();
        let mut state = self.state.lock();
        state.teardown(|handle| match loader {
            Some(loader) => unsafe { loader.destroy_acceleration_structure(handle, None) },
            None => warn!("{}: no loader to destroy the structure with", self.name),
        });
    }

    /// Release only the scratch buffer, e.g. once the build has completed.
    pub fn destroy_scratch_buffer(&self) {
        drop(self.state.lock().scratch_buffer.take());
    }

    /// Whether the structure has been created and not destroyed.
    pub fn is_built(&self) -> bool {
        self.state.lock().is_built()
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.state.lock().handle
    }

    /// Device address of the structure; 0 until it is created.
    pub fn address(&self) -> vk::DeviceAddress {
        self.state.lock().address
    }

    pub fn scratch_address(&self) -> vk::DeviceOrHostAddressKHR {
        let device_address = self
            .state
            .lock()
            .scratch_buffer
            .as_ref()
            .map_or(0, BufferResource::device_address);
        vk::DeviceOrHostAddressKHR { device_address }
    }

    /// Build info for a full build of `geometries` into this structure.
    pub fn build_geometry_info<'a>(
        &self,
        geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> vk::AccelerationStructureBuildGeometryInfoKHR<'a> {
        let state = self.state.lock();
        let scratch = state
            .scratch_buffer
            .as_ref()
            .map_or(0, BufferResource::device_address);
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(self.kind.raw())
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(state.handle)
            .geometries(geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch,
            })
    }

    /// Point `binding` of `set` at this structure.
    pub fn write_descriptor(&self, set: &DescriptorSet, binding: u32) {
        set.update_acceleration_structure(binding, &[self.handle()]);
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Byte offsets of each primitive inside the packed vertex and index
/// buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshLayout {
    pub vertex_offsets: Vec<u64>,
    pub index_offsets: Vec<u64>,
    pub total_vertex_size: u64,
    pub total_index_size: u64,
}

/// Vertex bytes and index bytes of one primitive.
pub type PrimitiveData<'a> = (&'a [u8], &'a [u8]);

impl MeshLayout {
    /// Plan the packing of `primitives` back to back, vertex and index
    /// offsets advancing independently.
    pub fn pack(primitives: &[PrimitiveData<'_>]) -> Self {
        let mut layout = Self::default();
        for (vertices, indices) in primitives {
            layout.vertex_offsets.push(layout.total_vertex_size);
            layout.index_offsets.push(layout.total_index_size);
            layout.total_vertex_size += vertices.len() as u64;
            layout.total_index_size += indices.len() as u64;
        }
        layout
    }

    pub fn primitive_count(&self) -> usize {
        self.vertex_offsets.len()
    }
}

struct MeshBuffers {
    vertices: StagingBuffer,
    indices: StagingBuffer,
    transform: StagingBuffer,
    layout: MeshLayout,
}

impl MeshBuffers {
    fn destroy(&mut self) {
        self.vertices.destroy();
        self.indices.destroy();
        self.transform.destroy();
    }
}

/// A bottom-level structure over triangle meshes.
pub struct BottomLevelAccelerationStructure {
    base: AccelerationStructure,
    mesh: Option<MeshBuffers>,
}

impl BottomLevelAccelerationStructure {
    pub fn new(device: Arc<Device>, allocator: GpuAllocator, name: impl Into<String>) -> Self {
        Self {
            base: AccelerationStructure::new(device, allocator, AccelerationStructureType::BottomLevel, name),
            mesh: None,
        }
    }

    /// Pack every primitive into one vertex and one index staging buffer,
    /// write `transform`, and create the device-local destinations.
    ///
    /// Nothing reaches device memory until [`Self::copy_mesh_buffers`] is
    /// recorded and has executed.
    pub fn create_mesh_buffers(
        &mut self,
        primitives: &[PrimitiveData<'_>],
        transform: &vk::TransformMatrixKHR,
    ) -> Result<()> {
        let layout = MeshLayout::pack(primitives);
        let device = Arc::clone(&self.base.device);
        let allocator = self.base.allocator.clone();
        let name = &self.base.name;

        let staging = |suffix: &str, size: u64| {
            StagingBuffer::new(
                Arc::clone(&device),
                allocator.clone(),
                format!("{name}_{suffix}"),
                size,
                vk::BufferUsageFlags::empty(),
            )
        };
        let mut vertices = staging("vertices", layout.total_vertex_size)?;
        let mut indices = staging("indices", layout.total_index_size)?;
        let mut transform_buffer = staging("transform", TRANSFORM_SIZE)?;

        for ((vertex_bytes, index_bytes), (vertex_offset, index_offset)) in primitives
            .iter()
            .zip(layout.vertex_offsets.iter().zip(&layout.index_offsets))
        {
            vertices.memory_copy(vertex_bytes, *vertex_offset)?;
            indices.memory_copy(index_bytes, *index_offset)?;
        }
        transform_buffer.memory_copy(bytemuck::cast_slice(&transform.matrix), 0)?;

        vertices.create_destination_buffer(BUILD_INPUT_USAGE)?;
        indices.create_destination_buffer(BUILD_INPUT_USAGE)?;
        transform_buffer.create_destination_buffer(BUILD_INPUT_USAGE)?;

        debug!(
            "{}: packed {} primitives, {} vertex bytes, {} index bytes",
            name,
            layout.primitive_count(),
            layout.total_vertex_size,
            layout.total_index_size
        );

        if let Some(mut old) = self.mesh.replace(MeshBuffers {
            vertices,
            indices,
            transform: transform_buffer,
            layout,
        }) {
            old.destroy();
        }
        Ok(())
    }

    /// Record the staging to device copies of the mesh buffers. The caller
    /// orders them before the build.
    pub fn copy_mesh_buffers(&self, cmd: &CommandBuffer) {
        if let Some(mesh) = &self.mesh {
            mesh.vertices.copy_into_vram(cmd);
            mesh.indices.copy_into_vram(cmd);
            mesh.transform.copy_into_vram(cmd);
        }
    }

    pub fn destroy_mesh_buffers(&mut self) {
        if let Some(mut mesh) = self.mesh.take() {
            mesh.destroy();
        }
    }

    /// Release the mesh buffers, then the structure and its buffers.
    pub fn destroy(&mut self) {
        self.destroy_mesh_buffers();
        self.base.destroy();
    }

    pub fn mesh_layout(&self) -> Option<&MeshLayout> {
        self.mesh.as_ref().map(|mesh| &mesh.layout)
    }

    pub fn vertex_buffer(&self) -> Option<&StagingBuffer> {
        self.mesh.as_ref().map(|mesh| &mesh.vertices)
    }

    pub fn index_buffer(&self) -> Option<&StagingBuffer> {
        self.mesh.as_ref().map(|mesh| &mesh.indices)
    }

    pub fn transform_buffer(&self) -> Option<&StagingBuffer> {
        self.mesh.as_ref().map(|mesh| &mesh.transform)
    }

    pub fn vertex_address(&self) -> vk::DeviceAddress {
        self.vertex_buffer().map_or(0, BufferResource::device_address)
    }

    pub fn index_address(&self) -> vk::DeviceAddress {
        self.index_buffer().map_or(0, BufferResource::device_address)
    }

    pub fn transform_address(&self) -> vk::DeviceAddress {
        self.transform_buffer().map_or(0, BufferResource::device_address)
    }

    /// Triangle geometry over the packed buffers, starting at primitive 0.
    pub fn triangle_geometry(
        &self,
        vertex_format: vk::Format,
        vertex_stride: vk::DeviceSize,
        max_vertex: u32,
        index_type: vk::IndexType,
        flags: vk::GeometryFlagsKHR,
    ) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertex_address(),
            })
            .vertex_stride(vertex_stride)
            .max_vertex(max_vertex)
            .index_type(index_type)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.index_address(),
            })
            .transform_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.transform_address(),
            });
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(flags)
    }
}

impl Deref for BottomLevelAccelerationStructure {
    type Target = AccelerationStructure;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl Drop for BottomLevelAccelerationStructure {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// The top-level structure over instances of bottom-level structures.
pub struct TopLevelAccelerationStructure {
    base: AccelerationStructure,
}

impl TopLevelAccelerationStructure {
    pub const NAME: &'static str = "tlas";

    pub fn new(device: Arc<Device>, allocator: GpuAllocator) -> Self {
        Self {
            base: AccelerationStructure::new(device, allocator, AccelerationStructureType::TopLevel, Self::NAME),
        }
    }

    /// Instance geometry reading tightly packed instance descriptors at
    /// `instances`.
    pub fn instances_geometry(
        instances: vk::DeviceAddress,
        flags: vk::GeometryFlagsKHR,
    ) -> vk::AccelerationStructureGeometryKHR<'static> {
        let data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instances,
            });
        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: data })
            .flags(flags)
    }
}

/// Describe one placement of the bottom-level structure at `blas_address`.
///
/// `custom_index` and `sbt_offset` keep their low 24 bits.
pub fn instance_descriptor(
    blas_address: vk::DeviceAddress,
    transform: vk::TransformMatrixKHR,
    custom_index: u32,
    mask: u8,
    sbt_offset: u32,
    flags: vk::GeometryInstanceFlagsKHR,
) -> vk::AccelerationStructureInstanceKHR {
    // Instance flags occupy the top 8 bits of the packed field.
    let flags = u8::try_from(flags.as_raw() & 0xFF).unwrap_or_default();
    vk::AccelerationStructureInstanceKHR {
        transform,
        instance_custom_index_and_mask: vk::Packed24_8::new(custom_index & 0x00FF_FFFF, mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            sbt_offset & 0x00FF_FFFF,
            flags,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

impl Deref for TopLevelAccelerationStructure {
    type Target = AccelerationStructure;

    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn sizes(structure: u64, scratch: u64) -> vk::AccelerationStructureBuildSizesInfoKHR<'static> {
        vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(structure)
            .build_scratch_size(scratch)
            .update_scratch_size(7)
    }

    #[test]
    fn build_sizes_are_aligned() {
        for (structure, scratch, alignment) in [(1, 1, 128), (300, 129, 128), (256, 256, 256), (0, 0, 64), (4097, 33, 32)] {
            let aligned = align_build_sizes(sizes(structure, scratch), alignment);
            assert_eq!(aligned.acceleration_structure_size % RESULT_SIZE_ALIGNMENT, 0);
            assert_eq!(aligned.build_scratch_size % u64::from(alignment), 0);
            assert!(aligned.acceleration_structure_size >= structure);
            assert!(aligned.acceleration_structure_size < structure + RESULT_SIZE_ALIGNMENT);
            assert!(aligned.build_scratch_size >= scratch);
        }
    }

    #[test]
    fn alignment_keeps_other_fields() {
        let aligned = align_build_sizes(sizes(300, 129), 128);
        assert_eq!(aligned.acceleration_structure_size, 512);
        assert_eq!(aligned.build_scratch_size, 256);
        assert_eq!(aligned.update_scratch_size, 7);
    }

    #[test]
    fn zero_scratch_alignment_is_treated_as_one() {
        let aligned = align_build_sizes(sizes(1, 13), 0);
        assert_eq!(aligned.build_scratch_size, 13);
    }

    #[test]
    fn mesh_layout_offsets_advance_independently() {
        let v0 = [0u8; 36];
        let i0 = [0u8; 12];
        let v1 = [0u8; 24];
        let i1 = [0u8; 6];
        let v2 = [0u8; 0];
        let i2 = [0u8; 18];
        let layout = MeshLayout::pack(&[(&v0, &i0), (&v1, &i1), (&v2, &i2)]);

        assert_eq!(layout.vertex_offsets, vec![0, 36, 60]);
        assert_eq!(layout.index_offsets, vec![0, 12, 18]);
        assert_eq!(layout.total_vertex_size, 60);
        assert_eq!(layout.total_index_size, 36);
        assert_eq!(layout.primitive_count(), 3);
    }

    #[test]
    fn empty_mesh_layout() {
        let layout = MeshLayout::pack(&[]);
        assert_eq!(layout, MeshLayout::default());
    }

    #[test]
    fn transform_is_48_bytes() {
        assert_eq!(TRANSFORM_SIZE, 48);
        assert_eq!(bytemuck::cast_slice::<f32, u8>(&IDENTITY_TRANSFORM.matrix).len(), 48);
    }

    #[test]
    fn type_maps_to_vulkan() {
        assert_eq!(
            AccelerationStructureType::BottomLevel.raw(),
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        );
        assert_eq!(
            AccelerationStructureType::TopLevel.raw(),
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        );
        assert_eq!(
            AccelerationStructureType::Generic.raw(),
            vk::AccelerationStructureTypeKHR::GENERIC
        );
    }

    #[test]
    fn instance_descriptor_packs_fields() {
        let instance = instance_descriptor(
            0xDEAD_0000,
            IDENTITY_TRANSFORM,
            0x0123_4567,
            0xFF,
            2,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
        );
        assert_eq!(instance.instance_custom_index_and_mask.low_24(), 0x0023_4567);
        assert_eq!(instance.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(instance.instance_shader_binding_table_record_offset_and_flags.low_24(), 2);
        assert_eq!(
            u32::from(instance.instance_shader_binding_table_record_offset_and_flags.high_8()),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(
            unsafe { instance.acceleration_structure_reference.device_handle },
            0xDEAD_0000
        );
    }

    fn built_state() -> StructureState<Vec<u8>> {
        StructureState {
            handle: vk::Handle::from_raw(0x1234),
            address: 0x8000,
            result_buffer: Some(vec![1]),
            scratch_buffer: Some(vec![2]),
        }
    }

    #[test]
    fn fresh_state_is_not_built() {
        let state = StructureState::<Vec<u8>>::default();
        assert!(!state.is_built());
        assert_eq!(state.address, 0);
    }

    #[test]
    fn teardown_leaves_sentinel_and_is_idempotent() {
        let mut state = built_state();
        assert!(state.is_built());

        let mut destroyed = Vec::new();
        state.teardown(|handle| destroyed.push(handle));
        assert_eq!(destroyed.len(), 1);
        assert!(!state.is_built());
        assert_eq!(state.address, 0);
        assert!(state.result_buffer.is_none());
        assert!(state.scratch_buffer.is_none());

        state.teardown(|handle| destroyed.push(handle));
        assert_eq!(destroyed.len(), 1);
    }

    #[test]
    fn teardown_of_unbuilt_state_skips_handle() {
        let mut state = StructureState::<Vec<u8>> {
            scratch_buffer: Some(vec![0; 4]),
            ..StructureState::default()
        };
        let mut called = false;
        state.teardown(|_| called = true);
        assert!(!called);
        assert!(state.scratch_buffer.is_none());
    }

    #[test]
    fn observers_never_see_torn_state() {
        let state = Arc::new(Mutex::new(built_state()));
        let done = Arc::new(AtomicBool::new(false));

        let observers: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut seen_destroyed = false;
                    while !done.load(Ordering::Acquire) {
                        let guard = state.lock();
                        let built = guard.is_built();
                        assert_eq!(built, guard.address != 0);
                        assert_eq!(built, guard.result_buffer.is_some());
                        if seen_destroyed {
                            assert!(!built);
                        }
                        seen_destroyed |= !built;
                    }
                })
            })
            .collect();

        thread::sleep(std::time::Duration::from_millis(5));
        state.lock().teardown(|_| thread::sleep(std::time::Duration::from_millis(1)));
        thread::sleep(std::time::Duration::from_millis(5));
        done.store(true, Ordering::Release);

        for observer in observers {
            observer.join().unwrap();
        }
        assert!(!state.lock().is_built());
    }
}
