//! Carbon device report.
//!
//! Creates a GPU context, prints what the selected device supports and can
//! optionally build a one-triangle acceleration structure end to end.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p carbon-info -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--validation`: Enable the Khronos validation layer
//! - `--no-ray-tracing`: Do not require ray tracing extensions
//! - `--build-as`: Build a bottom-level acceleration structure as a smoke test
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, Context};
use ash::vk;
use carbon_gpu::{execute_single_time_commands, CommandPool, GpuCapabilities, GpuContext, GpuContextBuilder};
use carbon_rt::{BottomLevelAccelerationStructure, IDENTITY_TRANSFORM};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TRIANGLE: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

#[derive(Debug, Default)]
struct Options {
    validation: bool,
    ray_tracing: bool,
    build_acceleration_structure: bool,
    help: bool,
}

impl Options {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut options = Self {
            ray_tracing: true,
            ..Self::default()
        };
        for arg in args {
            match arg.as_str() {
                "--validation" => options.validation = true,
                "--no-ray-tracing" => options.ray_tracing = false,
                "--build-as" => options.build_acceleration_structure = true,
                "-h" | "--help" => options.help = true,
                other => bail!("Unknown option: {other} (see --help)"),
            }
        }
        if options.build_acceleration_structure && !options.ray_tracing {
            bail!("--build-as needs ray tracing; drop --no-ray-tracing");
        }
        Ok(options)
    }
}

fn main() -> anyhow::Result<()> {
    let options = Options::parse(std::env::args().skip(1))?;
    if options.help {
        print_help();
        return Ok(());
    }

    init_logging();

    let context = GpuContextBuilder::new()
        .app_name("carbon-info")
        .validation(options.validation)
        .ray_tracing(options.ray_tracing)
        .build()
        .context("Failed to create GPU context")?;

    print_report(context.capabilities());

    if options.build_acceleration_structure {
        smoke_build(&context)?;
    }
    Ok(())
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn print_report(caps: &GpuCapabilities) {
    println!("Device:              {}", caps.device_name);
    println!("Vendor:              {:?}", caps.vendor);
    println!(
        "Vulkan:              {}.{}.{}",
        vk::api_version_major(caps.api_version),
        vk::api_version_minor(caps.api_version),
        vk::api_version_patch(caps.api_version)
    );
    println!("Driver version:      {:#x}", caps.driver_version);
    println!("Device-local memory: {} MB", caps.device_local_memory_mb);
    println!("Max allocations:     {}", caps.max_memory_allocation_count);
    println!("Push constants:      {} bytes", caps.max_push_constants_size);
    println!(
        "Vertex input:        {} attributes, {} bindings",
        caps.vertex_input.max_vertex_input_attributes, caps.vertex_input.max_vertex_input_bindings
    );
    println!("Dynamic rendering:   {}", yes_no(caps.supports_dynamic_rendering));
    println!("Synchronization2:    {}", yes_no(caps.supports_synchronization2));
    println!("Buffer addresses:    {}", yes_no(caps.supports_buffer_device_address));
    println!("Descriptor indexing: {}", yes_no(caps.supports_descriptor_indexing));
    println!("Checkpoints:         {}", yes_no(caps.supports_diagnostic_checkpoints));

    match &caps.ray_tracing {
        Some(rt) => {
            println!("Ray tracing:         yes");
            println!("  handle size:       {}", rt.shader_group_handle_size);
            println!("  handle alignment:  {}", rt.shader_group_handle_alignment);
            println!("  base alignment:    {}", rt.shader_group_base_alignment);
            println!("  max recursion:     {}", rt.max_ray_recursion_depth);
            println!(
                "  scratch alignment: {}",
                rt.min_acceleration_structure_scratch_offset_alignment
            );
            println!("  max geometries:    {}", rt.max_geometry_count);
            println!("  max instances:     {}", rt.max_instance_count);
            println!("  max primitives:    {}", rt.max_primitive_count);
        }
        None => println!("Ray tracing:         no"),
    }

    let missing = caps.missing_features();
    if !missing.is_empty() {
        warn!("Missing features: {}", missing.join(", "));
    }
}

fn smoke_build(context: &GpuContext) -> anyhow::Result<()> {
    let device = context.device();
    let queue = context.graphics_queue();
    let pool = CommandPool::new(
        Arc::clone(device),
        queue.family_index(),
        vk::CommandPoolCreateFlags::TRANSIENT,
        "smoke_pool",
    )?;

    let mut blas = BottomLevelAccelerationStructure::new(Arc::clone(device), context.allocator().clone(), "smoke_blas");
    blas.create_mesh_buffers(
        &[(
            bytemuck::cast_slice(&TRIANGLE),
            bytemuck::cast_slice(&TRIANGLE_INDICES),
        )],
        &IDENTITY_TRANSFORM,
    )?;

    let geometries = [blas.triangle_geometry(
        vk::Format::R32G32B32_SFLOAT,
        12,
        2,
        vk::IndexType::UINT32,
        vk::GeometryFlagsKHR::OPAQUE,
    )];
    let flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    let sizes = blas.build_sizes(&[1], &blas.build_geometry_info(&geometries, flags))?;
    info!(
        "Build sizes: structure {} bytes, scratch {} bytes",
        sizes.acceleration_structure_size, sizes.build_scratch_size
    );

    blas.create_scratch_buffer(&sizes)?;
    blas.create_result_buffer(&sizes)?;
    blas.create_structure(&sizes)?;

    let info = blas.build_geometry_info(&geometries, flags);
    let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(1)];
    execute_single_time_commands(&pool, queue, |cmd| {
        blas.copy_mesh_buffers(cmd);
        cmd.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            &[vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)],
            &[],
            &[],
        );
        cmd.build_acceleration_structures(&[info], &[&ranges[..]])
    })
    .context("Acceleration structure build failed")?;
    blas.destroy_scratch_buffer();

    println!("Smoke build:         ok, structure at {:#x}", blas.address());
    blas.destroy();
    Ok(())
}

fn print_help() {
    eprintln!(
        "carbon-info: print GPU capabilities

USAGE:
    carbon-info [OPTIONS]

OPTIONS:
    --validation        Enable the Khronos validation layer
    --no-ray-tracing    Do not require ray tracing extensions
    --build-as          Build a one-triangle acceleration structure
    -h, --help          Print this help message

ENVIRONMENT:
    RUST_LOG            Log filter (default: info)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Options> {
        Options::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn defaults_require_ray_tracing() {
        let options = parse(&[]).unwrap();
        assert!(options.ray_tracing);
        assert!(!options.validation);
        assert!(!options.build_acceleration_structure);
        assert!(!options.help);
    }

    #[test]
    fn flags_are_recognized() {
        let options = parse(&["--validation", "--build-as", "-h"]).unwrap();
        assert!(options.validation);
        assert!(options.build_acceleration_structure);
        assert!(options.help);
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(parse(&["--frobnicate"]).is_err());
    }

    #[test]
    fn smoke_build_needs_ray_tracing() {
        assert!(parse(&["--no-ray-tracing", "--build-as"]).is_err());
        assert!(!parse(&["--no-ray-tracing"]).unwrap().ray_tracing);
    }
}
