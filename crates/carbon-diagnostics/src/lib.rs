//! GPU crash diagnostics.
//!
//! This crate provides:
//! - Result codes of the vendor crash-dump library with stable names
//! - A shader registry used to resolve shaders referenced by a crash dump
//! - A crash tracker that decodes dumps, logs the fault and writes a JSON report
//!
//! The vendor library itself is reached through [`CrashDumpBackend`], so the
//! tracker can be driven by any binding (or by a mock in tests).

pub mod crash_tracker;
pub mod error;
pub mod result;
pub mod shader_database;

pub use crash_tracker::{
    check_result, ActiveShaderInfo, CrashDumpBackend, CrashDumpDecoder, CrashTrackerConfig,
    DescriptionKey, FaultedResource, GpuCrashTracker, PageFaultInfo, ShaderLookup,
    DEFAULT_DUMP_PATH,
};
pub use error::{DiagnosticsError, Result};
pub use result::DiagnosticsResult;
pub use shader_database::{ShaderDatabase, ShaderDebugInfoIdentifier, ShaderDebugName, ShaderHash};
