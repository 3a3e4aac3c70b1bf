//! Test harness for carbon.
//!
//! Provides a headless GPU context with readback helpers, plus the
//! integration tests that need real hardware.

pub mod harness;

#[cfg(test)]
mod render_pass_tests;

pub use harness::{bgra_to_rgba, image_difference, HeadlessContext, NullCrashBackend};

use carbon_gpu::GpuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("Readback of {expected} bytes returned {actual}")]
    Readback { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;
