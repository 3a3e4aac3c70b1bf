//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Raw Vulkan error without further context.
    #[error("Vulkan error: {0:?}")]
    Vulkan(#[from] vk::Result),

    /// A driver call failed.
    ///
    /// `checkpoints` holds the most recent checkpoint markers of the queue the
    /// failing work was submitted to, newest last. It is empty when the device
    /// was created without diagnostic checkpoints.
    #[error("{message}: {result:?}{}", format_checkpoints(.checkpoints))]
    Driver {
        message: String,
        result: vk::Result,
        checkpoints: Vec<String>,
    },

    /// Failed to load the Vulkan library.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A fixed device limit was reached.
    #[error("{0}")]
    ResourceExhausted(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// A ray tracing shader group was assembled from the wrong stages.
    #[error("Invalid shader group: {0}")]
    InvalidShaderGroup(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// The Vulkan result code behind this error, if any.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::Vulkan(result) | Self::Driver { result, .. } => Some(*result),
            _ => None,
        }
    }

    /// Whether the device was lost; nothing recorded afterwards will run.
    pub fn is_device_lost(&self) -> bool {
        self.vk_result() == Some(vk::Result::ERROR_DEVICE_LOST)
    }
}

fn format_checkpoints(checkpoints: &[String]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for marker in checkpoints {
        let _ = write!(out, "\n  checkpoint: {marker}");
    }
    out
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Attaches a message to raw `ash` results.
pub trait VkResultExt<T> {
    /// Convert a failed call into [`GpuError::Driver`] carrying `message`.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|result| GpuError::Driver {
            message: message.into(),
            result,
            checkpoints: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_names_result() {
        let err: Result<()> =
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).context("Failed to create buffer \"scratch\"");
        let message = err.unwrap_err().to_string();
        assert_eq!(
            message,
            "Failed to create buffer \"scratch\": ERROR_OUT_OF_DEVICE_MEMORY"
        );
    }

    #[test]
    fn driver_error_lists_checkpoints() {
        let err = GpuError::Driver {
            message: "Failed to end command buffer".to_string(),
            result: vk::Result::ERROR_DEVICE_LOST,
            checkpoints: vec!["build blas".to_string(), "trace rays".to_string()],
        };

        assert!(err.is_device_lost());
        let message = err.to_string();
        assert!(message.starts_with("Failed to end command buffer: ERROR_DEVICE_LOST"));
        assert!(message.contains("checkpoint: build blas"));
        assert!(message.ends_with("checkpoint: trace rays"));
    }

    #[test]
    fn resource_exhausted_keeps_message() {
        let err =
            GpuError::ResourceExhausted("Ran out of vertex attributes. Maximum is 16.".into());
        assert_eq!(err.to_string(), "Ran out of vertex attributes. Maximum is 16.");
        assert_eq!(err.vk_result(), None);
    }
}
