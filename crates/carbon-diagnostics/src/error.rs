//! Diagnostics error types.

use crate::result::DiagnosticsResult;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while capturing crash diagnostics.
///
/// None of these are fatal to rendering; the crash tracker logs them and
/// carries on.
#[derive(Error, Debug)]
pub enum DiagnosticsError {
    /// The vendor library returned a failure code.
    #[error("{context}: {result}")]
    Library {
        context: String,
        result: DiagnosticsResult,
    },

    /// Writing the crash report failed.
    #[error("Failed to write crash dump to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, DiagnosticsError>;
