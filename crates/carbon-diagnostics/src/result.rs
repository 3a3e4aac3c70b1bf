//! Result codes reported by the crash-dump library.

use std::fmt;

const FAIL: u32 = 0xBAD0_0000;

/// A result code of the vendor crash-dump library.
///
/// Only the codes relevant to Vulkan are named; anything else is kept as
/// [`DiagnosticsResult::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticsResult {
    Success,
    NotAvailable,
    Fail,
    VersionMismatch,
    NotInitialized,
    InvalidAdapter,
    InvalidParameter,
    Unknown,
    ApiError,
    NvApiIncompatible,
    GettingContextDataWithNewCommandList,
    AlreadyInitialized,
    DriverInitFailed,
    DriverVersionNotSupported,
    OutOfMemory,
    GetDataOnBundle,
    GetDataOnDeferredContext,
    FeatureNotEnabled,
    NoResourcesRegistered,
    ThisResourceNeverRegistered,
    Disabled,
    Other(u32),
}

impl DiagnosticsResult {
    /// Map a raw library result code.
    pub fn from_raw(code: u32) -> Self {
        match code {
            0x1 => Self::Success,
            0x2 => Self::NotAvailable,
            FAIL => Self::Fail,
            0xBAD0_0001 => Self::VersionMismatch,
            0xBAD0_0002 => Self::NotInitialized,
            0xBAD0_0003 => Self::InvalidAdapter,
            0xBAD0_0004 => Self::InvalidParameter,
            0xBAD0_0005 => Self::Unknown,
            0xBAD0_0006 => Self::ApiError,
            0xBAD0_0007 => Self::NvApiIncompatible,
            0xBAD0_0008 => Self::GettingContextDataWithNewCommandList,
            0xBAD0_0009 => Self::AlreadyInitialized,
            0xBAD0_000B => Self::DriverInitFailed,
            0xBAD0_000C => Self::DriverVersionNotSupported,
            0xBAD0_000D => Self::OutOfMemory,
            0xBAD0_000E => Self::GetDataOnBundle,
            0xBAD0_000F => Self::GetDataOnDeferredContext,
            0xBAD0_0010 => Self::FeatureNotEnabled,
            0xBAD0_0011 => Self::NoResourcesRegistered,
            0xBAD0_0012 => Self::ThisResourceNeverRegistered,
            0xBAD0_0016 => Self::Disabled,
            other => Self::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Turn a raw code into a `Result`, keeping the code as the error.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Name used when logging the code.
    pub fn name(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::NotAvailable => "NotAvailable",
            Self::Fail => "Fail",
            Self::VersionMismatch => "FAIL_VersionMismatch",
            Self::NotInitialized => "FAIL_NotInitialized",
            Self::InvalidAdapter => "FAIL_InvalidAdapter",
            Self::InvalidParameter => "FAIL_InvalidParameter",
            Self::Unknown => "FAIL_Unknown",
            Self::ApiError => "FAIL_ApiError",
            Self::NvApiIncompatible => "FAIL_NvApiIncompatible",
            Self::GettingContextDataWithNewCommandList => {
                "FAIL_GettingContextDataWithNewCommandList"
            }
            Self::AlreadyInitialized => "FAIL_AlreadyInitialized",
            Self::DriverInitFailed => "FAIL_DriverInitFailed",
            Self::DriverVersionNotSupported => "FAIL_DriverVersionNotSupported",
            Self::OutOfMemory => "FAIL_OutOfMemory",
            Self::GetDataOnBundle => "FAIL_GetDataOnBundle",
            Self::GetDataOnDeferredContext => "FAIL_GetDataOnDeferredContext",
            Self::FeatureNotEnabled => "FAIL_FeatureNotEnabled",
            Self::NoResourcesRegistered => "FAIL_NoResourcesRegistered",
            Self::ThisResourceNeverRegistered => "FAIL_ThisResourceNeverRegistered",
            Self::Disabled => "FAIL_Disabled",
            Self::Other(_) => "Unrecognized",
        }
    }
}

impl fmt::Display for DiagnosticsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "Unrecognized({code:#x})"),
            _ => f.write_str(self.name()),
        }
    }
}

impl std::error::Error for DiagnosticsResult {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_map_to_names() {
        assert_eq!(DiagnosticsResult::from_raw(0x1), DiagnosticsResult::Success);
        assert_eq!(DiagnosticsResult::from_raw(0x2), DiagnosticsResult::NotAvailable);
        assert_eq!(
            DiagnosticsResult::from_raw(0xBAD0_000D),
            DiagnosticsResult::OutOfMemory
        );
        assert_eq!(
            DiagnosticsResult::from_raw(0xBAD0_0016).to_string(),
            "FAIL_Disabled"
        );
    }

    #[test]
    fn unknown_codes_keep_raw_value() {
        let result = DiagnosticsResult::from_raw(0xBAD0_0014);
        assert_eq!(result, DiagnosticsResult::Other(0xBAD0_0014));
        assert_eq!(result.to_string(), "Unrecognized(0xbad00014)");
    }

    #[test]
    fn only_success_converts_to_ok() {
        assert!(DiagnosticsResult::Success.into_result().is_ok());
        assert_eq!(
            DiagnosticsResult::NotInitialized.into_result(),
            Err(DiagnosticsResult::NotInitialized)
        );
    }
}
