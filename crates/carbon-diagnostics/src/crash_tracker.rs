//! GPU crash-dump capture.
//!
//! The tracker is enabled before the Vulkan instance exists so the driver can
//! report every shader it compiles. When the device is lost the vendor library
//! hands the raw dump to [`GpuCrashTracker::on_crash_dump`], which decodes it,
//! logs the active shaders and the page fault, and writes a JSON report.

use crate::error::{DiagnosticsError, Result};
use crate::result::DiagnosticsResult;
use crate::shader_database::{ShaderDatabase, ShaderDebugInfoIdentifier, ShaderDebugName, ShaderHash};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, info, warn};

/// Default file the decoded crash report is written to.
pub const DEFAULT_DUMP_PATH: &str = "crashdump.json";

/// A shader that was executing when the device faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveShaderInfo {
    pub hash: u64,
    pub instance: u64,
    pub shader_type: u32,
}

/// Resource touched by a faulting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultedResource {
    pub gpu_va: u64,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub size: u64,
    pub format: u32,
    pub was_destroyed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultInfo {
    pub faulting_gpu_va: u64,
    pub resource: Option<FaultedResource>,
}

/// Keys of the descriptive entries attached to a crash dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKey {
    ApplicationName,
    ApplicationVersion,
    UserDefined(u32),
}

/// Lookups the decoder uses to resolve shaders while generating JSON.
pub trait ShaderLookup {
    fn shader_binary(&self, hash: ShaderHash) -> Option<Arc<[u32]>>;
    fn shader_debug_info(&self, identifier: &ShaderDebugInfoIdentifier) -> Option<Arc<[u8]>>;
    fn shader_source(&self, name: &ShaderDebugName) -> Option<Arc<[u32]>>;
}

/// A decoded crash dump. Dropping the decoder releases it.
pub trait CrashDumpDecoder {
    fn active_shaders(&self) -> std::result::Result<Vec<ActiveShaderInfo>, DiagnosticsResult>;
    fn page_fault(&self) -> std::result::Result<PageFaultInfo, DiagnosticsResult>;
    fn json(&self, lookup: &dyn ShaderLookup) -> std::result::Result<String, DiagnosticsResult>;
}

/// Binding to the vendor crash-dump library.
pub trait CrashDumpBackend: Send + Sync {
    /// Start watching Vulkan devices. The backend routes library callbacks to
    /// `tracker` for as long as it is alive.
    fn enable(&self, tracker: Weak<GpuCrashTracker>) -> DiagnosticsResult;

    fn disable(&self) -> DiagnosticsResult;

    fn shader_hash(&self, spirv: &[u32]) -> std::result::Result<ShaderHash, DiagnosticsResult>;

    fn shader_debug_info_identifier(
        &self,
        debug_info: &[u8],
    ) -> std::result::Result<ShaderDebugInfoIdentifier, DiagnosticsResult>;

    fn shader_debug_name(
        &self,
        full: &[u32],
        stripped: &[u32],
    ) -> std::result::Result<ShaderDebugName, DiagnosticsResult>;

    fn decode<'a>(
        &'a self,
        dump: &[u8],
    ) -> std::result::Result<Box<dyn CrashDumpDecoder + 'a>, DiagnosticsResult>;
}

/// Crash tracker configuration.
#[derive(Debug, Clone)]
pub struct CrashTrackerConfig {
    /// File the JSON report is written to.
    pub dump_path: PathBuf,
    pub application_name: String,
    pub application_version: String,
}

impl Default for CrashTrackerConfig {
    fn default() -> Self {
        Self {
            dump_path: PathBuf::from(DEFAULT_DUMP_PATH),
            application_name: String::new(),
            application_version: String::new(),
        }
    }
}

impl CrashTrackerConfig {
    pub fn with_dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = path.into();
        self
    }

    pub fn with_application(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.application_name = name.into();
        self.application_version = version.into();
        self
    }
}

/// Log a failing library result. Returns `true` on success.
///
/// An empty `message` suppresses the log line.
pub fn check_result(result: DiagnosticsResult, message: &str) -> bool {
    if result.is_success() {
        return true;
    }
    if !message.is_empty() {
        error!("{message}: {result}");
    }
    false
}

fn checked<T>(result: std::result::Result<T, DiagnosticsResult>, message: &str) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(code) => {
            check_result(code, message);
            None
        }
    }
}

fn library_error(context: &str) -> impl FnOnce(DiagnosticsResult) -> DiagnosticsError + '_ {
    move |result| DiagnosticsError::Library {
        context: context.to_string(),
        result,
    }
}

/// Captures and decodes GPU crash dumps.
pub struct GpuCrashTracker {
    backend: Box<dyn CrashDumpBackend>,
    database: ShaderDatabase,
    config: CrashTrackerConfig,
    crash_lock: Mutex<()>,
    enabled: AtomicBool,
}

impl GpuCrashTracker {
    pub fn new(backend: impl CrashDumpBackend + 'static, config: CrashTrackerConfig) -> Arc<Self> {
        Arc::new(Self {
            backend: Box::new(backend),
            database: ShaderDatabase::new(),
            config,
            crash_lock: Mutex::new(()),
            enabled: AtomicBool::new(false),
        })
    }

    /// Enable crash-dump collection. Must run before the Vulkan instance is
    /// created.
    pub fn enable(self: &Arc<Self>) -> bool {
        let ok = check_result(
            self.backend.enable(Arc::downgrade(self)),
            "Failed to enable GPU crash dumps",
        );
        self.enabled.store(ok, Ordering::Release);
        if ok {
            info!(
                "GPU crash dumps enabled, reports go to {}",
                self.config.dump_path.display()
            );
        }
        ok
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            check_result(self.backend.disable(), "Failed to disable GPU crash dumps");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn database(&self) -> &ShaderDatabase {
        &self.database
    }

    pub fn config(&self) -> &CrashTrackerConfig {
        &self.config
    }

    /// Register a shader binary so a crash dump can reference it by hash.
    pub fn register_shader(&self, spirv: &[u32]) -> Option<ShaderHash> {
        let hash = checked(self.backend.shader_hash(spirv), "Failed to hash shader binary")?;
        self.database.add_shader_binary(hash, spirv);
        Some(hash)
    }

    /// Register the unstripped variant of a shader that was compiled from
    /// `stripped`.
    pub fn register_shader_with_debug_info(&self, stripped: &[u32], full: &[u32]) -> Option<ShaderDebugName> {
        let name = checked(
            self.backend.shader_debug_name(full, stripped),
            "Failed to compute shader debug name",
        )?;
        self.database.add_shader_with_debug_info(name.clone(), full);
        Some(name)
    }

    /// Handle a crash dump delivered by the driver. Returns the path of the
    /// written report.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn on_crash_dump(&self, dump: &[u8]) -> Option<PathBuf> {
        let _guard = self.crash_lock.lock();
        match self.write_crash_report(dump) {
            Ok(path) => {
                error!("GPU crash dump written to {}", path.display());
                Some(path)
            }
            Err(err) => {
                error!("{err}");
                None
            }
        }
    }

    fn write_crash_report(&self, dump: &[u8]) -> Result<PathBuf> {
        let decoder = self
            .backend
            .decode(dump)
            .map_err(library_error("Failed to create crash dump decoder"))?;

        if let Some(shaders) = checked(decoder.active_shaders(), "Failed to query active shaders") {
            for shader in shaders {
                error!(
                    "Active shader: hash = {:#x}, instance = {:#x}, type = {}",
                    shader.hash, shader.instance, shader.shader_type
                );
            }
        }

        if let Some(fault) = checked(decoder.page_fault(), "") {
            log_page_fault(&fault);
        }

        let json = decoder
            .json(self)
            .map_err(library_error("Failed to generate crash dump JSON"))?;
        drop(decoder);

        let path = self.config.dump_path.clone();
        std::fs::write(&path, json).map_err(|source| DiagnosticsError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Store debug info the driver emits while compiling shaders.
    pub fn on_shader_debug_info(&self, debug_info: &[u8]) {
        let _guard = self.crash_lock.lock();
        let Some(identifier) = checked(
            self.backend.shader_debug_info_identifier(debug_info),
            "Failed to get shader debug info",
        ) else {
            return;
        };
        self.database.add_shader_debug_info(identifier, debug_info);
    }

    pub fn on_shader_lookup(&self, hash: ShaderHash) -> Option<Arc<[u32]>> {
        self.database.find_shader_binary(hash)
    }

    pub fn on_shader_debug_info_lookup(&self, identifier: &ShaderDebugInfoIdentifier) -> Option<Arc<[u8]>> {
        self.database.find_shader_debug_info(identifier)
    }

    pub fn on_shader_source_lookup(&self, name: &ShaderDebugName) -> Option<Arc<[u32]>> {
        self.database.find_shader_binary_with_debug_info(name)
    }

    /// Describe the application to the crash dump.
    pub fn on_description(&self, add: &mut dyn FnMut(DescriptionKey, &str)) {
        if !self.config.application_name.is_empty() {
            add(DescriptionKey::ApplicationName, &self.config.application_name);
        }
        if !self.config.application_version.is_empty() {
            add(
                DescriptionKey::ApplicationVersion,
                &self.config.application_version,
            );
        }
    }
}

impl ShaderLookup for GpuCrashTracker {
    fn shader_binary(&self, hash: ShaderHash) -> Option<Arc<[u32]>> {
        self.on_shader_lookup(hash)
    }

    fn shader_debug_info(&self, identifier: &ShaderDebugInfoIdentifier) -> Option<Arc<[u8]>> {
        self.on_shader_debug_info_lookup(identifier)
    }

    fn shader_source(&self, name: &ShaderDebugName) -> Option<Arc<[u32]>> {
        self.on_shader_source_lookup(name)
    }
}

impl Drop for GpuCrashTracker {
    fn drop(&mut self) {
        if self.is_enabled() {
            warn!("GPU crash tracker dropped while enabled");
            self.disable();
        }
    }
}

fn log_page_fault(fault: &PageFaultInfo) {
    error!("GPU page fault at {:#x}", fault.faulting_gpu_va);
    if let Some(resource) = &fault.resource {
        error!("Fault in resource starting at {:#x}", resource.gpu_va);
        error!(
            "Size of resource: ({}, {}, {}, {}) = {} bytes",
            resource.width, resource.height, resource.depth, resource.mip_levels, resource.size
        );
        error!("Format of resource: {}", resource.format);
        error!("Resource was destroyed: {}", resource.was_destroyed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockState {
        tracker: Mutex<Option<Weak<GpuCrashTracker>>>,
        disabled: AtomicUsize,
        decoders_alive: AtomicUsize,
    }

    struct MockBackend {
        state: Arc<MockState>,
        fail_decode: bool,
    }

    struct MockDecoder<'a> {
        state: &'a MockState,
    }

    impl CrashDumpDecoder for MockDecoder<'_> {
        fn active_shaders(&self) -> std::result::Result<Vec<ActiveShaderInfo>, DiagnosticsResult> {
            Ok(vec![ActiveShaderInfo {
                hash: 0xAB,
                instance: 1,
                shader_type: 5,
            }])
        }

        fn page_fault(&self) -> std::result::Result<PageFaultInfo, DiagnosticsResult> {
            Err(DiagnosticsResult::NotAvailable)
        }

        fn json(&self, lookup: &dyn ShaderLookup) -> std::result::Result<String, DiagnosticsResult> {
            let words = lookup.shader_binary(ShaderHash(0xAB)).map_or(0, |b| b.len());
            let info = lookup
                .shader_debug_info(&ShaderDebugInfoIdentifier { id: [3, 4] })
                .map_or(0, |d| d.len());
            Ok(format!("{{\"shader_words\":{words},\"debug_info_bytes\":{info}}}"))
        }
    }

    impl Drop for MockDecoder<'_> {
        fn drop(&mut self) {
            self.state.decoders_alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl CrashDumpBackend for MockBackend {
        fn enable(&self, tracker: Weak<GpuCrashTracker>) -> DiagnosticsResult {
            *self.state.tracker.lock() = Some(tracker);
            DiagnosticsResult::Success
        }

        fn disable(&self) -> DiagnosticsResult {
            self.state.disabled.fetch_add(1, Ordering::SeqCst);
            DiagnosticsResult::Success
        }

        fn shader_hash(&self, spirv: &[u32]) -> std::result::Result<ShaderHash, DiagnosticsResult> {
            spirv
                .first()
                .map(|&word| ShaderHash(u64::from(word)))
                .ok_or(DiagnosticsResult::InvalidParameter)
        }

        fn shader_debug_info_identifier(
            &self,
            debug_info: &[u8],
        ) -> std::result::Result<ShaderDebugInfoIdentifier, DiagnosticsResult> {
            match debug_info {
                [a, b, ..] => Ok(ShaderDebugInfoIdentifier {
                    id: [u64::from(*a), u64::from(*b)],
                }),
                _ => Err(DiagnosticsResult::InvalidParameter),
            }
        }

        fn shader_debug_name(
            &self,
            full: &[u32],
            stripped: &[u32],
        ) -> std::result::Result<ShaderDebugName, DiagnosticsResult> {
            Ok(ShaderDebugName(format!("{}-{}", full.len(), stripped.len())))
        }

        fn decode<'a>(
            &'a self,
            _dump: &[u8],
        ) -> std::result::Result<Box<dyn CrashDumpDecoder + 'a>, DiagnosticsResult> {
            if self.fail_decode {
                return Err(DiagnosticsResult::VersionMismatch);
            }
            self.state.decoders_alive.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockDecoder { state: &self.state }))
        }
    }

    fn tracker(name: &str, fail_decode: bool) -> (Arc<GpuCrashTracker>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let path = std::env::temp_dir().join(format!("carbon-{name}-{}.json", std::process::id()));
        let tracker = GpuCrashTracker::new(
            MockBackend {
                state: Arc::clone(&state),
                fail_decode,
            },
            CrashTrackerConfig::default()
                .with_dump_path(path)
                .with_application("carbon-tests", "v0.1.0"),
        );
        (tracker, state)
    }

    #[test]
    fn default_dump_path() {
        assert_eq!(
            CrashTrackerConfig::default().dump_path,
            PathBuf::from("crashdump.json")
        );
    }

    #[test]
    fn enable_hands_backend_a_weak_tracker() {
        let (tracker, state) = tracker("enable", false);
        assert!(tracker.enable());
        assert!(tracker.is_enabled());

        let weak = state.tracker.lock().clone().unwrap();
        assert!(Arc::ptr_eq(&weak.upgrade().unwrap(), &tracker));

        tracker.disable();
        tracker.disable();
        assert_eq!(state.disabled.load(Ordering::SeqCst), 1);
        assert!(!tracker.is_enabled());
    }

    #[test]
    fn crash_dump_writes_json_with_lookups() {
        let (tracker, state) = tracker("dump", false);
        tracker.register_shader(&[0xAB, 2, 3]).unwrap();
        tracker.on_shader_debug_info(&[3, 4, 9, 9, 9]);

        let path = tracker.on_crash_dump(&[0u8; 16]).unwrap();
        let json = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(json, "{\"shader_words\":3,\"debug_info_bytes\":5}");
        assert_eq!(state.decoders_alive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_decode_writes_nothing() {
        let (tracker, _state) = tracker("no-decode", true);
        assert!(tracker.on_crash_dump(&[1, 2, 3]).is_none());
        assert!(!tracker.config().dump_path.exists());
    }

    #[test]
    fn invalid_debug_info_is_ignored() {
        let (tracker, _state) = tracker("debug-info", false);
        tracker.on_shader_debug_info(&[1]);
        assert!(tracker
            .on_shader_debug_info_lookup(&ShaderDebugInfoIdentifier { id: [1, 0] })
            .is_none());
    }

    #[test]
    fn shader_with_debug_info_is_found_by_name() {
        let (tracker, _state) = tracker("source", false);
        let name = tracker
            .register_shader_with_debug_info(&[1, 2], &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(name, ShaderDebugName("4-2".into()));
        assert_eq!(&*tracker.on_shader_source_lookup(&name).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn description_reports_application() {
        let (tracker, _state) = tracker("description", false);
        let mut entries = Vec::new();
        tracker.on_description(&mut |key, value| entries.push((key, value.to_string())));
        assert_eq!(
            entries,
            vec![
                (DescriptionKey::ApplicationName, "carbon-tests".to_string()),
                (DescriptionKey::ApplicationVersion, "v0.1.0".to_string()),
            ]
        );
    }

    #[test]
    fn check_result_reports_success_only() {
        assert!(check_result(DiagnosticsResult::Success, "unused"));
        assert!(!check_result(DiagnosticsResult::Fail, "failed"));
        assert!(!check_result(DiagnosticsResult::Fail, ""));
    }
}
