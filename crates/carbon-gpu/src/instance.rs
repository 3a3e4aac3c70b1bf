//! Vulkan instance creation and physical device selection.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;
use std::ffi::{c_void, CStr, CString};
use tracing::{debug, error, info, trace, warn};

/// Application metadata handed to the driver.
#[derive(Debug, Clone)]
pub struct ApplicationInfo {
    pub application_name: String,
    pub application_version: u32,
    pub engine_name: String,
    pub engine_version: u32,
    pub api_version: u32,
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self {
            application_name: "carbon".to_string(),
            application_version: vk::make_api_version(0, 0, 1, 0),
            engine_name: "carbon".to_string(),
            engine_version: vk::make_api_version(0, 0, 1, 0),
            api_version: vk::API_VERSION_1_3,
        }
    }
}

impl ApplicationInfo {
    /// Application version as `v<major>.<minor>.<patch>`.
    pub fn version_string(&self) -> String {
        format!(
            "v{}.{}.{}",
            vk::api_version_major(self.application_version),
            vk::api_version_minor(self.application_version),
            vk::api_version_patch(self.application_version)
        )
    }
}

/// Surface extensions for the current platform.
pub fn surface_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Keep the requested extensions the loader reports as available.
///
/// Each missing extension is logged and skipped.
pub fn filter_available_extensions<'a>(
    requested: &[&'a CStr],
    available: &[&CStr],
) -> Vec<&'a CStr> {
    let mut enabled: Vec<&'a CStr> = Vec::with_capacity(requested.len());
    for &ext in requested {
        if enabled.contains(&ext) {
            continue;
        }
        if available.contains(&ext) {
            enabled.push(ext);
        } else {
            warn!("{} is not available!", ext.to_string_lossy());
        }
    }
    enabled
}

/// Create a Vulkan instance.
///
/// `extensions` are enabled when available. With `enable_validation` the
/// Khronos validation layer and `VK_EXT_debug_utils` are requested too.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app: &ApplicationInfo,
    extensions: &[&CStr],
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app.application_name.as_str())
        .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;
    let engine_name = CString::new(app.engine_name.as_str())
        .map_err(|e| GpuError::InvalidState(format!("Invalid engine name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(app.application_version)
        .engine_name(&engine_name)
        .engine_version(app.engine_version)
        .api_version(app.api_version);

    let mut requested = extensions.to_vec();
    if enable_validation {
        requested.push(ash::ext::debug_utils::NAME);
    }

    let available_properties = entry
        .enumerate_instance_extension_properties(None)
        .context("Failed to enumerate instance extensions")?;
    let available: Vec<&CStr> = available_properties
        .iter()
        .filter_map(|props| props.extension_name_as_c_str().ok())
        .collect();
    let enabled = filter_available_extensions(&requested, &available);
    let extension_names: Vec<*const i8> = enabled.iter().map(|ext| ext.as_ptr()).collect();

    let mut layers = Vec::new();
    if enable_validation {
        let available_layers = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        let found = available_layers
            .iter()
            .any(|props| props.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
        if found {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            warn!(
                "Validation layer {} not available",
                VALIDATION_LAYER.to_string_lossy()
            );
        }
    }

    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layers)
        .flags(create_flags);

    let instance = entry
        .create_instance(&create_info, None)
        .context("Failed to create instance")?;

    debug!("Instance created with {} extensions", enabled.len());
    Ok(instance)
}

/// A `VK_EXT_debug_utils` messenger forwarding driver messages to `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// # Safety
    /// The instance must be valid and created with `VK_EXT_debug_utils`.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = loader
            .create_debug_utils_messenger(&create_info, None)
            .context("Failed to create debug messenger")?;

        Ok(Self { loader, messenger })
    }

    /// # Safety
    /// Must be called once, before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = unsafe { callback_data.as_ref() }
        .and_then(|data| unsafe { data.message_as_c_str() })
        .map_or_else(|| "<no message>".into(), CStr::to_string_lossy);

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => error!("[{message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => warn!("[{message_type:?}] {message}"),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => debug!("[{message_type:?}] {message}"),
        _ => trace!("[{message_type:?}] {message}"),
    }

    vk::FALSE
}

/// Rank a physical device. `None` rejects it.
///
/// Devices below Vulkan 1.3 or missing a required extension are rejected.
/// Discrete GPUs rank above integrated ones, then virtual ones; VRAM breaks
/// ties at one point per GiB.
pub fn score_device(
    device_type: vk::PhysicalDeviceType,
    api_version: u32,
    device_local_memory_mb: u64,
    has_required_extensions: bool,
) -> Option<u32> {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    if major < 1 || (major == 1 && minor < 3) || !has_required_extensions {
        return None;
    }

    let type_score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 1,
    };
    let vram_score = u32::try_from(device_local_memory_mb / 1024).unwrap_or(u32::MAX);
    Some(type_score + vram_score.min(999))
}

/// Select the best physical device supporting every extension in `required`.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    required: &[&CStr],
) -> Result<vk::PhysicalDevice> {
    let devices = instance
        .enumerate_physical_devices()
        .context("Failed to enumerate physical devices")?;

    let mut best: Option<(u32, vk::PhysicalDevice)> = None;
    for device in devices {
        let properties = instance.get_physical_device_properties(device);
        let memory = instance.get_physical_device_memory_properties(device);
        let extensions = instance
            .enumerate_device_extension_properties(device)
            .unwrap_or_default();
        let has_required = required.iter().all(|req| {
            extensions
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(*req))
        });

        let name = properties
            .device_name_as_c_str()
            .map_or_else(|_| "<unknown>".into(), CStr::to_string_lossy);
        let Some(score) = score_device(
            properties.device_type,
            properties.api_version,
            device_local_memory_mb(&memory),
            has_required,
        ) else {
            debug!("Rejecting {name}");
            continue;
        };

        debug!("{name} scored {score}");
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((score, device));
        }
    }

    let (_, device) = best.ok_or(GpuError::NoSuitableDevice)?;
    let properties = instance.get_physical_device_properties(device);
    if let Ok(name) = properties.device_name_as_c_str() {
        info!("Selected physical device {}", name.to_string_lossy());
    }
    Ok(device)
}

/// Sum of device-local heap sizes in MiB.
pub fn device_local_memory_mb(memory: &vk::PhysicalDeviceMemoryProperties) -> u64 {
    memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size / (1024 * 1024))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_extensions_are_skipped() {
        let requested = [
            ash::khr::surface::NAME,
            ash::ext::debug_utils::NAME,
            ash::khr::surface::NAME,
        ];
        let available = [ash::khr::surface::NAME];

        let enabled = filter_available_extensions(&requested, &available);
        assert_eq!(enabled, vec![ash::khr::surface::NAME]);
    }

    #[test]
    fn device_scoring_prefers_discrete() {
        let discrete = score_device(
            vk::PhysicalDeviceType::DISCRETE_GPU,
            vk::API_VERSION_1_3,
            4096,
            true,
        );
        let integrated = score_device(
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::API_VERSION_1_3,
            32 * 1024,
            true,
        );
        assert!(discrete > integrated);
        assert_eq!(discrete, Some(1004));
    }

    #[test]
    fn device_scoring_rejects_old_or_incomplete_devices() {
        assert_eq!(
            score_device(
                vk::PhysicalDeviceType::DISCRETE_GPU,
                vk::API_VERSION_1_2,
                8192,
                true
            ),
            None
        );
        assert_eq!(
            score_device(
                vk::PhysicalDeviceType::DISCRETE_GPU,
                vk::API_VERSION_1_3,
                8192,
                false
            ),
            None
        );
    }

    #[test]
    fn version_string_formats_components() {
        let app = ApplicationInfo {
            application_version: vk::make_api_version(0, 1, 4, 2),
            ..ApplicationInfo::default()
        };
        assert_eq!(app.version_string(), "v1.4.2");
    }
}
